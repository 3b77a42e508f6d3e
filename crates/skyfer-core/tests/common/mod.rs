pub mod post_server;
pub mod transport;
