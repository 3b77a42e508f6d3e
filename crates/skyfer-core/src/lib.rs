pub mod config;
pub mod logging;

pub mod backoff;
pub mod cache;
pub mod chunkmacs;
pub mod curl_io;
pub mod direct_read;
pub mod distributor;
pub mod ds;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod fsaccess;
pub mod http;
pub mod localpath;
pub mod raid;
pub mod record;
pub mod transfer;
pub mod transfer_list;
