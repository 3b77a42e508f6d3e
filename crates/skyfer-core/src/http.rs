//! Ranged HTTP request state and the driver seam.
//!
//! `HttpReq` is plain state the direct-read slot owns and inspects between
//! event-loop wakeups; `HttpIo` is the transport that actually moves bytes.
//! The production driver is curl-multi (`curl_io`); tests script request
//! lifecycles through the same trait.

use anyhow::Result;

use crate::ds::Ds;

/// Lifecycle of one ranged request.
///
/// READY -> INFLIGHT -> (SUCCESS | FAILURE) -> READY, or DONE once the
/// buffer reports no further range for the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReqStatus {
    Ready,
    Inflight,
    Success,
    Failure,
    Done,
}

/// One ranged request. The input buffer grows incrementally during INFLIGHT
/// and is drained by the owner; `pos` tracks how far the drained bytes
/// reach into the requested range.
#[derive(Debug)]
pub struct HttpReq {
    pub id: u64,
    pub status: ReqStatus,
    pub httpstatus: u32,
    pub posturl: String,
    /// Next undrained offset within the connection's byte space.
    pub pos: u64,
    pub contentlength: i64,
    pub in_buf: Vec<u8>,
    pub lastdata: Ds,
    /// Millisecond stamp taken when the request was posted.
    pub post_start_ms: u64,
}

impl HttpReq {
    pub fn new(id: u64) -> Self {
        HttpReq {
            id,
            status: ReqStatus::Ready,
            httpstatus: 0,
            posturl: String::new(),
            pos: 0,
            contentlength: 0,
            in_buf: Vec::new(),
            lastdata: 0,
            post_start_ms: 0,
        }
    }
}

/// Transport driver for ranged requests.
///
/// `post` hands a READY request to the transport; `perform` advances all
/// in-flight transfers; `update` moves any buffered bytes and terminal
/// status into the request so the owner can act on them.
pub trait HttpIo {
    /// Allocate a request with a transport-unique id.
    fn new_req(&mut self) -> HttpReq;

    /// Start the ranged POST for `req.posturl`. Moves the request to
    /// INFLIGHT (or FAILURE on immediate transport error).
    fn post(&mut self, req: &mut HttpReq) -> Result<()>;

    /// Tear down the transfer and discard buffered input.
    fn disconnect(&mut self, req: &mut HttpReq);

    /// Drive all registered transfers forward.
    fn perform(&mut self) -> Result<()>;

    /// Pull buffered bytes and any terminal status into `req`.
    fn update(&mut self, req: &mut HttpReq);
}


#[cfg(test)]
mod tests {
    use super::testio::{ScriptedIo, Step};
    use super::*;

    #[test]
    fn scripted_io_plays_back_steps() {
        let mut io = ScriptedIo::new();
        io.script(
            "http://a/",
            vec![
                Step::Data(b"1234".to_vec()),
                Step::Hold,
                Step::Data(b"5678".to_vec()),
                Step::Success(200),
            ],
        );
        let mut req = io.new_req();
        req.posturl = "http://a/0-7".to_string();
        io.post(&mut req).unwrap();
        assert_eq!(req.status, ReqStatus::Inflight);

        io.update(&mut req);
        assert_eq!(req.in_buf, b"1234");
        assert_eq!(req.status, ReqStatus::Inflight);

        io.update(&mut req);
        assert_eq!(req.in_buf, b"12345678");
        assert_eq!(req.status, ReqStatus::Success);
        assert_eq!(req.httpstatus, 200);
    }

    #[test]
    fn unmatched_url_stays_inflight_forever() {
        let mut io = ScriptedIo::new();
        let mut req = io.new_req();
        req.posturl = "http://nowhere/".to_string();
        io.post(&mut req).unwrap();
        io.update(&mut req);
        assert_eq!(req.status, ReqStatus::Inflight);
        assert!(req.in_buf.is_empty());
    }
}
