//! One range read of a streaming file.

use crate::ds::Ds;
use crate::error::ApiError;
use crate::raid::{DirectReadBuffer, EFFECTIVE_RAIDPARTS, RAIDPARTS};

use super::slot::{DirectReadSlot, MAX_REQ_SIZE};
use super::ReadId;

/// Consumer of a direct read's output and lifecycle events.
///
/// `on_data` returns false to end the read; `on_failure` returns the desired
/// retry delay in deciseconds (`NEVER` to cancel). `is_valid` lets a sink
/// report that its consumer has gone away, which aborts the read at the next
/// step.
pub trait ReadSink {
    fn on_data(&mut self, buf: &[u8], offset: u64, speed: u64, mean_speed: u64) -> bool;

    fn on_failure(&mut self, e: ApiError, retry: u32, timeleft: Ds) -> Ds;

    fn is_valid(&self) -> bool {
        true
    }

    /// The read is being torn down without a failure (node revoked).
    fn revoke(&mut self) {}
}

/// A pending or active range read `[offset, offset + count)`.
pub struct DirectRead {
    pub id: ReadId,
    pub offset: u64,
    pub count: u64,
    /// Bytes already delivered to the sink.
    pub progress: u64,
    pub next_request_pos: u64,
    pub reqtag: i32,
    pub buffer: DirectReadBuffer,
    pub sink: Box<dyn ReadSink>,
    pub slot: Option<DirectReadSlot>,
}

impl DirectRead {
    pub fn new(
        id: ReadId,
        offset: u64,
        count: u64,
        reqtag: i32,
        sink: Box<dyn ReadSink>,
    ) -> Self {
        DirectRead {
            id,
            offset,
            count,
            progress: 0,
            next_request_pos: offset,
            reqtag,
            buffer: DirectReadBuffer::new(),
            sink,
            slot: None,
        }
    }

    /// Largest single request this read should issue, given the node size
    /// and how many URLs serve it.
    pub fn max_req_size(&self, node_size: u64, url_count: usize) -> u64 {
        let parts = if url_count == RAIDPARTS {
            EFFECTIVE_RAIDPARTS as u64
        } else {
            url_count.max(1) as u64
        };
        (node_size / parts).max(MAX_REQ_SIZE)
    }
}

impl std::fmt::Debug for DirectRead {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectRead")
            .field("id", &self.id)
            .field("offset", &self.offset)
            .field("count", &self.count)
            .field("progress", &self.progress)
            .field("slotted", &self.slot.is_some())
            .finish()
    }
}
