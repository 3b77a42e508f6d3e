//! Per-file multiplexer for streaming reads.
//!
//! One node per streamed file, many concurrent range reads. The node owns
//! the shared temp URLs, the retry counter and the timed-retry schedule; the
//! engine drives dispatch, URL command results and retries because they
//! touch the global read queue.

use crate::ds::Ds;
use crate::http::HttpIo;

use super::read::DirectRead;
use super::slot::{SlotAction, SlotCtx};
use super::{NodeKey, ReadId};

/// Watchdog window shared by the node's active slots.
#[derive(Debug, Clone, Copy, Default)]
pub struct NodeWatch {
    pub partiallen: u64,
    pub partialstarttime: Ds,
}

/// Outcome of stepping one read's slot, lifted to node level.
#[derive(Debug)]
pub enum ReadStep {
    Continue,
    /// The read finished or lost its consumer; remove it.
    DestroyRead(ReadId),
    /// The whole node must retry (all reads aborted, URLs re-requested).
    Retry {
        e: crate::error::ApiError,
        timeleft: Ds,
    },
}

pub struct DirectReadNode {
    pub key: NodeKey,
    pub tempurls: Vec<String>,
    pub size: u64,
    pub retries: u32,
    /// An URL-refresh command is outstanding.
    pub pending_cmd: bool,
    pub watch: NodeWatch,
    /// Absolute decisecond stamp of the next timed action, if any.
    pub sched: Option<Ds>,
    pub reads: Vec<DirectRead>,
}

impl DirectReadNode {
    pub fn new(key: NodeKey, size: u64) -> Self {
        DirectReadNode {
            key,
            tempurls: Vec::new(),
            size,
            retries: 0,
            pending_cmd: false,
            watch: NodeWatch::default(),
            sched: None,
            reads: Vec::new(),
        }
    }

    pub fn schedule(&mut self, now: Ds, delta: Ds) {
        self.sched = if crate::ds::ever(delta) {
            Some(now.saturating_add(delta))
        } else {
            None
        };
    }

    pub fn read_index(&self, id: ReadId) -> Option<usize> {
        self.reads.iter().position(|r| r.id == id)
    }

    /// Step one read's slot. Split-borrows the read out of `reads` and the
    /// watchdog window alongside it so the slot can update both.
    pub fn exec_read(
        &mut self,
        idx: usize,
        io: &mut dyn HttpIo,
        min_streaming_rate: i64,
        usealtdownport: bool,
        now_ds: Ds,
        now_ms: u64,
    ) -> ReadStep {
        let read = &mut self.reads[idx];
        let Some(mut slot) = read.slot.take() else {
            return ReadStep::Continue;
        };
        let mut ctx = SlotCtx {
            io,
            min_streaming_rate,
            usealtdownport,
            now_ds,
            now_ms,
            reschedule: None,
        };
        let action = slot.doio(read, &mut self.watch, &mut ctx);
        let reschedule = ctx.reschedule;
        let step = match action {
            SlotAction::Continue => {
                read.slot = Some(slot);
                ReadStep::Continue
            }
            SlotAction::DestroyRead => {
                slot.disconnect_all(&mut *ctx.io);
                ReadStep::DestroyRead(read.id)
            }
            SlotAction::RetryTransfer { e, timeleft } => {
                read.slot = Some(slot);
                ReadStep::Retry { e, timeleft }
            }
        };
        if let Some(delta) = reschedule {
            self.schedule(now_ds, delta);
        }
        step
    }
}

impl std::fmt::Debug for DirectReadNode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirectReadNode")
            .field("key", &self.key)
            .field("urls", &self.tempurls.len())
            .field("size", &self.size)
            .field("retries", &self.retries)
            .field("reads", &self.reads)
            .finish()
    }
}
