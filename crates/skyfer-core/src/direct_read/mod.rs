//! Streaming direct reads: per-file multiplexer nodes, range reads and the
//! parallel-connection slot that serves them.

pub mod node;
pub mod read;
pub mod slot;

use crate::record::NodeHandle;

pub use node::{DirectReadNode, NodeWatch};
pub use read::{DirectRead, ReadSink};
pub use slot::{DirectReadSlot, SlotAction, SlotCtx};

/// Engine-assigned identity of one range read.
pub type ReadId = u64;

/// Key of a streaming file: node handle plus whether it was opened through
/// a private (authenticated) link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeKey {
    pub handle: NodeHandle,
    pub private: bool,
}
