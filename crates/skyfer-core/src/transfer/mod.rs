//! Pending or active up/download, ordered by file fingerprint.
//!
//! A `Transfer` owns its `File` targets and, while active, a `TransferSlot`.
//! Everything needed to resume after a restart lives in the serialized
//! record (`serialize`); progress itself is derived from the chunk-MAC map.

pub mod complete;
pub mod fail;
pub mod file;
pub mod serialize;

use crate::backoff::Backoff;
use crate::chunkmacs::ChunkMacMap;
use crate::config::EngineConfig;
use crate::ds::Ds;
use crate::fingerprint::FileFingerprint;
use crate::fsaccess::OpenInfo;
use crate::localpath::LocalPath;
use crate::raid::RAIDPARTS;
use crate::record::NodeHandle;

pub use file::{CancelToken, CollisionResolution, File, TargetKind};

/// Engine-assigned transfer identity (also the cache row key).
pub type TransferId = u64;

pub const FILEKEY_LEN: usize = 32;
pub const TRANSFERKEY_LEN: usize = 16;
pub const UPLOAD_TOKEN_LEN: usize = 36;

/// Temp URLs go stale after this many seconds of inactivity.
pub const TEMPURL_TIMEOUT_SECS: i64 = 172_500;

/// Transfers above this size ride the large-file pools.
pub const LARGEFILE_THRESHOLD: u64 = 131_072;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    Get,
    Put,
}

impl Direction {
    pub fn index(self) -> usize {
        match self {
            Direction::Get => 0,
            Direction::Put => 1,
        }
    }

    pub fn tag(self) -> u8 {
        self.index() as u8
    }

    pub fn from_tag(t: u8) -> Option<Direction> {
        match t {
            0 => Some(Direction::Get),
            1 => Some(Direction::Put),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    None,
    Queued,
    Active,
    Paused,
    Retrying,
    Completing,
    Completed,
    Cancelled,
    Failed,
}

impl TransferState {
    pub fn tag(self) -> u8 {
        match self {
            TransferState::None => 0,
            TransferState::Queued => 1,
            TransferState::Active => 2,
            TransferState::Paused => 3,
            TransferState::Retrying => 4,
            TransferState::Completing => 5,
            TransferState::Completed => 6,
            TransferState::Cancelled => 7,
            TransferState::Failed => 8,
        }
    }

    pub fn from_tag(t: u8) -> Option<TransferState> {
        Some(match t {
            0 => TransferState::None,
            1 => TransferState::Queued,
            2 => TransferState::Active,
            3 => TransferState::Paused,
            4 => TransferState::Retrying,
            5 => TransferState::Completing,
            6 => TransferState::Completed,
            7 => TransferState::Cancelled,
            8 => TransferState::Failed,
            _ => return None,
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SizeClass {
    Large,
    Small,
}

/// Dispatch bucket: direction crossed with size class. Bucket indices 2..=5
/// address the six-slot selection array (0 and 1 are reserved).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferCategory {
    pub direction: Direction,
    pub sizetype: SizeClass,
}

impl TransferCategory {
    pub fn of(t: &Transfer) -> Self {
        TransferCategory {
            direction: t.direction,
            sizetype: if t.size > LARGEFILE_THRESHOLD {
                SizeClass::Large
            } else {
                SizeClass::Small
            },
        }
    }

    pub fn index(&self) -> usize {
        let s = match self.sizetype {
            SizeClass::Large => 0,
            SizeClass::Small => 1,
        };
        2 + self.direction.index() * 2 + s
    }
}

/// Live I/O state for one active transfer.
///
/// The heavy lifting (chunked upload/download requests) happens in the
/// transfer I/O layer; the lifecycle logic here needs the open-file snapshot
/// for drift detection and the retry timer used while completing.
#[derive(Debug)]
pub struct TransferSlot {
    pub fa: Option<OpenInfo>,
    pub retrying: bool,
    pub retrybt: Backoff,
}

impl TransferSlot {
    pub fn new() -> Self {
        TransferSlot {
            fa: None,
            retrying: false,
            retrybt: Backoff::new(11, 2560),
        }
    }
}

impl Default for TransferSlot {
    fn default() -> Self {
        Self::new()
    }
}

/// One pending or active file operation.
#[derive(Debug)]
pub struct Transfer {
    pub id: TransferId,
    pub direction: Direction,
    pub fingerprint: FileFingerprint,
    /// Recorded fingerprint of a failed integrity check.
    pub badfp: FileFingerprint,
    pub localfilename: LocalPath,
    pub filekey: [u8; FILEKEY_LEN],
    pub transferkey: [u8; TRANSFERKEY_LEN],
    pub ctriv: i64,
    pub metamac: i64,
    pub chunkmacs: ChunkMacMap,
    pub size: u64,
    pub pos: u64,
    pub progresscompleted: u64,
    pub state: TransferState,
    pub priority: u64,
    /// Empty, one URL, or exactly six (RAID).
    pub tempurls: Vec<String>,
    /// URL count of the previous attempt; detects non-RAID -> RAID resumption.
    pub discarded_temp_urls: u8,
    pub files: Vec<File>,
    pub failcount: u32,
    pub lastaccesstime: i64,
    pub ultoken: Option<[u8; UPLOAD_TOKEN_LEN]>,
    pub download_file_handle: Option<NodeHandle>,
    /// Kept across completion retries so a transient error doesn't restart
    /// target placement from scratch.
    pub download_distributor: Option<crate::distributor::FileDistributor>,
    pub slot: Option<TransferSlot>,
    pub bt: Backoff,
    pub finished: bool,
    pub tag: i32,
}

impl Transfer {
    pub fn new(id: TransferId, direction: Direction, cfg: &EngineConfig) -> Self {
        let base = match direction {
            Direction::Get => cfg.get_retry_base_ds,
            Direction::Put => cfg.put_retry_base_ds,
        };
        Transfer {
            id,
            direction,
            fingerprint: FileFingerprint::default(),
            badfp: FileFingerprint::default(),
            localfilename: LocalPath::default(),
            filekey: [0; FILEKEY_LEN],
            transferkey: [0; TRANSFERKEY_LEN],
            ctriv: 0,
            metamac: 0,
            chunkmacs: ChunkMacMap::new(),
            size: 0,
            pos: 0,
            progresscompleted: 0,
            state: TransferState::None,
            priority: 0,
            tempurls: Vec::new(),
            discarded_temp_urls: 0,
            files: Vec::new(),
            failcount: 0,
            lastaccesstime: 0,
            ultoken: None,
            download_file_handle: None,
            download_distributor: None,
            slot: None,
            bt: Backoff::new(base, cfg.retry_cap_ds),
            finished: false,
            tag: 0,
        }
    }

    /// Uploads addressed to the support inbox get special queue treatment.
    pub fn is_for_support(&self) -> bool {
        self.direction == Direction::Put
            && self
                .files
                .last()
                .map(|f| f.kind == TargetKind::SupportUpload)
                .unwrap_or(false)
    }

    /// Derive `(pos, progresscompleted)` from the chunk-MAC map.
    pub fn recalc_progress(&mut self) {
        let (pos, completed) = self.chunkmacs.calc_progress(self.size);
        self.pos = pos;
        self.progresscompleted = completed;
    }

    /// Discard temp URLs that can no longer be trusted: downloads that never
    /// moved a byte, and any set older than the URL lifetime. Downloads
    /// remember how many URLs they had so a later RAID resumption can adjust
    /// progress; uploads must restart their chunk state entirely.
    pub fn discard_temp_urls_if_stale(&mut self, now_secs: i64) {
        let stale = (self.direction == Direction::Get && self.pos == 0)
            || now_secs - self.lastaccesstime >= TEMPURL_TIMEOUT_SECS;
        if !stale || self.tempurls.is_empty() {
            return;
        }

        tracing::warn!(
            transfer = self.id,
            pos = self.pos,
            lastaccesstime = self.lastaccesstime,
            "discarding stale temp URLs"
        );

        match self.direction {
            Direction::Get => {
                self.discarded_temp_urls = self.tempurls.len() as u8;
            }
            Direction::Put => {
                self.chunkmacs.clear();
                self.progresscompleted = 0;
                self.ultoken = None;
                self.pos = 0;
            }
        }
        self.tempurls.clear();
    }

    /// A download that began against a single URL and resumed against six
    /// parts must drop any progress that is not RAID-line aligned: part
    /// fetches cannot credit a partial line.
    pub fn adjust_progress_if_now_raided(&mut self) {
        let resumed_as_raid =
            self.discarded_temp_urls == 1 && self.tempurls.len() == RAIDPARTS;
        if !resumed_as_raid {
            return;
        }

        let boundary = self.chunkmacs.truncate_to_raidline(self.pos);
        self.recalc_progress();
        self.pos = self.pos.min(boundary);
        if self.progresscompleted > self.size {
            tracing::error!(transfer = self.id, "invalid transfer progress after raid adjust");
            self.pos = self.size;
            self.progresscompleted = self.size;
        }
        tracing::debug!(
            transfer = self.id,
            pos = self.pos,
            completed = self.progresscompleted,
            "adjusted resumed transfer for raid part alignment"
        );
        self.discarded_temp_urls = 0;
    }

    /// Ready for dispatch: queued or retrying, with the backoff elapsed.
    pub fn is_ready(&self, now: Ds) -> bool {
        matches!(
            self.state,
            TransferState::Queued | TransferState::Retrying
        ) && self.bt.armed(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn transfer(direction: Direction) -> Transfer {
        Transfer::new(1, direction, &EngineConfig::default())
    }

    #[test]
    fn category_indices_span_two_to_five() {
        let mut t = transfer(Direction::Get);
        t.size = 1;
        assert_eq!(TransferCategory::of(&t).index(), 3);
        t.size = LARGEFILE_THRESHOLD + 1;
        assert_eq!(TransferCategory::of(&t).index(), 2);
        let mut t = transfer(Direction::Put);
        t.size = 1;
        assert_eq!(TransferCategory::of(&t).index(), 5);
        t.size = LARGEFILE_THRESHOLD + 1;
        assert_eq!(TransferCategory::of(&t).index(), 4);
    }

    #[test]
    fn stale_url_discard_get_records_count() {
        let mut t = transfer(Direction::Get);
        t.tempurls = vec!["u".into()];
        t.pos = 0;
        t.discard_temp_urls_if_stale(0);
        assert!(t.tempurls.is_empty());
        assert_eq!(t.discarded_temp_urls, 1);
    }

    #[test]
    fn fresh_get_with_progress_keeps_urls() {
        let mut t = transfer(Direction::Get);
        t.tempurls = vec!["u".into()];
        t.pos = 500;
        t.lastaccesstime = 1_000_000;
        t.discard_temp_urls_if_stale(1_000_000 + 10);
        assert_eq!(t.tempurls.len(), 1);
    }

    #[test]
    fn stale_url_discard_put_clears_chunk_state() {
        let mut t = transfer(Direction::Put);
        t.tempurls = vec!["u".into()];
        t.pos = 500;
        t.progresscompleted = 500;
        t.ultoken = Some([7; UPLOAD_TOKEN_LEN]);
        t.lastaccesstime = 0;
        t.discard_temp_urls_if_stale(TEMPURL_TIMEOUT_SECS + 1);
        assert!(t.tempurls.is_empty());
        assert_eq!(t.pos, 0);
        assert_eq!(t.progresscompleted, 0);
        assert!(t.ultoken.is_none());
    }

    #[test]
    fn support_uploads_are_detected_from_the_last_file() {
        let mut t = transfer(Direction::Put);
        assert!(!t.is_for_support());
        t.files.push(File::new(
            TargetKind::SupportUpload,
            "report",
            crate::localpath::LocalPath::from("/tmp/report"),
        ));
        assert!(t.is_for_support());
        let mut g = transfer(Direction::Get);
        g.files.push(File::new(
            TargetKind::Download,
            "d",
            crate::localpath::LocalPath::from("/tmp/d"),
        ));
        assert!(!g.is_for_support());
    }

    #[test]
    fn ready_requires_state_and_armed_backoff() {
        let mut t = transfer(Direction::Get);
        t.state = TransferState::Queued;
        assert!(t.is_ready(0));
        t.bt.backoff(0);
        assert!(!t.is_ready(0));
        t.state = TransferState::Paused;
        t.bt.arm();
        assert!(!t.is_ready(0));
        t.state = TransferState::Retrying;
        assert!(t.is_ready(0));
    }
}
