//! Per-target file descriptors owned by a transfer.
//!
//! One transfer can serve several targets (the same content downloaded to
//! two folders, say). Sync-originated targets defer most failure decisions
//! to the sync engine; app-originated ones give up once the error is clearly
//! permanent or the transfer has burned its retry budget.

use std::cell::Cell;
use std::rc::Rc;

use crate::distributor::TargetNameExistsResolution;
use crate::error::ErrorCode;
use crate::localpath::LocalPath;
use crate::record::NodeHandle;

/// Cooperative cancellation flag shared with the application.
#[derive(Debug, Clone, Default)]
pub struct CancelToken {
    flag: Rc<Cell<bool>>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.flag.set(true);
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.get()
    }
}

/// Origin and role of a file target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetKind {
    Download,
    SyncDownload,
    Upload,
    SyncUpload,
    /// Upload addressed to the support inbox.
    SupportUpload,
}

impl TargetKind {
    pub fn is_sync(self) -> bool {
        matches!(self, TargetKind::SyncDownload | TargetKind::SyncUpload)
    }

    pub fn is_upload(self) -> bool {
        matches!(
            self,
            TargetKind::Upload | TargetKind::SyncUpload | TargetKind::SupportUpload
        )
    }
}

/// How to resolve a target-name collision for this file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollisionResolution {
    Overwrite,
    RenameExistingToOldN,
    RenameNewWithN,
}

impl CollisionResolution {
    pub fn to_target_resolution(self) -> TargetNameExistsResolution {
        match self {
            CollisionResolution::Overwrite => TargetNameExistsResolution::OverwriteTarget,
            CollisionResolution::RenameExistingToOldN => {
                TargetNameExistsResolution::RenameExistingToOldN
            }
            CollisionResolution::RenameNewWithN => {
                TargetNameExistsResolution::RenameWithBracketedNumber
            }
        }
    }
}

/// One target of a transfer.
#[derive(Debug, Clone)]
pub struct File {
    pub kind: TargetKind,
    pub name: String,
    /// Target node (downloads) or parent node (uploads).
    pub handle: NodeHandle,
    pub localname: LocalPath,
    pub collision: CollisionResolution,
    pub cancel_token: CancelToken,
    /// Target node belongs to this account.
    pub hprivate: bool,
    /// Target node lives in someone else's storage.
    pub hforeign: bool,
    /// Local file is a temporary that should be cleaned up after completion.
    pub temporaryfile: bool,
    pub tag: i32,
    /// Terminal error recorded when the file was dropped from its transfer.
    pub terminated_err: Option<ErrorCode>,
}

impl File {
    pub fn new(kind: TargetKind, name: impl Into<String>, localname: LocalPath) -> Self {
        File {
            kind,
            name: name.into(),
            handle: NodeHandle(0),
            localname,
            collision: CollisionResolution::RenameNewWithN,
            cancel_token: CancelToken::new(),
            hprivate: true,
            hforeign: false,
            temporaryfile: false,
            tag: 0,
            terminated_err: None,
        }
    }

    pub fn is_sync(&self) -> bool {
        self.kind.is_sync()
    }

    /// Whether this file wants the transfer retried after `e`.
    ///
    /// MAC and local-write failures are final for everyone. Sync targets
    /// otherwise always ask for a retry (the sync engine re-evaluates the
    /// tree itself and removes the target if it is truly gone); app targets
    /// give up on takedowns and once the failure budget runs out.
    pub fn wants_retry(&self, e: ErrorCode, failcount: u32) -> bool {
        if matches!(e, ErrorCode::Key | ErrorCode::Write) {
            return false;
        }
        if self.is_sync() {
            return true;
        }
        match e {
            ErrorCode::Blocked => false,
            _ => failcount < 16,
        }
    }

    /// Final notification; the file is leaving its transfer.
    pub fn terminated(&mut self, e: ErrorCode) {
        self.terminated_err = Some(e);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cancel_token_is_shared() {
        let t = CancelToken::new();
        let t2 = t.clone();
        assert!(!t2.is_cancelled());
        t.cancel();
        assert!(t2.is_cancelled());
    }

    #[test]
    fn sync_files_retry_everything_but_final_errors() {
        let f = File::new(TargetKind::SyncDownload, "a", LocalPath::from("/s/a"));
        assert!(f.wants_retry(ErrorCode::Again, 100));
        assert!(f.wants_retry(ErrorCode::Blocked, 100));
        assert!(!f.wants_retry(ErrorCode::Key, 0));
        assert!(!f.wants_retry(ErrorCode::Write, 0));
    }

    #[test]
    fn permanent_errors_stop_retries() {
        let f = File::new(TargetKind::Download, "a", LocalPath::from("/d/a"));
        assert!(!f.wants_retry(ErrorCode::Key, 0));
        assert!(!f.wants_retry(ErrorCode::Blocked, 0));
        assert!(!f.wants_retry(ErrorCode::Write, 0));
        assert!(f.wants_retry(ErrorCode::Again, 0));
        assert!(f.wants_retry(ErrorCode::Again, 15));
        assert!(!f.wants_retry(ErrorCode::Again, 16), "failure budget exhausted");
    }
}
