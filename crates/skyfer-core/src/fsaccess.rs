//! Filesystem capability consumed by transfer completion.
//!
//! The engine never touches `std::fs` directly for completion decisions;
//! this seam lets tests substitute failure and drift scenarios. The
//! transient-error flag reports on the most recent operation, so callers
//! check it immediately after a failure.

use filetime::FileTime;
use std::io;

use crate::fingerprint::FileFingerprint;
use crate::localpath::LocalPath;

/// Snapshot of an open file used to detect source drift during uploads.
#[derive(Debug, Clone, Copy, Default)]
pub struct OpenInfo {
    pub fopen_succeeded: bool,
    pub size: u64,
    pub mtime: i64,
}

pub trait FsAccess {
    /// Set a file's modification time. Returns success.
    fn set_mtime(&mut self, path: &LocalPath, mtime: i64) -> bool;

    /// Remove a local file. Returns success.
    fn unlink(&mut self, path: &LocalPath) -> bool;

    /// Fingerprint a file's current on-disk contents.
    fn fingerprint(&mut self, path: &LocalPath) -> Option<FileFingerprint>;

    /// Open metadata for drift checks.
    fn open_info(&mut self, path: &LocalPath) -> OpenInfo;

    /// Whether the most recent failed operation looked transient.
    fn transient_error(&self) -> bool;
}

/// Production implementation over std::fs.
#[derive(Debug, Default)]
pub struct StdFs {
    transient: bool,
}

impl StdFs {
    pub fn new() -> Self {
        Self::default()
    }

    fn note<T>(&mut self, r: io::Result<T>) -> Option<T> {
        match r {
            Ok(v) => {
                self.transient = false;
                Some(v)
            }
            Err(e) => {
                self.transient = matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::WouldBlock
                );
                None
            }
        }
    }
}

impl FsAccess for StdFs {
    fn set_mtime(&mut self, path: &LocalPath, mtime: i64) -> bool {
        self.note(filetime::set_file_mtime(
            path.as_path(),
            FileTime::from_unix_time(mtime, 0),
        ))
        .is_some()
    }

    fn unlink(&mut self, path: &LocalPath) -> bool {
        self.note(std::fs::remove_file(path.as_path())).is_some()
    }

    fn fingerprint(&mut self, path: &LocalPath) -> Option<FileFingerprint> {
        match FileFingerprint::from_file(path.as_path()) {
            Ok(fp) => {
                self.transient = false;
                Some(fp)
            }
            Err(e) => {
                tracing::debug!("fingerprint of {} failed: {}", path, e);
                self.transient = false;
                None
            }
        }
    }

    fn open_info(&mut self, path: &LocalPath) -> OpenInfo {
        match std::fs::metadata(path.as_path()) {
            Ok(meta) => {
                self.transient = false;
                OpenInfo {
                    fopen_succeeded: true,
                    size: meta.len(),
                    mtime: meta
                        .modified()
                        .ok()
                        .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
                        .map(|d| d.as_secs() as i64)
                        .unwrap_or(0),
                }
            }
            Err(e) => {
                self.transient = matches!(
                    e.kind(),
                    io::ErrorKind::Interrupted
                        | io::ErrorKind::TimedOut
                        | io::ErrorKind::WouldBlock
                );
                OpenInfo::default()
            }
        }
    }

    fn transient_error(&self) -> bool {
        self.transient
    }
}
