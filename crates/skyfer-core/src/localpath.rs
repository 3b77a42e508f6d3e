//! Platform-tagged opaque encoding for local filesystem paths.
//!
//! Persisted records carry paths as byte strings. The portable form prefixes
//! a platform tag so a record written on one OS is recognized (and rejected
//! cleanly, rather than misread) on another; the legacy form is the raw
//! platform-encoded bytes, still accepted on read.

use std::fmt;
use std::path::{Path, PathBuf};

#[cfg(unix)]
use std::os::unix::ffi::{OsStrExt, OsStringExt};

/// Platform tag used in the portable encoding.
#[cfg(unix)]
const PLATFORM_TAG: u8 = 1;
#[cfg(not(unix))]
const PLATFORM_TAG: u8 = 2;

/// A local absolute path with a stable serialized form.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LocalPath {
    path: PathBuf,
}

impl LocalPath {
    pub fn new(path: PathBuf) -> Self {
        LocalPath { path }
    }

    pub fn is_empty(&self) -> bool {
        self.path.as_os_str().is_empty()
    }

    pub fn is_absolute(&self) -> bool {
        self.path.is_absolute()
    }

    pub fn as_path(&self) -> &Path {
        &self.path
    }

    pub fn clear(&mut self) {
        self.path = PathBuf::new();
    }

    pub fn parent(&self) -> Option<LocalPath> {
        self.path.parent().map(|p| LocalPath::new(p.to_path_buf()))
    }

    /// Portable serialized form: platform tag byte followed by the
    /// platform-encoded bytes.
    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(1 + self.path.as_os_str().len());
        out.push(PLATFORM_TAG);
        out.extend_from_slice(Self::platform_bytes(&self.path));
        out
    }

    /// Decode the portable form. `None` when the tag is missing or belongs
    /// to a different platform.
    pub fn unserialize(data: &[u8]) -> Option<LocalPath> {
        let (&tag, rest) = data.split_first()?;
        if tag != PLATFORM_TAG {
            return None;
        }
        Some(LocalPath::new(Self::from_platform_bytes(rest)))
    }

    /// Decode the legacy (untagged) platform-encoded form.
    pub fn from_platform_encoded(data: &[u8]) -> LocalPath {
        LocalPath::new(Self::from_platform_bytes(data))
    }

    #[cfg(unix)]
    fn platform_bytes(p: &Path) -> &[u8] {
        p.as_os_str().as_bytes()
    }

    #[cfg(unix)]
    fn from_platform_bytes(data: &[u8]) -> PathBuf {
        PathBuf::from(std::ffi::OsString::from_vec(data.to_vec()))
    }

    #[cfg(not(unix))]
    fn platform_bytes(p: &Path) -> &[u8] {
        // Lossy on non-Unix; records written here are tagged so other
        // platforms reject rather than misread them.
        p.to_str().map(str::as_bytes).unwrap_or(&[])
    }

    #[cfg(not(unix))]
    fn from_platform_bytes(data: &[u8]) -> PathBuf {
        PathBuf::from(String::from_utf8_lossy(data).into_owned())
    }
}

impl From<&str> for LocalPath {
    fn from(s: &str) -> Self {
        LocalPath::new(PathBuf::from(s))
    }
}

impl From<PathBuf> for LocalPath {
    fn from(p: PathBuf) -> Self {
        LocalPath::new(p)
    }
}

impl fmt::Display for LocalPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.path.display().fmt(f)
    }
}
