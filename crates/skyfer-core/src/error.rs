//! Error-kind taxonomy surfaced by the storage API and the transfer engine.

use std::fmt;

/// Classification of a transfer or read failure. These are opaque kinds as
/// far as callers are concerned; the policy tables in `transfer::fail` and
/// `direct_read::slot` enumerate how each one is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Ok,
    /// Operation left unfinished (e.g. file cancelled mid-transfer).
    Incomplete,
    /// Invalid arguments, typically a stale target handle.
    Args,
    /// Storage or bandwidth quota exceeded.
    OverQuota,
    /// Account is past the free-tier grace period.
    Paywall,
    /// Target blocked (takedown or similar).
    Blocked,
    /// Too many concurrent operations or requests.
    TooMany,
    /// Business account past due; fatal to the whole sync subsystem.
    BusinessPastDue,
    /// Sub-user key material missing for an upload.
    SubUserKeyMissing,
    /// Remote resource not found (e.g. file-storage server unavailable).
    NotFound,
    /// Local read failure, or source changed under an active upload.
    Read,
    /// Local write failure, including failed fingerprint verification.
    Write,
    /// Transient failure; retry later.
    Again,
    /// Key/MAC verification failure.
    Key,
    Failed,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorCode::Ok => "OK",
            ErrorCode::Incomplete => "EINCOMPLETE",
            ErrorCode::Args => "EARGS",
            ErrorCode::OverQuota => "EOVERQUOTA",
            ErrorCode::Paywall => "EPAYWALL",
            ErrorCode::Blocked => "EBLOCKED",
            ErrorCode::TooMany => "ETOOMANY",
            ErrorCode::BusinessPastDue => "EBUSINESSPASTDUE",
            ErrorCode::SubUserKeyMissing => "ESUBUSERKEYMISSING",
            ErrorCode::NotFound => "ENOENT",
            ErrorCode::Read => "EREAD",
            ErrorCode::Write => "EWRITE",
            ErrorCode::Again => "EAGAIN",
            ErrorCode::Key => "EKEY",
            ErrorCode::Failed => "EFAILED",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An error kind together with the extra-info marker some API responses
/// carry (a `TooMany` with extra info identifies a per-file takedown rather
/// than plain congestion, and is treated as permanent for downloads).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ApiError {
    pub code: ErrorCode,
    pub extra_info: bool,
}

impl ApiError {
    pub fn new(code: ErrorCode) -> Self {
        ApiError {
            code,
            extra_info: false,
        }
    }

    pub fn with_extra_info(code: ErrorCode) -> Self {
        ApiError {
            code,
            extra_info: true,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.code == ErrorCode::Ok
    }
}

impl From<ErrorCode> for ApiError {
    fn from(code: ErrorCode) -> Self {
        ApiError::new(code)
    }
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.extra_info {
            write!(f, "{} (+info)", self.code)
        } else {
            self.code.fmt(f)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_matches_wire_names() {
        assert_eq!(ErrorCode::OverQuota.to_string(), "EOVERQUOTA");
        assert_eq!(ErrorCode::NotFound.to_string(), "ENOENT");
        assert_eq!(ApiError::new(ErrorCode::Again).to_string(), "EAGAIN");
    }

    #[test]
    fn extra_info_marker() {
        let e = ApiError::with_extra_info(ErrorCode::TooMany);
        assert!(e.extra_info);
        assert_eq!(e.to_string(), "ETOOMANY (+info)");
        assert!(!ApiError::new(ErrorCode::TooMany).extra_info);
    }
}
