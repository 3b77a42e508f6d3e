//! Decisecond time arithmetic shared by backoff timers and read scheduling.

/// Monotonic time in deciseconds (tenths of a second).
pub type Ds = u64;

/// Sentinel for "do not fire": a timer armed with `NEVER` stays idle forever.
pub const NEVER: Ds = u64::MAX;

/// True if `ds` denotes an actual delay rather than the `NEVER` sentinel.
pub fn ever(ds: Ds) -> bool {
    ds != NEVER
}

/// Milliseconds to deciseconds, rounding down.
pub fn ms_to_ds(ms: u64) -> Ds {
    ms / 100
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn never_is_not_ever() {
        assert!(!ever(NEVER));
        assert!(ever(0));
        assert!(ever(42));
    }

    #[test]
    fn ms_conversion_rounds_down() {
        assert_eq!(ms_to_ds(0), 0);
        assert_eq!(ms_to_ds(99), 0);
        assert_eq!(ms_to_ds(100), 1);
        assert_eq!(ms_to_ds(1050), 10);
    }
}
