//! Wall-clock time helpers.
//!
//! Ticks arrive with millisecond timestamps while candles are keyed by
//! bucket-start seconds; both conversions live here.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time as **milliseconds** since Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Current time as **seconds** since Unix epoch.
#[inline]
pub fn now_secs() -> i64 {
    (now_ms() / 1_000) as i64
}

/// Convert a millisecond timestamp to whole seconds (floor).
#[inline]
pub fn ms_to_secs(ts_ms: u64) -> i64 {
    (ts_ms / 1_000) as i64
}

/// Align `ts_secs` down to the start of its `width`-second bucket.
///
/// A zero width leaves the timestamp unchanged.
#[inline]
pub fn align_down(ts_secs: i64, width: i64) -> i64 {
    if width <= 0 {
        return ts_secs;
    }
    ts_secs.div_euclid(width) * width
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_to_bucket() {
        assert_eq!(align_down(0, 60), 0);
        assert_eq!(align_down(59, 60), 0);
        assert_eq!(align_down(61, 60), 60);
        assert_eq!(align_down(3_599, 300), 3_300);
        assert_eq!(align_down(42, 0), 42);
    }

    #[test]
    fn ms_conversion_floors() {
        assert_eq!(ms_to_secs(61_999), 61);
        assert_eq!(ms_to_secs(0), 0);
    }

    #[test]
    fn clock_is_sane() {
        // Past 2020-01-01.
        assert!(now_secs() > 1_577_836_800);
        assert!(now_ms() >= 1_577_836_800_000);
    }
}
