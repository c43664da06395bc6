use std::time::Duration;

use time::OffsetDateTime;

/// Returns the wall-clock time in milliseconds since the Unix epoch.
pub(crate) fn timestamp_ms() -> u64 {
    let ns = OffsetDateTime::now_utc().unix_timestamp_nanos();
    // The wall clock being set before 1970 is not something we can report.
    u64::try_from(ns / 1_000_000).unwrap_or_default()
}

/// Converts a duration to nanoseconds, saturating.
pub(crate) fn duration_ns(duration: Duration) -> u64 {
    u64::try_from(duration.as_nanos()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn timestamp() {
        // 2020-09-13.
        assert!(timestamp_ms() > 1_600_000_000_000);
    }

    #[test]
    fn duration() {
        assert_eq!(duration_ns(Duration::from_micros(1500)), 1_500_000);
        assert_eq!(duration_ns(Duration::MAX), u64::MAX);
    }
}
