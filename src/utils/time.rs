//! Wall-clock helpers. Dates on the wire are milliseconds since the Unix epoch.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Current wall-clock time in milliseconds since the Unix epoch
pub fn unix_millis() -> i64 {
    to_unix_millis(SystemTime::now())
}

/// Convert a `SystemTime` into a wire timestamp, clamping dates before the epoch
pub fn to_unix_millis(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// Convert a wire timestamp into a `SystemTime`, clamping dates before the epoch
pub fn from_unix_millis(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_trip() {
        let now = unix_millis();
        assert!(now > 0);
        assert_eq!(to_unix_millis(from_unix_millis(now)), now);
    }

    #[test]
    fn test_negative_dates_clamp() {
        assert_eq!(from_unix_millis(-5), UNIX_EPOCH);
    }
}
