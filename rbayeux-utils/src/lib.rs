//! Small helpers shared by the rbayeux crates.
//!
//! - Duration strings such as `1m30s` or `250ms` ([`to_duration`]) with a serde
//!   adapter for configuration files ([`deserialize_duration`])
//! - Wall-clock timestamps in seconds and milliseconds
//! - Thread-safe statistics counters ([`Counter`], [`Total`])
//!
//! ```
//! use rbayeux_utils::{to_duration, timestamp_millis, Counter};
//!
//! assert_eq!(to_duration("1m30s").as_secs(), 90);
//! assert!(timestamp_millis() > 0);
//!
//! let c = Counter::new();
//! c.inc();
//! c.inc();
//! c.dec();
//! assert_eq!((c.count(), c.max()), (1, 2));
//! ```

#![deny(unsafe_code)]

use std::time::Duration;

use serde::de::{Deserialize, Deserializer};

mod counter;

pub use counter::{Counter, Total};

/// Seconds since Unix epoch
pub type Timestamp = i64;

/// Milliseconds since Unix epoch
pub type TimestampMillis = i64;

/// Deserialize a [`Duration`] written as a human-readable string
#[inline]
pub fn deserialize_duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    let v = String::deserialize(deserializer)?;
    Ok(to_duration(&v))
}

/// Parse a human-readable duration.
///
/// Units: `ms`, `s`, `m`, `h`, `d`. A bare number is taken as seconds.
/// Unknown units or malformed parts count as zero.
///
/// ```
/// assert_eq!(rbayeux_utils::to_duration("2h5s").as_secs(), 7205);
/// assert_eq!(rbayeux_utils::to_duration("1s500ms").as_millis(), 1500);
/// assert_eq!(rbayeux_utils::to_duration("30").as_secs(), 30);
/// ```
pub fn to_duration(text: &str) -> Duration {
    let text = text.trim().to_lowercase();
    if let Ok(secs) = text.parse::<u64>() {
        return Duration::from_secs(secs);
    }

    let mut millis = 0u64;
    let mut number = String::new();
    let mut chars = text.chars().peekable();
    while let Some(c) = chars.next() {
        if c.is_ascii_digit() {
            number.push(c);
            continue;
        }
        let v = number.parse::<u64>().unwrap_or_default();
        number.clear();
        let factor = match c {
            'm' if chars.peek() == Some(&'s') => {
                chars.next();
                1
            }
            's' => 1_000,
            'm' => 60_000,
            'h' => 3_600_000,
            'd' => 86_400_000,
            _ => 0,
        };
        millis = millis.saturating_add(v.saturating_mul(factor));
    }
    Duration::from_millis(millis)
}

#[inline]
pub fn timestamp_secs() -> Timestamp {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_secs() as i64)
        .unwrap_or_else(|_| chrono::Utc::now().timestamp())
}

#[inline]
pub fn timestamp_millis() -> TimestampMillis {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|t| t.as_millis() as i64)
        .unwrap_or_else(|_| chrono::Utc::now().timestamp_millis())
}

/// RFC 3339 UTC rendering of a millisecond timestamp, empty for non-positive input
#[inline]
pub fn format_timestamp_millis(t: TimestampMillis) -> String {
    if t <= 0 {
        return String::new();
    }
    chrono::DateTime::from_timestamp_millis(t)
        .map(|dt| dt.to_rfc3339_opts(chrono::SecondsFormat::Millis, true))
        .unwrap_or_default()
}
