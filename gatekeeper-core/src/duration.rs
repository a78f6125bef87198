//! Human-readable durations as written in policy files.
//!
//! Policy authors write ages such as `"2 hours 30 minutes"` or `"1 week"`.
//! Every `<number> <unit>` pair found in the string is summed; a month counts
//! as 30 days.

use regex::Regex;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

const MINUTE: u64 = 60;
const HOUR: u64 = 60 * MINUTE;
const DAY: u64 = 24 * HOUR;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DurationParseError {
    #[error("duration is empty")]
    Empty,
    #[error("no duration units found in {0:?}")]
    NoUnits(String),
    #[error("duration {0:?} is too large")]
    Overflow(String),
}

fn unit_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"(?i)(\d+)\s*(second|minute|hour|day|week|month)s?")
            .expect("duration pattern is a valid regex")
    })
}

fn unit_seconds(unit: &str) -> u64 {
    match unit.to_ascii_lowercase().as_str() {
        "second" => 1,
        "minute" => MINUTE,
        "hour" => HOUR,
        "day" => DAY,
        "week" => 7 * DAY,
        // month
        _ => 30 * DAY,
    }
}

/// Parse a duration such as `"1 day 12 hours"`.
pub fn parse_duration(input: &str) -> Result<Duration, DurationParseError> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err(DurationParseError::Empty);
    }

    let mut total: u64 = 0;
    let mut matched = false;
    for caps in unit_pattern().captures_iter(trimmed) {
        matched = true;
        let amount: u64 = caps[1]
            .parse()
            .map_err(|_| DurationParseError::Overflow(trimmed.to_string()))?;
        total = amount
            .checked_mul(unit_seconds(&caps[2]))
            .and_then(|secs| total.checked_add(secs))
            .ok_or_else(|| DurationParseError::Overflow(trimmed.to_string()))?;
    }

    if !matched {
        return Err(DurationParseError::NoUnits(trimmed.to_string()));
    }

    Ok(Duration::from_secs(total))
}

/// Round to the nearest whole minute, halfway values rounding up.
pub fn round_to_minute(duration: Duration) -> Duration {
    let millis = duration.as_millis();
    let minute = 60_000u128;
    let whole = millis / minute;
    let remainder = millis % minute;
    let minutes = if remainder * 2 >= minute {
        whole + 1
    } else {
        whole
    };
    Duration::from_secs((minutes as u64).saturating_mul(MINUTE))
}

/// Format as hours, minutes and seconds, e.g. `1h30m0s`, `45m0s` or `0s`.
///
/// Sub-second precision is dropped.
pub fn format_hms(duration: Duration) -> String {
    let secs = duration.as_secs();
    let hours = secs / HOUR;
    let minutes = (secs % HOUR) / MINUTE;
    let seconds = secs % MINUTE;

    if hours > 0 {
        format!("{}h{}m{}s", hours, minutes, seconds)
    } else if minutes > 0 {
        format!("{}m{}s", minutes, seconds)
    } else {
        format!("{}s", seconds)
    }
}

/// A minimum-age value in a policy file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyDuration(pub Duration);

impl PolicyDuration {
    pub fn as_duration(&self) -> Duration {
        self.0
    }

    pub fn is_zero(&self) -> bool {
        self.0.is_zero()
    }
}

impl From<Duration> for PolicyDuration {
    fn from(duration: Duration) -> Self {
        PolicyDuration(duration)
    }
}

impl fmt::Display for PolicyDuration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} seconds", self.0.as_secs())
    }
}

impl Serialize for PolicyDuration {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PolicyDuration {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse_duration(&raw)
            .map(PolicyDuration)
            .map_err(serde::de::Error::custom)
    }
}
