//! Clock abstraction and relative time offsets.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Duration, Utc};

use crate::error::ConfigurationError;

/// Abstraction over system time for deterministic behavior.
pub trait Clock: Send + Sync {
    /// Returns the current time.
    fn now(&self) -> DateTime<Utc>;
}

/// Production clock that delegates to the system clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// A signed offset relative to "now", written like `+1 hour` or `-30 minutes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RelativeOffset {
    seconds: i64,
}

impl RelativeOffset {
    /// Offset of a whole number of seconds.
    #[must_use]
    pub fn from_seconds(seconds: i64) -> Self {
        Self { seconds }
    }

    /// Parses offsets such as `+1 hour`, `30 minutes`, `-2 days`, `1w`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidRelativeOffset` on unknown units,
    /// missing amounts or offsets wider than the representable date range.
    pub fn parse(input: &str) -> Result<Self, ConfigurationError> {
        let invalid = || ConfigurationError::InvalidRelativeOffset(input.to_owned());
        let trimmed = input.trim();
        let (sign, rest) = match trimmed.strip_prefix('-') {
            Some(rest) => (-1, rest),
            None => (1, trimmed.strip_prefix('+').unwrap_or(trimmed)),
        };
        let rest = rest.trim_start();
        let digits_end = rest
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(rest.len());
        if digits_end == 0 {
            return Err(invalid());
        }
        let amount: i64 = rest[..digits_end].parse().map_err(|_| invalid())?;
        let unit_seconds = match rest[digits_end..].trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => 1,
            "m" | "min" | "mins" | "minute" | "minutes" => 60,
            "h" | "hour" | "hours" => 3_600,
            "d" | "day" | "days" => 86_400,
            "w" | "week" | "weeks" => 604_800,
            _ => return Err(invalid()),
        };
        let seconds = amount
            .checked_mul(unit_seconds)
            .and_then(|s| s.checked_mul(sign))
            .filter(|s| s.unsigned_abs() <= max_span_seconds())
            .ok_or_else(invalid)?;
        Ok(Self { seconds })
    }

    /// Length of the offset in seconds (negative for past offsets).
    #[must_use]
    pub fn as_seconds(&self) -> i64 {
        self.seconds
    }

    /// Returns `true` for offsets pointing into the future.
    #[must_use]
    pub fn is_positive(&self) -> bool {
        self.seconds > 0
    }

    /// The offset as a chrono duration, if it fits one.
    #[must_use]
    pub fn to_duration(&self) -> Option<Duration> {
        Duration::try_seconds(self.seconds)
    }

    /// Applies the offset to `from`.
    ///
    /// # Errors
    ///
    /// Returns `ConfigurationError::InvalidRelativeOffset` when the result
    /// falls outside the representable date range.
    pub fn apply(&self, from: DateTime<Utc>) -> Result<DateTime<Utc>, ConfigurationError> {
        self.to_duration()
            .and_then(|duration| from.checked_add_signed(duration))
            .ok_or_else(|| ConfigurationError::InvalidRelativeOffset(self.to_string()))
    }
}

/// Widest span between two representable instants.
fn max_span_seconds() -> u64 {
    DateTime::<Utc>::MAX_UTC
        .signed_duration_since(DateTime::<Utc>::MIN_UTC)
        .num_seconds()
        .unsigned_abs()
}

impl FromStr for RelativeOffset {
    type Err = ConfigurationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for RelativeOffset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:+} seconds", self.seconds)
    }
}
