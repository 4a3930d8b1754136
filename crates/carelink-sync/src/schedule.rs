//! Interval evaluation for `sync_frequency` strings.
//!
//! Only minute-level intervals are supported. Cron-like strings are accepted
//! for the shapes that express a fixed interval (`*/15 * * * *`,
//! `0 */2 * * *`, `0 0 * * *`); day-of-week and day-of-month fields are not
//! interpreted.

use chrono::{DateTime, Utc};

const MINUTES_PER_HOUR: u32 = 60;
const MINUTES_PER_DAY: u32 = 24 * 60;

/// Parsed sync interval.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncFrequency {
    /// Every N minutes.
    Minutes(u32),
    /// Every N hours.
    Hours(u32),
    /// Every 24 hours.
    Daily,
}

impl SyncFrequency {
    /// Parses a frequency string; `None` when the shape is not understood.
    pub fn parse(raw: &str) -> Option<Self> {
        let normalized = raw.trim().to_ascii_lowercase();
        let fields: Vec<&str> = normalized.split_whitespace().collect();

        let parsed = match fields.as_slice() {
            ["hourly" | "@hourly"] | ["every", "hour"] | ["0", "*", "*", "*", "*"] => {
                Some(Self::Hours(1))
            },
            ["daily" | "@daily" | "@midnight"] | ["every", "day"] | ["0", "0", "*", "*", "*"] => {
                Some(Self::Daily)
            },
            ["every", "minute"] | ["*", "*", "*", "*", "*"] => Some(Self::Minutes(1)),
            ["every", n, "minutes" | "minute" | "mins" | "min"] => n.parse().ok().map(Self::Minutes),
            ["every", n, "hours" | "hour"] => n.parse().ok().map(Self::Hours),
            [minute, "*", "*", "*", "*"] => {
                minute.strip_prefix("*/").and_then(|n| n.parse().ok()).map(Self::Minutes)
            },
            ["0", hour, "*", "*", "*"] => {
                hour.strip_prefix("*/").and_then(|n| n.parse().ok()).map(Self::Hours)
            },
            [single] => parse_suffixed(single),
            _ => None,
        };

        parsed.filter(|f| f.interval_minutes() > 0)
    }

    /// Interval length in minutes.
    pub fn interval_minutes(&self) -> u32 {
        match self {
            Self::Minutes(n) => *n,
            Self::Hours(n) => n.saturating_mul(MINUTES_PER_HOUR),
            Self::Daily => MINUTES_PER_DAY,
        }
    }

    /// True when a config last synced at `last_sync_at` should sync at `now`.
    ///
    /// Both timestamps are truncated to the minute. A config that never
    /// synced is always due.
    pub fn is_due(&self, last_sync_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        let Some(last) = last_sync_at else {
            return true;
        };
        let elapsed = minute_of(now) - minute_of(last);
        elapsed >= i64::from(self.interval_minutes())
    }
}

fn parse_suffixed(token: &str) -> Option<SyncFrequency> {
    if let Some(n) = token.strip_suffix('m') {
        return n.parse().ok().map(SyncFrequency::Minutes);
    }
    if let Some(n) = token.strip_suffix('h') {
        return n.parse().ok().map(SyncFrequency::Hours);
    }
    None
}

fn minute_of(at: DateTime<Utc>) -> i64 {
    at.timestamp().div_euclid(60)
}
