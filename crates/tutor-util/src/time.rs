//! Time utilities for tutord
//!
//! All instants handled by tutord are UTC. Session windows, reschedule
//! candidates and job fire times are expressed as `DateTime<Utc>` and the
//! engine receives `now` explicitly from its caller; [`now`] is the single
//! place that reads the system clock.
//!
//! # Mock Time for Development
//!
//! In debug builds, the `TUTORD_MOCK_TIME` environment variable can be set to
//! an RFC 3339 instant (e.g. `2025-01-01T09:55:00Z`). The clock then starts at
//! that instant and advances at the real rate, which makes it easy to walk a
//! session through its start window by hand.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Environment variable name for mock time (debug builds only)
pub const MOCK_TIME_ENV_VAR: &str = "TUTORD_MOCK_TIME";

/// Offset between mock time and real time, computed once at first use.
static MOCK_TIME_OFFSET: OnceLock<Option<Duration>> = OnceLock::new();

#[allow(clippy::disallowed_methods)] // wraps Utc::now()
fn get_mock_time_offset() -> Option<Duration> {
    *MOCK_TIME_OFFSET.get_or_init(|| {
        #[cfg(debug_assertions)]
        {
            if let Ok(raw) = std::env::var(MOCK_TIME_ENV_VAR) {
                match parse_instant(&raw) {
                    Some(mock_now) => {
                        let offset = mock_now.signed_duration_since(Utc::now());
                        tracing::info!(
                            mock_time = %raw,
                            offset_secs = offset.num_seconds(),
                            "Mock time enabled"
                        );
                        return Some(offset);
                    }
                    None => {
                        tracing::warn!(
                            mock_time = %raw,
                            expected_format = "RFC 3339",
                            "Invalid mock time format"
                        );
                    }
                }
            }
            None
        }
        #[cfg(not(debug_assertions))]
        {
            None
        }
    })
}

/// Returns whether mock time is currently active.
pub fn is_mock_time_active() -> bool {
    get_mock_time_offset().is_some()
}

/// Current UTC time, respecting `TUTORD_MOCK_TIME` in debug builds.
#[allow(clippy::disallowed_methods)] // the one sanctioned wall-clock read
pub fn now() -> DateTime<Utc> {
    let real_now = Utc::now();

    match get_mock_time_offset() {
        Some(offset) => real_now + offset,
        None => real_now,
    }
}

/// Parse an RFC 3339 instant and normalise it to UTC.
pub fn parse_instant(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value.trim())
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

/// Format an instant the way it is persisted (RFC 3339, second precision
/// unless sub-second digits are present).
pub fn format_instant(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(chrono::SecondsFormat::AutoSi, true)
}

/// Whole minutes as a chrono duration.
pub fn minutes(n: u32) -> Duration {
    Duration::minutes(i64::from(n))
}

/// Half-open interval `[start, end)` on the UTC timeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeSpan {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl TimeSpan {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        debug_assert!(start <= end, "span must not end before it starts");
        Self { start, end }
    }

    /// Span starting at `start` and lasting `duration_minutes`.
    pub fn from_minutes(start: DateTime<Utc>, duration_minutes: u32) -> Self {
        Self::new(start, start + minutes(duration_minutes))
    }

    /// Like [`TimeSpan::from_minutes`], but `None` when the end falls outside
    /// the representable range.
    pub fn checked_from_minutes(start: DateTime<Utc>, duration_minutes: u32) -> Option<Self> {
        start
            .checked_add_signed(minutes(duration_minutes))
            .map(|end| Self::new(start, end))
    }

    /// `[a, a+d)` and `[b, b+d')` overlap iff `a < b+d' && b < a+d`.
    /// Touching spans do not overlap.
    pub fn overlaps(&self, other: &TimeSpan) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Whether `instant` lies inside the span (end excluded).
    pub fn contains(&self, instant: DateTime<Utc>) -> bool {
        self.start <= instant && instant < self.end
    }

    /// Whether the span has fully elapsed at `instant`.
    pub fn has_elapsed(&self, instant: DateTime<Utc>) -> bool {
        instant >= self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }
}

impl fmt::Display for TimeSpan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", format_instant(&self.start), format_instant(&self.end))
    }
}

/// Format a duration for humans (e.g. "1h 30m", "45m", "30s").
pub fn format_duration(d: Duration) -> String {
    let total_secs = d.num_seconds().max(0);
    let hours = total_secs / 3600;
    let mins = (total_secs % 3600) / 60;
    let secs = total_secs % 60;

    if hours > 0 {
        format!("{}h {}m", hours, mins)
    } else if mins > 0 {
        format!("{}m", mins)
    } else {
        format!("{}s", secs)
    }
}
