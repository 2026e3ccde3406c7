//! Fixed-size UTC window arithmetic
//!
//! Every function here is pure: time always arrives as an explicit parameter
//! (milliseconds since the Unix epoch, UTC). Nothing in this module reads the
//! wall clock, so backfills and replays compute exactly the same windows as
//! the live loop did.
//!
//! `closed_windows_between` is the only authority on which windows are ready
//! to aggregate. Callers pass a confirmation-buffered `safe_time` (see
//! [`safe_time`]) instead of "now".

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

const HOUR_MS: i64 = 60 * 60 * 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WindowSize {
    #[serde(rename = "1h")]
    Hour1,
    #[serde(rename = "6h")]
    Hour6,
    #[serde(rename = "24h")]
    Hour24,
}

impl WindowSize {
    pub fn as_str(&self) -> &'static str {
        match self {
            WindowSize::Hour1 => "1h",
            WindowSize::Hour6 => "6h",
            WindowSize::Hour24 => "24h",
        }
    }

    pub fn duration_ms(&self) -> i64 {
        match self {
            WindowSize::Hour1 => HOUR_MS,
            WindowSize::Hour6 => 6 * HOUR_MS,
            WindowSize::Hour24 => 24 * HOUR_MS,
        }
    }

    pub fn all() -> [WindowSize; 3] {
        [WindowSize::Hour1, WindowSize::Hour6, WindowSize::Hour24]
    }
}

impl fmt::Display for WindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownWindowSize(pub String);

impl fmt::Display for UnknownWindowSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "unknown window size '{}' (expected 1h, 6h or 24h)", self.0)
    }
}

impl std::error::Error for UnknownWindowSize {}

impl FromStr for WindowSize {
    type Err = UnknownWindowSize;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "1h" => Ok(WindowSize::Hour1),
            "6h" => Ok(WindowSize::Hour6),
            "24h" => Ok(WindowSize::Hour24),
            other => Err(UnknownWindowSize(other.to_string())),
        }
    }
}

/// Half-open interval `[start, end)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WindowBounds {
    pub start: i64,
    pub end: i64,
}

impl WindowBounds {
    pub fn contains(&self, t: i64) -> bool {
        self.start <= t && t < self.end
    }
}

/// `floor(t / duration) × duration`, flooring toward negative infinity so
/// pre-epoch timestamps still land in the window that contains them.
pub fn floor_to_window_start(t: i64, size: WindowSize) -> i64 {
    let duration = size.duration_ms();
    t.div_euclid(duration) * duration
}

pub fn window_bounds(t: i64, size: WindowSize) -> WindowBounds {
    let start = floor_to_window_start(t, size);
    WindowBounds {
        start,
        end: start + size.duration_ms(),
    }
}

pub fn is_closed(end: i64, safe_time: i64) -> bool {
    end <= safe_time
}

/// Wall time minus the confirmation buffer. Data stamped before this point is
/// considered final enough to aggregate.
pub fn safe_time(now: i64, confirmations: u64, block_time_ms: u64) -> i64 {
    let buffer = confirmations.saturating_mul(block_time_ms);
    now.saturating_sub(i64::try_from(buffer).unwrap_or(i64::MAX))
}

/// Every fully closed window after the one containing `from`, in increasing
/// order, stopping at the first window whose end is past `to`.
///
/// `from` is normally the start of the last window already processed, so the
/// first window returned is the one immediately following it.
pub fn closed_windows_between(from: i64, to: i64, size: WindowSize) -> Vec<WindowBounds> {
    let duration = size.duration_ms();
    let mut windows = Vec::new();
    let mut start = floor_to_window_start(from, size) + duration;

    while is_closed(start + duration, to) {
        windows.push(WindowBounds {
            start,
            end: start + duration,
        });
        start += duration;
    }

    windows
}

#[cfg(test)]
mod tests {
    use super::*;

    // 2024-01-01T00:00:00Z
    const BASE: i64 = 1_704_067_200_000;

    #[test]
    fn test_window_size_roundtrip_strings() {
        for size in WindowSize::all() {
            assert_eq!(size.as_str().parse::<WindowSize>().unwrap(), size);
        }
        assert!("15m".parse::<WindowSize>().is_err());
    }

    #[test]
    fn test_floor_to_window_start() {
        let t = BASE + 2 * HOUR_MS + 17 * 60_000 + 3;

        assert_eq!(floor_to_window_start(t, WindowSize::Hour1), BASE + 2 * HOUR_MS);
        assert_eq!(floor_to_window_start(t, WindowSize::Hour6), BASE);
        assert_eq!(floor_to_window_start(t, WindowSize::Hour24), BASE);
    }

    #[test]
    fn test_floor_is_idempotent() {
        let samples = [0, 1, BASE - 1, BASE, BASE + 59_999, BASE + 7 * HOUR_MS + 1, -1, -HOUR_MS - 5];
        for size in WindowSize::all() {
            for t in samples {
                let once = floor_to_window_start(t, size);
                assert_eq!(floor_to_window_start(once, size), once, "t={} size={}", t, size);
            }
        }
    }

    #[test]
    fn test_bounds_contain_timestamp() {
        let samples = [0, 1, BASE - 1, BASE, BASE + HOUR_MS - 1, BASE + 13 * HOUR_MS + 12, -7];
        for size in WindowSize::all() {
            for t in samples {
                let bounds = window_bounds(t, size);
                assert!(bounds.start <= t && t < bounds.end, "t={} size={}", t, size);
                assert_eq!(bounds.end - bounds.start, size.duration_ms());
            }
        }
    }

    #[test]
    fn test_is_closed_boundary() {
        assert!(is_closed(BASE, BASE));
        assert!(is_closed(BASE, BASE + 1));
        assert!(!is_closed(BASE + 1, BASE));
    }

    #[test]
    fn test_safe_time() {
        assert_eq!(safe_time(BASE, 12, 12_000), BASE - 144_000);
        assert_eq!(safe_time(BASE, 0, 12_000), BASE);
    }

    #[test]
    fn test_closed_windows_are_contiguous_and_closed() {
        let from = BASE + 30 * 60_000;
        let to = BASE + 5 * HOUR_MS + 10;

        let windows = closed_windows_between(from, to, WindowSize::Hour1);

        // Windows after the one containing `from`: 01:00..05:00 are closed
        assert_eq!(windows.len(), 4);
        assert_eq!(windows[0].start, BASE + HOUR_MS);
        for pair in windows.windows(2) {
            assert_eq!(pair[0].end, pair[1].start);
            assert!(pair[0].start < pair[1].start);
        }
        for w in &windows {
            assert!(w.end <= to);
        }
    }

    #[test]
    fn test_closed_windows_stops_at_open_window() {
        // `to` sits in the middle of the window after `from`
        let windows = closed_windows_between(BASE, BASE + HOUR_MS + 1, WindowSize::Hour1);
        assert!(windows.is_empty());

        let windows = closed_windows_between(BASE, BASE + 2 * HOUR_MS, WindowSize::Hour1);
        assert_eq!(windows, vec![WindowBounds { start: BASE + HOUR_MS, end: BASE + 2 * HOUR_MS }]);
    }

    #[test]
    fn test_closed_windows_large_sizes() {
        let windows = closed_windows_between(BASE, BASE + 3 * 24 * HOUR_MS, WindowSize::Hour24);
        assert_eq!(windows.len(), 2);

        let windows = closed_windows_between(BASE, BASE + 24 * HOUR_MS, WindowSize::Hour6);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows.last().unwrap().end, BASE + 24 * HOUR_MS);
    }
}
