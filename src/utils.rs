//! Common utility functions used across modules.
//!
//! - [`format_count_with_separator`] - Format counts with thousands separator (1,234,567)
//! - [`format_bytes`] - Format byte sizes (KB, MB, GB)
//! - [`format_remaining`] - Compact time-left display for block listings
//! - [`truncate`] - Truncate strings with ellipsis
//! - [`RateLimitedLog`] - Gate for repeated error logging
//! - [`chrono_duration`] - Saturating std to chrono duration conversion
//! - [`expiry_after`] - Overflow-free expiry timestamps

use chrono::{DateTime, Utc};
use std::time::{Duration, Instant};

const CENTURY: Duration = Duration::from_secs(36_500 * 86_400);

/// Format a number with thousands separators (commas).
///
/// # Examples
/// ```
/// use blockwarden::utils::format_count_with_separator;
/// assert_eq!(format_count_with_separator(1000), "1,000");
/// assert_eq!(format_count_with_separator(1234567), "1,234,567");
/// ```
pub fn format_count_with_separator(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::new();
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Format bytes in human-readable form (KB, MB, GB).
///
/// # Examples
/// ```
/// use blockwarden::utils::format_bytes;
/// assert_eq!(format_bytes(1024), "1.0 KB");
/// assert_eq!(format_bytes(1_500_000), "1.4 MB");
/// ```
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;

    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

/// Format a remaining duration as at most two units (`2d 3h`, `4m 10s`).
///
/// # Examples
/// ```
/// use blockwarden::utils::format_remaining;
/// assert_eq!(format_remaining(chrono::Duration::seconds(3725)), "1h 2m");
/// assert_eq!(format_remaining(chrono::Duration::seconds(-5)), "expired");
/// ```
pub fn format_remaining(remaining: chrono::Duration) -> String {
    let secs = remaining.num_seconds();
    if secs <= 0 {
        return "expired".to_string();
    }
    let (d, h, m, s) = (secs / 86400, (secs % 86400) / 3600, (secs % 3600) / 60, secs % 60);
    if d > 0 {
        format!("{}d {}h", d, h)
    } else if h > 0 {
        format!("{}h {}m", h, m)
    } else if m > 0 {
        format!("{}m {}s", m, s)
    } else {
        format!("{}s", s)
    }
}

/// Truncate a string to a maximum length, adding "..." if truncated.
///
/// Cuts on a character boundary, so multi-byte input never panics.
///
/// # Examples
/// ```
/// use blockwarden::utils::truncate;
/// assert_eq!(truncate("short", 10), "short");
/// assert_eq!(truncate("this is long", 10), "this is...");
/// ```
pub fn truncate(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        s.to_string()
    } else if max_len <= 3 {
        "...".to_string()
    } else {
        let mut end = max_len - 3;
        while !s.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &s[..end])
    }
}

/// Convert a std Duration to a chrono Duration, saturating at a century.
pub fn chrono_duration(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d.min(CENTURY)).unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// `now + d`, clamped to the latest representable time instead of overflowing.
pub fn expiry_after(now: DateTime<Utc>, d: Duration) -> DateTime<Utc> {
    now.checked_add_signed(chrono_duration(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Allows a log line through at most once per interval.
///
/// Suppressed occurrences are counted and handed back with the next line
/// that is allowed, so the operator still sees how often the error fired.
#[derive(Debug)]
pub struct RateLimitedLog {
    interval: Duration,
    last: Option<Instant>,
    suppressed: u64,
}

impl RateLimitedLog {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last: None,
            suppressed: 0,
        }
    }

    /// Returns `Some(suppressed_since_last)` when a line may be emitted now.
    pub fn check(&mut self) -> Option<u64> {
        self.check_at(Instant::now())
    }

    pub fn check_at(&mut self, now: Instant) -> Option<u64> {
        match self.last {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed += 1;
                None
            }
            _ => {
                self.last = Some(now);
                Some(std::mem::take(&mut self.suppressed))
            }
        }
    }
}
