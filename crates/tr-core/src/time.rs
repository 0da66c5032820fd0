//! Time utilities
//!
//! Liveness tracking stores wall-clock timestamps as milliseconds since the
//! Unix epoch so they can be compared and logged without carrying `Instant`s
//! across components.

use std::time::{SystemTime, UNIX_EPOCH};

/// Get the current Unix timestamp in milliseconds.
///
/// Returns 0 if the system clock is set before the Unix epoch.
///
/// # Examples
/// ```
/// use tr_core::time::current_time_millis;
///
/// let now = current_time_millis();
/// assert!(now > 0);
/// ```
pub fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Milliseconds elapsed between `since` and `now`.
///
/// Returns 0 if `since` lies after `now`.
pub fn millis_between(since: u64, now: u64) -> u64 {
    now.saturating_sub(since)
}
