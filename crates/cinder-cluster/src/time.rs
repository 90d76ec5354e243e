//! Wall-clock time in milliseconds.
//!
//! Node tables persist ping and pong timestamps, so the clock is the Unix
//! epoch rather than a process-local monotonic one. 0 means "never".

use std::time::{SystemTime, UNIX_EPOCH};

/// Milliseconds since the Unix epoch.
#[inline]
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
