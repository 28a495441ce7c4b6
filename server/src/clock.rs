// SPDX-License-Identifier: MPL-2.0

//! Wall-clock helpers.
//!
//! Timestamps in dentry stats and binlog records are whole seconds since
//! the Unix epoch, truncated to `i64` the way the wire format carries them.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current time in seconds since the Unix epoch.
pub fn current_time_secs() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Current time in milliseconds since the Unix epoch.
pub fn current_time_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
