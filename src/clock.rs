//! Epoch-seconds clock source, overridable for tests.

use std::time::{SystemTime, UNIX_EPOCH};

/// Injectable seconds-since-epoch source.
///
/// Production code uses [`system_clock`]; tests substitute a closure reading
/// a shared counter so expiry boundaries can be pinned exactly.
pub type Clock = Box<dyn Fn() -> u64 + Send + Sync>;

/// Returns the wall-clock reading in whole seconds since the Unix epoch.
pub fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Returns a [`Clock`] backed by the system wall clock.
pub fn system_clock() -> Clock {
    Box::new(now_secs)
}
