// Helpers for timestamps
//
// Austin Shafer - 2020
use std::time::{Duration, SystemTime, UNIX_EPOCH};

pub fn get_current_time() -> Duration {
    // A clock before the epoch is not something we can do anything
    // about, report zero instead of taking the process down.
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or(Duration::from_secs(0))
}

// Helper to get the current time in milliseconds
pub fn get_current_millis() -> u32 {
    get_current_time().as_millis() as u32
}
