// A set of helper structs for common operations
//
// Austin Shafer - 2020
pub mod log;
pub mod logging;
pub mod timing;

extern crate anyhow;
pub use anyhow::{anyhow, bail, Context, Error, Result};

/// Parse a boolean-ish environment value
///
/// Accepts 1/true/yes/on (case insensitive), everything else is false.
pub fn env_flag(value: &str) -> bool {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn env_flag_values() {
        assert!(env_flag("1"));
        assert!(env_flag("TRUE"));
        assert!(env_flag(" yes "));
        assert!(env_flag("On"));
        assert!(!env_flag("0"));
        assert!(!env_flag("off"));
        assert!(!env_flag(""));
    }
}
