// This makes it easy to import the logging stuff
//
// Callers use this as `log::error!(...)` after `use utils::log;`
// Austin Shafer - 2020

#![allow(unused_imports)]
pub use ::log::{debug, error, info, log_enabled, trace, warn, Level};
