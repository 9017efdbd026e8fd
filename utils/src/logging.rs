// Category-based logging infrastructure
//
// This installs the global logger. Everything else logs through
// the `log` facade re-exported in `utils::log`, so this must be
// stateless after init and safe to use from multiple threads.
//
// Austin Shafer - 2020
use crate::timing::get_current_millis;

use std::io::Write;

/// The variable checked first for a filter string
pub const LOG_ENV: &str = "CYCLONE_LOG";

/// Install the logger
///
/// Lines look like `[millis]<level> file:line - message`. The filter is
/// read from `CYCLONE_LOG`, then `RUST_LOG`, and defaults to `info`.
/// Calling this twice is harmless, the second call is ignored.
pub fn init() {
    let filter = std::env::var(LOG_ENV)
        .or_else(|_| std::env::var("RUST_LOG"))
        .unwrap_or_else(|_| "info".to_string());

    let _ = env_logger::Builder::new()
        .parse_filters(&filter)
        .format(|buf, record| {
            writeln!(
                buf,
                "[{:?}]<{}> {}:{} - {}",
                get_current_millis(),
                record.level().as_str().to_lowercase(),
                record.file().unwrap_or("?"),
                record.line().unwrap_or(0),
                record.args()
            )
        })
        .try_init();
}
