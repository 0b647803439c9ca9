//! Structured logging for the runtime, built on `slog`.
//!
//! Components own child loggers carrying their context (node id, component
//! name) as key/value pairs. Components that can be constructed without a
//! logger fall back to a `Discard` root.

pub use slog::{debug, error, info, o, trace, warn};
pub use slog::{Discard, Logger};

use sloggers::{Config, LoggerConfig};

/// Builds a terminal logger writing to stderr at the supplied level.
///
/// Levels are the sloggers names: "trace", "debug", "info", "warning",
/// "error", "critical".
pub fn term_logger(level: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(&format!(
        r#"
type = "terminal"
level = "{}"
destination = "stderr"
"#,
        level
    ))
    .expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// A root logger that swallows everything. Used by tests and by components
/// constructed without logging wired up.
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}
