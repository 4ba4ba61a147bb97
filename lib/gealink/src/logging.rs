//! Thin façade over `slog` so components can take an optional parent
//! logger and the binaries can build a terminal root from configuration.

pub use slog::{debug, error, info, o, trace, warn, Discard, Logger};

use sloggers::{Config, LoggerConfig};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "debug"
destination = "stderr"
"#;

/// Builds the default terminal logger.
pub fn init() -> Logger {
    from_toml(DEFAULT_CONFIG)
}

/// Builds a logger from a `sloggers` TOML configuration string.
pub fn from_toml(toml: &str) -> Logger {
    let config: LoggerConfig = serdeconv::from_toml_str(toml).expect("Error parsing logger configuration");

    config.build_logger().expect("Error building logger")
}

/// Logger that swallows everything; the fallback when a component is
/// constructed without a parent.
#[inline]
pub fn discard() -> Logger {
    Logger::root(Discard, o!())
}

/// Resolves an optional parent logger into a child or a discard root.
#[inline]
pub fn child<'a, L: Into<Option<&'a Logger>>>(log: L, module: &'static str) -> Logger {
    match log.into() {
        Some(log) => log.new(o!("module" => module)),
        None => discard(),
    }
}
