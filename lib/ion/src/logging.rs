pub use slog::{crit, debug, error, info, o, trace, warn};
pub use slog::{Discard, Drain, Logger};

const DEFAULT_CONFIG: &str = r#"
type = "terminal"
level = "info"
destination = "stderr"
"#;

/// Builds a logger from a TOML logging configuration.
pub fn from_toml(config: &str) -> Result<Logger, String> {
    use sloggers::{Config, LoggerConfig};

    let config: LoggerConfig = serdeconv::from_toml_str(config).map_err(|err| err.to_string())?;

    config.build_logger().map_err(|err| err.to_string())
}

/// Builds the default terminal logger.
#[inline]
pub fn init() -> Logger {
    from_toml(DEFAULT_CONFIG).expect("Default logging config must build")
}

/// A logger that swallows everything.
#[inline]
pub fn null() -> Logger {
    Logger::root(Discard, o!())
}
