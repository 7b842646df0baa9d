//! Logging setup for processes embedding the transport.
//!
//! The library itself only emits `tracing` events; installing a subscriber
//! is left to the application. These helpers cover the common case.

use tracing_subscriber::EnvFilter;

/// Output format for [`init_logging_with`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per event
    Json,
}

/// Install a text subscriber. `RUST_LOG` wins over `verbose`.
///
/// Returns `false` if a global subscriber was already installed.
pub fn init_logging(verbose: bool) -> bool {
    init_logging_with(verbose, LogFormat::Text)
}

/// Install a subscriber with the given output format.
pub fn init_logging_with(verbose: bool, format: LogFormat) -> bool {
    let log_level = if verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.try_init().is_ok(),
        LogFormat::Json => builder.json().try_init().is_ok(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_init_is_harmless() {
        let _ = init_logging(false);
        assert!(!init_logging(true));
        assert!(!init_logging_with(false, LogFormat::Json));
    }
}
