use crate::config::LoggingConfig;
use crate::error::{ConfigError, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

const LOG_FILE_PREFIX: &str = "cost-plugin-broker.log";

/// Install the global subscriber.
///
/// Logs go to stderr, as JSON when `config.json` is set. With a configured
/// directory a daily-rolling file receives the same events. The returned
/// guard flushes the file writer on drop and must be held until exit.
pub fn init(config: &LoggingConfig, debug: bool) -> Result<Option<WorkerGuard>> {
    let filter = build_filter(&config.level, debug)?;

    let (file_layer, guard) = match &config.directory {
        Some(dir) => {
            std::fs::create_dir_all(dir).map_err(|e| {
                ConfigError::Validation(format!(
                    "failed to create log directory {}: {e}",
                    dir.display()
                ))
            })?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            let layer = fmt::layer().with_ansi(false).with_writer(writer);
            (Some(layer), Some(guard))
        }
        None => (None, None),
    };

    let json_layer = config
        .json
        .then(|| fmt::layer().json().with_writer(std::io::stderr));
    let text_layer = (!config.json).then(|| fmt::layer().with_writer(std::io::stderr));

    tracing_subscriber::registry()
        .with(filter)
        .with(json_layer)
        .with(text_layer)
        .with(file_layer)
        .try_init()
        .map_err(|e| ConfigError::Validation(format!("failed to initialise logging: {e}")))?;

    Ok(guard)
}

// RUST_LOG still applies to other crates; this crate's level comes from config.
fn build_filter(level: &str, debug: bool) -> Result<EnvFilter> {
    let level = if debug { "debug" } else { level };
    let directive = format!("{}={level}", env!("CARGO_CRATE_NAME"))
        .parse()
        .map_err(|e: tracing_subscriber::filter::ParseError| {
            ConfigError::Validation(format!("invalid log level '{level}': {e}"))
        })?;

    let base = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    Ok(base.add_directive(directive))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_filter_accepts_levels() {
        for level in ["trace", "debug", "info", "warn", "error"] {
            assert!(build_filter(level, false).is_ok(), "{level}");
        }
    }

    #[test]
    fn test_build_filter_rejects_garbage() {
        assert!(build_filter("loud", false).is_err());
    }

    #[test]
    fn test_debug_flag_overrides_level() {
        // Invalid configured level is ignored when --debug is given
        assert!(build_filter("loud", true).is_ok());
    }
}
