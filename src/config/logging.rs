/// Logging setup on top of tracing-subscriber
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{EnvFilter, Layer, Registry, fmt};

use crate::config::{ConfigError, LogFormat, LoggingConfig};

const LOG_FILE_PREFIX: &str = "rs_terminals.log";

/// Initialize logging from `config`. `RUST_LOG`, when set, replaces the
/// configured level.
///
/// Keep the returned guard alive while logging to files; dropping it
/// flushes and stops the writer. Calling this again once a subscriber is
/// installed leaves the existing one in place.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>, ConfigError> {
    let filter = match EnvFilter::try_from_default_env() {
        Ok(filter) => filter,
        Err(_) => EnvFilter::try_new(&config.level).map_err(|e| {
            ConfigError::InvalidStructure(format!("invalid log level {:?}: {}", config.level, e))
        })?,
    };

    let mut layers: Vec<Box<dyn Layer<Registry> + Send + Sync>> = Vec::new();
    layers.push(match config.format {
        LogFormat::Text => fmt::layer()
            .with_thread_ids(true)
            .with_target(true)
            .with_line_number(true)
            .boxed(),
        LogFormat::Json => fmt::layer().json().with_current_span(false).boxed(),
    });

    let mut guard = None;
    if let Some(directory) = &config.directory {
        std::fs::create_dir_all(directory)?;
        let appender = tracing_appender::rolling::daily(directory, LOG_FILE_PREFIX);
        let (writer, worker) = tracing_appender::non_blocking(appender);
        layers.push(fmt::layer().with_ansi(false).with_writer(writer).boxed());
        guard = Some(worker);
    }

    match tracing_subscriber::registry().with(layers).with(filter).try_init() {
        Ok(()) => {
            tracing::info!("Logging initialized with level: {}", config.level);
            Ok(guard)
        }
        Err(_) => {
            tracing::debug!("Logging already initialized");
            Ok(None)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_initialization_is_harmless() {
        let config = LoggingConfig::default();
        assert!(init_logging(&config).is_ok());
        assert!(init_logging(&config).unwrap().is_none());
    }

    #[test]
    fn bad_level_is_rejected() {
        if std::env::var_os("RUST_LOG").is_some() {
            return;
        }
        let config = LoggingConfig {
            level: "rs_terminals=loud".to_string(),
            ..LoggingConfig::default()
        };
        assert!(matches!(
            init_logging(&config),
            Err(ConfigError::InvalidStructure(_))
        ));
    }
}
