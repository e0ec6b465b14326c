/// Configuration loader: TOML file layered under environment variables
use std::path::{Path, PathBuf};

use ::config::{Config, Environment, File, FileFormat};
use tracing::{debug, info, warn};

use crate::config::{ConfigError, TerminalConfig};

/// Prefix of environment overrides, e.g. `RS_TERMINALS__MAX_SESSIONS=8`.
pub const ENV_PREFIX: &str = "RS_TERMINALS";

/// Configuration loader responsible for loading and parsing configuration files
pub struct ConfigLoader {
    env_prefix: String,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            env_prefix: ENV_PREFIX.to_string(),
        }
    }

    /// Read overrides from `<prefix>__*` instead.
    pub fn with_env_prefix(prefix: impl Into<String>) -> Self {
        Self {
            env_prefix: prefix.into(),
        }
    }

    /// Load the configuration.
    ///
    /// An explicit `config_path` must exist; without one, `config.toml` in
    /// the working directory is used if present. Environment variables
    /// (including those from a `.env` file) override file values.
    pub fn load_config(&self, config_path: Option<&Path>) -> Result<TerminalConfig, ConfigError> {
        match dotenvy::dotenv() {
            Ok(path) => debug!("Loaded environment from {:?}", path),
            Err(e) if e.not_found() => {}
            Err(e) => warn!("Failed to load .env file: {}", e),
        }

        let mut builder = Config::builder();
        match config_path {
            Some(path) if !path.is_file() => {
                return Err(ConfigError::FileNotFound(path.display().to_string()));
            }
            Some(path) => {
                info!("Loading configuration from file: {:?}", path);
                builder = builder.add_source(File::from(path).format(FileFormat::Toml));
            }
            None => match default_config_path().filter(|path| path.is_file()) {
                Some(path) => {
                    info!("Using default configuration file path: {:?}", path);
                    builder = builder.add_source(File::from(path).format(FileFormat::Toml));
                }
                None => info!("No configuration file, using defaults"),
            },
        }

        let config = builder
            .add_source(
                Environment::with_prefix(&self.env_prefix)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize::<TerminalConfig>()?;
        Ok(config)
    }

    /// Parse configuration from TOML content
    pub fn parse_config(&self, content: &str) -> Result<TerminalConfig, ConfigError> {
        let config = toml::from_str::<TerminalConfig>(content)?;
        debug!("Configuration parsed successfully");
        Ok(config)
    }
}

/// `config.toml` in the current working directory
pub fn default_config_path() -> Option<PathBuf> {
    std::env::current_dir()
        .ok()
        .map(|dir| dir.join("config.toml"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LogFormat;

    const SAMPLE: &str = r#"
default_shell_type = "bash"
max_sessions = 8
cull_inactive_timeout_secs = 600

[shells.default]
command = ["/bin/sh"]
size = { columns = 120, rows = 40 }

[shells.bash]
command = ["/bin/bash", "--login"]
environment = { TERM = "xterm-256color" }

[session]
history_limit_bytes = 1024

[logging]
level = "debug"
format = "json"
"#;

    #[test]
    fn parses_a_full_file() {
        let config = ConfigLoader::new().parse_config(SAMPLE).unwrap();

        assert_eq!(config.default_shell_type, "bash");
        assert_eq!(config.max_sessions, 8);
        assert_eq!(config.cull_inactive_timeout_secs, 600);
        assert_eq!(config.cull_interval_secs, 300);
        assert_eq!(config.session.history_limit_bytes, 1024);
        assert_eq!(config.session.outbound_capacity, 256);
        assert_eq!(config.logging.format, LogFormat::Json);
        assert_eq!(
            config.shells["bash"].command.as_deref(),
            Some(&["/bin/bash".to_string(), "--login".to_string()][..])
        );
    }

    #[test]
    fn empty_file_gives_defaults() {
        let config = ConfigLoader::new().parse_config("").unwrap();
        assert_eq!(config.default_shell_type, "default");
        assert_eq!(config.max_sessions, 64);
        assert!(config.shells.is_empty());
    }

    #[test]
    fn malformed_file_is_a_parse_error() {
        let err = ConfigLoader::new()
            .parse_config("max_sessions = \"many\"")
            .unwrap_err();
        assert!(matches!(err, ConfigError::ParseError(_)));
    }

    #[test]
    fn environment_overrides_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("terminals.toml");
        std::fs::write(&path, SAMPLE).unwrap();

        let prefix = "RS_TERMINALS_LOADER_TEST";
        // SAFETY: the variable is unique to this test
        unsafe {
            std::env::set_var(format!("{prefix}__MAX_SESSIONS"), "3");
        }
        let config = ConfigLoader::with_env_prefix(prefix)
            .load_config(Some(&path))
            .unwrap();
        unsafe {
            std::env::remove_var(format!("{prefix}__MAX_SESSIONS"));
        }

        assert_eq!(config.max_sessions, 3);
        assert_eq!(config.default_shell_type, "bash");
        assert_eq!(config.shells["default"].size.map(|s| s.rows), Some(40));
    }

    #[test]
    fn missing_explicit_file_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = ConfigLoader::new()
            .load_config(Some(&dir.path().join("absent.toml")))
            .unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound(_)));
    }
}
