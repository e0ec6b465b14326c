/// Configuration data structures for rs_terminals
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::api::CreateSessionRequest;
use crate::config::ConfigError;
use crate::pty::PtyConfig;
use crate::service::{RegistrySettings, SessionOptions};

/// Name of the shell entry every other entry falls back to.
pub const DEFAULT_SHELL: &str = "default";

/// Terminal configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct TerminalConfig {
    /// Shell used when a request names none
    pub default_shell_type: String,

    /// Shell configurations including `default`
    pub shells: HashMap<String, ShellConfig>,

    /// Base directory for relative and rejected working directories
    pub root_dir: Option<PathBuf>,

    pub max_sessions: usize,

    /// Seconds without a connection before a session is culled; 0 disables culling
    pub cull_inactive_timeout_secs: u64,

    /// Seconds between two culling sweeps
    pub cull_interval_secs: u64,

    pub session: SessionConfig,

    pub logging: LoggingConfig,
}

impl Default for TerminalConfig {
    fn default() -> Self {
        Self {
            default_shell_type: DEFAULT_SHELL.to_string(),
            shells: HashMap::new(),
            root_dir: None,
            max_sessions: 64,
            cull_inactive_timeout_secs: 0,
            cull_interval_secs: 300,
            session: SessionConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

/// Terminal size configuration
#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
pub struct ShellSize {
    pub columns: u16,
    pub rows: u16,
}

/// Shell configuration; unset fields fall back to `shells.default`
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
pub struct ShellConfig {
    /// Program and arguments
    pub command: Option<Vec<String>>,

    pub working_directory: Option<PathBuf>,

    pub size: Option<ShellSize>,

    /// Merged over the default shell's environment
    pub environment: Option<HashMap<String, String>>,
}

/// Per-session buffers and timers
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Events queued per connection before the oldest are dropped
    pub outbound_capacity: usize,

    /// Recent output replayed to new connections
    pub history_limit_bytes: usize,

    /// Time between SIGTERM and SIGKILL
    pub kill_grace_period_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            outbound_capacity: 256,
            history_limit_bytes: 64 * 1024,
            kill_grace_period_ms: 3000,
        }
    }
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration
#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default)]
pub struct LoggingConfig {
    /// Filter directive, e.g. `info` or `rs_terminals=debug`; `RUST_LOG` wins
    pub level: String,

    pub format: LogFormat,

    /// Also write daily-rotated log files here
    pub directory: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            directory: None,
        }
    }
}

impl TerminalConfig {
    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            outbound_capacity: self.session.outbound_capacity,
            history_limit_bytes: self.session.history_limit_bytes,
            kill_grace_period: Duration::from_millis(self.session.kill_grace_period_ms),
            ..SessionOptions::default()
        }
    }

    pub fn registry_settings(&self) -> RegistrySettings {
        let idle_timeout = match self.cull_inactive_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        RegistrySettings {
            max_sessions: self.max_sessions,
            idle_timeout,
            cull_interval: Duration::from_secs(self.cull_interval_secs.max(1)),
            session: self.session_options(),
        }
    }

    /// Resolve what to spawn for `request`: request values win over the
    /// chosen shell's, which win over the default shell's.
    pub fn spawn_config(&self, request: &CreateSessionRequest) -> Result<PtyConfig, ConfigError> {
        let shell_type = request
            .shell_type
            .as_deref()
            .unwrap_or(&self.default_shell_type);
        let fallback = self.shells.get(DEFAULT_SHELL).cloned().unwrap_or_default();
        let shell = match self.shells.get(shell_type) {
            Some(shell) => shell.clone(),
            None if shell_type == DEFAULT_SHELL || request.shell_type.is_none() => {
                fallback.clone()
            }
            None => return Err(ConfigError::ShellConfigNotFound(shell_type.to_string())),
        };

        let command = shell
            .command
            .or(fallback.command)
            .unwrap_or_else(|| vec![login_shell()]);
        let Some((program, args)) = command.split_first() else {
            return Err(ConfigError::InvalidStructure(format!(
                "shells.{}.command is empty",
                shell_type
            )));
        };

        let size = shell.size.or(fallback.size);
        let rows = request.rows.or(size.map(|s| s.rows)).unwrap_or(24);
        let cols = request.cols.or(size.map(|s| s.columns)).unwrap_or(80);

        let mut environment = fallback.environment.unwrap_or_default();
        environment.extend(shell.environment.unwrap_or_default());
        let mut env: Vec<(String, String)> = environment.into_iter().collect();
        env.sort();

        let cwd = request
            .cwd
            .clone()
            .or(shell.working_directory)
            .or(fallback.working_directory);

        let mut config = PtyConfig::new(program.clone())
            .with_args(args.iter().cloned())
            .with_size(rows, cols);
        config.env = env;
        config.cwd = self.resolve_cwd(cwd.as_deref());
        Ok(config)
    }

    /// Relative paths are taken from `root_dir`; anything that is not an
    /// existing directory falls back to `root_dir`.
    fn resolve_cwd(&self, cwd: Option<&Path>) -> Option<PathBuf> {
        let root = self.root_dir.clone();
        let Some(cwd) = cwd else {
            return root;
        };
        let candidate = match &root {
            Some(root) if cwd.is_relative() => root.join(cwd),
            _ => cwd.to_path_buf(),
        };
        if candidate.is_dir() {
            Some(candidate)
        } else {
            warn!("Ignoring working directory {:?}: not a directory", candidate);
            root
        }
    }
}

fn login_shell() -> String {
    std::env::var("SHELL").unwrap_or_else(|_| "/bin/sh".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_with_shells() -> TerminalConfig {
        let mut config = TerminalConfig::default();
        config.shells.insert(
            DEFAULT_SHELL.to_string(),
            ShellConfig {
                command: Some(vec!["/bin/bash".to_string(), "-l".to_string()]),
                size: Some(ShellSize { columns: 100, rows: 30 }),
                environment: Some(HashMap::from([
                    ("LANG".to_string(), "C.UTF-8".to_string()),
                    ("EDITOR".to_string(), "vi".to_string()),
                ])),
                ..ShellConfig::default()
            },
        );
        config.shells.insert(
            "zsh".to_string(),
            ShellConfig {
                command: Some(vec!["/bin/zsh".to_string()]),
                environment: Some(HashMap::from([("EDITOR".to_string(), "nano".to_string())])),
                ..ShellConfig::default()
            },
        );
        config
    }

    #[test]
    fn shell_values_override_the_default_shell() {
        let config = config_with_shells();
        let request = CreateSessionRequest {
            shell_type: Some("zsh".to_string()),
            ..CreateSessionRequest::default()
        };

        let spawn = config.spawn_config(&request).unwrap();

        assert_eq!(spawn.command, "/bin/zsh");
        assert!(spawn.args.is_empty());
        assert_eq!((spawn.rows, spawn.cols), (30, 100));
        assert_eq!(
            spawn.env,
            vec![
                ("EDITOR".to_string(), "nano".to_string()),
                ("LANG".to_string(), "C.UTF-8".to_string()),
            ]
        );
    }

    #[test]
    fn request_size_wins() {
        let config = config_with_shells();
        let request = CreateSessionRequest {
            rows: Some(50),
            cols: Some(200),
            ..CreateSessionRequest::default()
        };

        let spawn = config.spawn_config(&request).unwrap();

        assert_eq!(spawn.command, "/bin/bash");
        assert_eq!(spawn.args, vec!["-l".to_string()]);
        assert_eq!((spawn.rows, spawn.cols), (50, 200));
    }

    #[test]
    fn unknown_shell_type_is_an_error() {
        let request = CreateSessionRequest {
            shell_type: Some("fish".to_string()),
            ..CreateSessionRequest::default()
        };
        assert!(matches!(
            config_with_shells().spawn_config(&request),
            Err(ConfigError::ShellConfigNotFound(name)) if name == "fish"
        ));
    }

    #[test]
    fn relative_cwd_is_resolved_against_root_dir() {
        let root = tempfile::tempdir().unwrap();
        std::fs::create_dir(root.path().join("project")).unwrap();
        let config = TerminalConfig {
            root_dir: Some(root.path().to_path_buf()),
            ..TerminalConfig::default()
        };

        let request = CreateSessionRequest {
            cwd: Some(PathBuf::from("project")),
            ..CreateSessionRequest::default()
        };
        let spawn = config.spawn_config(&request).unwrap();
        assert_eq!(spawn.cwd, Some(root.path().join("project")));

        let missing = CreateSessionRequest {
            cwd: Some(PathBuf::from("does/not/exist")),
            ..CreateSessionRequest::default()
        };
        let spawn = config.spawn_config(&missing).unwrap();
        assert_eq!(spawn.cwd, Some(root.path().to_path_buf()));
    }

    #[test]
    fn zero_cull_timeout_disables_reaping() {
        let mut config = TerminalConfig::default();
        assert_eq!(config.registry_settings().idle_timeout, None);

        config.cull_inactive_timeout_secs = 120;
        config.session.kill_grace_period_ms = 250;
        let settings = config.registry_settings();
        assert_eq!(settings.idle_timeout, Some(Duration::from_secs(120)));
        assert_eq!(settings.cull_interval, Duration::from_secs(300));
        assert_eq!(settings.session.kill_grace_period, Duration::from_millis(250));
    }
}
