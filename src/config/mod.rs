/// Configuration module: settings, loading and logging setup
mod config;
mod config_loader;
mod error;
mod logging;

pub use self::config::*;
pub use config_loader::{ConfigLoader, default_config_path};
pub use error::ConfigError;
pub use logging::init_logging;
