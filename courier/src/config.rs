use std::{
    path::{Path, PathBuf},
    sync::Arc,
};

use courier_bounce::WebhookError;
use courier_messenger::{
    MessengerError, MessengerRegistry, PostbackConfig, PostbackMessenger, SmtpConfig,
    SmtpMessenger,
};
use serde::Deserialize;
use thiserror::Error;

const CONFIG_ENV: &str = "COURIER_CONFIG";
const DEFAULT_PATHS: [&str; 2] = ["./courier.config.ron", "/etc/courier/courier.config.ron"];

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("COURIER_CONFIG points to non-existent file: {}", .0.display())]
    MissingOverride(PathBuf),

    #[error("No configuration file found. Tried:\n  - COURIER_CONFIG environment variable\n{0}")]
    NotFound(String),

    #[error("Failed to read config from {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid configuration: {0}")]
    Parse(#[from] ron::error::SpannedError),

    #[error("Invalid messenger configuration: {0}")]
    Messenger(#[from] MessengerError),

    #[error("Invalid webhook configuration: {0}")]
    Webhook(#[from] WebhookError),
}

/// Transports campaigns can be delivered through, addressed by name.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct MessengersConfig {
    #[serde(default)]
    pub smtp: Vec<SmtpConfig>,

    #[serde(default)]
    pub postback: Vec<PostbackConfig>,
}

impl MessengersConfig {
    /// Builds every configured messenger and registers it under its name.
    ///
    /// # Errors
    ///
    /// If a messenger cannot be built or two messengers share a name.
    pub fn registry(&self) -> Result<MessengerRegistry, MessengerError> {
        let mut registry = MessengerRegistry::new();

        for config in &self.smtp {
            registry.register(Arc::new(SmtpMessenger::new(config)?))?;
        }
        for config in &self.postback {
            registry.register(Arc::new(PostbackMessenger::new(config)?))?;
        }

        Ok(registry)
    }
}

/// Find the configuration file using the following precedence:
/// 1. `COURIER_CONFIG` environment variable
/// 2. ./courier.config.ron (current working directory)
/// 3. /etc/courier/courier.config.ron (system-wide config)
pub fn find_config_file() -> Result<PathBuf, ConfigError> {
    locate(
        std::env::var_os(CONFIG_ENV).map(PathBuf::from),
        &DEFAULT_PATHS.map(PathBuf::from),
    )
}

fn locate(env_path: Option<PathBuf>, default_paths: &[PathBuf]) -> Result<PathBuf, ConfigError> {
    if let Some(path) = env_path {
        if path.exists() {
            return Ok(path);
        }
        return Err(ConfigError::MissingOverride(path));
    }

    if let Some(path) = default_paths.iter().find(|path| path.exists()) {
        return Ok(path.clone());
    }

    let paths_tried = default_paths
        .iter()
        .map(|p| format!("  - {}", p.display()))
        .collect::<Vec<_>>()
        .join("\n");

    Err(ConfigError::NotFound(paths_tried))
}

pub(crate) fn read(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}
