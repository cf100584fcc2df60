//! Configuration file parsing and structures.
//!
//! egond uses TOML for declarative configuration. Native integrations are
//! statically typed Rust structs under `[integrations]`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing_subscriber::filter::LevelFilter;
use tracing_subscriber::EnvFilter;

/// Top-level configuration structure
#[derive(Debug, Default, PartialEq, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub logging: LoggingConfig,

    /// HTTP status API, disabled when the section is absent
    #[serde(default)]
    pub api: Option<ApiConfig>,

    #[serde(default)]
    pub integrations: IntegrationsConfig,
}

#[derive(Debug, Default, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

#[derive(Debug, Default, PartialEq, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default)]
    pub level: LogLevel,

    /// Per-target levels, e.g. `egond::integrations = "debug"`
    #[serde(default)]
    pub overrides: HashMap<String, LogLevel>,
}

impl LoggingConfig {
    /// Build the subscriber filter from the base level and the overrides
    pub fn env_filter(&self) -> EnvFilter {
        EnvFilter::new(self.filter_directives())
    }

    fn filter_directives(&self) -> String {
        let mut directives = vec![LevelFilter::from(self.level).to_string()];
        let mut overrides: Vec<_> = self.overrides.iter().collect();
        overrides.sort();
        for (target, level) in overrides {
            directives.push(format!("{}={}", target, LevelFilter::from(*level)));
        }
        directives.join(",")
    }
}

fn default_listen() -> String {
    "127.0.0.1".to_string()
}

fn default_api_port() -> u16 {
    8565
}

/// Native HTTP API configuration
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_api_port")]
    pub port: u16,
}

/// Integration configuration container
#[derive(Debug, Default, PartialEq, Deserialize)]
pub struct IntegrationsConfig {
    /// ABB Ego-n controller integration
    #[serde(default)]
    pub egon: Option<EgonConfig>,
}

pub const DEFAULT_REFRESH_MS: u64 = 60_000;
pub const DEFAULT_DEVICE_PORT: &str = "80";

fn default_refresh() -> u64 {
    DEFAULT_REFRESH_MS
}

fn default_device_port() -> String {
    DEFAULT_DEVICE_PORT.to_string()
}

/// Configuration for the Ego-n integration
///
/// Blank strings fall back to the defaults, so `port = ""` still talks to
/// port 80.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EgonConfig {
    /// Controller IP address or hostname
    #[serde(default)]
    pub ip: String,

    /// Controller HTTP port (default: "80")
    #[serde(default = "default_device_port")]
    pub port: String,

    #[serde(default)]
    pub user: Option<String>,

    #[serde(default)]
    pub password: Option<String>,

    /// Poll interval in milliseconds (default: 60000)
    #[serde(default = "default_refresh")]
    pub refresh: u64,

    /// Per-request timeout in milliseconds; unset means no timeout
    #[serde(default)]
    pub request_timeout_ms: Option<u64>,

    /// Item name -> binding configuration (the device element id)
    #[serde(default)]
    pub items: BTreeMap<String, String>,
}

impl Default for EgonConfig {
    fn default() -> Self {
        Self {
            ip: String::new(),
            port: default_device_port(),
            user: None,
            password: None,
            refresh: DEFAULT_REFRESH_MS,
            request_timeout_ms: None,
            items: BTreeMap::new(),
        }
    }
}

fn non_blank(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

impl EgonConfig {
    /// Base URL of the controller, `http://{ip}:{port}`
    pub fn host(&self) -> String {
        let ip = non_blank(&self.ip).unwrap_or("");
        let port = non_blank(&self.port).unwrap_or(DEFAULT_DEVICE_PORT);
        format!("http://{}:{}", ip, port)
    }

    pub fn user(&self) -> &str {
        self.user.as_deref().and_then(non_blank).unwrap_or("")
    }

    pub fn password(&self) -> &str {
        self.password.as_deref().and_then(non_blank).unwrap_or("")
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_millis(self.refresh)
    }

    pub fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout_ms.map(Duration::from_millis)
    }

    /// Check the fields serde cannot
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.refresh == 0 {
            return Err(ConfigError::Invalid {
                field: "integrations.egon.refresh".to_string(),
                message: "must be a positive number of milliseconds".to_string(),
            });
        }
        if self.request_timeout_ms == Some(0) {
            return Err(ConfigError::Invalid {
                field: "integrations.egon.request_timeout_ms".to_string(),
                message: "must be a positive number of milliseconds".to_string(),
            });
        }
        for (item, binding) in &self.items {
            if non_blank(binding).is_none() {
                return Err(ConfigError::Invalid {
                    field: format!("integrations.egon.items.{}", item),
                    message: "binding must name a device element id".to_string(),
                });
            }
        }
        Ok(())
    }
}

impl Config {
    /// Load configuration from a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())
            .map_err(|e| ConfigError::Io(path.as_ref().to_path_buf(), e))?;

        Self::from_toml(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn from_toml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if let Some(egon) = &self.integrations.egon {
            egon.validate()?;
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),

    #[error("Failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid value for {field}: {message}")]
    Invalid { field: String, message: String },
}
