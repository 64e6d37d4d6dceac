//! Controller Configuration
//!
//! Loaded from the mounted ConfigMap at `/config/config.yaml`. Every section is
//! optional; missing values fall back to the defaults below.

use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use tracing::{info, warn};

/// Default location of the mounted configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/config/config.yaml";

/// Environment variable that overrides [`DEFAULT_CONFIG_PATH`]
pub const CONFIG_PATH_ENV: &str = "CONTROLLER_CONFIG_PATH";

/// Main controller configuration structure
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct ControllerConfig {
    /// Reconciler configuration
    #[serde(default)]
    pub controller: ReconcilerConfig,

    /// Health endpoint configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Reconciler configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ReconcilerConfig {
    /// Namespace to watch; all namespaces when unset
    #[serde(default)]
    pub namespace: Option<String>,

    /// Component name attached to emitted events
    #[serde(default = "default_agent_name", rename = "agentName")]
    pub agent_name: String,

    /// Delay before a Run is retried after a transient error
    #[serde(
        default = "default_error_requeue_seconds",
        rename = "errorRequeueSeconds"
    )]
    pub error_requeue_seconds: u64,
}

/// Health endpoint configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind_address", rename = "bindAddress")]
    pub bind_address: String,
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is not set
    #[serde(default = "default_log_filter")]
    pub filter: String,

    #[serde(default)]
    pub format: LogFormat,
}

/// Log output format
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

fn default_agent_name() -> String {
    "run-taskloop".to_string()
}

fn default_error_requeue_seconds() -> u64 {
    10
}

fn default_bind_address() -> String {
    "0.0.0.0:8080".to_string()
}

fn default_log_filter() -> String {
    "info,taskloop_controller=debug,kube=info".to_string()
}

impl Default for ReconcilerConfig {
    fn default() -> Self {
        Self {
            namespace: None,
            agent_name: default_agent_name(),
            error_requeue_seconds: default_error_requeue_seconds(),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            format: LogFormat::default(),
        }
    }
}

impl ControllerConfig {
    /// Validate that the configuration can be used to start the controller
    pub fn validate(&self) -> Result<(), anyhow::Error> {
        if self.controller.agent_name.trim().is_empty() {
            return Err(anyhow::anyhow!("controller.agentName must not be empty"));
        }

        if self.controller.error_requeue_seconds == 0 {
            return Err(anyhow::anyhow!(
                "controller.errorRequeueSeconds must be greater than zero"
            ));
        }

        if let Some(namespace) = &self.controller.namespace {
            if namespace.trim().is_empty() {
                return Err(anyhow::anyhow!(
                    "controller.namespace must be omitted or non-empty"
                ));
            }
        }

        self.server
            .bind_address
            .parse::<SocketAddr>()
            .map_err(|e| {
                anyhow::anyhow!(
                    "server.bindAddress {:?} is not a socket address: {e}",
                    self.server.bind_address
                )
            })?;

        Ok(())
    }

    /// Load configuration from mounted ConfigMap file
    pub fn from_mounted_file(config_path: &str) -> Result<Self, anyhow::Error> {
        let config_str = std::fs::read_to_string(config_path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file {config_path}: {e}"))?;

        Self::from_yaml(&config_str)
    }

    pub fn from_yaml(config_str: &str) -> Result<Self, anyhow::Error> {
        serde_yaml::from_str(config_str)
            .map_err(|e| anyhow::anyhow!("Failed to parse config YAML: {e}"))
    }

    /// Load from `CONTROLLER_CONFIG_PATH` (or the default mount), falling back
    /// to defaults when the file cannot be used. The result is validated.
    ///
    /// Nothing is logged here, since this runs before tracing is installed.
    /// Call [`ConfigSource::log`] once it is.
    pub fn load() -> Result<(Self, ConfigSource), anyhow::Error> {
        let path =
            std::env::var(CONFIG_PATH_ENV).unwrap_or_else(|_| DEFAULT_CONFIG_PATH.to_string());
        Self::load_from(&path)
    }

    pub fn load_from(path: &str) -> Result<(Self, ConfigSource), anyhow::Error> {
        let (config, source) = match Self::from_mounted_file(path) {
            Ok(cfg) => (cfg, ConfigSource::File(path.to_string())),
            Err(reason) => (
                Self::default(),
                ConfigSource::Defaults {
                    path: path.to_string(),
                    reason,
                },
            ),
        };

        config.validate()?;
        Ok((config, source))
    }
}

/// Where a loaded configuration came from
#[derive(Debug)]
pub enum ConfigSource {
    File(String),
    /// The file could not be read or parsed, so defaults are in effect
    Defaults { path: String, reason: anyhow::Error },
}

impl ConfigSource {
    #[must_use]
    pub fn is_defaults(&self) -> bool {
        matches!(self, Self::Defaults { .. })
    }

    pub fn log(&self) {
        match self {
            Self::File(path) => info!("Loaded controller configuration from {}", path),
            Self::Defaults { path, reason } => warn!(
                "Failed to load configuration from {}, using defaults: {}",
                path, reason
            ),
        }
    }
}
