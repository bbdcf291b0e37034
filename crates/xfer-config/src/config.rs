//! Configuration Loading System
//!
//! Sources are applied in the order they were added to the loader, later
//! ones replacing earlier ones:
//! 1. Default values
//! 2. Configuration files or in-memory TOML
//! 3. Environment variables

use crate::{ConfigError, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use xfer_node::{AdmissionConfig, AgentConfig, RunningConfig};
use xfer_sched::{DispatcherConfig, PlacementConfig};
use xfer_telemetry::{LogFormat, LogLevel};

/// Configuration source type
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigSource {
    File(PathBuf),
    Env,
    Default,
    /// In-memory TOML
    Memory(String),
}

/// Log destination
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogOutput {
    #[default]
    Stdout,
    Stderr,
    File,
    /// File plus stdout
    Both,
}

impl FromStr for LogOutput {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "stdout" => Ok(Self::Stdout),
            "stderr" => Ok(Self::Stderr),
            "file" => Ok(Self::File),
            "both" => Ok(Self::Both),
            _ => Err(ConfigError::InvalidValue {
                field: "log.output".to_string(),
                message: format!("Invalid log output: {s}"),
            }),
        }
    }
}

/// Logging section
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    pub level: LogLevel,
    pub format: LogFormat,
    pub output: LogOutput,
    /// Required when `output` is `file` or `both`
    pub file_path: Option<PathBuf>,
    /// Extra filter directives, e.g. `xfer_sched::placement=debug`
    pub directives: Vec<String>,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Pretty,
            output: LogOutput::Stdout,
            file_path: None,
            directives: Vec::new(),
        }
    }
}

impl LogConfig {
    /// Settings for [`xfer_telemetry::init_logging`]
    pub fn to_telemetry(&self) -> Result<xfer_telemetry::LogConfig> {
        let file = || {
            self.file_path.clone().ok_or_else(|| ConfigError::InvalidValue {
                field: "log.file_path".to_string(),
                message: "required when output is 'file' or 'both'".to_string(),
            })
        };
        let output = match self.output {
            LogOutput::Stdout => xfer_telemetry::LogOutput::Stdout,
            LogOutput::Stderr => xfer_telemetry::LogOutput::Stderr,
            LogOutput::File => xfer_telemetry::LogOutput::File(file()?),
            LogOutput::Both => xfer_telemetry::LogOutput::Both {
                stdout: true,
                file: file()?,
            },
        };
        Ok(xfer_telemetry::LogConfig {
            level: self.level,
            format: self.format,
            output,
            directives: self.directives.clone(),
            ..xfer_telemetry::LogConfig::default()
        })
    }
}

/// Transfer manager side: dispatcher and placement tracker
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub dispatcher: DispatcherConfig,
    pub placement: PlacementConfig,
}

/// Node side: agent loop, admission queue and running transfers
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub agent: AgentConfig,
    pub admission: AdmissionConfig,
    pub running: RunningConfig,
}

/// Top-level configuration
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct XferConfig {
    pub manager: ManagerConfig,
    pub node: NodeConfig,
    pub log: LogConfig,
}

impl XferConfig {
    /// Fail on the first validation error; warnings are ignored
    pub fn validate(&self) -> Result<()> {
        let result = crate::validate::validate_config(self);
        if result.is_valid() {
            return Ok(());
        }
        let messages: Vec<String> = result.errors.iter().map(ToString::to_string).collect();
        Err(ConfigError::Validation(messages.join("; ")))
    }
}

/// Configuration loader
#[derive(Debug)]
pub struct ConfigLoader {
    sources: Vec<ConfigSource>,
    env_prefix: Option<String>,
}

impl ConfigLoader {
    #[must_use]
    pub fn new() -> Self {
        Self {
            sources: vec![ConfigSource::Default],
            env_prefix: None,
        }
    }

    /// Add a file source
    #[must_use]
    pub fn with_file(mut self, path: impl AsRef<Path>) -> Self {
        self.sources
            .push(ConfigSource::File(path.as_ref().to_path_buf()));
        self
    }

    /// Add an in-memory TOML source
    #[must_use]
    pub fn with_memory(mut self, toml: impl Into<String>) -> Self {
        self.sources.push(ConfigSource::Memory(toml.into()));
        self
    }

    /// Add environment variable source with prefix
    #[must_use]
    pub fn with_env_prefix(mut self, prefix: &str) -> Self {
        self.env_prefix = Some(prefix.to_string());
        self.sources.push(ConfigSource::Env);
        self
    }

    /// Load configuration from all sources
    pub fn load(&self) -> Result<XferConfig> {
        let mut config = XferConfig::default();

        for source in &self.sources {
            match source {
                ConfigSource::Default => {}
                ConfigSource::File(path) => {
                    let content = std::fs::read_to_string(path)?;
                    config = Self::parse(&content)?;
                }
                ConfigSource::Memory(content) => {
                    config = Self::parse(content)?;
                }
                ConfigSource::Env => {
                    if let Some(prefix) = &self.env_prefix {
                        config = Self::apply_env_overrides(config, prefix)?;
                    }
                }
            }
        }

        Ok(Self::expand_paths(config))
    }

    /// Load configuration from a TOML string
    pub fn load_from_str(toml: &str) -> Result<XferConfig> {
        Ok(Self::expand_paths(Self::parse(toml)?))
    }

    #[must_use]
    pub fn default_config() -> XferConfig {
        XferConfig::default()
    }

    fn parse(content: &str) -> Result<XferConfig> {
        toml::from_str(content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn expand_paths(mut config: XferConfig) -> XferConfig {
        if let Some(ref path) = config.log.file_path {
            config.log.file_path = Some(Self::expand_path(path));
        }
        config
    }

    /// Apply environment variable overrides
    fn apply_env_overrides(mut config: XferConfig, prefix: &str) -> Result<XferConfig> {
        // Manager overrides
        let dispatcher = &mut config.manager.dispatcher;
        if let Ok(val) = std::env::var(format!("{prefix}_MANAGER_SCHEDULER_ID")) {
            dispatcher.scheduler_id = val;
        }
        if let Some(val) = env_parse(prefix, "MANAGER_WORKER_COUNT")? {
            dispatcher.worker_count = val;
        }
        if let Some(val) = env_parse::<u32>(prefix, "MANAGER_MAX_SCHEDULED_PER_SECOND")? {
            // 0 lifts the limit
            dispatcher.max_scheduled_per_second = (val > 0).then_some(val);
        }
        if let Some(val) = env_parse(prefix, "MANAGER_REMOTE_TIMEOUT_MS")? {
            dispatcher.remote_timeout_ms = val;
        }
        if let Some(val) = env_parse(prefix, "MANAGER_OUTCOME_BATCH_SIZE")? {
            dispatcher.outcome_batch_size = val;
        }
        if let Some(val) = env_parse(prefix, "MANAGER_POOL_DIRECTORY_MAX_AGE_MS")? {
            config.manager.dispatcher.pool_directory_max_age_ms = val;
        }
        if let Some(val) = env_parse(prefix, "MANAGER_RECENT_START_BUCKET_MS")? {
            config.manager.placement.recent_start_bucket_ms = val;
        }

        // Node overrides
        if let Ok(val) = std::env::var(format!("{prefix}_NODE_ID")) {
            config.node.agent.node_id = val;
        }
        if let Some(val) = env_parse(prefix, "NODE_REMOTE_TIMEOUT_MS")? {
            config.node.agent.remote_timeout_ms = val;
        }
        let admission = &mut config.node.admission;
        if let Some(val) = env_parse(prefix, "NODE_TOTAL_SLOTS")? {
            admission.total_slots = val;
        }
        if let Some(val) = env_parse(prefix, "NODE_GUARANTEED_USER_SLOT_PERCENT")? {
            admission.guaranteed_user_slot_percent = val;
        }
        if let Some(val) = env_parse(prefix, "NODE_MAX_REGULAR_BEFORE_BACKFILL")? {
            admission.max_regular_before_backfill = val;
        }
        if let Some(val) = env_parse(prefix, "NODE_MAX_D2D_RETRY_INTERVAL_SECS")? {
            admission.max_d2d_retry_interval_secs = val;
        }
        if let Some(val) = env_parse(prefix, "NODE_CLIENT_CONNECT_TIMEOUT_SECS")? {
            config.node.running.client_connect_timeout_secs = val;
        }

        // Log overrides
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_LEVEL")) {
            config.log.level = val.parse().map_err(|e| ConfigError::InvalidValue {
                field: "log.level".to_string(),
                message: format!("{e}"),
            })?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_FORMAT")) {
            config.log.format = val.parse().map_err(|e| ConfigError::InvalidValue {
                field: "log.format".to_string(),
                message: format!("{e}"),
            })?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_OUTPUT")) {
            config.log.output = val.parse()?;
        }
        if let Ok(val) = std::env::var(format!("{prefix}_LOG_FILE_PATH")) {
            config.log.file_path = Some(PathBuf::from(val));
        }

        Ok(config)
    }

    /// Expand path with tilde
    fn expand_path(path: &Path) -> PathBuf {
        if let Some(rest) = path.to_str().and_then(|s| s.strip_prefix("~/")) {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest);
            }
        }
        path.to_path_buf()
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

fn env_parse<T: FromStr>(prefix: &str, key: &str) -> Result<Option<T>> {
    let name = format!("{prefix}_{key}");
    match std::env::var(&name) {
        Ok(val) => val
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::EnvVar(format!("Invalid {name} value: {val}"))),
        Err(_) => Ok(None),
    }
}
