//! Stack configuration
//!
//! Loaded from YAML or assembled with [`MptcpConfigBuilder`].

use serde::{Deserialize, Serialize};

use crate::mptcp::scheduler::validate_scheduler_name;
use mptcp_core::types::option::MPTCP_VERSION;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration: {0}")]
    Invalid(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Multipath configuration shared by every connection of a manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MptcpConfig {
    /// Offer and accept MP_CAPABLE; when false every path stays plain
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    /// Require DSS checksums on connections we take part in
    #[serde(default)]
    pub checksum_required: bool,

    /// Protocol version advertised in MP_CAPABLE
    #[serde(default = "default_version")]
    pub version: u8,

    /// Name of the scheduler policy bound to new connections
    #[serde(default = "default_scheduler")]
    pub scheduler: String,

    /// Upper bound on established plus in-flight subflows per connection
    #[serde(default = "default_max_subflows")]
    pub max_subflows: usize,

    /// Peer ADD_ADDR announcements accepted per connection
    #[serde(default = "default_max_add_addr_accepted")]
    pub max_add_addr_accepted: usize,

    /// Key regenerations allowed when a token collides
    #[serde(default = "default_token_retries")]
    pub token_retries: u32,

    /// Capacity of the path manager work queue
    #[serde(default = "default_pm_queue_depth")]
    pub pm_queue_depth: usize,
}

fn default_enabled() -> bool { true }
fn default_version() -> u8 { MPTCP_VERSION }
fn default_scheduler() -> String { "default".to_string() }
fn default_max_subflows() -> usize { 8 }
fn default_max_add_addr_accepted() -> usize { 8 }
fn default_token_retries() -> u32 { 8 }
fn default_pm_queue_depth() -> usize { 64 }

impl Default for MptcpConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            checksum_required: false,
            version: default_version(),
            scheduler: default_scheduler(),
            max_subflows: default_max_subflows(),
            max_add_addr_accepted: default_max_add_addr_accepted(),
            token_retries: default_token_retries(),
            pm_queue_depth: default_pm_queue_depth(),
        }
    }
}

impl MptcpConfig {
    pub fn builder() -> MptcpConfigBuilder {
        MptcpConfigBuilder::default()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_subflows == 0 {
            return Err(ConfigError::Invalid("max_subflows must be at least 1".to_string()));
        }
        if self.token_retries == 0 {
            return Err(ConfigError::Invalid("token_retries must be at least 1".to_string()));
        }
        if self.pm_queue_depth == 0 {
            return Err(ConfigError::Invalid("pm_queue_depth must be at least 1".to_string()));
        }
        if self.version != MPTCP_VERSION {
            return Err(ConfigError::Invalid(format!(
                "unsupported protocol version {}",
                self.version
            )));
        }
        validate_scheduler_name(&self.scheduler)
            .map_err(|e| ConfigError::Invalid(format!("scheduler: {}", e)))?;
        Ok(())
    }

    /// Load configuration from a YAML file
    pub fn from_yaml_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    /// Load configuration from a YAML string
    pub fn from_yaml_str(yaml: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }
}

/// Builder for MptcpConfig
#[derive(Debug, Default)]
pub struct MptcpConfigBuilder {
    enabled: Option<bool>,
    checksum_required: Option<bool>,
    scheduler: Option<String>,
    max_subflows: Option<usize>,
    max_add_addr_accepted: Option<usize>,
    token_retries: Option<u32>,
    pm_queue_depth: Option<usize>,
}

impl MptcpConfigBuilder {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn checksum_required(mut self, required: bool) -> Self {
        self.checksum_required = Some(required);
        self
    }

    pub fn scheduler(mut self, name: impl Into<String>) -> Self {
        self.scheduler = Some(name.into());
        self
    }

    pub fn max_subflows(mut self, max: usize) -> Self {
        self.max_subflows = Some(max);
        self
    }

    pub fn max_add_addr_accepted(mut self, max: usize) -> Self {
        self.max_add_addr_accepted = Some(max);
        self
    }

    pub fn token_retries(mut self, retries: u32) -> Self {
        self.token_retries = Some(retries);
        self
    }

    pub fn pm_queue_depth(mut self, depth: usize) -> Self {
        self.pm_queue_depth = Some(depth);
        self
    }

    pub fn build(self) -> MptcpConfig {
        let default = MptcpConfig::default();
        MptcpConfig {
            enabled: self.enabled.unwrap_or(default.enabled),
            checksum_required: self.checksum_required.unwrap_or(default.checksum_required),
            version: default.version,
            scheduler: self.scheduler.unwrap_or(default.scheduler),
            max_subflows: self.max_subflows.unwrap_or(default.max_subflows),
            max_add_addr_accepted: self.max_add_addr_accepted.unwrap_or(default.max_add_addr_accepted),
            token_retries: self.token_retries.unwrap_or(default.token_retries),
            pm_queue_depth: self.pm_queue_depth.unwrap_or(default.pm_queue_depth),
        }
    }
}
