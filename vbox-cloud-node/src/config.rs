//! Configuration management for the vbox-cloud CLI.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use vbox_cloud_common::LogFormat;
use vbox_cloud_driver::command::{DEFAULT_CLONE_TIMEOUT, DEFAULT_COMMAND_TIMEOUT, DEFAULT_VBOXMANAGE_PATH};
use vbox_cloud_driver::profiles::{default_profiles, host_architecture};
use vbox_cloud_driver::{CommandTimeouts, DriverConfig, HardwareProfile, HardwareProfileCatalog};

use crate::cli::Args;

/// Config file read when `--config` is not given.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/vbox-cloud/node.yaml";

/// Main configuration structure.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// VirtualBox driver configuration
    pub driver: DriverSection,
    /// Hardware profile catalog
    pub hardware_profiles: Vec<HardwareProfile>,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            driver: DriverSection::default(),
            hardware_profiles: default_profiles(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            return Err(anyhow::anyhow!("Config file not found: {}", path.display()));
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content).with_context(|| format!("Failed to parse config file: {}", path.display()))
    }

    /// Parse configuration from YAML text.
    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = serde_yaml::from_str(content)?;
        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(ref path) = args.vboxmanage {
            self.driver.vboxmanage_path = path.clone();
        }

        if let Some(ref adapter) = args.bridge_adapter {
            self.driver.bridge_adapter = adapter.clone();
        }

        if let Some(ref level) = args.log_level {
            self.logging.level = level.clone();
        }

        if args.log_json {
            self.logging.format = LogFormatSetting::Json;
        }

        if args.dev {
            self.driver.backend = ExecutorBackend::Mock;
        }

        self
    }

    /// Invocation timeouts.
    pub fn timeouts(&self) -> CommandTimeouts {
        CommandTimeouts {
            command: Duration::from_secs(self.driver.command_timeout_secs),
            clone: Duration::from_secs(self.driver.clone_timeout_secs),
        }
    }

    /// Profile catalog, validated.
    pub fn catalog(&self) -> Result<HardwareProfileCatalog> {
        let architecture = self.driver.architecture.clone().unwrap_or_else(host_architecture);
        HardwareProfileCatalog::new(self.hardware_profiles.clone(), architecture)
            .context("Invalid hardware_profiles")
    }

    /// Settings applied to new instances.
    pub fn driver_config(&self) -> DriverConfig {
        let defaults = DriverConfig::default();
        DriverConfig {
            owner: self.driver.owner.clone().unwrap_or(defaults.owner),
            bridge_adapter: self.driver.bridge_adapter.clone(),
            os_type: self.driver.os_type.clone(),
            media_dir: self.driver.media_dir.clone().unwrap_or(defaults.media_dir),
        }
    }
}

/// Which VBoxManage the driver talks to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutorBackend {
    /// The real VBoxManage binary
    #[default]
    Vboxmanage,
    /// In-memory VirtualBox for development
    Mock,
}

/// Driver configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DriverSection {
    pub backend: ExecutorBackend,
    /// Path to the VBoxManage binary
    pub vboxmanage_path: String,
    /// Bound for ordinary VBoxManage calls
    pub command_timeout_secs: u64,
    /// Bound for disk cloning
    pub clone_timeout_secs: u64,
    /// Host interface bridged to NIC 1 of new instances
    pub bridge_adapter: String,
    /// `--ostype` for new instances
    pub os_type: String,
    /// Owner reported on records (defaults to $USER)
    pub owner: Option<String>,
    /// Architecture reported on images and profiles (defaults to the host's)
    pub architecture: Option<String>,
    /// Directory for cloud-init ISOs (defaults to a temp directory)
    pub media_dir: Option<PathBuf>,
}

impl Default for DriverSection {
    fn default() -> Self {
        Self {
            backend: ExecutorBackend::default(),
            vboxmanage_path: DEFAULT_VBOXMANAGE_PATH.to_string(),
            command_timeout_secs: DEFAULT_COMMAND_TIMEOUT.as_secs(),
            clone_timeout_secs: DEFAULT_CLONE_TIMEOUT.as_secs(),
            bridge_adapter: "eth0".to_string(),
            os_type: "Linux".to_string(),
            owner: None,
            architecture: None,
            media_dir: None,
        }
    }
}

/// Log output format as written in the config file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum LogFormatSetting {
    #[default]
    Pretty,
    Json,
}

impl From<LogFormatSetting> for LogFormat {
    fn from(setting: LogFormatSetting) -> Self {
        match setting {
            LogFormatSetting::Pretty => LogFormat::Pretty,
            LogFormatSetting::Json => LogFormat::Json,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub level: String,
    pub format: LogFormatSetting,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormatSetting::default(),
        }
    }
}
