//! Discovery configuration.
//!
//! Hosts hand the service a [`DiscoveryConfig`], usually parsed from a TOML
//! table. Missing keys fall back to defaults and per-source settings are
//! merged over the built-in defaults for that source.

use crate::error::{DiscoveryError, Result};
use crate::rotator::RotationStrategy;
use crate::types::CliSource;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

// Default refresh timings
const DEFAULT_AUTH_TIMEOUT_SECONDS: u64 = 300; // 5 minutes
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;
const DEFAULT_POLL_ATTEMPTS: u32 = 60;
const DEFAULT_SETTLE_DELAY_MS: u64 = 1000;
const DEFAULT_COMMAND_TIMEOUT_SECONDS: u64 = 300; // 5 minutes
const DEFAULT_VALIDATION_TIMEOUT_SECONDS: u64 = 15;

/// Per-source switches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Rotation priority (lower = higher priority)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            priority: None,
        }
    }
}

/// Source switches keyed by CLI name (`[sources.kimi-cli]`, ...)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct SourcesConfig {
    pub kimi_cli: SourceConfig,
    pub codex_cli: SourceConfig,
    pub qwen_cli: SourceConfig,
    pub gemini_cli: SourceConfig,
}

impl SourcesConfig {
    pub fn get(&self, source: CliSource) -> &SourceConfig {
        match source {
            CliSource::KimiCli => &self.kimi_cli,
            CliSource::CodexCli => &self.codex_cli,
            CliSource::QwenCli => &self.qwen_cli,
            CliSource::GeminiCli => &self.gemini_cli,
        }
    }

    pub fn get_mut(&mut self, source: CliSource) -> &mut SourceConfig {
        match source {
            CliSource::KimiCli => &mut self.kimi_cli,
            CliSource::CodexCli => &mut self.codex_cli,
            CliSource::QwenCli => &mut self.qwen_cli,
            CliSource::GeminiCli => &mut self.gemini_cli,
        }
    }
}

/// Timings bounding the refresh flows
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RefreshSettings {
    pub auth_timeout_seconds: u64,
    pub poll_interval_ms: u64,
    pub poll_attempts: u32,
    pub settle_delay_ms: u64,
    pub command_timeout_seconds: u64,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        Self {
            auth_timeout_seconds: DEFAULT_AUTH_TIMEOUT_SECONDS,
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            poll_attempts: DEFAULT_POLL_ATTEMPTS,
            settle_delay_ms: DEFAULT_SETTLE_DELAY_MS,
            command_timeout_seconds: DEFAULT_COMMAND_TIMEOUT_SECONDS,
        }
    }
}

impl RefreshSettings {
    pub fn auth_timeout(&self) -> Duration {
        Duration::from_secs(self.auth_timeout_seconds)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_seconds)
    }
}

/// Configuration for the discovery service
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// Run a scan when the service starts
    pub scan_on_startup: bool,
    /// Import discovered credentials into the host store after a scan
    pub auto_import: bool,
    /// Validate credentials against the provider before importing
    pub validate_tokens: bool,
    pub rotation_strategy: RotationStrategy,
    /// Override for the history file location
    #[serde(skip_serializing_if = "Option::is_none")]
    pub history_path: Option<PathBuf>,
    /// Timeout for a single provider validation request
    pub validation_timeout_seconds: u64,
    pub sources: SourcesConfig,
    pub refresh: RefreshSettings,
}

fn default_true() -> bool {
    true
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            scan_on_startup: true,
            auto_import: true,
            validate_tokens: true,
            rotation_strategy: RotationStrategy::default(),
            history_path: None,
            validation_timeout_seconds: DEFAULT_VALIDATION_TIMEOUT_SECONDS,
            sources: SourcesConfig::default(),
            refresh: RefreshSettings::default(),
        }
    }
}

impl DiscoveryConfig {
    /// Parse configuration from a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Load configuration from a TOML file, falling back to defaults when absent
    pub async fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_toml_str(&content)
    }

    /// Load `~/.credscout/config.toml` (or the `CREDSCOUT_DIR` override)
    pub async fn load_default() -> Result<Self> {
        Self::load(&crate::paths::config_path()?).await
    }

    /// Settings for one source, with the built-in priority filled in
    pub fn source(&self, source: CliSource) -> SourceConfig {
        let configured = *self.sources.get(source);
        SourceConfig {
            enabled: configured.enabled,
            priority: configured
                .priority
                .or_else(|| Some(source.default_priority())),
        }
    }

    pub fn is_enabled(&self, source: CliSource) -> bool {
        self.source(source).enabled
    }

    /// Priority map handed to the rotator
    pub fn priorities(&self) -> HashMap<CliSource, u32> {
        CliSource::ALL
            .into_iter()
            .map(|source| {
                let priority = self
                    .source(source)
                    .priority
                    .unwrap_or(source.default_priority());
                (source, priority)
            })
            .collect()
    }

    pub fn validation_timeout(&self) -> Duration {
        Duration::from_secs(self.validation_timeout_seconds)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.validation_timeout_seconds == 0 {
            return Err(DiscoveryError::Config(
                "Validation timeout must be at least 1 second".to_string(),
            ));
        }

        if self.refresh.auth_timeout_seconds == 0 {
            return Err(DiscoveryError::Config(
                "Refresh auth timeout must be at least 1 second".to_string(),
            ));
        }

        if self.refresh.command_timeout_seconds == 0 {
            return Err(DiscoveryError::Config(
                "Refresh command timeout must be at least 1 second".to_string(),
            ));
        }

        if self.refresh.poll_interval_ms == 0 {
            return Err(DiscoveryError::Config(
                "Refresh poll interval must be greater than zero".to_string(),
            ));
        }

        if self.refresh.poll_attempts == 0 {
            return Err(DiscoveryError::Config(
                "Refresh poll attempts must be at least 1".to_string(),
            ));
        }

        if let Some(path) = &self.history_path
            && path.as_os_str().is_empty()
        {
            return Err(DiscoveryError::Config(
                "History path must not be empty".to_string(),
            ));
        }

        Ok(())
    }
}
