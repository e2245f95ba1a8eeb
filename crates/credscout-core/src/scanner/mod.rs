//! Credential Scanners
//!
//! One scanner per supported CLI. Each knows where its tool keeps credentials
//! on disk, which environment variable to fall back to, and which provider
//! endpoint answers a cheap authenticated request.
//!
//! Shared behavior lives in [`ScanContext`], which every scanner owns; the
//! source modules only implement the [`Scanner`] trait.

mod codex;
mod gemini;
mod kimi;
mod qwen;

pub use codex::CodexScanner;
pub use gemini::GeminiScanner;
pub use kimi::KimiScanner;
pub use qwen::QwenScanner;

use crate::error::Result;
use crate::types::{CliSource, CredentialKind, CredentialMetadata, DiscoveredCredential};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// OAuth tokens expiring within this window are treated as absent
pub const EXPIRY_MARGIN_SECONDS: i64 = 5 * 60;

const DEFAULT_VALIDATION_TIMEOUT_SECONDS: u64 = 15;

/// Result of probing one source
#[derive(Debug, Clone)]
pub enum ScanOutcome {
    Found(DiscoveredCredential),
    NotFound { reason: String },
}

impl ScanOutcome {
    pub fn not_found(reason: impl Into<String>) -> Self {
        ScanOutcome::NotFound {
            reason: reason.into(),
        }
    }

    pub fn is_found(&self) -> bool {
        matches!(self, ScanOutcome::Found(_))
    }

    pub fn credential(&self) -> Option<&DiscoveredCredential> {
        match self {
            ScanOutcome::Found(credential) => Some(credential),
            ScanOutcome::NotFound { .. } => None,
        }
    }

    pub fn reason(&self) -> Option<&str> {
        match self {
            ScanOutcome::Found(_) => None,
            ScanOutcome::NotFound { reason } => Some(reason),
        }
    }
}

/// Trait for per-CLI credential scanners
///
/// `scan` and `read_credential` only read local files and the environment.
/// `validate` makes one outbound request; the built-in scanners report
/// transport failures as `Ok(false)`.
#[async_trait]
pub trait Scanner: Send + Sync {
    /// The CLI this scanner probes
    fn source(&self) -> CliSource;

    /// Credential kind this source normally yields
    fn kind(&self) -> CredentialKind {
        self.source().default_kind()
    }

    /// File the tool's login flow writes its credential to
    fn credential_path(&self) -> PathBuf;

    /// Look for a usable credential
    async fn scan(&self) -> Result<ScanOutcome>;

    /// Ask the provider whether a secret is accepted
    async fn validate(&self, secret: &str) -> Result<bool>;

    /// Parse a credential file in this source's format, without expiry checks
    async fn read_credential(&self, path: &Path) -> Option<DiscoveredCredential>;
}

/// Shared scanner capabilities: path resolution, env fallback, validation
/// requests and credential construction.
#[derive(Debug, Clone)]
pub struct ScanContext {
    source: CliSource,
    home: PathBuf,
    env_var: String,
    validation_url: String,
    client: reqwest::Client,
}

impl ScanContext {
    /// Default context for a source: real home directory, documented env var
    /// and the provider's validation endpoint.
    pub fn for_source(source: CliSource) -> Self {
        let (validation_url, env_var) = match source {
            CliSource::KimiCli => (kimi::VALIDATION_URL, kimi::ENV_VAR),
            CliSource::CodexCli => (codex::VALIDATION_URL, codex::ENV_VAR),
            CliSource::QwenCli => (qwen::VALIDATION_URL, qwen::ENV_VAR),
            CliSource::GeminiCli => (gemini::VALIDATION_URL, gemini::ENV_VAR),
        };

        Self {
            source,
            home: dirs::home_dir().unwrap_or_else(|| PathBuf::from(".")),
            env_var: env_var.to_string(),
            validation_url: validation_url.to_string(),
            client: http_client(std::time::Duration::from_secs(
                DEFAULT_VALIDATION_TIMEOUT_SECONDS,
            )),
        }
    }

    /// Resolve tool paths against a different home (for testing)
    pub fn with_home(mut self, home: impl Into<PathBuf>) -> Self {
        self.home = home.into();
        self
    }

    pub fn with_env_var(mut self, name: impl Into<String>) -> Self {
        self.env_var = name.into();
        self
    }

    pub fn with_validation_url(mut self, url: impl Into<String>) -> Self {
        self.validation_url = url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: std::time::Duration) -> Self {
        self.client = http_client(timeout);
        self
    }

    pub fn source(&self) -> CliSource {
        self.source
    }

    pub fn home(&self) -> &Path {
        &self.home
    }

    pub fn env_var(&self) -> &str {
        &self.env_var
    }

    /// Path below the home directory
    pub fn home_path(&self, segments: &[&str]) -> PathBuf {
        segments
            .iter()
            .fold(self.home.clone(), |path, segment| path.join(segment))
    }

    /// Non-empty value of the fallback environment variable
    pub fn env_secret(&self) -> Option<String> {
        non_empty(std::env::var(&self.env_var).ok())
    }

    /// `env:NAME` origin marker for environment credentials
    pub fn env_origin(&self) -> String {
        format!("env:{}", self.env_var)
    }

    /// Build a discovered credential attributed to this source
    pub fn credential(
        &self,
        kind: CredentialKind,
        secret: impl Into<String>,
        metadata: CredentialMetadata,
    ) -> DiscoveredCredential {
        DiscoveredCredential::new(self.source, kind, secret, metadata)
    }

    /// Send one bearer-authenticated GET; only HTTP 200 counts as valid
    pub async fn validate_bearer(&self, secret: &str) -> bool {
        let response = self
            .client
            .get(&self.validation_url)
            .bearer_auth(secret)
            .header("Content-Type", "application/json")
            .send()
            .await;

        match response {
            Ok(response) => {
                let valid = response.status() == reqwest::StatusCode::OK;
                debug!(
                    source = %self.source,
                    status = response.status().as_u16(),
                    valid,
                    "Validation response"
                );
                valid
            }
            Err(error) => {
                debug!(source = %self.source, error = %error, "Validation request failed");
                false
            }
        }
    }
}

fn http_client(timeout: std::time::Duration) -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .unwrap_or_else(|_| reqwest::Client::new())
}

/// Read and parse a JSON file, `None` when missing or malformed
pub async fn read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let content = read_text(path).await?;
    match serde_json::from_str(&content) {
        Ok(value) => Some(value),
        Err(error) => {
            debug!(path = %path.display(), error = %error, "Failed to parse credential file");
            None
        }
    }
}

/// Read and parse a TOML file, `None` when missing or malformed
pub async fn read_toml(path: &Path) -> Option<toml::Table> {
    let content = read_text(path).await?;
    match content.parse::<toml::Table>() {
        Ok(table) => Some(table),
        Err(error) => {
            debug!(path = %path.display(), error = %error, "Failed to parse config file");
            None
        }
    }
}

/// Read a text file, trimmed; `None` when missing or unreadable
pub async fn read_text(path: &Path) -> Option<String> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) => Some(content.trim().to_string()),
        Err(error) => {
            debug!(path = %path.display(), error = %error, "Credential file not readable");
            None
        }
    }
}

/// Drop empty and whitespace-only values
pub fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Convert an epoch-milliseconds expiry into a timestamp
pub fn expiry_from_millis(millis: Option<i64>) -> Option<DateTime<Utc>> {
    millis.and_then(DateTime::from_timestamp_millis)
}

/// True when the expiry is at or within the safety margin of `now`
pub fn is_expiring(expires_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
    expires_at
        .map(|expires| expires <= now + Duration::seconds(EXPIRY_MARGIN_SECONDS))
        .unwrap_or(false)
}

/// Build the scanner matching a context's source
pub fn build_scanner(ctx: ScanContext) -> Arc<dyn Scanner> {
    match ctx.source() {
        CliSource::KimiCli => Arc::new(KimiScanner::with_context(ctx)),
        CliSource::CodexCli => Arc::new(CodexScanner::with_context(ctx)),
        CliSource::QwenCli => Arc::new(QwenScanner::with_context(ctx)),
        CliSource::GeminiCli => Arc::new(GeminiScanner::with_context(ctx)),
    }
}
