//! Core types for credential discovery
//!
//! Defines the supported CLI sources, discovered credentials (in memory only),
//! the persisted history projection and the credential shape handed to the host.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::DiscoveryError;
use crate::fingerprint::{fingerprint, short_fingerprint};

/// Current on-disk history format version
pub const HISTORY_VERSION: u32 = 1;

/// Supported CLI tools whose local credential storage is scanned
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum CliSource {
    KimiCli,
    CodexCli,
    QwenCli,
    GeminiCli,
}

impl CliSource {
    /// Every supported source, in default priority order
    pub const ALL: [CliSource; 4] = [
        CliSource::KimiCli,
        CliSource::CodexCli,
        CliSource::QwenCli,
        CliSource::GeminiCli,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CliSource::KimiCli => "kimi-cli",
            CliSource::CodexCli => "codex-cli",
            CliSource::QwenCli => "qwen-cli",
            CliSource::GeminiCli => "gemini-cli",
        }
    }

    /// Provider identifier used for host-side profiles
    pub fn provider(&self) -> &'static str {
        match self {
            CliSource::KimiCli => "kimi-code",
            CliSource::CodexCli => "openai",
            CliSource::QwenCli => "qwen-portal",
            CliSource::GeminiCli => "google-gemini-cli",
        }
    }

    /// Credential kind the source normally stores
    pub fn default_kind(&self) -> CredentialKind {
        match self {
            CliSource::KimiCli | CliSource::CodexCli => CredentialKind::ApiKey,
            CliSource::QwenCli | CliSource::GeminiCli => CredentialKind::OAuth,
        }
    }

    /// Rotation priority when configuration does not set one (lower wins)
    pub fn default_priority(&self) -> u32 {
        match self {
            CliSource::KimiCli => 1,
            CliSource::CodexCli => 2,
            CliSource::QwenCli => 3,
            CliSource::GeminiCli => 4,
        }
    }

    /// Provider page where a new API key can be generated
    pub fn api_key_url(&self) -> Option<&'static str> {
        match self {
            CliSource::KimiCli => Some("https://platform.moonshot.cn/console/api-keys"),
            CliSource::CodexCli => Some("https://platform.openai.com/api-keys"),
            CliSource::QwenCli => Some("https://bailian.console.aliyun.com/?apiKey=1#/api-key"),
            CliSource::GeminiCli => Some("https://aistudio.google.com/app/apikey"),
        }
    }

    /// Browser login page for OAuth-backed sources
    pub fn oauth_login_url(&self) -> Option<&'static str> {
        match self {
            CliSource::KimiCli => None,
            CliSource::CodexCli => Some("https://chat.openai.com/"),
            CliSource::QwenCli => Some("https://chat.qwenlm.ai/"),
            CliSource::GeminiCli => Some("https://accounts.google.com/o/oauth2/auth"),
        }
    }

    /// Native login command of the tool
    pub fn login_command(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            CliSource::KimiCli => ("kimi", &["login"]),
            CliSource::CodexCli => ("codex", &["login"]),
            CliSource::QwenCli => ("qwen-code", &["--auth"]),
            CliSource::GeminiCli => ("gemini", &["login"]),
        }
    }
}

impl fmt::Display for CliSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CliSource {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        CliSource::ALL
            .into_iter()
            .find(|source| source.as_str() == s.trim())
            .ok_or_else(|| DiscoveryError::UnknownSource(s.to_string()))
    }
}

/// Whether a credential is a long-lived API key or an OAuth access token
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CredentialKind {
    #[serde(rename = "api_key")]
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
}

impl fmt::Display for CredentialKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialKind::ApiKey => f.write_str("api_key"),
            CredentialKind::OAuth => f.write_str("oauth"),
        }
    }
}

/// Lifecycle status of a tracked credential
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CredentialStatus {
    #[default]
    Active,
    Expired,
    Invalid,
    Revoked,
}

impl fmt::Display for CredentialStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CredentialStatus::Active => f.write_str("active"),
            CredentialStatus::Expired => f.write_str("expired"),
            CredentialStatus::Invalid => f.write_str("invalid"),
            CredentialStatus::Revoked => f.write_str("revoked"),
        }
    }
}

/// Provider details a scanner attaches to a credential
#[derive(Clone, Default, PartialEq, Eq)]
pub struct CredentialMetadata {
    /// File path or `env:NAME` the secret was read from
    pub origin: Option<String>,
    /// OAuth refresh token, kept in memory for import only
    pub refresh_token: Option<String>,
    /// Access token expiration time
    pub expires_at: Option<DateTime<Utc>>,
    /// Associated email/account
    pub email: Option<String>,
}

impl CredentialMetadata {
    pub fn from_origin(origin: impl Into<String>) -> Self {
        Self {
            origin: Some(origin.into()),
            ..Default::default()
        }
    }
}

impl fmt::Debug for CredentialMetadata {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CredentialMetadata")
            .field("origin", &self.origin)
            .field(
                "refresh_token",
                &self.refresh_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("expires_at", &self.expires_at)
            .field("email", &self.email)
            .finish()
    }
}

/// A credential found by a scanner. Holds the raw secret and never leaves memory.
#[derive(Clone)]
pub struct DiscoveredCredential {
    pub source: CliSource,
    pub provider: String,
    pub profile_id: String,
    pub kind: CredentialKind,
    pub secret: String,
    pub fingerprint: String,
    pub discovered_at: DateTime<Utc>,
    pub last_used_at: Option<DateTime<Utc>>,
    pub usage_count: u64,
    pub status: CredentialStatus,
    pub metadata: CredentialMetadata,
}

impl DiscoveredCredential {
    /// Build a freshly discovered, active credential for a source
    pub fn new(
        source: CliSource,
        kind: CredentialKind,
        secret: impl Into<String>,
        metadata: CredentialMetadata,
    ) -> Self {
        let secret = secret.into();
        let provider = source.provider().to_string();
        Self {
            source,
            profile_id: format!("{}:default", provider),
            provider,
            kind,
            fingerprint: fingerprint(&secret),
            secret,
            discovered_at: Utc::now(),
            last_used_at: None,
            usage_count: 0,
            status: CredentialStatus::Active,
            metadata,
        }
    }

    /// OAuth credentials carrying a refresh token can be renewed without a login
    pub fn can_auto_refresh(&self) -> bool {
        self.kind == CredentialKind::OAuth && self.metadata.refresh_token.is_some()
    }
}

impl fmt::Debug for DiscoveredCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiscoveredCredential")
            .field("source", &self.source)
            .field("provider", &self.provider)
            .field("profile_id", &self.profile_id)
            .field("kind", &self.kind)
            .field("fingerprint", &short_fingerprint(&self.fingerprint))
            .field("discovered_at", &self.discovered_at)
            .field("usage_count", &self.usage_count)
            .field("status", &self.status)
            .field("metadata", &self.metadata)
            .finish_non_exhaustive()
    }
}

/// Persisted projection of a discovered credential, without secret material
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryEntry {
    pub source: CliSource,
    pub provider: String,
    pub profile_id: String,
    pub kind: CredentialKind,
    pub fingerprint: String,
    pub discovered_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_used_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub usage_count: u64,
    pub status: CredentialStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default)]
    pub consecutive_failures: u32,
    /// When the host store last accepted this fingerprint
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub imported_at: Option<DateTime<Utc>>,
}

impl HistoryEntry {
    pub fn from_credential(credential: &DiscoveredCredential) -> Self {
        Self {
            source: credential.source,
            provider: credential.provider.clone(),
            profile_id: credential.profile_id.clone(),
            kind: credential.kind,
            fingerprint: credential.fingerprint.clone(),
            discovered_at: credential.discovered_at,
            last_used_at: credential.last_used_at,
            usage_count: credential.usage_count,
            status: credential.status,
            last_error: None,
            consecutive_failures: 0,
            imported_at: None,
        }
    }

    pub fn is_active(&self) -> bool {
        self.status == CredentialStatus::Active
    }
}

/// The versioned history container written to disk
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryFile {
    pub version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_scan_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub discovered: Vec<HistoryEntry>,
}

impl HistoryFile {
    pub fn empty() -> Self {
        Self {
            version: HISTORY_VERSION,
            last_scan_at: None,
            discovered: Vec::new(),
        }
    }
}

impl Default for HistoryFile {
    fn default() -> Self {
        Self::empty()
    }
}

/// Credential in the shape the host credential store expects
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum HostCredential {
    #[serde(rename = "api_key")]
    ApiKey { provider: String, key: String },
    #[serde(rename = "oauth")]
    OAuth {
        provider: String,
        access: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        refresh: Option<String>,
        /// Expiry as epoch milliseconds
        #[serde(default, skip_serializing_if = "Option::is_none")]
        expires: Option<i64>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        email: Option<String>,
    },
}

impl HostCredential {
    pub fn from_discovered(credential: &DiscoveredCredential) -> Self {
        match credential.kind {
            CredentialKind::ApiKey => HostCredential::ApiKey {
                provider: credential.provider.clone(),
                key: credential.secret.clone(),
            },
            CredentialKind::OAuth => HostCredential::OAuth {
                provider: credential.provider.clone(),
                access: credential.secret.clone(),
                refresh: credential.metadata.refresh_token.clone(),
                expires: credential
                    .metadata
                    .expires_at
                    .map(|expires| expires.timestamp_millis()),
                email: credential.metadata.email.clone(),
            },
        }
    }

    pub fn provider(&self) -> &str {
        match self {
            HostCredential::ApiKey { provider, .. } | HostCredential::OAuth { provider, .. } => {
                provider
            }
        }
    }
}

impl fmt::Debug for HostCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HostCredential::ApiKey { provider, .. } => f
                .debug_struct("ApiKey")
                .field("provider", provider)
                .finish_non_exhaustive(),
            HostCredential::OAuth {
                provider,
                expires,
                email,
                ..
            } => f
                .debug_struct("OAuth")
                .field("provider", provider)
                .field("expires", expires)
                .field("email", email)
                .finish_non_exhaustive(),
        }
    }
}

/// Profile upserted into the host credential store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CredentialProfile {
    pub profile_id: String,
    pub credential: HostCredential,
}
