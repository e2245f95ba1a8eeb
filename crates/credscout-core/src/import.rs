//! Import engine
//!
//! Hands discovered credentials to the host's credential store and records
//! the outcome in history. Imports run one at a time so two credentials can
//! never race on the same fingerprint.

use crate::error::DiscoveryError;
use crate::fingerprint::short_fingerprint;
use crate::history::HistoryStore;
use crate::types::{
    CliSource, CredentialProfile, CredentialStatus, DiscoveredCredential, HostCredential,
};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

/// The host's credential store
#[async_trait]
pub trait CredentialHost: Send + Sync {
    /// Insert or replace the profile with the same id
    async fn upsert_credential_profile(&self, profile: CredentialProfile) -> anyhow::Result<()>;
}

/// Outcome of importing one credential
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub success: bool,
    pub source: CliSource,
    pub profile_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub already_exists: bool,
}

impl ImportResult {
    pub(crate) fn imported(credential: &DiscoveredCredential, already_exists: bool) -> Self {
        Self {
            success: true,
            source: credential.source,
            profile_id: credential.profile_id.clone(),
            error: None,
            already_exists,
        }
    }

    pub(crate) fn failed(credential: &DiscoveredCredential, error: String) -> Self {
        Self {
            success: false,
            source: credential.source,
            profile_id: credential.profile_id.clone(),
            error: Some(error),
            already_exists: false,
        }
    }
}

/// Totals for a batch import
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportSummary {
    pub imported: usize,
    /// Already present and active
    pub skipped: usize,
    pub failed: usize,
    pub results: Vec<ImportResult>,
}

/// Default model for a provider's profile
pub fn default_model(provider: &str) -> Option<&'static str> {
    match provider {
        "kimi-code" => Some("kimi-code/kimi-k2.5"),
        "openai" => Some("openai/gpt-4o"),
        "qwen-portal" => Some("qwen-portal/qwen-coder-plus"),
        "google-gemini-cli" => Some("google-gemini-cli/gemini-3-pro-preview"),
        _ => None,
    }
}

pub struct ImportEngine {
    history: Arc<HistoryStore>,
    host: Arc<dyn CredentialHost>,
}

impl ImportEngine {
    pub fn new(history: Arc<HistoryStore>, host: Arc<dyn CredentialHost>) -> Self {
        Self { history, host }
    }

    /// Import one credential.
    ///
    /// A fingerprint that is active and was imported before is reported as
    /// already existing without calling the host again.
    pub async fn import_credential(&self, credential: &DiscoveredCredential) -> ImportResult {
        let fingerprint = &credential.fingerprint;

        if let Some(entry) = self.history.get(fingerprint).await
            && entry.is_active()
            && entry.imported_at.is_some()
        {
            return ImportResult::imported(credential, true);
        }

        let profile = CredentialProfile {
            profile_id: credential.profile_id.clone(),
            credential: HostCredential::from_discovered(credential),
        };

        if let Err(e) = self.host.upsert_credential_profile(profile).await {
            let error = DiscoveryError::Host(format!(
                "Failed to import {} credential: {}",
                credential.provider, e
            ));
            let message = redact(&error.to_string(), credential);
            warn!(
                source = %credential.source,
                fingerprint = %short_fingerprint(fingerprint),
                error = %message,
                "Import failed"
            );
            if let Err(e) = self.history.record_failure(fingerprint, &message).await {
                warn!(error = %e, "Failed to record import failure");
            }
            return ImportResult::failed(credential, message);
        }

        if let Err(e) = self.record_imported(credential).await {
            warn!(
                source = %credential.source,
                error = %e,
                "Credential imported but history update failed"
            );
        }

        info!(
            source = %credential.source,
            profile_id = %credential.profile_id,
            fingerprint = %short_fingerprint(fingerprint),
            "Imported credential"
        );
        ImportResult::imported(credential, false)
    }

    /// Import credentials sequentially
    pub async fn import_credentials(&self, credentials: &[DiscoveredCredential]) -> ImportSummary {
        let mut summary = ImportSummary::default();

        for credential in credentials {
            let result = self.import_credential(credential).await;
            match (result.success, result.already_exists) {
                (true, true) => summary.skipped += 1,
                (true, false) => summary.imported += 1,
                (false, _) => summary.failed += 1,
            }
            summary.results.push(result);
        }

        summary
    }

    async fn record_imported(&self, credential: &DiscoveredCredential) -> crate::error::Result<()> {
        self.history.add_or_update(credential).await?;
        self.history
            .set_status(&credential.fingerprint, CredentialStatus::Active)
            .await?;
        self.history.mark_imported(&credential.fingerprint).await?;
        Ok(())
    }
}

/// Strip secret material a host error may have echoed back
fn redact(message: &str, credential: &DiscoveredCredential) -> String {
    [
        Some(credential.secret.as_str()),
        credential.metadata.refresh_token.as_deref(),
    ]
    .into_iter()
    .flatten()
    .filter(|secret| !secret.is_empty())
    .fold(message.to_string(), |redacted, secret| {
        redacted.replace(secret, "[REDACTED]")
    })
}
