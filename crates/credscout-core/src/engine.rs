//! Discovery engine
//!
//! Fans a scan out over every enabled scanner, merges what they find into the
//! history store and keeps per-source failures apart so one broken source
//! never hides the others.

use crate::config::DiscoveryConfig;
use crate::fingerprint::short_fingerprint;
use crate::history::HistoryStore;
use crate::scanner::{ScanContext, ScanOutcome, Scanner, build_scanner};
use crate::types::{CliSource, CredentialStatus, DiscoveredCredential};
use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Outcome of one scan pass. Holds raw secrets, so it is never serialized.
#[derive(Debug, Clone, Default)]
pub struct DiscoveryReport {
    /// Number of scanners run
    pub scanned: usize,
    pub found: usize,
    /// `"<source>: <message>"` for every source that yielded nothing
    pub errors: Vec<String>,
    pub credentials: Vec<DiscoveredCredential>,
}

/// Read-only counters derived from the history store
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryStats {
    pub enabled_sources: Vec<CliSource>,
    pub total_discovered: usize,
    pub active: usize,
    pub last_scan_at: Option<DateTime<Utc>>,
}

pub struct DiscoveryEngine {
    scanners: Vec<Arc<dyn Scanner>>,
    history: Arc<HistoryStore>,
}

impl DiscoveryEngine {
    /// Build scanners for every source enabled in the configuration
    pub fn new(config: &DiscoveryConfig, history: Arc<HistoryStore>) -> Self {
        let scanners = CliSource::ALL
            .into_iter()
            .filter(|source| config.is_enabled(*source))
            .map(|source| {
                build_scanner(
                    ScanContext::for_source(source).with_timeout(config.validation_timeout()),
                )
            })
            .collect();
        Self::with_scanners(scanners, history)
    }

    /// Use an explicit scanner set
    pub fn with_scanners(scanners: Vec<Arc<dyn Scanner>>, history: Arc<HistoryStore>) -> Self {
        Self { scanners, history }
    }

    pub fn history(&self) -> &Arc<HistoryStore> {
        &self.history
    }

    pub fn scanners(&self) -> &[Arc<dyn Scanner>] {
        &self.scanners
    }

    /// Scanner for a source, if that source is enabled
    pub fn scanner(&self, source: CliSource) -> Option<Arc<dyn Scanner>> {
        self.scanners
            .iter()
            .find(|scanner| scanner.source() == source)
            .cloned()
    }

    pub fn enabled_sources(&self) -> Vec<CliSource> {
        self.scanners.iter().map(|scanner| scanner.source()).collect()
    }

    /// Run every scanner concurrently and merge the results into history
    pub async fn scan(&self) -> DiscoveryReport {
        info!(sources = self.scanners.len(), "Starting credential scan");

        let outcomes = join_all(self.scanners.iter().map(|scanner| async move {
            (scanner.source(), scanner.scan().await)
        }))
        .await;

        let mut report = DiscoveryReport {
            scanned: self.scanners.len(),
            ..Default::default()
        };

        for (source, outcome) in outcomes {
            match outcome {
                Ok(ScanOutcome::Found(credential)) => {
                    debug!(
                        source = %source,
                        kind = %credential.kind,
                        fingerprint = %short_fingerprint(&credential.fingerprint),
                        "Credential found"
                    );
                    if let Err(e) = self.history.add_or_update(&credential).await {
                        warn!(source = %source, error = %e, "Failed to record credential");
                        report.errors.push(format!("{}: {}", source, e));
                    }
                    report.credentials.push(credential);
                }
                Ok(ScanOutcome::NotFound { reason }) => {
                    debug!(source = %source, reason = %reason, "No credential found");
                    report.errors.push(format!("{}: {}", source, reason));
                }
                Err(e) => {
                    warn!(source = %source, error = %e, "Scanner failed");
                    report.errors.push(format!("{}: {}", source, e));
                }
            }
        }

        if let Err(e) = self.history.mark_scan_complete().await {
            warn!(error = %e, "Failed to record scan completion");
            report.errors.push(format!("history: {}", e));
        }

        report.found = report.credentials.len();
        info!(
            scanned = report.scanned,
            found = report.found,
            errors = report.errors.len(),
            "Credential scan complete"
        );
        report
    }

    /// Check a credential with its provider and record the verdict.
    ///
    /// Returns false for sources that are not enabled.
    pub async fn validate_credential(&self, credential: &DiscoveredCredential) -> bool {
        let Some(scanner) = self.scanner(credential.source) else {
            debug!(source = %credential.source, "No enabled scanner for validation");
            return false;
        };

        let fingerprint = &credential.fingerprint;
        let (valid, recorded) = match scanner.validate(&credential.secret).await {
            Ok(true) => (
                true,
                self.history
                    .set_status(fingerprint, CredentialStatus::Active)
                    .await,
            ),
            Ok(false) => (
                false,
                self.history
                    .set_status(fingerprint, CredentialStatus::Invalid)
                    .await,
            ),
            Err(e) => (
                false,
                self.history.record_failure(fingerprint, &e.to_string()).await,
            ),
        };

        if let Err(e) = recorded {
            warn!(source = %credential.source, error = %e, "Failed to record validation result");
        }

        info!(
            source = %credential.source,
            fingerprint = %short_fingerprint(fingerprint),
            valid,
            "Validated credential"
        );
        valid
    }

    pub async fn stats(&self) -> DiscoveryStats {
        let snapshot = self.history.snapshot().await;
        DiscoveryStats {
            enabled_sources: self.enabled_sources(),
            total_discovered: snapshot.discovered.len(),
            active: snapshot
                .discovered
                .iter()
                .filter(|entry| entry.is_active())
                .count(),
            last_scan_at: snapshot.last_scan_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DiscoveryError, Result};
    use crate::types::{CredentialKind, CredentialMetadata};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Scanner returning a fixed outcome
    struct FakeScanner {
        source: CliSource,
        secret: Option<&'static str>,
        valid: Option<bool>,
    }

    #[async_trait]
    impl Scanner for FakeScanner {
        fn source(&self) -> CliSource {
            self.source
        }

        fn credential_path(&self) -> PathBuf {
            PathBuf::from("/nonexistent")
        }

        async fn scan(&self) -> Result<ScanOutcome> {
            match self.secret {
                Some(secret) => Ok(ScanOutcome::Found(DiscoveredCredential::new(
                    self.source,
                    CredentialKind::ApiKey,
                    secret,
                    CredentialMetadata::default(),
                ))),
                None => Err(DiscoveryError::Host("scanner exploded".to_string())),
            }
        }

        async fn validate(&self, _secret: &str) -> Result<bool> {
            self.valid
                .ok_or_else(|| DiscoveryError::Host("provider unreachable".to_string()))
        }

        async fn read_credential(&self, _path: &Path) -> Option<DiscoveredCredential> {
            None
        }
    }

    fn fake(source: CliSource, secret: Option<&'static str>, valid: Option<bool>) -> Arc<dyn Scanner> {
        Arc::new(FakeScanner {
            source,
            secret,
            valid,
        })
    }

    async fn history(dir: &TempDir) -> Arc<HistoryStore> {
        Arc::new(HistoryStore::open(dir.path().join("history.json")).await)
    }

    #[tokio::test]
    async fn test_scan_collects_partial_failures() {
        let dir = TempDir::new().unwrap();
        let engine = DiscoveryEngine::with_scanners(
            vec![
                fake(CliSource::KimiCli, Some("k"), Some(true)),
                fake(CliSource::CodexCli, None, None),
                fake(CliSource::QwenCli, Some("q"), Some(true)),
                fake(CliSource::GeminiCli, None, None),
            ],
            history(&dir).await,
        );

        let report = engine.scan().await;
        assert_eq!(report.scanned, 4);
        assert_eq!(report.found, 2);
        assert_eq!(report.errors.len(), 2);
        assert!(report.errors.iter().any(|e| e.starts_with("codex-cli: ")));
        assert!(report.errors.iter().any(|e| e.starts_with("gemini-cli: ")));

        let stats = engine.stats().await;
        assert_eq!(stats.total_discovered, 2);
        assert_eq!(stats.active, 2);
        assert!(stats.last_scan_at.is_some());
    }

    #[tokio::test]
    async fn test_rescan_does_not_duplicate() {
        let dir = TempDir::new().unwrap();
        let engine = DiscoveryEngine::with_scanners(
            vec![fake(CliSource::KimiCli, Some("k"), Some(true))],
            history(&dir).await,
        );

        engine.scan().await;
        engine.scan().await;
        assert_eq!(engine.history().entries().await.len(), 1);
    }

    #[tokio::test]
    async fn test_validate_credential_updates_status() {
        let dir = TempDir::new().unwrap();
        let engine = DiscoveryEngine::with_scanners(
            vec![
                fake(CliSource::KimiCli, Some("good"), Some(true)),
                fake(CliSource::CodexCli, Some("bad"), Some(false)),
            ],
            history(&dir).await,
        );
        let report = engine.scan().await;

        for credential in &report.credentials {
            let valid = engine.validate_credential(credential).await;
            let entry = engine.history().get(&credential.fingerprint).await.unwrap();
            match credential.source {
                CliSource::KimiCli => {
                    assert!(valid);
                    assert_eq!(entry.status, CredentialStatus::Active);
                }
                _ => {
                    assert!(!valid);
                    assert_eq!(entry.status, CredentialStatus::Invalid);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_validate_error_records_failure() {
        let dir = TempDir::new().unwrap();
        let engine = DiscoveryEngine::with_scanners(
            vec![fake(CliSource::GeminiCli, Some("g"), None)],
            history(&dir).await,
        );
        let report = engine.scan().await;
        let credential = &report.credentials[0];

        assert!(!engine.validate_credential(credential).await);
        let entry = engine.history().get(&credential.fingerprint).await.unwrap();
        assert_eq!(entry.consecutive_failures, 1);
        assert_eq!(entry.status, CredentialStatus::Active);
        assert!(entry.last_error.unwrap().contains("provider unreachable"));
    }

    #[tokio::test]
    async fn test_validate_disabled_source_is_false() {
        let dir = TempDir::new().unwrap();
        let engine = DiscoveryEngine::with_scanners(Vec::new(), history(&dir).await);
        let credential = DiscoveredCredential::new(
            CliSource::KimiCli,
            CredentialKind::ApiKey,
            "k",
            CredentialMetadata::default(),
        );
        assert!(!engine.validate_credential(&credential).await);
    }

    #[tokio::test]
    async fn test_new_respects_enabled_sources() {
        let dir = TempDir::new().unwrap();
        let mut config = DiscoveryConfig::default();
        config.sources.get_mut(CliSource::CodexCli).enabled = false;

        let engine = DiscoveryEngine::new(&config, history(&dir).await);
        assert_eq!(
            engine.enabled_sources(),
            vec![CliSource::KimiCli, CliSource::QwenCli, CliSource::GeminiCli]
        );
        assert!(engine.scanner(CliSource::CodexCli).is_none());
    }
}
