//! Discovery service
//!
//! The single entry point hosts talk to. It owns the history store and wires
//! scanning, validation, import, rotation and refresh together. Hosts build
//! one instance with [`DiscoveryService::builder`] and share it behind an
//! `Arc`.

use crate::config::DiscoveryConfig;
use crate::engine::{DiscoveryEngine, DiscoveryStats};
use crate::error::Result;
use crate::fingerprint::short_fingerprint;
use crate::history::HistoryStore;
use crate::import::{CredentialHost, ImportEngine, ImportResult, ImportSummary};
use crate::refresh::{
    FallbackUrlOpener, LoginCommand, ProgressFn, RefreshMethod, RefreshState, Refresher,
    SystemUrlOpener, UrlOpener, default_method,
};
use crate::rotator::{RotationStats, Rotator};
use crate::scanner::{ScanContext, Scanner, build_scanner};
use crate::types::{
    CliSource, CredentialMetadata, CredentialStatus, DiscoveredCredential, HistoryFile,
};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{info, warn};

/// Outcome of a scan, safe to show or serialize
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanReport {
    pub scanned: usize,
    pub found: usize,
    /// Credentials that passed validation (all found ones when validation is off)
    pub valid: usize,
    pub imported: usize,
    pub errors: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub import: Option<ImportSummary>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceStatus {
    pub running: bool,
    /// Sources with a refresh in flight
    pub refreshing: Vec<CliSource>,
    #[serde(flatten)]
    pub discovery: DiscoveryStats,
    pub rotation: RotationStats,
}

/// The credential to use next. The secret stays in the host's store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationTicket {
    pub source: CliSource,
    pub provider: String,
    pub profile_id: String,
    pub fingerprint: String,
}

/// Outcome of a refresh request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshReport {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub method: Option<RefreshMethod>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// The user has to finish the refresh by hand and re-scan or import
    pub needs_manual_input: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_fingerprint: Option<String>,
}

impl RefreshReport {
    fn failed(method: Option<RefreshMethod>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            method,
            error: Some(error.into()),
            message: None,
            needs_manual_input: false,
            new_fingerprint: None,
        }
    }
}

/// Builder for [`DiscoveryService`]
pub struct DiscoveryServiceBuilder {
    config: DiscoveryConfig,
    host: Arc<dyn CredentialHost>,
    history: Option<Arc<HistoryStore>>,
    scanners: Option<Vec<Arc<dyn Scanner>>>,
    url_opener: Option<Arc<dyn UrlOpener>>,
    login_commands: Vec<(CliSource, LoginCommand)>,
}

impl DiscoveryServiceBuilder {
    /// Use an already opened history store
    pub fn history(mut self, history: Arc<HistoryStore>) -> Self {
        self.history = Some(history);
        self
    }

    /// Replace the scanners built from configuration
    pub fn scanners(mut self, scanners: Vec<Arc<dyn Scanner>>) -> Self {
        self.scanners = Some(scanners);
        self
    }

    /// The host's own URL opener; the system opener remains the fallback
    pub fn url_opener(mut self, opener: Arc<dyn UrlOpener>) -> Self {
        self.url_opener = Some(opener);
        self
    }

    pub fn login_command(mut self, source: CliSource, command: LoginCommand) -> Self {
        self.login_commands.push((source, command));
        self
    }

    pub async fn build(self) -> Result<DiscoveryService> {
        self.config.validate()?;

        let history = match self.history {
            Some(history) => history,
            None => match &self.config.history_path {
                Some(path) => Arc::new(HistoryStore::open(path.clone()).await),
                None => Arc::new(HistoryStore::open_default().await?),
            },
        };

        let engine = match self.scanners {
            Some(scanners) => DiscoveryEngine::with_scanners(scanners, history.clone()),
            None => DiscoveryEngine::new(&self.config, history.clone()),
        };

        let opener: Arc<dyn UrlOpener> = match self.url_opener {
            Some(opener) => Arc::new(FallbackUrlOpener::new(opener)),
            None => Arc::new(SystemUrlOpener),
        };
        let refresher = self.login_commands.into_iter().fold(
            Refresher::new(opener, self.config.refresh.clone()),
            |refresher, (source, command)| refresher.with_login_command(source, command),
        );

        let rotator = Rotator::new(
            history.clone(),
            self.config.rotation_strategy,
            self.config.priorities(),
        );

        Ok(DiscoveryService {
            importer: ImportEngine::new(history.clone(), self.host),
            config: self.config,
            history,
            engine,
            rotator,
            refresher,
            running: AtomicBool::new(false),
        })
    }
}

pub struct DiscoveryService {
    config: DiscoveryConfig,
    history: Arc<HistoryStore>,
    engine: DiscoveryEngine,
    importer: ImportEngine,
    rotator: Rotator,
    refresher: Refresher,
    running: AtomicBool,
}

impl DiscoveryService {
    pub fn builder(
        config: DiscoveryConfig,
        host: Arc<dyn CredentialHost>,
    ) -> DiscoveryServiceBuilder {
        DiscoveryServiceBuilder {
            config,
            host,
            history: None,
            scanners: None,
            url_opener: None,
            login_commands: Vec::new(),
        }
    }

    pub fn config(&self) -> &DiscoveryConfig {
        &self.config
    }

    pub fn rotator(&self) -> &Rotator {
        &self.rotator
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Start the service, scanning first when configured to.
    ///
    /// Returns the startup scan's report; `None` when already running or when
    /// startup scanning is off.
    pub async fn start(&self) -> Option<ScanReport> {
        if self.running.swap(true, Ordering::SeqCst) {
            return None;
        }
        info!("Discovery service starting");

        let report = if self.config.scan_on_startup {
            Some(self.scan().await)
        } else {
            None
        };

        info!("Discovery service started");
        report
    }

    pub async fn stop(&self) {
        if self.running.swap(false, Ordering::SeqCst) {
            info!("Discovery service stopped");
        }
    }

    /// Scan every source, then validate and import when configured
    pub async fn scan(&self) -> ScanReport {
        let discovery = self.engine.scan().await;
        let mut report = ScanReport {
            scanned: discovery.scanned,
            found: discovery.found,
            valid: discovery.found,
            errors: discovery.errors,
            ..Default::default()
        };

        if !self.config.auto_import || discovery.credentials.is_empty() {
            return report;
        }

        let candidates: Vec<DiscoveredCredential> = if self.config.validate_tokens {
            info!(count = discovery.credentials.len(), "Validating credentials");
            let verdicts = join_all(
                discovery
                    .credentials
                    .iter()
                    .map(|credential| self.engine.validate_credential(credential)),
            )
            .await;
            discovery
                .credentials
                .into_iter()
                .zip(verdicts)
                .filter_map(|(credential, valid)| valid.then_some(credential))
                .collect()
        } else {
            discovery.credentials
        };
        report.valid = candidates.len();

        let summary = self.importer.import_credentials(&candidates).await;
        info!(
            imported = summary.imported,
            skipped = summary.skipped,
            failed = summary.failed,
            "Import complete"
        );
        report.imported = summary.imported;
        report.import = Some(summary);
        report
    }

    pub async fn status(&self) -> ServiceStatus {
        ServiceStatus {
            running: self.is_running(),
            refreshing: {
                let mut sources: Vec<_> =
                    self.refresher.running_sources().into_iter().collect();
                sources.sort();
                sources
            },
            discovery: self.engine.stats().await,
            rotation: self.rotator.stats().await,
        }
    }

    pub async fn history(&self) -> HistoryFile {
        self.history.snapshot().await
    }

    pub async fn clear_history(&self) -> Result<()> {
        self.history.clear().await
    }

    /// Pick the next credential according to the rotation strategy
    pub async fn rotation_token(&self) -> Option<RotationTicket> {
        let entry = self.rotator.next().await?;
        Some(RotationTicket {
            source: entry.source,
            provider: entry.provider,
            profile_id: entry.profile_id,
            fingerprint: entry.fingerprint,
        })
    }

    pub async fn record_usage(&self, fingerprint: &str) -> Result<bool> {
        self.rotator.record_usage(fingerprint).await
    }

    /// Current refresh state for a source
    pub fn refresh_state(&self, source: CliSource) -> RefreshState {
        self.refresher.state(source)
    }

    /// Replace a tracked credential.
    ///
    /// On success the new credential is imported and the old fingerprint is
    /// marked `revoked`. Methods that only deliver instructions report
    /// `needs_manual_input`.
    pub async fn refresh_token(
        &self,
        source: CliSource,
        fingerprint: &str,
        method: Option<RefreshMethod>,
    ) -> Result<RefreshReport> {
        let Some(entry) = self.history.get(fingerprint).await else {
            return Ok(RefreshReport::failed(method, "Credential not found in history"));
        };
        if entry.source != source {
            return Ok(RefreshReport::failed(
                method,
                format!("Credential belongs to {}, not {}", entry.source, source),
            ));
        }

        let method = method.unwrap_or_else(|| default_method(source, entry.kind));
        info!(
            source = %source,
            method = %method,
            fingerprint = %short_fingerprint(fingerprint),
            "Refreshing credential"
        );

        let progress: ProgressFn = Arc::new(move |message: &str| {
            info!(source = %source, "{}", message);
        });
        let result = self
            .refresher
            .refresh(self.scanner(source), method, Some(progress))
            .await;
        let state = result.state();

        let Some(credential) = result.credential else {
            return Ok(RefreshReport {
                success: false,
                method: Some(method),
                error: result.error,
                message: result.message,
                needs_manual_input: method == RefreshMethod::ApiKeyWeb
                    || state == RefreshState::NeedsManualInput,
                new_fingerprint: None,
            });
        };

        let imported = self.importer.import_credential(&credential).await;
        if !imported.success {
            return Ok(RefreshReport::failed(
                Some(method),
                imported
                    .error
                    .unwrap_or_else(|| "Failed to import refreshed credential".to_string()),
            ));
        }

        if credential.fingerprint != fingerprint {
            self.history
                .set_status(fingerprint, CredentialStatus::Revoked)
                .await?;
        }

        Ok(RefreshReport {
            success: true,
            method: Some(method),
            error: None,
            message: None,
            needs_manual_input: false,
            new_fingerprint: Some(credential.fingerprint),
        })
    }

    /// Validate a credential the user typed in and import it
    pub async fn import_manual_token(&self, source: CliSource, secret: &str) -> ImportResult {
        let secret = secret.trim();
        let credential = DiscoveredCredential::new(
            source,
            source.default_kind(),
            secret,
            CredentialMetadata::from_origin("manual"),
        );
        info!(source = %source, "Importing manual credential");

        if secret.is_empty() {
            return ImportResult::failed(&credential, "Credential is empty".to_string());
        }

        let valid = match self.scanner(source).validate(secret).await {
            Ok(valid) => valid,
            Err(e) => {
                warn!(source = %source, error = %e, "Manual credential validation failed");
                false
            }
        };
        if !valid {
            return ImportResult::failed(&credential, "Credential validation failed".to_string());
        }

        self.importer.import_credential(&credential).await
    }

    /// Enabled scanner for a source, or a default one for disabled sources
    fn scanner(&self, source: CliSource) -> Arc<dyn Scanner> {
        self.engine.scanner(source).unwrap_or_else(|| {
            build_scanner(
                ScanContext::for_source(source).with_timeout(self.config.validation_timeout()),
            )
        })
    }
}
