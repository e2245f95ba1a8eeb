//! Credential refresh flows
//!
//! Each call runs one method to completion and returns a [`RefreshResult`];
//! failures never escape as errors. Available methods:
//!
//! - `oauth-browser`: open the login page, wait for the tool to write a new
//!   credential file
//! - `api-key-web`: open the provider's key page; the user imports by hand
//! - `cli-command`: run the tool's own login command and re-read its file
//! - `manual`: nothing to automate

mod command;
mod opener;
mod watch;

pub use command::{CommandOutcome, LoginCommand, run_login_command};
pub use opener::{FallbackUrlOpener, SystemUrlOpener, UrlOpener};
pub use watch::CredentialWatch;

use crate::config::RefreshSettings;
use crate::error::DiscoveryError;
use crate::fingerprint::short_fingerprint;
use crate::scanner::Scanner;
use crate::types::{CliSource, CredentialKind, DiscoveredCredential};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

/// Callback receiving human-readable progress lines
pub type ProgressFn = Arc<dyn Fn(&str) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RefreshMethod {
    OauthBrowser,
    ApiKeyWeb,
    CliCommand,
    Manual,
}

impl RefreshMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RefreshMethod::OauthBrowser => "oauth-browser",
            RefreshMethod::ApiKeyWeb => "api-key-web",
            RefreshMethod::CliCommand => "cli-command",
            RefreshMethod::Manual => "manual",
        }
    }
}

impl fmt::Display for RefreshMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RefreshMethod {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "oauth-browser" => Ok(RefreshMethod::OauthBrowser),
            "api-key-web" => Ok(RefreshMethod::ApiKeyWeb),
            "cli-command" => Ok(RefreshMethod::CliCommand),
            "manual" => Ok(RefreshMethod::Manual),
            other => Err(DiscoveryError::Config(format!(
                "Unknown refresh method: {}",
                other
            ))),
        }
    }
}

/// Where a refresh attempt stands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", tag = "state", content = "method")]
pub enum RefreshState {
    Idle,
    Running(RefreshMethod),
    Succeeded,
    Failed,
    /// Instructions were delivered but no credential was obtained
    NeedsManualInput,
}

/// Result of one refresh attempt
#[derive(Debug, Clone)]
pub struct RefreshResult {
    pub success: bool,
    pub method: RefreshMethod,
    /// The replacement credential, when the method produced one
    pub credential: Option<DiscoveredCredential>,
    /// Instructions for the user
    pub message: Option<String>,
    pub error: Option<String>,
}

impl RefreshResult {
    fn obtained(method: RefreshMethod, credential: DiscoveredCredential) -> Self {
        Self {
            success: true,
            method,
            credential: Some(credential),
            message: None,
            error: None,
        }
    }

    fn instructions(method: RefreshMethod, message: impl Into<String>) -> Self {
        Self {
            success: true,
            method,
            credential: None,
            message: Some(message.into()),
            error: None,
        }
    }

    fn failed(method: RefreshMethod, error: impl Into<String>) -> Self {
        Self {
            success: false,
            method,
            credential: None,
            message: None,
            error: Some(error.into()),
        }
    }

    /// Terminal state of the attempt
    pub fn state(&self) -> RefreshState {
        match (self.success, &self.credential) {
            (true, Some(_)) => RefreshState::Succeeded,
            (true, None) => RefreshState::NeedsManualInput,
            (false, _) => RefreshState::Failed,
        }
    }
}

/// Method used when the caller does not pick one
pub fn default_method(source: CliSource, kind: CredentialKind) -> RefreshMethod {
    match source {
        CliSource::KimiCli => RefreshMethod::ApiKeyWeb,
        CliSource::CodexCli => match kind {
            CredentialKind::OAuth => RefreshMethod::CliCommand,
            CredentialKind::ApiKey => RefreshMethod::ApiKeyWeb,
        },
        CliSource::QwenCli | CliSource::GeminiCli => RefreshMethod::OauthBrowser,
    }
}

/// Page where a credential of this kind is renewed
pub fn refresh_url(source: CliSource, kind: CredentialKind) -> Option<&'static str> {
    match kind {
        CredentialKind::ApiKey => source.api_key_url(),
        CredentialKind::OAuth => source.oauth_login_url(),
    }
}

fn report(progress: &Option<ProgressFn>, message: &str) {
    if let Some(progress) = progress {
        progress(message);
    }
}

/// Clears the in-flight marker for a source when the attempt ends
struct RunningGuard<'a> {
    running: &'a Mutex<HashMap<CliSource, RefreshMethod>>,
    source: CliSource,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.running.lock() {
            running.remove(&self.source);
        }
    }
}

/// Runs refresh flows for every source
pub struct Refresher {
    opener: Arc<dyn UrlOpener>,
    settings: RefreshSettings,
    login_commands: HashMap<CliSource, LoginCommand>,
    running: Mutex<HashMap<CliSource, RefreshMethod>>,
}

impl Refresher {
    pub fn new(opener: Arc<dyn UrlOpener>, settings: RefreshSettings) -> Self {
        Self {
            opener,
            settings,
            login_commands: HashMap::new(),
            running: Mutex::new(HashMap::new()),
        }
    }

    /// Replace a source's login command
    pub fn with_login_command(mut self, source: CliSource, command: LoginCommand) -> Self {
        self.login_commands.insert(source, command);
        self
    }

    pub fn login_command(&self, source: CliSource) -> LoginCommand {
        self.login_commands.get(&source).cloned().unwrap_or_else(|| {
            let (program, args) = source.login_command();
            LoginCommand::new(program, args)
        })
    }

    /// Current state for a source: running or idle
    pub fn state(&self, source: CliSource) -> RefreshState {
        self.running
            .lock()
            .ok()
            .and_then(|running| running.get(&source).copied())
            .map(RefreshState::Running)
            .unwrap_or(RefreshState::Idle)
    }

    /// Sources with an attempt in flight
    pub fn running_sources(&self) -> HashSet<CliSource> {
        self.running
            .lock()
            .map(|running| running.keys().copied().collect())
            .unwrap_or_default()
    }

    /// Run one refresh attempt for the scanner's source
    pub async fn refresh(
        &self,
        scanner: Arc<dyn Scanner>,
        method: RefreshMethod,
        progress: Option<ProgressFn>,
    ) -> RefreshResult {
        let source = scanner.source();

        let _guard = match self.running.lock() {
            Ok(mut running) => {
                if let Some(active) = running.get(&source) {
                    return RefreshResult::failed(
                        method,
                        format!("A {} refresh is already running for {}", active, source),
                    );
                }
                running.insert(source, method);
                RunningGuard {
                    running: &self.running,
                    source,
                }
            }
            Err(_) => {
                return RefreshResult::failed(method, "Refresh state is unavailable");
            }
        };

        info!(source = %source, method = %method, "Starting refresh");
        report(&progress, &format!("Starting {} refresh for {}...", method, source));

        let result = match method {
            RefreshMethod::OauthBrowser => self.oauth_browser(scanner, &progress).await,
            RefreshMethod::ApiKeyWeb => self.api_key_web(source, &progress).await,
            RefreshMethod::CliCommand => self.cli_command(scanner, &progress).await,
            RefreshMethod::Manual => RefreshResult::failed(
                method,
                "Manual refresh required: import a new credential directly",
            ),
        };

        match (&result.credential, &result.error) {
            (Some(credential), _) => info!(
                source = %source,
                method = %method,
                fingerprint = %short_fingerprint(&credential.fingerprint),
                "Refresh obtained new credential"
            ),
            (None, Some(error)) => warn!(source = %source, method = %method, error = %error, "Refresh failed"),
            (None, None) => info!(source = %source, method = %method, "Refresh needs manual input"),
        }
        result
    }

    async fn oauth_browser(
        &self,
        scanner: Arc<dyn Scanner>,
        progress: &Option<ProgressFn>,
    ) -> RefreshResult {
        let method = RefreshMethod::OauthBrowser;
        let source = scanner.source();
        let Some(url) = source.oauth_login_url() else {
            return RefreshResult::failed(method, format!("No OAuth login URL for {}", source));
        };

        // Watch first so a fast login cannot slip past
        let watch = CredentialWatch::start(scanner, &self.settings).await;

        report(progress, "Opening browser for authentication...");
        if let Err(e) = self.opener.open_url(url).await {
            return RefreshResult::failed(method, format!("Failed to open browser: {}", e));
        }

        report(progress, "Waiting for authentication to complete...");
        tokio::select! {
            credential = watch.wait() => match credential {
                Some(credential) => RefreshResult::obtained(method, credential),
                None => RefreshResult::failed(method, "No new credential detected"),
            },
            _ = tokio::time::sleep(self.settings.auth_timeout()) => RefreshResult::failed(
                method,
                format!(
                    "Authentication timed out after {} seconds",
                    self.settings.auth_timeout_seconds
                ),
            ),
        }
    }

    async fn api_key_web(&self, source: CliSource, progress: &Option<ProgressFn>) -> RefreshResult {
        let method = RefreshMethod::ApiKeyWeb;
        let Some(url) = source.api_key_url() else {
            return RefreshResult::failed(method, format!("No API key page for {}", source));
        };

        report(
            progress,
            &format!("Opening {} to generate a new API key...", source.provider()),
        );
        if let Err(e) = self.opener.open_url(url).await {
            return RefreshResult::failed(method, format!("Failed to open browser: {}", e));
        }

        RefreshResult::instructions(
            method,
            format!(
                "Generate a new API key at {} and run a scan to import it",
                url
            ),
        )
    }

    async fn cli_command(
        &self,
        scanner: Arc<dyn Scanner>,
        progress: &Option<ProgressFn>,
    ) -> RefreshResult {
        let method = RefreshMethod::CliCommand;
        let source = scanner.source();
        let command = self.login_command(source);
        let path = scanner.credential_path();
        let baseline = scanner
            .read_credential(&path)
            .await
            .map(|credential| credential.fingerprint);

        report(progress, &format!("Running {} login command...", command.program));
        let outcome = run_login_command(
            &command,
            self.settings.command_timeout(),
            progress.clone(),
        )
        .await;

        if outcome.succeeded() {
            tokio::time::sleep(self.settings.settle_delay()).await;
            return match scanner.read_credential(&path).await {
                Some(credential)
                    if baseline.as_deref() != Some(credential.fingerprint.as_str()) =>
                {
                    RefreshResult::obtained(method, credential)
                }
                _ => RefreshResult::failed(
                    method,
                    "Login succeeded but no new credential was found; run a scan to import it",
                ),
            };
        }

        match outcome {
            CommandOutcome::Exited {
                code,
                stdout,
                stderr,
            } => {
                let output = if stderr.trim().is_empty() {
                    stdout
                } else {
                    stderr
                };
                RefreshResult::failed(
                    method,
                    format!(
                        "Login command failed with exit code {}: {}",
                        code.map(|c| c.to_string())
                            .unwrap_or_else(|| "none".to_string()),
                        output.trim()
                    ),
                )
            }
            CommandOutcome::TimedOut => RefreshResult::failed(
                method,
                format!(
                    "Login command timed out after {} seconds",
                    self.settings.command_timeout_seconds
                ),
            ),
            CommandOutcome::SpawnFailed(e) => RefreshResult::failed(
                method,
                format!("Failed to start {}: {}", command.program, e),
            ),
            CommandOutcome::WaitFailed(e) => {
                RefreshResult::failed(method, format!("Login command failed: {}", e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{KimiScanner, QwenScanner, ScanContext};
    use async_trait::async_trait;
    use std::path::{Path, PathBuf};
    use tempfile::TempDir;

    /// Records opened URLs and optionally writes a credential file, the way a
    /// completed browser login would
    #[derive(Default)]
    struct LoginSimulator {
        urls: tokio::sync::Mutex<Vec<String>>,
        writes: Option<(PathBuf, String)>,
    }

    #[async_trait]
    impl UrlOpener for LoginSimulator {
        async fn open_url(&self, url: &str) -> anyhow::Result<()> {
            self.urls.lock().await.push(url.to_string());
            if let Some((path, content)) = &self.writes {
                let path = path.clone();
                let content = content.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(std::time::Duration::from_millis(50)).await;
                    if let Some(parent) = path.parent() {
                        let _ = tokio::fs::create_dir_all(parent).await;
                    }
                    let _ = tokio::fs::write(path, content).await;
                });
            }
            Ok(())
        }
    }

    fn fast_settings() -> RefreshSettings {
        RefreshSettings {
            auth_timeout_seconds: 5,
            poll_interval_ms: 20,
            poll_attempts: 100,
            settle_delay_ms: 10,
            command_timeout_seconds: 5,
        }
    }

    fn qwen(home: &Path) -> Arc<dyn Scanner> {
        Arc::new(QwenScanner::with_context(
            ScanContext::for_source(CliSource::QwenCli).with_home(home),
        ))
    }

    fn kimi(home: &Path) -> Arc<dyn Scanner> {
        Arc::new(KimiScanner::with_context(
            ScanContext::for_source(CliSource::KimiCli).with_home(home),
        ))
    }

    #[test]
    fn test_default_method() {
        assert_eq!(
            default_method(CliSource::KimiCli, CredentialKind::ApiKey),
            RefreshMethod::ApiKeyWeb
        );
        assert_eq!(
            default_method(CliSource::CodexCli, CredentialKind::OAuth),
            RefreshMethod::CliCommand
        );
        assert_eq!(
            default_method(CliSource::CodexCli, CredentialKind::ApiKey),
            RefreshMethod::ApiKeyWeb
        );
        assert_eq!(
            default_method(CliSource::QwenCli, CredentialKind::OAuth),
            RefreshMethod::OauthBrowser
        );
        assert_eq!(
            default_method(CliSource::GeminiCli, CredentialKind::OAuth),
            RefreshMethod::OauthBrowser
        );
    }

    #[test]
    fn test_refresh_url() {
        assert_eq!(
            refresh_url(CliSource::CodexCli, CredentialKind::ApiKey),
            Some("https://platform.openai.com/api-keys")
        );
        assert_eq!(refresh_url(CliSource::KimiCli, CredentialKind::OAuth), None);
    }

    #[test]
    fn test_method_parse() {
        assert_eq!(
            "cli-command".parse::<RefreshMethod>().unwrap(),
            RefreshMethod::CliCommand
        );
        assert!("carrier-pigeon".parse::<RefreshMethod>().is_err());
    }

    #[tokio::test]
    async fn test_manual_always_fails() {
        let dir = TempDir::new().unwrap();
        let refresher = Refresher::new(Arc::new(LoginSimulator::default()), fast_settings());

        let result = refresher
            .refresh(kimi(dir.path()), RefreshMethod::Manual, None)
            .await;
        assert!(!result.success);
        assert_eq!(result.state(), RefreshState::Failed);
        assert_eq!(refresher.state(CliSource::KimiCli), RefreshState::Idle);
    }

    #[tokio::test]
    async fn test_api_key_web_needs_manual_input() {
        let dir = TempDir::new().unwrap();
        let opener = Arc::new(LoginSimulator::default());
        let refresher = Refresher::new(opener.clone(), fast_settings());

        let result = refresher
            .refresh(kimi(dir.path()), RefreshMethod::ApiKeyWeb, None)
            .await;
        assert!(result.success);
        assert!(result.credential.is_none());
        assert_eq!(result.state(), RefreshState::NeedsManualInput);
        assert!(result.message.unwrap().contains("run a scan"));
        assert_eq!(
            *opener.urls.lock().await,
            vec!["https://platform.moonshot.cn/console/api-keys".to_string()]
        );
    }

    #[tokio::test]
    async fn test_oauth_browser_without_login_url() {
        let dir = TempDir::new().unwrap();
        let refresher = Refresher::new(Arc::new(LoginSimulator::default()), fast_settings());

        let result = refresher
            .refresh(kimi(dir.path()), RefreshMethod::OauthBrowser, None)
            .await;
        assert_eq!(result.state(), RefreshState::Failed);
    }

    #[tokio::test]
    async fn test_oauth_browser_picks_up_new_login() {
        let dir = TempDir::new().unwrap();
        let opener = Arc::new(LoginSimulator {
            writes: Some((
                dir.path().join(".qwen").join("oauth_creds.json"),
                r#"{"accessToken": "qwen-fresh", "refreshToken": "qwen-refresh"}"#.to_string(),
            )),
            ..Default::default()
        });
        let refresher = Refresher::new(opener.clone(), fast_settings());

        let messages = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = messages.clone();
        let progress: ProgressFn = Arc::new(move |line: &str| {
            if let Ok(mut messages) = sink.lock() {
                messages.push(line.to_string());
            }
        });

        let result = refresher
            .refresh(qwen(dir.path()), RefreshMethod::OauthBrowser, Some(progress))
            .await;

        assert_eq!(result.state(), RefreshState::Succeeded);
        let credential = result.credential.unwrap();
        assert_eq!(credential.secret, "qwen-fresh");
        assert_eq!(credential.kind, CredentialKind::OAuth);
        assert_eq!(
            *opener.urls.lock().await,
            vec!["https://chat.qwenlm.ai/".to_string()]
        );
        assert!(
            messages
                .lock()
                .unwrap()
                .iter()
                .any(|m| m.contains("Waiting for authentication"))
        );
    }

    #[tokio::test]
    async fn test_oauth_browser_times_out() {
        let dir = TempDir::new().unwrap();
        let qwen_dir = dir.path().join(".qwen");
        tokio::fs::create_dir_all(&qwen_dir).await.unwrap();
        tokio::fs::write(qwen_dir.join("oauth_creds.json"), r#"{"accessToken": "qwen-old"}"#)
            .await
            .unwrap();

        let settings = RefreshSettings {
            auth_timeout_seconds: 1,
            ..fast_settings()
        };
        let refresher = Refresher::new(Arc::new(LoginSimulator::default()), settings);

        let result = refresher
            .refresh(qwen(dir.path()), RefreshMethod::OauthBrowser, None)
            .await;
        assert!(!result.success);
        assert!(result.error.unwrap().contains("timed out"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_command_reads_new_credential() {
        let dir = TempDir::new().unwrap();
        let creds_dir = dir.path().join(".kimi").join("credentials");
        let script = format!(
            "mkdir -p '{}' && printf '%s' '{{\"apiKey\": \"sk-kimi-relogin\"}}' > '{}' && echo logged in",
            creds_dir.display(),
            creds_dir.join("kimi-code.json").display()
        );
        let refresher = Refresher::new(Arc::new(LoginSimulator::default()), fast_settings())
            .with_login_command(CliSource::KimiCli, LoginCommand::new("sh", &["-c", script.as_str()]));

        let lines = Arc::new(std::sync::Mutex::new(Vec::new()));
        let sink = lines.clone();
        let progress: ProgressFn = Arc::new(move |line: &str| {
            if let Ok(mut lines) = sink.lock() {
                lines.push(line.to_string());
            }
        });

        let result = refresher
            .refresh(kimi(dir.path()), RefreshMethod::CliCommand, Some(progress))
            .await;

        assert_eq!(result.state(), RefreshState::Succeeded);
        assert_eq!(result.credential.unwrap().secret, "sk-kimi-relogin");
        assert!(lines.lock().unwrap().contains(&"logged in".to_string()));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_command_failure_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let refresher = Refresher::new(Arc::new(LoginSimulator::default()), fast_settings())
            .with_login_command(
                CliSource::KimiCli,
                LoginCommand::new("sh", &["-c", "echo denied >&2; exit 2"]),
            );
        let result = refresher
            .refresh(kimi(dir.path()), RefreshMethod::CliCommand, None)
            .await;
        let error = result.error.unwrap();
        assert!(error.contains("exit code 2"));
        assert!(error.contains("denied"));

        let refresher = Refresher::new(Arc::new(LoginSimulator::default()), fast_settings())
            .with_login_command(CliSource::KimiCli, LoginCommand::new("sh", &["-c", "true"]));
        let result = refresher
            .refresh(kimi(dir.path()), RefreshMethod::CliCommand, None)
            .await;
        assert!(result.error.unwrap().contains("run a scan"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cli_command_unchanged_credential_is_not_new() {
        let dir = TempDir::new().unwrap();
        let creds_dir = dir.path().join(".kimi").join("credentials");
        tokio::fs::create_dir_all(&creds_dir).await.unwrap();
        tokio::fs::write(creds_dir.join("kimi-code.json"), r#"{"apiKey": "sk-old"}"#)
            .await
            .unwrap();

        let refresher = Refresher::new(Arc::new(LoginSimulator::default()), fast_settings())
            .with_login_command(CliSource::KimiCli, LoginCommand::new("sh", &["-c", "true"]));
        let result = refresher
            .refresh(kimi(dir.path()), RefreshMethod::CliCommand, None)
            .await;

        assert_eq!(result.state(), RefreshState::Failed);
        assert!(result.credential.is_none());
        assert!(result.error.unwrap().contains("run a scan"));
    }

    #[test]
    fn test_default_login_command() {
        let refresher = Refresher::new(Arc::new(LoginSimulator::default()), fast_settings());
        assert_eq!(
            refresher.login_command(CliSource::QwenCli),
            LoginCommand::new("qwen-code", &["--auth"])
        );
    }
}
