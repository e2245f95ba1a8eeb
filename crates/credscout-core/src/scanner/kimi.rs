//! Kimi CLI scanner
//!
//! The Kimi CLI stores its API key in `~/.kimi/credentials/kimi-code.json`.
//! Older installs keep it in `~/.kimi/config.toml`.

use super::{ScanContext, ScanOutcome, Scanner, non_empty, read_json, read_toml};
use crate::error::Result;
use crate::types::{CliSource, CredentialKind, CredentialMetadata, DiscoveredCredential};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub(crate) const VALIDATION_URL: &str = "https://api.kimi.com/coding/v1/models";
pub(crate) const ENV_VAR: &str = "KIMI_API_KEY";

#[derive(Debug, Deserialize)]
struct KimiCredentialsFile {
    #[serde(default, rename = "apiKey", alias = "api_key")]
    api_key: Option<String>,
}

/// Scanner for the Kimi CLI
pub struct KimiScanner {
    ctx: ScanContext,
}

impl KimiScanner {
    pub fn new() -> Self {
        Self::with_context(ScanContext::for_source(CliSource::KimiCli))
    }

    pub fn with_context(ctx: ScanContext) -> Self {
        Self { ctx }
    }

    fn config_path(&self) -> PathBuf {
        self.ctx.home_path(&[".kimi", "config.toml"])
    }

    async fn read_config_key(&self) -> Option<String> {
        let table = read_toml(&self.config_path()).await?;
        let key = table
            .get("api_key")
            .or_else(|| table.get("apiKey"))
            .and_then(|value| value.as_str())
            .map(str::to_string);
        non_empty(key)
    }
}

impl Default for KimiScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scanner for KimiScanner {
    fn source(&self) -> CliSource {
        CliSource::KimiCli
    }

    fn credential_path(&self) -> PathBuf {
        self.ctx.home_path(&[".kimi", "credentials", "kimi-code.json"])
    }

    async fn scan(&self) -> Result<ScanOutcome> {
        let credentials_path = self.credential_path();
        if let Some(credential) = self.read_credential(&credentials_path).await {
            debug!(path = %credentials_path.display(), "Found kimi-cli credentials file");
            return Ok(ScanOutcome::Found(credential));
        }

        if let Some(key) = self.read_config_key().await {
            let origin = self.config_path().display().to_string();
            debug!(path = %origin, "Found kimi-cli key in config.toml");
            return Ok(ScanOutcome::Found(self.ctx.credential(
                CredentialKind::ApiKey,
                key,
                CredentialMetadata::from_origin(origin),
            )));
        }

        if let Some(key) = self.ctx.env_secret() {
            return Ok(ScanOutcome::Found(self.ctx.credential(
                CredentialKind::ApiKey,
                key,
                CredentialMetadata::from_origin(self.ctx.env_origin()),
            )));
        }

        Ok(ScanOutcome::not_found("No kimi-cli credentials found"))
    }

    async fn validate(&self, secret: &str) -> Result<bool> {
        Ok(self.ctx.validate_bearer(secret).await)
    }

    async fn read_credential(&self, path: &Path) -> Option<DiscoveredCredential> {
        let file: KimiCredentialsFile = read_json(path).await?;
        let key = non_empty(file.api_key)?;
        Some(self.ctx.credential(
            CredentialKind::ApiKey,
            key,
            CredentialMetadata::from_origin(path.display().to_string()),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fingerprint::fingerprint;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn scanner(home: &Path, env_var: &str) -> KimiScanner {
        KimiScanner::with_context(
            ScanContext::for_source(CliSource::KimiCli)
                .with_home(home)
                .with_env_var(env_var),
        )
    }

    async fn write(home: &Path, relative: &str, content: &str) {
        let path = home.join(relative);
        tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
        tokio::fs::write(path, content).await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_reads_credentials_file() {
        let dir = TempDir::new().unwrap();
        write(
            dir.path(),
            ".kimi/credentials/kimi-code.json",
            r#"{"apiKey": "sk-kimi-file"}"#,
        )
        .await;

        let outcome = scanner(dir.path(), "CREDSCOUT_TEST_KIMI_UNSET_1")
            .scan()
            .await
            .unwrap();
        let cred = outcome.credential().unwrap();
        assert_eq!(cred.secret, "sk-kimi-file");
        assert_eq!(cred.kind, CredentialKind::ApiKey);
        assert_eq!(cred.provider, "kimi-code");
        assert_eq!(cred.fingerprint, fingerprint("sk-kimi-file"));
    }

    #[tokio::test]
    async fn test_scan_falls_back_to_config_toml() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), ".kimi/config.toml", "api_key = \"sk-kimi-toml\"\n").await;

        let outcome = scanner(dir.path(), "CREDSCOUT_TEST_KIMI_UNSET_2")
            .scan()
            .await
            .unwrap();
        assert_eq!(outcome.credential().unwrap().secret, "sk-kimi-toml");
    }

    #[tokio::test]
    async fn test_scan_falls_back_to_env() {
        let dir = TempDir::new().unwrap();
        let env_var = "CREDSCOUT_TEST_KIMI_ENV";
        unsafe { std::env::set_var(env_var, "sk-kimi-env") };

        let outcome = scanner(dir.path(), env_var).scan().await.unwrap();
        let cred = outcome.credential().unwrap();
        assert_eq!(cred.secret, "sk-kimi-env");
        assert_eq!(cred.metadata.origin.as_deref(), Some("env:CREDSCOUT_TEST_KIMI_ENV"));

        unsafe { std::env::remove_var(env_var) };
    }

    #[tokio::test]
    async fn test_scan_empty_key_is_not_found() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), ".kimi/credentials/kimi-code.json", r#"{"apiKey": ""}"#).await;

        let outcome = scanner(dir.path(), "CREDSCOUT_TEST_KIMI_UNSET_3")
            .scan()
            .await
            .unwrap();
        assert!(!outcome.is_found());
        assert!(outcome.reason().unwrap().contains("kimi-cli"));
    }

    #[tokio::test]
    async fn test_validate_against_provider() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/coding/v1/models"))
            .and(header("authorization", "Bearer sk-good"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let scanner = KimiScanner::with_context(
            ScanContext::for_source(CliSource::KimiCli)
                .with_validation_url(format!("{}/coding/v1/models", server.uri())),
        );
        assert!(scanner.validate("sk-good").await.unwrap());
        assert!(!scanner.validate("sk-bad").await.unwrap());
    }
}
