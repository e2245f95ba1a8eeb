//! Gemini CLI scanner
//!
//! Reads the Google OAuth token set from `~/.gemini/oauth_creds.json`.

use super::{
    ScanContext, ScanOutcome, Scanner, expiry_from_millis, is_expiring, non_empty, read_json,
};
use crate::error::Result;
use crate::types::{CliSource, CredentialKind, CredentialMetadata, DiscoveredCredential};
use async_trait::async_trait;
use chrono::Utc;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub(crate) const VALIDATION_URL: &str = "https://www.googleapis.com/oauth2/v1/userinfo?alt=json";
pub(crate) const ENV_VAR: &str = "GEMINI_ACCESS_TOKEN";

#[derive(Debug, Deserialize)]
struct GeminiOAuthFile {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default, alias = "expiry_date")]
    expires_at: Option<i64>,
    #[serde(default)]
    email: Option<String>,
}

/// Scanner for the Gemini CLI
pub struct GeminiScanner {
    ctx: ScanContext,
}

impl GeminiScanner {
    pub fn new() -> Self {
        Self::with_context(ScanContext::for_source(CliSource::GeminiCli))
    }

    pub fn with_context(ctx: ScanContext) -> Self {
        Self { ctx }
    }
}

impl Default for GeminiScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scanner for GeminiScanner {
    fn source(&self) -> CliSource {
        CliSource::GeminiCli
    }

    fn credential_path(&self) -> PathBuf {
        self.ctx.home_path(&[".gemini", "oauth_creds.json"])
    }

    async fn scan(&self) -> Result<ScanOutcome> {
        let path = self.credential_path();
        if let Some(credential) = self.read_credential(&path).await {
            if is_expiring(credential.metadata.expires_at, Utc::now()) {
                debug!(path = %path.display(), "gemini-cli token expired or expiring soon");
                return Ok(ScanOutcome::not_found(
                    "gemini-cli OAuth token is expired or about to expire",
                ));
            }
            return Ok(ScanOutcome::Found(credential));
        }

        if let Some(token) = self.ctx.env_secret() {
            return Ok(ScanOutcome::Found(self.ctx.credential(
                CredentialKind::OAuth,
                token,
                CredentialMetadata::from_origin(self.ctx.env_origin()),
            )));
        }

        Ok(ScanOutcome::not_found("No gemini-cli OAuth credentials found"))
    }

    async fn validate(&self, secret: &str) -> Result<bool> {
        Ok(self.ctx.validate_bearer(secret).await)
    }

    async fn read_credential(&self, path: &Path) -> Option<DiscoveredCredential> {
        let file: GeminiOAuthFile = read_json(path).await?;
        let access = non_empty(file.access_token)?;
        Some(self.ctx.credential(
            CredentialKind::OAuth,
            access,
            CredentialMetadata {
                origin: Some(path.display().to_string()),
                refresh_token: non_empty(file.refresh_token),
                expires_at: expiry_from_millis(file.expires_at),
                email: non_empty(file.email),
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn scanner(home: &Path) -> GeminiScanner {
        GeminiScanner::with_context(
            ScanContext::for_source(CliSource::GeminiCli)
                .with_home(home)
                .with_env_var("CREDSCOUT_TEST_GEMINI_UNSET"),
        )
    }

    async fn write_creds(home: &Path, content: &str) {
        let dir = home.join(".gemini");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("oauth_creds.json"), content)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scan_reads_email_and_expiry_alias() {
        let dir = TempDir::new().unwrap();
        let expires = (Utc::now() + Duration::hours(1)).timestamp_millis();
        write_creds(
            dir.path(),
            &format!(
                r#"{{"access_token": "ya29.token", "refresh_token": "1//refresh", "expiry_date": {}, "email": "dev@example.com", "token_type": "Bearer"}}"#,
                expires
            ),
        )
        .await;

        let outcome = scanner(dir.path()).scan().await.unwrap();
        let cred = outcome.credential().unwrap();
        assert_eq!(cred.provider, "google-gemini-cli");
        assert_eq!(cred.metadata.email.as_deref(), Some("dev@example.com"));
        assert!(cred.metadata.expires_at.is_some());
        assert!(cred.can_auto_refresh());
    }

    #[tokio::test]
    async fn test_scan_expired_token() {
        let dir = TempDir::new().unwrap();
        let expires = (Utc::now() - Duration::hours(1)).timestamp_millis();
        write_creds(
            dir.path(),
            &format!(r#"{{"access_token": "ya29.old", "expires_at": {}}}"#, expires),
        )
        .await;

        let outcome = scanner(dir.path()).scan().await.unwrap();
        assert!(outcome.reason().unwrap().contains("expired"));
    }

    #[tokio::test]
    async fn test_scan_missing_file() {
        let dir = TempDir::new().unwrap();
        let outcome = scanner(dir.path()).scan().await.unwrap();
        assert_eq!(outcome.reason(), Some("No gemini-cli OAuth credentials found"));
    }
}
