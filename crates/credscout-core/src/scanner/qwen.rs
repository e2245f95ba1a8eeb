//! Qwen Code scanner
//!
//! Qwen Code keeps its portal OAuth token in `~/.qwen/oauth_creds.json`.

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

pub(crate) const VALIDATION_URL: &str = "https://chat.qwen.ai/api/user/info";
pub(crate) const ENV_VAR: &str = "QWEN_ACCESS_TOKEN";

#[derive(Debug, Deserialize)]
struct QwenOAuthFile {
    #[serde(default, rename = "accessToken", alias = "access_token")]
    access_token: Option<String>,
    #[serde(default, rename = "refreshToken", alias = "refresh_token")]
    refresh_token: Option<String>,
    #[serde(default, rename = "expiresAt", alias = "expiry_date")]
    expires_at: Option<i64>,
}

/// Scanner for Qwen Code
pub struct QwenScanner {
    ctx: ScanContext,
}

impl QwenScanner {
    pub fn new() -> Self {
        Self::with_context(ScanContext::for_source(CliSource::QwenCli))
    }

    pub fn with_context(ctx: ScanContext) -> Self {
        Self { ctx }
    }
}

impl Default for QwenScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scanner for QwenScanner {
    fn source(&self) -> CliSource {
        CliSource::QwenCli
    }

    fn credential_path(&self) -> PathBuf {
        self.ctx.home_path(&[".qwen", "oauth_creds.json"])
    }

    async fn scan(&self) -> Result<ScanOutcome> {
        let path = self.credential_path();
        if let Some(credential) = self.read_credential(&path).await {
            if is_expiring(credential.metadata.expires_at, Utc::now()) {
                debug!(path = %path.display(), "qwen-cli token expired or expiring soon");
                return Ok(ScanOutcome::not_found(
                    "qwen-cli OAuth token is expired or about to expire",
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

        Ok(ScanOutcome::not_found("No qwen-cli OAuth credentials found"))
    }

    async fn validate(&self, secret: &str) -> Result<bool> {
        Ok(self.ctx.validate_bearer(secret).await)
    }

    async fn read_credential(&self, path: &Path) -> Option<DiscoveredCredential> {
        let file: QwenOAuthFile = read_json(path).await?;
        let access = non_empty(file.access_token)?;
        Some(self.ctx.credential(
            CredentialKind::OAuth,
            access,
            CredentialMetadata {
                origin: Some(path.display().to_string()),
                refresh_token: non_empty(file.refresh_token),
                expires_at: expiry_from_millis(file.expires_at),
                email: None,
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    fn scanner(home: &Path, env_var: &str) -> QwenScanner {
        QwenScanner::with_context(
            ScanContext::for_source(CliSource::QwenCli)
                .with_home(home)
                .with_env_var(env_var),
        )
    }

    async fn write_creds(home: &Path, content: &str) {
        let dir = home.join(".qwen");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("oauth_creds.json"), content)
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_scan_valid_token() {
        let dir = TempDir::new().unwrap();
        let expires = (Utc::now() + Duration::hours(2)).timestamp_millis();
        write_creds(
            dir.path(),
            &format!(
                r#"{{"accessToken": "qwen-access", "refreshToken": "qwen-refresh", "expiresAt": {}}}"#,
                expires
            ),
        )
        .await;

        let outcome = scanner(dir.path(), "CREDSCOUT_TEST_QWEN_UNSET_1")
            .scan()
            .await
            .unwrap();
        let cred = outcome.credential().unwrap();
        assert_eq!(cred.kind, CredentialKind::OAuth);
        assert_eq!(cred.provider, "qwen-portal");
        assert_eq!(cred.metadata.refresh_token.as_deref(), Some("qwen-refresh"));
        assert_eq!(
            cred.metadata.expires_at.map(|e| e.timestamp_millis()),
            Some(expires)
        );
    }

    #[tokio::test]
    async fn test_scan_snake_case_fields() {
        let dir = TempDir::new().unwrap();
        write_creds(
            dir.path(),
            r#"{"access_token": "qwen-snake", "refresh_token": "r"}"#,
        )
        .await;

        let outcome = scanner(dir.path(), "CREDSCOUT_TEST_QWEN_UNSET_2")
            .scan()
            .await
            .unwrap();
        assert_eq!(outcome.credential().unwrap().secret, "qwen-snake");
    }

    #[tokio::test]
    async fn test_scan_token_expiring_within_margin() {
        let dir = TempDir::new().unwrap();
        let expires = (Utc::now() + Duration::minutes(1)).timestamp_millis();
        write_creds(
            dir.path(),
            &format!(r#"{{"accessToken": "qwen-old", "expiresAt": {}}}"#, expires),
        )
        .await;

        let qwen = scanner(dir.path(), "CREDSCOUT_TEST_QWEN_UNSET_3");
        let outcome = qwen.scan().await.unwrap();
        assert!(!outcome.is_found());
        assert!(outcome.reason().unwrap().contains("expired"));

        // Reading the file directly skips the expiry check
        let cred = qwen.read_credential(&qwen.credential_path()).await;
        assert_eq!(cred.unwrap().secret, "qwen-old");
    }

    #[tokio::test]
    async fn test_scan_env_fallback() {
        let dir = TempDir::new().unwrap();
        let env_var = "CREDSCOUT_TEST_QWEN_ENV";
        unsafe { std::env::set_var(env_var, "qwen-env-token") };

        let outcome = scanner(dir.path(), env_var).scan().await.unwrap();
        let cred = outcome.credential().unwrap();
        assert_eq!(cred.kind, CredentialKind::OAuth);
        assert!(cred.metadata.expires_at.is_none());

        unsafe { std::env::remove_var(env_var) };
    }
}
