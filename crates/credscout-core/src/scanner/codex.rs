//! Codex CLI scanner
//!
//! Codex writes `~/.codex/auth.json` after login. The file holds either an
//! OpenAI API key or the ChatGPT OAuth token set under `tokens`.

use super::{ScanContext, ScanOutcome, Scanner, non_empty, read_json};
use crate::error::Result;
use crate::types::{CliSource, CredentialKind, CredentialMetadata, DiscoveredCredential};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

pub(crate) const VALIDATION_URL: &str = "https://api.openai.com/v1/models";
pub(crate) const ENV_VAR: &str = "OPENAI_API_KEY";

#[derive(Debug, Default, Deserialize)]
struct CodexAuthFile {
    #[serde(default, rename = "apiKey")]
    api_key: Option<String>,
    #[serde(default, rename = "openaiApiKey")]
    openai_api_key: Option<String>,
    #[serde(default, rename = "OPENAI_API_KEY")]
    openai_api_key_upper: Option<String>,
    #[serde(default, rename = "accessToken")]
    access_token: Option<String>,
    #[serde(default, rename = "refreshToken")]
    refresh_token: Option<String>,
    #[serde(default)]
    tokens: Option<CodexTokens>,
}

#[derive(Debug, Default, Deserialize)]
struct CodexTokens {
    #[serde(default)]
    access_token: Option<String>,
    #[serde(default)]
    refresh_token: Option<String>,
}

impl CodexAuthFile {
    fn api_key(&self) -> Option<String> {
        non_empty(self.api_key.clone())
            .or_else(|| non_empty(self.openai_api_key.clone()))
            .or_else(|| non_empty(self.openai_api_key_upper.clone()))
    }

    fn oauth_tokens(&self) -> Option<(String, Option<String>)> {
        let nested = self.tokens.as_ref();
        let access = non_empty(nested.and_then(|t| t.access_token.clone()))
            .or_else(|| non_empty(self.access_token.clone()))?;
        let refresh = non_empty(nested.and_then(|t| t.refresh_token.clone()))
            .or_else(|| non_empty(self.refresh_token.clone()));
        Some((access, refresh))
    }
}

/// Scanner for the Codex CLI
pub struct CodexScanner {
    ctx: ScanContext,
}

impl CodexScanner {
    pub fn new() -> Self {
        Self::with_context(ScanContext::for_source(CliSource::CodexCli))
    }

    pub fn with_context(ctx: ScanContext) -> Self {
        Self { ctx }
    }

    fn candidate_paths(&self) -> [PathBuf; 2] {
        [
            self.credential_path(),
            self.ctx.home_path(&[".codex", "config.json"]),
        ]
    }
}

impl Default for CodexScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Scanner for CodexScanner {
    fn source(&self) -> CliSource {
        CliSource::CodexCli
    }

    fn credential_path(&self) -> PathBuf {
        self.ctx.home_path(&[".codex", "auth.json"])
    }

    async fn scan(&self) -> Result<ScanOutcome> {
        for path in self.candidate_paths() {
            if let Some(credential) = self.read_credential(&path).await {
                debug!(path = %path.display(), kind = %credential.kind, "Found codex-cli credentials");
                return Ok(ScanOutcome::Found(credential));
            }
        }

        if let Some(key) = self.ctx.env_secret() {
            return Ok(ScanOutcome::Found(self.ctx.credential(
                CredentialKind::ApiKey,
                key,
                CredentialMetadata::from_origin(self.ctx.env_origin()),
            )));
        }

        Ok(ScanOutcome::not_found("No codex-cli credentials found"))
    }

    async fn validate(&self, secret: &str) -> Result<bool> {
        Ok(self.ctx.validate_bearer(secret).await)
    }

    async fn read_credential(&self, path: &Path) -> Option<DiscoveredCredential> {
        let file: CodexAuthFile = read_json(path).await?;
        let origin = path.display().to_string();

        if let Some(key) = file.api_key() {
            return Some(self.ctx.credential(
                CredentialKind::ApiKey,
                key,
                CredentialMetadata::from_origin(origin),
            ));
        }

        let (access, refresh) = file.oauth_tokens()?;
        Some(self.ctx.credential(
            CredentialKind::OAuth,
            access,
            CredentialMetadata {
                origin: Some(origin),
                refresh_token: refresh,
                ..Default::default()
            },
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn scanner(home: &Path, env_var: &str) -> CodexScanner {
        CodexScanner::with_context(
            ScanContext::for_source(CliSource::CodexCli)
                .with_home(home)
                .with_env_var(env_var),
        )
    }

    async fn write_auth(home: &Path, file: &str, content: &str) {
        let dir = home.join(".codex");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join(file), content).await.unwrap();
    }

    #[tokio::test]
    async fn test_scan_api_key_field_variants() {
        for (content, expected) in [
            (r#"{"apiKey": "sk-a"}"#, "sk-a"),
            (r#"{"openaiApiKey": "sk-b"}"#, "sk-b"),
            (r#"{"OPENAI_API_KEY": "sk-c", "tokens": null}"#, "sk-c"),
        ] {
            let dir = TempDir::new().unwrap();
            write_auth(dir.path(), "auth.json", content).await;

            let outcome = scanner(dir.path(), "CREDSCOUT_TEST_CODEX_UNSET_1")
                .scan()
                .await
                .unwrap();
            let cred = outcome.credential().unwrap();
            assert_eq!(cred.secret, expected);
            assert_eq!(cred.kind, CredentialKind::ApiKey);
        }
    }

    #[tokio::test]
    async fn test_scan_oauth_tokens() {
        let dir = TempDir::new().unwrap();
        write_auth(
            dir.path(),
            "auth.json",
            r#"{"OPENAI_API_KEY": null, "tokens": {"access_token": "chatgpt-access", "refresh_token": "chatgpt-refresh"}}"#,
        )
        .await;

        let outcome = scanner(dir.path(), "CREDSCOUT_TEST_CODEX_UNSET_2")
            .scan()
            .await
            .unwrap();
        let cred = outcome.credential().unwrap();
        assert_eq!(cred.kind, CredentialKind::OAuth);
        assert_eq!(cred.secret, "chatgpt-access");
        assert!(cred.can_auto_refresh());
    }

    #[tokio::test]
    async fn test_scan_reads_config_json() {
        let dir = TempDir::new().unwrap();
        write_auth(dir.path(), "config.json", r#"{"apiKey": "sk-config"}"#).await;

        let outcome = scanner(dir.path(), "CREDSCOUT_TEST_CODEX_UNSET_3")
            .scan()
            .await
            .unwrap();
        assert_eq!(outcome.credential().unwrap().secret, "sk-config");
    }

    #[tokio::test]
    async fn test_scan_nothing_found() {
        let dir = TempDir::new().unwrap();
        write_auth(dir.path(), "auth.json", "{}").await;

        let outcome = scanner(dir.path(), "CREDSCOUT_TEST_CODEX_UNSET_4")
            .scan()
            .await
            .unwrap();
        assert_eq!(outcome.reason(), Some("No codex-cli credentials found"));
    }
}
