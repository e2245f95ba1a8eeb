//! Waiting for a login flow to write a new credential file.

use crate::config::RefreshSettings;
use crate::fingerprint::short_fingerprint;
use crate::scanner::Scanner;
use crate::types::DiscoveredCredential;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, warn};

enum WatchMode {
    /// File exists: react to filesystem events on its directory
    Events {
        _watcher: RecommendedWatcher,
        rx: mpsc::Receiver<notify::Result<Event>>,
    },
    /// File missing (or watching failed): check at a fixed interval
    Poll { interval: Duration, attempts: u32 },
}

/// A pending wait for a fresh credential at a scanner's credential path.
///
/// Created before the login page is opened so no write is missed. Dropping
/// it releases the underlying watcher.
pub struct CredentialWatch {
    scanner: Arc<dyn Scanner>,
    path: PathBuf,
    baseline: Option<String>,
    mode: WatchMode,
}

impl CredentialWatch {
    pub async fn start(scanner: Arc<dyn Scanner>, settings: &RefreshSettings) -> Self {
        let path = scanner.credential_path();
        let baseline = scanner
            .read_credential(&path)
            .await
            .map(|credential| credential.fingerprint);

        let poll = WatchMode::Poll {
            interval: settings.poll_interval(),
            attempts: settings.poll_attempts,
        };

        let mode = if path.exists() {
            match watch_parent(&path) {
                Ok(mode) => mode,
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Failed to watch credential file, polling instead");
                    poll
                }
            }
        } else {
            poll
        };

        Self {
            scanner,
            path,
            baseline,
            mode,
        }
    }

    pub fn is_polling(&self) -> bool {
        matches!(self.mode, WatchMode::Poll { .. })
    }

    /// Wait until the file holds a credential different from the one present
    /// at start. `None` when polling runs out of attempts or the watcher stops.
    pub async fn wait(mut self) -> Option<DiscoveredCredential> {
        match &mut self.mode {
            WatchMode::Events { rx, .. } => {
                let file_name = self.path.file_name().map(|name| name.to_os_string());
                while let Some(result) = rx.recv().await {
                    let Ok(event) = result else { continue };
                    let relevant = matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_))
                        && event
                            .paths
                            .iter()
                            .any(|path| path.file_name().map(|n| n.to_os_string()) == file_name);
                    if !relevant {
                        continue;
                    }
                    if let Some(credential) = fresh_credential(&*self.scanner, &self.path, &self.baseline).await {
                        return Some(credential);
                    }
                }
                None
            }
            WatchMode::Poll { interval, attempts } => {
                for _ in 0..*attempts {
                    tokio::time::sleep(*interval).await;
                    if let Some(credential) = fresh_credential(&*self.scanner, &self.path, &self.baseline).await {
                        return Some(credential);
                    }
                }
                debug!(path = %self.path.display(), "Polling for credential file exhausted");
                None
            }
        }
    }
}

fn watch_parent(path: &std::path::Path) -> notify::Result<WatchMode> {
    let parent = path
        .parent()
        .map(|p| p.to_path_buf())
        .unwrap_or_else(|| PathBuf::from("."));
    let (tx, rx) = mpsc::channel(64);

    let mut watcher = notify::recommended_watcher(move |res| {
        let _ = tx.blocking_send(res);
    })?;
    watcher.watch(&parent, RecursiveMode::NonRecursive)?;

    debug!(dir = %parent.display(), "Watching for credential changes");
    Ok(WatchMode::Events {
        _watcher: watcher,
        rx,
    })
}

async fn fresh_credential(
    scanner: &dyn Scanner,
    path: &std::path::Path,
    baseline: &Option<String>,
) -> Option<DiscoveredCredential> {
    let credential = scanner.read_credential(path).await?;
    if baseline.as_deref() == Some(credential.fingerprint.as_str()) {
        return None;
    }
    debug!(
        source = %credential.source,
        fingerprint = %short_fingerprint(&credential.fingerprint),
        "Detected new credential"
    );
    Some(credential)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scanner::{GeminiScanner, ScanContext};
    use crate::types::CliSource;
    use tempfile::TempDir;

    fn scanner(home: &std::path::Path) -> Arc<dyn Scanner> {
        Arc::new(GeminiScanner::with_context(
            ScanContext::for_source(CliSource::GeminiCli).with_home(home),
        ))
    }

    fn settings(attempts: u32) -> RefreshSettings {
        RefreshSettings {
            poll_interval_ms: 20,
            poll_attempts: attempts,
            ..Default::default()
        }
    }

    async fn write_token(home: &std::path::Path, token: &str) {
        let dir = home.join(".gemini");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(
            dir.join("oauth_creds.json"),
            format!(r#"{{"access_token": "{}"}}"#, token),
        )
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_poll_detects_created_file() {
        let dir = TempDir::new().unwrap();
        let watch = CredentialWatch::start(scanner(dir.path()), &settings(100)).await;
        assert!(watch.is_polling());

        let home = dir.path().to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(60)).await;
            write_token(&home, "ya29.created").await;
        });

        let credential = watch.wait().await.unwrap();
        assert_eq!(credential.secret, "ya29.created");
    }

    #[tokio::test]
    async fn test_poll_gives_up_after_attempts() {
        let dir = TempDir::new().unwrap();
        let watch = CredentialWatch::start(scanner(dir.path()), &settings(3)).await;
        assert!(watch.wait().await.is_none());
    }

    #[tokio::test]
    async fn test_watch_ignores_unchanged_token() {
        let dir = TempDir::new().unwrap();
        write_token(dir.path(), "ya29.old").await;

        let watch = CredentialWatch::start(scanner(dir.path()), &settings(3)).await;
        assert!(!watch.is_polling());

        let home = dir.path().to_path_buf();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            write_token(&home, "ya29.old").await;
            tokio::time::sleep(Duration::from_millis(100)).await;
            write_token(&home, "ya29.new").await;
        });

        let credential = tokio::time::timeout(Duration::from_secs(10), watch.wait())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(credential.secret, "ya29.new");
    }
}
