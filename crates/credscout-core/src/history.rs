//! Discovery history store
//!
//! Persists the secret-free projection of every discovered credential to a
//! single JSON file. Every mutation rewrites the whole file before returning,
//! while holding the store's write lock, so concurrent callers cannot lose
//! updates or duplicate a fingerprint.

use crate::error::{DiscoveryError, Result};
use crate::fingerprint::short_fingerprint;
use crate::rotator::{self, RotationStrategy};
use crate::types::{
    CredentialStatus, DiscoveredCredential, HISTORY_VERSION, HistoryEntry, HistoryFile,
};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

/// Consecutive failures that force a credential to `invalid`
pub const FAILURE_THRESHOLD: u32 = 3;

/// File-backed history of discovered credentials
pub struct HistoryStore {
    path: PathBuf,
    state: RwLock<HistoryFile>,
}

impl HistoryStore {
    /// Open the store at `path`, starting empty when the file is missing.
    ///
    /// An unreadable file or one written by another format version is moved
    /// aside to `<name>.bak` and the store starts empty.
    pub async fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = load(&path).await;
        debug!(
            path = %path.display(),
            entries = state.discovered.len(),
            "Opened discovery history"
        );
        Self {
            path,
            state: RwLock::new(state),
        }
    }

    /// Open the store at the default location (`~/.credscout/cli-token-history.json`)
    pub async fn open_default() -> Result<Self> {
        Ok(Self::open(crate::paths::history_path()?).await)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Copy of the whole history
    pub async fn snapshot(&self) -> HistoryFile {
        self.state.read().await.clone()
    }

    pub async fn entries(&self) -> Vec<HistoryEntry> {
        self.state.read().await.discovered.clone()
    }

    pub async fn last_scan_at(&self) -> Option<DateTime<Utc>> {
        self.state.read().await.last_scan_at
    }

    pub async fn has(&self, fingerprint: &str) -> bool {
        self.state
            .read()
            .await
            .discovered
            .iter()
            .any(|entry| entry.fingerprint == fingerprint)
    }

    pub async fn get(&self, fingerprint: &str) -> Option<HistoryEntry> {
        self.state
            .read()
            .await
            .discovered
            .iter()
            .find(|entry| entry.fingerprint == fingerprint)
            .cloned()
    }

    /// Entries whose status is `active`, in insertion order
    pub async fn list_active(&self) -> Vec<HistoryEntry> {
        self.state
            .read()
            .await
            .discovered
            .iter()
            .filter(|entry| entry.is_active())
            .cloned()
            .collect()
    }

    /// Insert a credential or merge it into the entry with the same fingerprint.
    ///
    /// A merge takes the new discovery time and status but keeps the usage
    /// count, last-used time, failure record and import time.
    pub async fn add_or_update(&self, credential: &DiscoveredCredential) -> Result<HistoryEntry> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let mut entry = HistoryEntry::from_credential(credential);

        let merged = match next
            .discovered
            .iter_mut()
            .find(|existing| existing.fingerprint == credential.fingerprint)
        {
            Some(existing) => {
                entry.usage_count = existing.usage_count;
                entry.last_used_at = existing.last_used_at;
                entry.consecutive_failures = existing.consecutive_failures;
                entry.last_error = existing.last_error.take();
                entry.imported_at = existing.imported_at;
                *existing = entry.clone();
                true
            }
            None => {
                next.discovered.push(entry.clone());
                false
            }
        };

        self.commit(&mut state, next).await?;
        if merged {
            debug!(
                source = %credential.source,
                fingerprint = %short_fingerprint(&credential.fingerprint),
                "Updated history entry"
            );
        } else {
            info!(
                source = %credential.source,
                fingerprint = %short_fingerprint(&credential.fingerprint),
                "Added history entry"
            );
        }
        Ok(entry)
    }

    /// Count one use of a credential
    pub async fn record_usage(&self, fingerprint: &str) -> Result<bool> {
        self.update_entry(fingerprint, |entry| {
            entry.usage_count += 1;
            entry.last_used_at = Some(Utc::now());
        })
        .await
    }

    /// Record a failure; the third consecutive one marks the entry `invalid`
    pub async fn record_failure(&self, fingerprint: &str, error: &str) -> Result<bool> {
        self.update_entry(fingerprint, |entry| {
            entry.consecutive_failures += 1;
            entry.last_error = Some(error.to_string());
            if entry.consecutive_failures >= FAILURE_THRESHOLD {
                if entry.status != CredentialStatus::Invalid {
                    warn!(
                        source = %entry.source,
                        fingerprint = %short_fingerprint(&entry.fingerprint),
                        failures = entry.consecutive_failures,
                        "Credential marked invalid after repeated failures"
                    );
                }
                entry.status = CredentialStatus::Invalid;
            }
        })
        .await
    }

    /// Set the status explicitly; `active` also clears the failure record
    pub async fn set_status(&self, fingerprint: &str, status: CredentialStatus) -> Result<bool> {
        self.update_entry(fingerprint, |entry| {
            entry.status = status;
            if status == CredentialStatus::Active {
                entry.consecutive_failures = 0;
                entry.last_error = None;
            }
        })
        .await
    }

    /// Stamp the time the host store accepted this credential
    pub async fn mark_imported(&self, fingerprint: &str) -> Result<bool> {
        self.update_entry(fingerprint, |entry| {
            entry.imported_at = Some(Utc::now());
        })
        .await
    }

    pub async fn mark_scan_complete(&self) -> Result<()> {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        next.last_scan_at = Some(Utc::now());
        self.commit(&mut state, next).await
    }

    /// Drop every entry and the last-scan time
    pub async fn clear(&self) -> Result<()> {
        let mut state = self.state.write().await;
        self.commit(&mut state, HistoryFile::empty()).await?;
        info!(path = %self.path.display(), "Cleared discovery history");
        Ok(())
    }

    /// Quick selection without a rotator: `least-used` picks the lowest usage
    /// count, every other strategy the first active entry.
    pub async fn next_for_rotation(&self, strategy: RotationStrategy) -> Option<HistoryEntry> {
        let active = self.list_active().await;
        match strategy {
            RotationStrategy::LeastUsed => rotator::least_used(&active).cloned(),
            _ => active.into_iter().next(),
        }
    }

    async fn update_entry<F>(&self, fingerprint: &str, apply: F) -> Result<bool>
    where
        F: FnOnce(&mut HistoryEntry),
    {
        let mut state = self.state.write().await;
        let mut next = state.clone();
        let Some(entry) = next
            .discovered
            .iter_mut()
            .find(|entry| entry.fingerprint == fingerprint)
        else {
            debug!(
                fingerprint = %short_fingerprint(fingerprint),
                "Ignoring update for unknown fingerprint"
            );
            return Ok(false);
        };

        apply(entry);
        self.commit(&mut state, next).await?;
        Ok(true)
    }

    /// Write `next` to disk, then make it the in-memory state. On a failed
    /// write the current state is left untouched.
    async fn commit(&self, state: &mut HistoryFile, next: HistoryFile) -> Result<()> {
        self.persist(&next).await?;
        *state = next;
        Ok(())
    }

    async fn persist(&self, state: &HistoryFile) -> Result<()> {
        write_history(&self.path, state).await.map_err(|e| {
            warn!(path = %self.path.display(), error = %e, "Failed to persist history");
            DiscoveryError::History(format!(
                "Failed to write {}: {}",
                self.path.display(),
                e
            ))
        })
    }
}

async fn load(path: &Path) -> HistoryFile {
    let content = match tokio::fs::read_to_string(path).await {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return HistoryFile::empty(),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to read history, starting empty");
            backup(path).await;
            return HistoryFile::empty();
        }
    };

    match serde_json::from_str::<HistoryFile>(&content) {
        Ok(file) if file.version == HISTORY_VERSION => file,
        Ok(file) => {
            warn!(
                path = %path.display(),
                found = file.version,
                expected = HISTORY_VERSION,
                "History version mismatch, starting empty"
            );
            backup(path).await;
            HistoryFile::empty()
        }
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Failed to parse history, starting empty");
            backup(path).await;
            HistoryFile::empty()
        }
    }
}

/// Move an unusable history file aside so the next write does not destroy it
async fn backup(path: &Path) {
    let backup_path = sibling_path(path, "bak");
    match tokio::fs::rename(path, &backup_path).await {
        Ok(()) => info!(backup = %backup_path.display(), "Backed up previous history file"),
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to back up history file"),
    }
}

fn sibling_path(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

/// Write the history to a temp file with owner-only permissions, then rename
async fn write_history(path: &Path, state: &HistoryFile) -> std::io::Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }

    let content = serde_json::to_vec_pretty(state).map_err(std::io::Error::other)?;
    let temp_path = sibling_path(path, "tmp");

    let mut options = tokio::fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let mut file = options.open(&temp_path).await?;
    file.write_all(&content).await?;
    file.sync_all().await?;
    drop(file);

    tokio::fs::rename(&temp_path, path).await
}
