//! Credential rotation across discovered sources
//!
//! Picks which active credential to hand out next. The round-robin cursor is
//! in memory only; usage counts live in the history store.

use crate::error::{DiscoveryError, Result};
use crate::history::HistoryStore;
use crate::types::{CliSource, HistoryEntry};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::RwLock;
use tracing::debug;

/// Priority given to sources missing from the priority map
const UNMAPPED_PRIORITY: u32 = u32::MAX;

/// Strategy for picking the next credential
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RotationStrategy {
    /// Cycle through active credentials in order
    #[default]
    RoundRobin,
    /// Lowest usage count first
    LeastUsed,
    /// Lowest source priority number first, then least used
    Priority,
    /// Least used among credentials without recent failures
    HealthBased,
}

impl RotationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationStrategy::RoundRobin => "round-robin",
            RotationStrategy::LeastUsed => "least-used",
            RotationStrategy::Priority => "priority",
            RotationStrategy::HealthBased => "health-based",
        }
    }
}

impl fmt::Display for RotationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RotationStrategy {
    type Err = DiscoveryError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim() {
            "round-robin" => Ok(RotationStrategy::RoundRobin),
            "least-used" => Ok(RotationStrategy::LeastUsed),
            "priority" => Ok(RotationStrategy::Priority),
            "health-based" => Ok(RotationStrategy::HealthBased),
            other => Err(DiscoveryError::Config(format!(
                "Unknown rotation strategy: {}",
                other
            ))),
        }
    }
}

/// Count and usage for one source
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceUsage {
    pub count: usize,
    pub usage: u64,
}

/// Rotation statistics
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationStats {
    pub strategy: RotationStrategy,
    pub total_active: usize,
    /// Usage summed over every entry, active or not
    pub total_usage: u64,
    pub by_source: BTreeMap<CliSource, SourceUsage>,
}

/// Lowest usage count; ties go to the earliest entry
pub fn least_used(entries: &[HistoryEntry]) -> Option<&HistoryEntry> {
    entries.iter().reduce(|min, entry| {
        if entry.usage_count < min.usage_count {
            entry
        } else {
            min
        }
    })
}

/// Lowest priority number, then lowest usage count
pub fn by_priority<'a>(
    entries: &'a [HistoryEntry],
    priorities: &HashMap<CliSource, u32>,
) -> Option<&'a HistoryEntry> {
    let priority = |entry: &HistoryEntry| {
        priorities
            .get(&entry.source)
            .copied()
            .unwrap_or(UNMAPPED_PRIORITY)
    };
    entries
        .iter()
        .min_by_key(|entry| (priority(entry), entry.usage_count))
}

/// Least used among entries with no consecutive failures, otherwise the
/// entry with the fewest failures
pub fn healthiest(entries: &[HistoryEntry]) -> Option<&HistoryEntry> {
    let healthy = entries
        .iter()
        .filter(|entry| entry.consecutive_failures == 0)
        .reduce(|min, entry| {
            if entry.usage_count < min.usage_count {
                entry
            } else {
                min
            }
        });

    healthy.or_else(|| {
        entries.iter().reduce(|min, entry| {
            if entry.consecutive_failures < min.consecutive_failures {
                entry
            } else {
                min
            }
        })
    })
}

/// Picks the next credential from the store's active entries
pub struct Rotator {
    history: Arc<HistoryStore>,
    strategy: RwLock<RotationStrategy>,
    priorities: RwLock<HashMap<CliSource, u32>>,
    cursor: AtomicUsize,
}

impl Rotator {
    pub fn new(
        history: Arc<HistoryStore>,
        strategy: RotationStrategy,
        priorities: HashMap<CliSource, u32>,
    ) -> Self {
        Self {
            history,
            strategy: RwLock::new(strategy),
            priorities: RwLock::new(priorities),
            cursor: AtomicUsize::new(0),
        }
    }

    pub async fn strategy(&self) -> RotationStrategy {
        *self.strategy.read().await
    }

    pub async fn set_strategy(&self, strategy: RotationStrategy) {
        *self.strategy.write().await = strategy;
        debug!(strategy = %strategy, "Rotation strategy updated");
    }

    pub async fn set_priorities(&self, priorities: HashMap<CliSource, u32>) {
        *self.priorities.write().await = priorities;
    }

    /// Next active credential, `None` when nothing is active
    pub async fn next(&self) -> Option<HistoryEntry> {
        let active = self.history.list_active().await;
        if active.is_empty() {
            return None;
        }

        let strategy = self.strategy().await;
        let selected = match strategy {
            RotationStrategy::RoundRobin => {
                // Cursor is best effort: the active list may change between calls
                let index = self.cursor.fetch_add(1, Ordering::Relaxed) % active.len();
                active.get(index)
            }
            RotationStrategy::LeastUsed => least_used(&active),
            RotationStrategy::Priority => {
                let priorities = self.priorities.read().await;
                by_priority(&active, &priorities)
            }
            RotationStrategy::HealthBased => healthiest(&active),
        };

        selected.cloned()
    }

    pub async fn record_usage(&self, fingerprint: &str) -> Result<bool> {
        self.history.record_usage(fingerprint).await
    }

    pub async fn record_failure(&self, fingerprint: &str, error: &str) -> Result<bool> {
        self.history.record_failure(fingerprint, error).await
    }

    pub async fn stats(&self) -> RotationStats {
        let entries = self.history.entries().await;
        let mut by_source: BTreeMap<CliSource, SourceUsage> = BTreeMap::new();
        for entry in &entries {
            let usage = by_source.entry(entry.source).or_default();
            usage.count += 1;
            usage.usage += entry.usage_count;
        }

        RotationStats {
            strategy: self.strategy().await,
            total_active: entries.iter().filter(|entry| entry.is_active()).count(),
            total_usage: entries.iter().map(|entry| entry.usage_count).sum(),
            by_source,
        }
    }
}
