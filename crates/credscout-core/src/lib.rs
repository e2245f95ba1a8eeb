//! Discovery, validation, import, rotation and refresh of credentials that
//! local AI command-line tools leave on disk.
//!
//! Hosts create a [`DiscoveryService`] with their [`CredentialHost`] and drive
//! everything through it.

pub mod config;
pub mod engine;
pub mod error;
pub mod fingerprint;
pub mod history;
pub mod import;
pub mod paths;
pub mod refresh;
pub mod rotator;
pub mod scanner;
pub mod service;
pub mod types;

pub use config::{DiscoveryConfig, RefreshSettings, SourceConfig};
pub use error::{DiscoveryError, Result};
pub use history::HistoryStore;
pub use import::{CredentialHost, ImportResult, ImportSummary};
pub use refresh::{RefreshMethod, RefreshState, UrlOpener};
pub use rotator::{RotationStats, RotationStrategy};
pub use scanner::{ScanContext, ScanOutcome, Scanner};
pub use service::{
    DiscoveryService, DiscoveryServiceBuilder, RefreshReport, RotationTicket, ScanReport,
    ServiceStatus,
};
pub use types::*;
