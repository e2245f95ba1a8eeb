//! Error types for credential discovery

use thiserror::Error;

/// Discovery error types
#[derive(Error, Debug)]
pub enum DiscoveryError {
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("History store error: {0}")]
    History(String),

    #[error("Unknown credential source: {0}")]
    UnknownSource(String),

    #[error("Host error: {0}")]
    Host(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Result type alias for discovery operations
pub type Result<T> = std::result::Result<T, DiscoveryError>;
