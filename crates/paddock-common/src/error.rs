//! Error types shared across Paddock crates

use thiserror::Error;

/// Result type alias for Paddock operations
pub type Result<T> = std::result::Result<T, PaddockError>;

/// Main error type for Paddock
#[derive(Error, Debug)]
pub enum PaddockError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid artifact name: {0}")]
    InvalidArtifactName(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
