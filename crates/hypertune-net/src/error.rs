//! Error types for hypernetwork operations

use std::path::PathBuf;
use thiserror::Error;

/// Hypernetwork errors
#[derive(Debug, Error)]
pub enum HypernetError {
    /// Tensor operation failed
    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    /// Multiplier sequence does not describe a shape-preserving block
    #[error("Invalid multiplier sequence {sequence:?}: {reason}")]
    InvalidMultipliers {
        sequence: Vec<f64>,
        reason: &'static str,
    },

    /// Stored weights do not fit the constructed block
    #[error("State mismatch for '{key}': {reason}")]
    StateMismatch { key: String, reason: String },

    /// The hypernetwork file could not be deserialized
    #[error("Invalid hypernetwork file {path}: {reason}")]
    FileFormat { path: PathBuf, reason: String },

    /// The hypernetwork file could not be written
    #[error("Failed to write {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl HypernetError {
    pub(crate) fn mismatch(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::StateMismatch {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Result type for hypernetwork operations
pub type Result<T> = std::result::Result<T, HypernetError>;
