//! Training errors

use std::path::PathBuf;

use hypertune_net::HypernetError;
use hypertune_registry::RegistryError;
use thiserror::Error;

/// Training errors
#[derive(Debug, Error)]
pub enum TrainError {
    #[error("Hypernetwork not selected")]
    NoHypernetworkSelected,

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error("Hypernetwork error: {0}")]
    Hypernet(#[from] HypernetError),

    #[error("Tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("Invalid learning rate schedule '{schedule}': {reason}")]
    InvalidSchedule { schedule: String, reason: String },

    #[error("Dataset at {0} is empty")]
    EmptyDataset(PathBuf),

    #[error("Dataset error: {0}")]
    Dataset(String),

    #[error("Model error: {0}")]
    Model(String),

    #[error("Preview failed: {0}")]
    Preview(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for training operations
pub type Result<T> = std::result::Result<T, TrainError>;
