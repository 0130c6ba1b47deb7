//! CLI commands

use std::path::PathBuf;

use hypertune_registry::{HypernetworkRegistry, RegistryConfig};

pub mod hypernetwork;

/// Scanned registry over `dir`, or the default location
pub fn open_registry(dir: Option<PathBuf>) -> HypernetworkRegistry {
    let config = match dir {
        Some(dir) => RegistryConfig::with_root(dir),
        None => RegistryConfig::default(),
    };

    let mut registry = HypernetworkRegistry::new(config);
    registry.scan();
    registry
}
