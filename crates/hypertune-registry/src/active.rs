//! The currently active hypernetwork
//!
//! Holds at most one loaded hypernetwork plus the strength it is applied at,
//! and hands out [`HypernetworkContext`]s for attention calls.

use std::path::Path;

use candle_core::Device;
use hypertune_net::{Hypernetwork, HypernetworkContext, Result, DEFAULT_STRENGTH};
use tracing::{error, info};

use crate::registry::HypernetworkRegistry;

/// Slot for the hypernetwork applied to attention
pub struct ActiveHypernetwork {
    loaded: Option<Hypernetwork>,
    strength: f64,
    device: Device,
}

impl ActiveHypernetwork {
    /// Create an empty slot; hypernetworks are loaded onto `device`
    pub fn new(device: &Device) -> Self {
        Self {
            loaded: None,
            strength: DEFAULT_STRENGTH,
            device: device.clone(),
        }
    }

    /// Load a hypernetwork by registry name
    ///
    /// Replaces whatever was active. An unknown name unloads the current
    /// hypernetwork; a file that fails to load is logged and leaves the slot
    /// empty. Returns the newly active hypernetwork, if any.
    pub fn load(&mut self, registry: &HypernetworkRegistry, name: &str) -> Option<&Hypernetwork> {
        match registry.get(name) {
            Some(path) => {
                info!(name, "Loading hypernetwork");
                self.loaded = None;

                match Hypernetwork::from_file(path, &self.device) {
                    Ok(hypernetwork) => self.loaded = Some(hypernetwork),
                    Err(err) => {
                        error!(path = %path.display(), error = ?err, "Error loading hypernetwork");
                    }
                }
            }
            None => {
                if self.loaded.is_some() {
                    info!("Unloading hypernetwork");
                }
                self.loaded = None;
            }
        }

        self.loaded.as_ref()
    }

    /// Load a hypernetwork straight from a file, propagating failures
    ///
    /// The slot is empty afterwards if loading fails.
    pub fn load_path(&mut self, path: impl AsRef<Path>) -> Result<&mut Hypernetwork> {
        self.loaded = None;
        let hypernetwork = Hypernetwork::from_file(path, &self.device)?;
        Ok(self.loaded.insert(hypernetwork))
    }

    /// Make `hypernetwork` active, returning the previous one
    pub fn replace(&mut self, hypernetwork: Hypernetwork) -> Option<Hypernetwork> {
        self.loaded.replace(hypernetwork)
    }

    /// Deactivate and return the current hypernetwork
    pub fn unload(&mut self) -> Option<Hypernetwork> {
        self.loaded.take()
    }

    pub fn get(&self) -> Option<&Hypernetwork> {
        self.loaded.as_ref()
    }

    pub fn get_mut(&mut self) -> Option<&mut Hypernetwork> {
        self.loaded.as_mut()
    }

    pub fn is_loaded(&self) -> bool {
        self.loaded.is_some()
    }

    /// Strength blocks run at
    pub fn strength(&self) -> f64 {
        self.strength
    }

    /// Set the strength; `None` restores the default
    pub fn set_strength(&mut self, strength: Option<f64>) {
        self.strength = strength.unwrap_or(DEFAULT_STRENGTH);
    }

    /// Device hypernetworks are loaded onto
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Context for attention calls
    pub fn context(&self) -> HypernetworkContext<'_> {
        HypernetworkContext::new(self.loaded.as_ref(), self.strength)
    }
}
