//! Per-call hypernetwork state for attention layers

use crate::hypernetwork::{BlockPair, Hypernetwork};

/// Strength applied when nothing else is configured
pub const DEFAULT_STRENGTH: f64 = 1.0;

/// What an attention call should do with its context
///
/// Carries the hypernetwork to apply (if any) and the strength its blocks
/// run at. Every attention call receives one of these explicitly; hosts that
/// swap hypernetworks between calls simply build a new context.
#[derive(Debug, Clone, Copy)]
pub struct HypernetworkContext<'a> {
    hypernetwork: Option<&'a Hypernetwork>,
    strength: f64,
}

impl<'a> HypernetworkContext<'a> {
    /// Create a context
    pub fn new(hypernetwork: Option<&'a Hypernetwork>, strength: f64) -> Self {
        Self {
            hypernetwork,
            strength,
        }
    }

    /// Context that leaves attention untouched
    pub fn disabled() -> Self {
        Self::new(None, DEFAULT_STRENGTH)
    }

    /// Context applying `hypernetwork` at full strength
    pub fn active(hypernetwork: &'a Hypernetwork) -> Self {
        Self::new(Some(hypernetwork), DEFAULT_STRENGTH)
    }

    /// Override the strength
    pub fn with_strength(mut self, strength: f64) -> Self {
        self.strength = strength;
        self
    }

    pub fn hypernetwork(&self) -> Option<&'a Hypernetwork> {
        self.hypernetwork
    }

    pub fn strength(&self) -> f64 {
        self.strength
    }

    /// Block pair for a context width, if the active hypernetwork has one
    pub fn blocks_for(&self, dim: usize) -> Option<&'a BlockPair> {
        self.hypernetwork.and_then(|h| h.blocks(dim))
    }
}

impl Default for HypernetworkContext<'_> {
    fn default() -> Self {
        Self::disabled()
    }
}
