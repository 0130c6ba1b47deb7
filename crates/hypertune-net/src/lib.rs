//! Hypertune Net - Hypernetworks for Cross-Attention
//!
//! A hypernetwork is a small auxiliary network that adjusts the context fed
//! to the key/value projections of a frozen diffusion model's cross-attention
//! layers. The base model's weights are never touched.
//!
//! # Structure
//!
//! ```text
//! Hypernetwork
//! ├── 768  → BlockPair { key: ModuleBlock, value: ModuleBlock }
//! ├── 1024 → BlockPair { ... }
//! └── step, name, sd_checkpoint, sd_checkpoint_name
//! ```
//!
//! Each [`ModuleBlock`] is a residual chain of linear layers whose widths
//! follow a multiplier sequence such as `[1, 2, 1]` or `[1, 2, 4, 2, 4, 1]`.
//!
//! # Applying
//!
//! Attention layers receive a [`HypernetworkContext`] on every call and hand
//! it to [`apply_hypernetwork`], which looks up the pair matching the
//! context width.

pub mod attention;
pub mod block;
pub mod context;
pub mod error;
pub mod hypernetwork;

// Re-exports
pub use attention::{apply_hypernetwork, AttachedHypernetwork, CrossAttention};
pub use block::{LayerShape, ModuleBlock, ShapeSpec, DEFAULT_MULTIPLIERS};
pub use context::{HypernetworkContext, DEFAULT_STRENGTH};
pub use error::{HypernetError, Result};
pub use hypernetwork::{
    BlockPair, CheckpointInfo, Hypernetwork, DEEP_MULTIPLIERS, HYPERNETWORK_EXTENSION,
};
