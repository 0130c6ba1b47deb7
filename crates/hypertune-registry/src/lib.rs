//! Hypertune Registry - Hypernetwork Discovery
//!
//! Finds hypernetwork files on disk, resolves user-supplied names to files,
//! and manages the single active hypernetwork.
//!
//! # Naming
//!
//! A hypernetwork's name is its file stem:
//!
//! ```text
//! hypernetworks/
//! ├── anime.safetensors          → "anime"
//! └── styles/
//!     └── painterly.safetensors  → "painterly"
//! ```

pub mod active;
pub mod registry;

pub use active::ActiveHypernetwork;
pub use registry::{HypernetworkRegistry, RegistryConfig, RegistryError};
