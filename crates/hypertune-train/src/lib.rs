//! Hypertune Train - Hypernetwork Training
//!
//! Runs the optimization loop for a hypernetwork against an external
//! diffusion model: learning-rate scheduling, periodic checkpoints and
//! preview renders, a smoothed loss log, and cooperative interruption.
//!
//! # Run Layout
//!
//! ```text
//! <log_directory>/<YYYY-MM-DD>/<name>/
//! ├── hypernetwork_loss.csv
//! ├── hypernetworks/<name>-<step>.safetensors
//! └── images/<name>-<step>.png
//! ```
//!
//! The final hypernetwork is written back to the file the registry resolved
//! its name to.

pub mod config;
pub mod error;
pub mod interrupt;
pub mod loss;
pub mod model;
pub mod preview;
pub mod schedule;
pub mod trainer;

pub use config::TrainingConfig;
pub use error::{Result, TrainError};
pub use interrupt::InterruptFlag;
pub use loss::{LossLog, LossRecord, LossWindow, LOSS_WINDOW};
pub use model::{
    DatasetLoader, DatasetRequest, DiffusionModel, ProgressObserver, StepReport, TrainingDataset,
    TrainingPhase, TrainingSample,
};
pub use preview::{GeneratedImage, PreviewRequest};
pub use schedule::LearnRateScheduler;
pub use trainer::{HypernetworkTrainer, TrainingOutcome};
