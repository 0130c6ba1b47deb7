//! Collaborators driven by the trainer
//!
//! The diffusion model, the dataset pipeline and progress reporting live
//! outside this crate; the trainer only talks to them through these traits.

use std::path::PathBuf;

use candle_core::Tensor;
use hypertune_net::{CheckpointInfo, HypernetworkContext};

use crate::config::TrainingConfig;
use crate::preview::{GeneratedImage, PreviewRequest};
use crate::Result;

/// One encoded training example
#[derive(Debug, Clone)]
pub struct TrainingSample {
    /// Text conditioning fed to cross-attention
    pub cond: Tensor,
    /// Encoded image latent
    pub latent: Tensor,
    /// Caption the conditioning was built from
    pub caption: String,
}

/// Indexed source of training samples
pub trait TrainingDataset {
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Sample at `index`, which is always below `len()`
    fn get(&mut self, index: usize) -> Result<TrainingSample>;
}

/// What a dataset should be built from
#[derive(Debug, Clone, PartialEq)]
pub struct DatasetRequest {
    pub data_root: PathBuf,
    pub template_file: Option<PathBuf>,
    pub width: usize,
    pub height: usize,
    pub repeats: usize,
}

impl From<&TrainingConfig> for DatasetRequest {
    fn from(config: &TrainingConfig) -> Self {
        Self {
            data_root: config.data_root.clone(),
            template_file: config.template_file.clone(),
            width: config.width,
            height: config.height,
            repeats: config.image_repeats_per_epoch,
        }
    }
}

/// Builds datasets, encoding images and captions with the model's stages
pub trait DatasetLoader {
    type Dataset: TrainingDataset;

    fn prepare(&mut self, request: &DatasetRequest) -> Result<Self::Dataset>;
}

/// The diffusion model a hypernetwork is trained against
pub trait DiffusionModel {
    /// Denoising loss for one sample with the hypernetwork applied through `ctx`
    ///
    /// The returned tensor must be differentiable with respect to the
    /// hypernetwork's trainables.
    fn training_loss(
        &mut self,
        latent: &Tensor,
        cond: &Tensor,
        ctx: &HypernetworkContext<'_>,
    ) -> Result<Tensor>;

    /// Move the conditioning and decoding stages off the compute device
    fn offload_auxiliary(&mut self) -> Result<()> {
        Ok(())
    }

    /// Bring the conditioning and decoding stages back
    fn restore_auxiliary(&mut self) -> Result<()> {
        Ok(())
    }

    /// Render a preview; `None` when the model produced no image
    fn render_preview(
        &mut self,
        request: &PreviewRequest,
        ctx: &HypernetworkContext<'_>,
    ) -> Result<Option<GeneratedImage>>;

    /// Identity of the loaded base checkpoint
    fn checkpoint(&self) -> CheckpointInfo;
}

/// Stage of a training run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainingPhase {
    Initializing,
    PreparingDataset,
    Training,
    Checkpointing,
    Previewing,
    Finalizing,
}

/// Progress after one optimizer step
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepReport {
    /// Zero-based step just trained
    pub step: u64,
    /// Step the run trains up to
    pub max_steps: u64,
    /// One-based epoch
    pub epoch: u64,
    /// One-based step within the epoch
    pub epoch_step: u64,
    /// Mean of the recent loss window
    pub loss: f64,
    pub learn_rate: f64,
}

/// Receives progress notifications
pub trait ProgressObserver {
    fn on_phase(&mut self, _phase: TrainingPhase) {}

    fn on_step(&mut self, _report: &StepReport) {}
}

impl ProgressObserver for () {}
