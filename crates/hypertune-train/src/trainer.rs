//! Hypernetwork training loop

use std::path::{Path, PathBuf};

use candle_core::DType;
use candle_nn::{AdamW, Optimizer, ParamsAdamW};
use hypertune_net::{Hypernetwork, HypernetworkContext};
use hypertune_registry::{ActiveHypernetwork, HypernetworkRegistry};
use tracing::{debug, info, span, Level};

use crate::config::{is_due, TrainingConfig};
use crate::interrupt::InterruptFlag;
use crate::loss::{LossLog, LossRecord, LossWindow};
use crate::model::{
    DatasetLoader, DatasetRequest, DiffusionModel, ProgressObserver, StepReport, TrainingDataset,
    TrainingPhase,
};
use crate::preview::PreviewRequest;
use crate::schedule::LearnRateScheduler;
use crate::{Result, TrainError};

const CHECKPOINT_DIR: &str = "hypernetworks";
const IMAGES_DIR: &str = "images";

/// Result of a finished (or skipped) run
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingOutcome {
    /// Where the trained hypernetwork lives
    pub output_path: PathBuf,
    /// Step counter of the hypernetwork when the run ended
    pub final_step: u64,
    /// Optimizer steps taken in this run
    pub steps_trained: u64,
    pub interrupted: bool,
    /// Mean of the recent loss window, 0 when nothing was trained
    pub mean_loss: f64,
}

/// Where one run writes and what it trains at
struct RunPlan<'a> {
    name: &'a str,
    run_dir: PathBuf,
    checkpoint_dir: PathBuf,
    images_dir: PathBuf,
    strength: f64,
}

/// What the step loop did
struct StepSummary {
    steps_trained: u64,
    interrupted: bool,
    mean_loss: f64,
}

/// Trains the hypernetwork named in its configuration
pub struct HypernetworkTrainer {
    config: TrainingConfig,
    interrupt: InterruptFlag,
}

impl HypernetworkTrainer {
    pub fn new(config: TrainingConfig) -> Self {
        Self {
            config,
            interrupt: InterruptFlag::new(),
        }
    }

    /// Use an existing interrupt flag
    pub fn with_interrupt(mut self, interrupt: InterruptFlag) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    /// Handle for stopping a running `train` call
    pub fn interrupt_flag(&self) -> InterruptFlag {
        self.interrupt.clone()
    }

    /// Today's log directory for `name`: `<log_directory>/<YYYY-MM-DD>/<name>`
    pub fn run_directory(&self, name: &str) -> PathBuf {
        let date = chrono::Local::now().format("%Y-%m-%d").to_string();
        self.config.log_directory.join(date).join(name)
    }

    /// Train the configured hypernetwork until its step counter passes
    /// `steps`, the schedule runs out, or the interrupt flag is raised
    ///
    /// The hypernetwork is loaded into `active` and stays there afterwards.
    /// The result is written back to the file the registry resolved the name
    /// to. An interrupted run still stamps and saves that file.
    pub fn train<M, L, P>(
        &self,
        registry: &HypernetworkRegistry,
        active: &mut ActiveHypernetwork,
        model: &mut M,
        datasets: &mut L,
        progress: &mut P,
    ) -> Result<TrainingOutcome>
    where
        M: DiffusionModel,
        L: DatasetLoader,
        P: ProgressObserver,
    {
        let config = &self.config;
        let name = config.hypernetwork_name.as_str();

        progress.on_phase(TrainingPhase::Initializing);
        if name.is_empty() {
            return Err(TrainError::NoHypernetworkSelected);
        }

        let span = span!(Level::INFO, "train_hypernetwork", name);
        let _enter = span.enter();

        let output_path = registry.resolve(name)?.to_path_buf();

        active.set_strength(Some(config.strength));
        let strength = active.strength();
        let hypernetwork = active.load_path(&output_path)?;

        let initial_step = hypernetwork.step;
        if initial_step >= config.steps {
            info!(
                step = initial_step,
                steps = config.steps,
                "Hypernetwork already trained to the requested step"
            );
            return Ok(TrainingOutcome {
                output_path,
                final_step: initial_step,
                steps_trained: 0,
                interrupted: false,
                mean_loss: 0.0,
            });
        }

        let scheduler = LearnRateScheduler::new(&config.learn_rate, config.steps, initial_step)?;

        let run_dir = self.run_directory(name);
        let plan = RunPlan {
            name,
            checkpoint_dir: run_dir.join(CHECKPOINT_DIR),
            images_dir: run_dir.join(IMAGES_DIR),
            run_dir,
            strength,
        };
        std::fs::create_dir_all(&plan.run_dir)?;
        if config.save_hypernetwork_every > 0 {
            std::fs::create_dir_all(&plan.checkpoint_dir)?;
        }
        if config.create_image_every > 0 {
            std::fs::create_dir_all(&plan.images_dir)?;
        }

        progress.on_phase(TrainingPhase::PreparingDataset);
        info!(data_root = %config.data_root.display(), "Preparing dataset");
        let mut dataset = datasets.prepare(&DatasetRequest::from(config))?;
        if dataset.is_empty() {
            return Err(TrainError::EmptyDataset(config.data_root.clone()));
        }

        if config.unload_models_when_training {
            model.offload_auxiliary()?;
        }

        let steps = self.run_steps(&plan, hypernetwork, scheduler, model, &mut dataset, progress);

        // Stages come back even when the loop failed
        let restored = if config.unload_models_when_training {
            model.restore_auxiliary()
        } else {
            Ok(())
        };
        let summary = steps?;
        restored?;

        progress.on_phase(TrainingPhase::Finalizing);
        save_stamped(hypernetwork, model, &output_path)?;

        info!(
            step = hypernetwork.step,
            steps_trained = summary.steps_trained,
            interrupted = summary.interrupted,
            path = %output_path.display(),
            "Saved hypernetwork"
        );

        Ok(TrainingOutcome {
            output_path,
            final_step: hypernetwork.step,
            steps_trained: summary.steps_trained,
            interrupted: summary.interrupted,
            mean_loss: summary.mean_loss,
        })
    }

    /// Optimizer loop with its cadenced checkpoints, loss log and previews
    ///
    /// Leaves the auxiliary stages offloaded when they were offloaded on entry,
    /// also on error.
    fn run_steps<M, D, P>(
        &self,
        plan: &RunPlan<'_>,
        hypernetwork: &mut Hypernetwork,
        mut scheduler: LearnRateScheduler,
        model: &mut M,
        dataset: &mut D,
        progress: &mut P,
    ) -> Result<StepSummary>
    where
        M: DiffusionModel,
        D: TrainingDataset,
        P: ProgressObserver,
    {
        let config = &self.config;
        let name = plan.name;
        let initial_step = hypernetwork.step;
        let dataset_len = dataset.len();

        let mut optimizer = AdamW::new(
            hypernetwork.trainables(),
            ParamsAdamW {
                lr: scheduler.learn_rate(),
                beta1: 0.9,
                beta2: 0.999,
                eps: 1e-8,
                weight_decay: 0.01,
            },
        )?;

        info!(
            initial_step,
            steps = config.steps,
            samples = dataset_len,
            parameters = hypernetwork.parameter_count(),
            run_dir = %plan.run_dir.display(),
            "Training hypernetwork"
        );
        progress.on_phase(TrainingPhase::Training);

        let loss_log = LossLog::in_dir(&plan.run_dir);
        let mut window = LossWindow::new();
        let mut steps_trained = 0u64;
        let mut interrupted = false;

        for i in 0u64.. {
            let step = initial_step + i;
            hypernetwork.step = step;

            scheduler.apply(&mut optimizer, step);
            if scheduler.is_finished() {
                break;
            }
            if self.interrupt.is_interrupted() {
                info!(step, "Training interrupted");
                interrupted = true;
                break;
            }

            let sample = dataset.get((i % dataset_len as u64) as usize)?;
            let ctx = HypernetworkContext::new(Some(&*hypernetwork), plan.strength);

            let loss = model
                .training_loss(&sample.latent, &sample.cond, &ctx)?
                .mean_all()?;
            optimizer.backward_step(&loss)?;
            steps_trained += 1;

            window.record(step, loss.to_dtype(DType::F64)?.to_scalar::<f64>()?);
            let mean_loss = window.mean();
            let record = LossRecord::new(step, dataset_len, mean_loss, scheduler.learn_rate());

            debug!(step, loss = mean_loss, learn_rate = record.learn_rate, "Step");
            progress.on_step(&StepReport {
                step,
                max_steps: config.steps,
                epoch: record.epoch,
                epoch_step: record.epoch_step,
                loss: mean_loss,
                learn_rate: record.learn_rate,
            });

            if step > 0 && is_due(config.save_hypernetwork_every, step) {
                progress.on_phase(TrainingPhase::Checkpointing);
                let path = plan.checkpoint_dir.join(format!("{name}-{step}.safetensors"));
                save_stamped(hypernetwork, model, &path)?;
                info!(step, path = %path.display(), "Saved checkpoint");
                progress.on_phase(TrainingPhase::Training);
            }

            if is_due(config.write_csv_every, step) {
                loss_log.append(&record)?;
            }

            if step > 0 && is_due(config.create_image_every, step) {
                progress.on_phase(TrainingPhase::Previewing);
                let request = match &config.preview {
                    Some(preview) => preview.clone(),
                    None => PreviewRequest {
                        width: config.width,
                        height: config.height,
                        ..PreviewRequest::from_caption(sample.caption.clone())
                    },
                };

                if config.unload_models_when_training {
                    model.restore_auxiliary()?;
                }
                let ctx = HypernetworkContext::new(Some(&*hypernetwork), plan.strength);
                let image = model.render_preview(&request, &ctx);
                if config.unload_models_when_training {
                    model.offload_auxiliary()?;
                }

                if let Some(image) = image? {
                    let path = plan.images_dir.join(format!("{name}-{step}.png"));
                    image.save(&path)?;
                    info!(step, prompt = %request.prompt, path = %path.display(), "Saved preview");
                }
                progress.on_phase(TrainingPhase::Training);
            }
        }

        Ok(StepSummary {
            steps_trained,
            interrupted,
            mean_loss: window.mean(),
        })
    }
}

/// Record the model's checkpoint identity and write the hypernetwork
fn save_stamped<M: DiffusionModel>(
    hypernetwork: &mut Hypernetwork,
    model: &M,
    path: &Path,
) -> Result<()> {
    hypernetwork.stamp_checkpoint(&model.checkpoint());
    hypernetwork.save(path)?;
    Ok(())
}
