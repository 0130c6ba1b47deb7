//! Training configuration

use std::path::{Path, PathBuf};

use hypertune_net::DEFAULT_STRENGTH;
use serde::{Deserialize, Serialize};

use crate::preview::PreviewRequest;
use crate::{Result, TrainError};

/// Settings for one training run
///
/// Cadences (`*_every`) of zero or less disable the corresponding side effect.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Registry name of the hypernetwork to train
    pub hypernetwork_name: String,
    /// Learning rate schedule, e.g. `"0.00005:100, 0.00001:1000, 0.000005"`
    pub learn_rate: String,
    /// Directory with training images
    pub data_root: PathBuf,
    /// Root for dated run logs, checkpoints and previews
    pub log_directory: PathBuf,
    /// Train until the hypernetwork's step counter passes this
    pub steps: u64,
    /// Render a preview every N steps
    pub create_image_every: i64,
    /// Save a checkpoint every N steps
    pub save_hypernetwork_every: i64,
    /// Append to the loss log every N steps
    pub write_csv_every: i64,
    /// Prompt template file for the dataset
    pub template_file: Option<PathBuf>,
    /// Fixed preview settings; previews use the current caption when absent
    pub preview: Option<PreviewRequest>,
    /// Keep conditioning/decoding stages offloaded between previews
    pub unload_models_when_training: bool,
    /// How often each image is repeated per epoch
    pub image_repeats_per_epoch: usize,
    /// Training image width
    pub width: usize,
    /// Training image height
    pub height: usize,
    /// Strength the hypernetwork is trained at
    pub strength: f64,
}

impl TrainingConfig {
    /// Configuration for training `name` with defaults for everything else
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            hypernetwork_name: name.into(),
            ..Default::default()
        }
    }

    /// Load from a JSON file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        serde_json::from_str(&content).map_err(|e| TrainError::Config(e.to_string()))
    }

    /// Save as pretty-printed JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let json =
            serde_json::to_string_pretty(self).map_err(|e| TrainError::Config(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            hypernetwork_name: String::new(),
            learn_rate: "0.00001".to_string(),
            data_root: PathBuf::from("train"),
            log_directory: PathBuf::from("logs"),
            steps: 100_000,
            create_image_every: 500,
            save_hypernetwork_every: 500,
            write_csv_every: 500,
            template_file: None,
            preview: None,
            unload_models_when_training: false,
            image_repeats_per_epoch: 1,
            width: 512,
            height: 512,
            strength: DEFAULT_STRENGTH,
        }
    }
}

/// Whether a cadence of `every` fires at `step`
pub(crate) fn is_due(every: i64, step: u64) -> bool {
    every > 0 && step % every as u64 == 0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = TrainingConfig::new("anime");
        assert_eq!(config.hypernetwork_name, "anime");
        assert_eq!(config.steps, 100_000);
        assert!(config.preview.is_none());
        assert_eq!(config.strength, 1.0);
    }

    #[test]
    fn test_partial_json() {
        let config: TrainingConfig = serde_json::from_str(
            r#"{
                "hypernetwork_name": "anime",
                "steps": 2000,
                "create_image_every": 0,
                "preview": { "prompt": "a castle", "seed": 42 }
            }"#,
        )
        .unwrap();

        assert_eq!(config.steps, 2000);
        assert_eq!(config.create_image_every, 0);
        assert_eq!(config.save_hypernetwork_every, 500);

        let preview = config.preview.unwrap();
        assert_eq!(preview.prompt, "a castle");
        assert_eq!(preview.seed, 42);
        assert_eq!(preview.steps, 20);
    }

    #[test]
    fn test_file_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("train.json");

        let mut config = TrainingConfig::new("anime");
        config.learn_rate = "0.005:100, 0.0005".to_string();
        config.save(&path).unwrap();

        let loaded = TrainingConfig::from_file(&path).unwrap();
        assert_eq!(loaded.hypernetwork_name, "anime");
        assert_eq!(loaded.learn_rate, "0.005:100, 0.0005");
    }

    #[test]
    fn test_invalid_json() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("train.json");
        std::fs::write(&path, "{ not json").unwrap();

        assert!(matches!(
            TrainingConfig::from_file(&path),
            Err(TrainError::Config(_))
        ));
    }

    #[test]
    fn test_is_due() {
        assert!(is_due(5, 10));
        assert!(!is_due(5, 11));
        assert!(is_due(1, 0));
        assert!(!is_due(0, 10));
        assert!(!is_due(-3, 9));
    }
}
