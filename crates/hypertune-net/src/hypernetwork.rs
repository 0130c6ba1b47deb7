//! Hypernetwork container and file format
//!
//! A hypernetwork maps attention context widths to a pair of
//! [`ModuleBlock`]s, one transforming the context fed to the key
//! projection and one for the value projection.
//!
//! # File Format
//!
//! Hypernetworks are stored as a single safetensors file:
//!
//! ```text
//! 768.k.linear.0.weight    [1536, 768]
//! 768.k.linear.0.bias      [1536]
//! 768.k.linear.1.weight    [768, 1536]
//! ...
//! 768.v.linear.0.weight    [1536, 768]
//! ...
//! __metadata__: { step, name, sd_checkpoint, sd_checkpoint_name }
//! ```
//!
//! Layer widths are not recorded; they are read back from the tensor shapes.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor, Var};
use safetensors::SafeTensors;
use tracing::debug;

use crate::block::ModuleBlock;
use crate::{HypernetError, Result};

/// File extension of hypernetwork files
pub const HYPERNETWORK_EXTENSION: &str = "safetensors";

/// Multiplier sequence for newly created hypernetworks
pub const DEEP_MULTIPLIERS: [f64; 6] = [1.0, 2.0, 4.0, 2.0, 4.0, 1.0];

const STEP_KEY: &str = "step";
const NAME_KEY: &str = "name";
const CHECKPOINT_KEY: &str = "sd_checkpoint";
const CHECKPOINT_NAME_KEY: &str = "sd_checkpoint_name";

const KEY_TAG: &str = "k";
const VALUE_TAG: &str = "v";

/// Key-path and value-path blocks for one feature dimension
#[derive(Debug, Clone)]
pub struct BlockPair {
    pub key: ModuleBlock,
    pub value: ModuleBlock,
}

impl BlockPair {
    pub fn new(key: ModuleBlock, value: ModuleBlock) -> Self {
        Self { key, value }
    }

    /// Two freshly initialized blocks of the same shape
    pub fn random(dim: usize, multipliers: Option<&[f64]>, device: &Device) -> Result<Self> {
        Ok(Self::new(
            ModuleBlock::random(dim, multipliers, device)?,
            ModuleBlock::random(dim, multipliers, device)?,
        ))
    }

    pub fn trainables(&self) -> Vec<Var> {
        let mut vars = self.key.trainables();
        vars.extend(self.value.trainables());
        vars
    }
}

/// Base model checkpoint a hypernetwork was trained against
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckpointInfo {
    /// Short content hash of the checkpoint
    pub hash: String,
    /// Human-readable model name
    pub model_name: String,
}

impl CheckpointInfo {
    pub fn new(hash: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            hash: hash.into(),
            model_name: model_name.into(),
        }
    }
}

/// A set of block pairs keyed by attention context width
#[derive(Debug, Clone)]
pub struct Hypernetwork {
    /// Identifier; derived from the file name on load if unset
    pub name: Option<String>,
    /// File this hypernetwork was last loaded from
    pub filename: Option<PathBuf>,
    /// Training step counter
    pub step: u64,
    /// Hash of the base checkpoint used for training
    pub sd_checkpoint: Option<String>,
    /// Name of the base checkpoint used for training
    pub sd_checkpoint_name: Option<String>,
    layers: BTreeMap<usize, BlockPair>,
    device: Device,
}

impl Hypernetwork {
    /// Create an empty hypernetwork
    pub fn new(name: Option<String>, device: &Device) -> Self {
        Self {
            name,
            filename: None,
            step: 0,
            sd_checkpoint: None,
            sd_checkpoint_name: None,
            layers: BTreeMap::new(),
            device: device.clone(),
        }
    }

    /// Create a hypernetwork with fresh blocks for each of `sizes`
    ///
    /// Blocks default to [`DEEP_MULTIPLIERS`].
    pub fn with_sizes(
        name: impl Into<String>,
        sizes: &[usize],
        multipliers: Option<&[f64]>,
        device: &Device,
    ) -> Result<Self> {
        let multipliers = multipliers.unwrap_or(&DEEP_MULTIPLIERS);
        let mut hypernetwork = Self::new(Some(name.into()), device);

        for &size in sizes {
            hypernetwork.insert(size, BlockPair::random(size, Some(multipliers), device)?);
        }

        Ok(hypernetwork)
    }

    /// Load a hypernetwork from a file
    pub fn from_file(path: impl AsRef<Path>, device: &Device) -> Result<Self> {
        let mut hypernetwork = Self::new(None, device);
        hypernetwork.load(path)?;
        Ok(hypernetwork)
    }

    /// Name, or an empty string when unnamed
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or("")
    }

    /// Device the blocks live on
    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Block pair for a feature dimension
    pub fn blocks(&self, dim: usize) -> Option<&BlockPair> {
        self.layers.get(&dim)
    }

    /// All block pairs, ascending by dimension
    pub fn layers(&self) -> impl Iterator<Item = (usize, &BlockPair)> {
        self.layers.iter().map(|(&dim, pair)| (dim, pair))
    }

    /// Feature dimensions with a block pair
    pub fn dims(&self) -> Vec<usize> {
        self.layers.keys().copied().collect()
    }

    /// Add or replace the pair for a dimension
    pub fn insert(&mut self, dim: usize, pair: BlockPair) -> Option<BlockPair> {
        self.layers.insert(dim, pair)
    }

    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }

    /// Every trainable tensor of every block
    pub fn trainables(&self) -> Vec<Var> {
        self.layers.values().flat_map(BlockPair::trainables).collect()
    }

    /// Total number of scalar parameters
    pub fn parameter_count(&self) -> usize {
        self.layers
            .values()
            .map(|pair| pair.key.parameter_count() + pair.value.parameter_count())
            .sum()
    }

    /// Write the hypernetwork to `path`
    ///
    /// The file is written in place; an interrupted write leaves it truncated.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let mut tensors: Vec<(String, Tensor)> = Vec::new();
        for (dim, pair) in &self.layers {
            for (tag, block) in [(KEY_TAG, &pair.key), (VALUE_TAG, &pair.value)] {
                for (key, tensor) in block.state_dict() {
                    tensors.push((format!("{dim}.{tag}.{key}"), tensor));
                }
            }
        }

        let mut metadata = HashMap::new();
        metadata.insert(STEP_KEY.to_string(), self.step.to_string());
        if let Some(name) = &self.name {
            metadata.insert(NAME_KEY.to_string(), name.clone());
        }
        if let Some(hash) = &self.sd_checkpoint {
            metadata.insert(CHECKPOINT_KEY.to_string(), hash.clone());
        }
        if let Some(model_name) = &self.sd_checkpoint_name {
            metadata.insert(CHECKPOINT_NAME_KEY.to_string(), model_name.clone());
        }

        safetensors::serialize_to_file(tensors, &Some(metadata), path).map_err(|e| {
            HypernetError::Write {
                path: path.to_path_buf(),
                reason: e.to_string(),
            }
        })?;

        debug!(path = %path.display(), step = self.step, "Saved hypernetwork");
        Ok(())
    }

    /// Restore block pairs and metadata from `path`
    ///
    /// Pairs found in the file replace existing pairs of the same dimension.
    /// Nothing is modified unless the whole file loads.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let file_format = |reason: String| HypernetError::FileFormat {
            path: path.to_path_buf(),
            reason,
        };

        let buffer = std::fs::read(path)?;
        let (_, header) =
            SafeTensors::read_metadata(&buffer).map_err(|e| file_format(e.to_string()))?;
        let tensors = candle_core::safetensors::load_buffer(&buffer, &self.device)
            .map_err(|e| file_format(e.to_string()))?;
        let metadata = header.metadata().clone().unwrap_or_default();

        let mut grouped: BTreeMap<usize, [HashMap<String, Tensor>; 2]> = BTreeMap::new();
        for (key, tensor) in tensors {
            let Some((dim, tag, block_key)) = split_key(&key) else {
                debug!(key = %key, "Ignoring non-layer tensor");
                continue;
            };
            let slot = match tag {
                KEY_TAG => 0,
                VALUE_TAG => 1,
                _ => {
                    debug!(key = %key, "Ignoring tensor with unknown path tag");
                    continue;
                }
            };
            grouped.entry(dim).or_default()[slot].insert(block_key.to_string(), tensor);
        }

        let mut layers = BTreeMap::new();
        for (dim, [key_weights, value_weights]) in grouped {
            let pair = BlockPair::new(
                ModuleBlock::from_weights(dim, &key_weights, &self.device)?,
                ModuleBlock::from_weights(dim, &value_weights, &self.device)?,
            );
            layers.insert(dim, pair);
        }

        let step = match metadata.get(STEP_KEY) {
            Some(step) => step
                .parse()
                .map_err(|_| file_format(format!("invalid step '{step}'")))?,
            None => 0,
        };

        self.filename = Some(path.to_path_buf());
        if self.name.is_none() {
            self.name = path
                .file_stem()
                .map(|stem| stem.to_string_lossy().into_owned());
        }
        if let Some(name) = metadata.get(NAME_KEY) {
            self.name = Some(name.clone());
        }
        self.step = step;
        self.sd_checkpoint = metadata.get(CHECKPOINT_KEY).cloned();
        self.sd_checkpoint_name = metadata.get(CHECKPOINT_NAME_KEY).cloned();
        self.layers.extend(layers);

        Ok(())
    }

    /// Record the base checkpoint this hypernetwork was trained against
    pub fn stamp_checkpoint(&mut self, checkpoint: &CheckpointInfo) {
        self.sd_checkpoint = Some(checkpoint.hash.clone());
        self.sd_checkpoint_name = Some(checkpoint.model_name.clone());
    }
}

/// Split `"768.k.linear.0.weight"` into `(768, "k", "linear.0.weight")`
fn split_key(key: &str) -> Option<(usize, &str, &str)> {
    let (dim, rest) = key.split_once('.')?;
    let dim = dim.parse().ok()?;
    let (tag, block_key) = rest.split_once('.')?;
    Some((dim, tag, block_key))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn weights_equal(a: &Hypernetwork, b: &Hypernetwork) -> bool {
        a.dims() == b.dims()
            && a.layers().zip(b.layers()).all(|((_, pa), (_, pb))| {
                [(&pa.key, &pb.key), (&pa.value, &pb.value)]
                    .into_iter()
                    .all(|(x, y)| {
                        let sx = x.state_dict();
                        let sy = y.state_dict();
                        sx.len() == sy.len()
                            && sx.iter().all(|(k, t)| {
                                let u = &sy[k];
                                t.flatten_all().unwrap().to_vec1::<f32>().unwrap()
                                    == u.flatten_all().unwrap().to_vec1::<f32>().unwrap()
                            })
                    })
            })
    }

    #[test]
    fn test_split_key() {
        assert_eq!(
            split_key("768.k.linear.0.weight"),
            Some((768, "k", "linear.0.weight"))
        );
        assert_eq!(split_key("step"), None);
        assert_eq!(split_key("name.k.linear"), None);
    }

    #[test]
    fn test_with_sizes() {
        let hn = Hypernetwork::with_sizes("test", &[320, 768], None, &Device::Cpu).unwrap();
        assert_eq!(hn.dims(), vec![320, 768]);
        assert_eq!(
            hn.blocks(768).unwrap().key.shape().multipliers(),
            &DEEP_MULTIPLIERS
        );
        assert!(hn.blocks(1024).is_none());
        // 5 layers, weight + bias, two blocks, two sizes
        assert_eq!(hn.trainables().len(), 5 * 2 * 2 * 2);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("roundtrip.safetensors");

        let multipliers = [1.0, 2.0, 1.0];
        let mut hn =
            Hypernetwork::with_sizes("anime", &[768, 1024], Some(&multipliers), &Device::Cpu)
                .unwrap();
        hn.step = 1234;
        hn.stamp_checkpoint(&CheckpointInfo::new("7460a6fa", "sd-v1-4"));
        hn.save(&path).unwrap();

        let loaded = Hypernetwork::from_file(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.name(), "anime");
        assert_eq!(loaded.step, 1234);
        assert_eq!(loaded.sd_checkpoint.as_deref(), Some("7460a6fa"));
        assert_eq!(loaded.sd_checkpoint_name.as_deref(), Some("sd-v1-4"));
        assert_eq!(loaded.filename.as_deref(), Some(path.as_path()));
        assert!(weights_equal(&hn, &loaded));
    }

    #[test]
    fn test_load_defaults_name_from_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("unnamed.safetensors");

        let hn = Hypernetwork::with_sizes("ignored", &[16], None, &Device::Cpu).unwrap();
        let mut anonymous = hn.clone();
        anonymous.name = None;
        anonymous.save(&path).unwrap();

        let loaded = Hypernetwork::from_file(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.name(), "unnamed");
        assert_eq!(loaded.step, 0);
        assert!(loaded.sd_checkpoint.is_none());
        assert!(loaded.sd_checkpoint_name.is_none());
    }

    #[test]
    fn test_load_mixed_depths() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("mixed.safetensors");

        let mut hn = Hypernetwork::new(Some("mixed".into()), &Device::Cpu);
        hn.insert(8, BlockPair::random(8, Some(&[1.0, 2.0, 1.0]), &Device::Cpu).unwrap());
        hn.insert(16, BlockPair::random(16, Some(&DEEP_MULTIPLIERS), &Device::Cpu).unwrap());
        hn.save(&path).unwrap();

        let loaded = Hypernetwork::from_file(&path, &Device::Cpu).unwrap();
        assert_eq!(
            loaded.blocks(8).unwrap().key.shape().multipliers(),
            &[1.0, 2.0, 1.0]
        );
        assert_eq!(
            loaded.blocks(16).unwrap().value.shape().multipliers(),
            &DEEP_MULTIPLIERS
        );
    }

    #[test]
    fn test_fractional_multipliers_roundtrip() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("frac.safetensors");

        let hn = Hypernetwork::with_sizes("frac", &[11], Some(&[1.0, 1.4, 1.0]), &Device::Cpu)
            .unwrap();
        hn.save(&path).unwrap();

        let loaded = Hypernetwork::from_file(&path, &Device::Cpu).unwrap();
        assert_eq!(loaded.blocks(11).unwrap().key.shape().widths(), &[11, 15, 11]);
        assert!(weights_equal(&hn, &loaded));
    }

    #[test]
    fn test_empty_hypernetwork() {
        let mut hn = Hypernetwork::new(Some("empty".into()), &Device::Cpu);
        assert!(hn.is_empty());
        assert_eq!(hn.parameter_count(), 0);

        hn.insert(8, BlockPair::random(8, None, &Device::Cpu).unwrap());
        assert!(!hn.is_empty());
    }

    #[test]
    fn test_corrupt_file_is_file_format_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("corrupt.safetensors");
        std::fs::write(&path, b"definitely not safetensors").unwrap();

        let mut hn = Hypernetwork::new(Some("keep".into()), &Device::Cpu);
        let result = hn.load(&path);

        assert!(matches!(result, Err(HypernetError::FileFormat { .. })));
        assert!(hn.filename.is_none());
        assert_eq!(hn.name(), "keep");
    }

    #[test]
    fn test_missing_file_is_error() {
        let result = Hypernetwork::from_file("/nonexistent/nothing.safetensors", &Device::Cpu);
        assert!(matches!(result, Err(HypernetError::Io(_))));
    }
}
