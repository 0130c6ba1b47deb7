//! Residual feed-forward block applied to attention context
//!
//! A [`ModuleBlock`] is a chain of linear layers whose widths follow a
//! multiplier sequence scaled by the feature dimension:
//!
//! ```text
//! dim=768, multipliers=[1, 2, 1]  ->  768 -> 1536 -> 768
//! ```
//!
//! The sequence must start and end at 1, so the output can be added back
//! onto the input: `y = x + chain(x) * strength`.

use std::collections::HashMap;

use candle_core::{DType, Device, Module, Tensor, Var};
use candle_nn::Linear;
use tracing::{debug, warn};

use crate::{HypernetError, Result};

/// Multiplier sequence used when nothing else is known: one hidden layer of double width
pub const DEFAULT_MULTIPLIERS: [f64; 3] = [1.0, 2.0, 1.0];

/// Standard deviation of freshly initialized weights
pub const INIT_STD: f32 = 0.01;

/// Key names of the pre-sequence format, which always had exactly two layers
const LEGACY_LAYERS: [&str; 2] = ["linear1", "linear2"];

/// Where a block's layer widths come from
#[derive(Debug, Clone, PartialEq)]
pub enum ShapeSpec {
    /// No stored weights and no explicit request
    Default,
    /// Requested by the caller; always wins over stored weights
    Explicit(Vec<f64>),
    /// Widths of stored `linear.{i}.weight` tensors, input width first
    Inferred(Vec<usize>),
}

impl ShapeSpec {
    /// Pick the shape source for a block
    pub fn select(
        dim: usize,
        weights: Option<&HashMap<String, Tensor>>,
        explicit: Option<&[f64]>,
    ) -> Self {
        match (explicit, weights) {
            (Some(sequence), _) => Self::Explicit(sequence.to_vec()),
            (None, Some(weights)) if weights.contains_key(&layer_key(0, "weight")) => {
                Self::Inferred(infer_widths(dim, weights))
            }
            _ => Self::Default,
        }
    }

    /// Resolve into a concrete layer shape for `dim`
    pub fn resolve(&self, dim: usize) -> Result<LayerShape> {
        match self {
            Self::Default => LayerShape::new(dim, DEFAULT_MULTIPLIERS.to_vec()),
            Self::Explicit(sequence) => LayerShape::new(dim, sequence.clone()),
            Self::Inferred(widths) => LayerShape::from_widths(dim, widths.clone()),
        }
    }
}

/// Read the layer widths out of stored weights
///
/// Walks `linear.0.weight`, `linear.1.weight`, ... until a key is missing and
/// collects each layer's output width after the input width `dim`.
pub fn infer_widths(dim: usize, weights: &HashMap<String, Tensor>) -> Vec<usize> {
    let mut widths = vec![dim];
    let mut index = 0;

    while let Some(weight) = weights.get(&layer_key(index, "weight")) {
        widths.push(weight.dims().first().copied().unwrap_or(0));
        index += 1;
    }

    widths
}

/// Resolved, immutable layer widths of a block
#[derive(Debug, Clone, PartialEq)]
pub struct LayerShape {
    dim: usize,
    multipliers: Vec<f64>,
    widths: Vec<usize>,
}

impl LayerShape {
    /// Validate a multiplier sequence against a feature dimension
    ///
    /// Widths are `dim * multiplier`, truncated.
    pub fn new(dim: usize, multipliers: Vec<f64>) -> Result<Self> {
        let widths = multipliers
            .iter()
            .map(|m| (dim as f64 * m) as usize)
            .collect();
        Self::checked(dim, multipliers, widths)
    }

    /// Shape with exact widths, e.g. read back from stored tensors
    ///
    /// Multipliers are `width / dim`, so fractional ones keep their widths.
    pub fn from_widths(dim: usize, widths: Vec<usize>) -> Result<Self> {
        let multipliers = widths.iter().map(|&w| w as f64 / dim as f64).collect();
        Self::checked(dim, multipliers, widths)
    }

    fn checked(dim: usize, multipliers: Vec<f64>, widths: Vec<usize>) -> Result<Self> {
        let invalid = |reason| HypernetError::InvalidMultipliers {
            sequence: multipliers.clone(),
            reason,
        };

        if multipliers.len() < 2 {
            return Err(invalid("need at least two entries"));
        }
        if multipliers[0] != 1.0 {
            return Err(invalid("sequence should start with size 1"));
        }
        if multipliers[multipliers.len() - 1] != 1.0 {
            return Err(invalid("sequence should end with size 1"));
        }
        if widths.iter().any(|&w| w == 0) {
            return Err(invalid("every layer needs a non-zero width"));
        }

        Ok(Self {
            dim,
            multipliers,
            widths,
        })
    }

    /// Base feature dimension
    pub fn dim(&self) -> usize {
        self.dim
    }

    /// Multiplier sequence
    pub fn multipliers(&self) -> &[f64] {
        &self.multipliers
    }

    /// Width at every point of the chain, input first
    pub fn widths(&self) -> &[usize] {
        &self.widths
    }

    /// Number of linear layers
    pub fn num_layers(&self) -> usize {
        self.widths.len() - 1
    }

    /// `(in_width, out_width)` of each layer
    pub fn layer_dims(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.widths.windows(2).map(|w| (w[0], w[1]))
    }
}

/// One linear layer with trainable weight and bias
#[derive(Debug, Clone)]
struct LinearLayer {
    /// `[out, in]`
    weight: Var,
    /// `[out]`
    bias: Var,
}

impl LinearLayer {
    fn random(in_width: usize, out_width: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            weight: Var::randn(0f32, INIT_STD, (out_width, in_width), device)?,
            bias: Var::zeros(out_width, DType::F32, device)?,
        })
    }

    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let linear = Linear::new(
            self.weight.as_tensor().clone(),
            Some(self.bias.as_tensor().clone()),
        );
        Ok(linear.forward(x)?)
    }
}

/// Residual feed-forward transform for attention context vectors
#[derive(Debug, Clone)]
pub struct ModuleBlock {
    shape: LayerShape,
    layers: Vec<LinearLayer>,
}

impl ModuleBlock {
    /// Create a block
    ///
    /// # Arguments
    /// * `dim` - Feature dimension of the context this block transforms
    /// * `weights` - Stored weights to restore, keyed `linear.{i}.weight` / `linear.{i}.bias`
    ///   (or the legacy `linear1.*` / `linear2.*`)
    /// * `multipliers` - Explicit width schedule; inferred from `weights` when absent
    /// * `device` - Device the weights live on
    pub fn new(
        dim: usize,
        weights: Option<&HashMap<String, Tensor>>,
        multipliers: Option<&[f64]>,
        device: &Device,
    ) -> Result<Self> {
        let shape = ShapeSpec::select(dim, weights, multipliers).resolve(dim)?;

        let layers = shape
            .layer_dims()
            .map(|(in_width, out_width)| LinearLayer::random(in_width, out_width, device))
            .collect::<Result<Vec<_>>>()?;

        let block = Self { shape, layers };

        if let Some(weights) = weights {
            if let Err(err) = block.load_state(weights) {
                warn!(dim, error = %err, "State mismatch, trying legacy two-layer format");
                block.load_legacy(weights)?;
            }
        }

        Ok(block)
    }

    /// Create a freshly initialized block
    pub fn random(dim: usize, multipliers: Option<&[f64]>, device: &Device) -> Result<Self> {
        Self::new(dim, None, multipliers, device)
    }

    /// Restore a block from stored weights, inferring its shape
    pub fn from_weights(
        dim: usize,
        weights: &HashMap<String, Tensor>,
        device: &Device,
    ) -> Result<Self> {
        Self::new(dim, Some(weights), None, device)
    }

    /// Resolved layer shape
    pub fn shape(&self) -> &LayerShape {
        &self.shape
    }

    /// Feature dimension
    pub fn dim(&self) -> usize {
        self.shape.dim()
    }

    /// Apply the block: `x + chain(x) * strength`
    ///
    /// The input is computed in F32 and cast back to its own dtype.
    pub fn forward(&self, x: &Tensor, strength: f64) -> Result<Tensor> {
        let input = x.to_dtype(DType::F32)?;

        let mut hidden = input.clone();
        for layer in &self.layers {
            hidden = layer.forward(&hidden)?;
        }

        let output = (input + hidden.affine(strength, 0.0)?)?;
        Ok(output.to_dtype(x.dtype())?)
    }

    /// All trainable tensors (weights and biases, layer order)
    pub fn trainables(&self) -> Vec<Var> {
        self.layers
            .iter()
            .flat_map(|layer| [layer.weight.clone(), layer.bias.clone()])
            .collect()
    }

    /// Total number of scalar parameters
    pub fn parameter_count(&self) -> usize {
        self.layers
            .iter()
            .map(|layer| layer.weight.elem_count() + layer.bias.elem_count())
            .sum()
    }

    /// Export weights as `linear.{i}.weight` / `linear.{i}.bias`
    pub fn state_dict(&self) -> HashMap<String, Tensor> {
        let mut state = HashMap::with_capacity(self.layers.len() * 2);
        for (index, layer) in self.layers.iter().enumerate() {
            state.insert(layer_key(index, "weight"), layer.weight.as_tensor().clone());
            state.insert(layer_key(index, "bias"), layer.bias.as_tensor().clone());
        }
        state
    }

    /// Strict restore: every layer present with the right shape, no extra layers
    fn load_state(&self, weights: &HashMap<String, Tensor>) -> Result<()> {
        for key in weights.keys() {
            if let Some(index) = parse_layer_index(key) {
                if index >= self.layers.len() {
                    return Err(HypernetError::mismatch(
                        key.as_str(),
                        format!("block has only {} layers", self.layers.len()),
                    ));
                }
            }
        }

        let mut updates = Vec::with_capacity(self.layers.len() * 2);
        for (index, layer) in self.layers.iter().enumerate() {
            let weight = lookup(weights, &layer_key(index, "weight"), &layer.weight)?;
            let bias = lookup(weights, &layer_key(index, "bias"), &layer.bias)?;
            updates.push((&layer.weight, weight));
            updates.push((&layer.bias, bias));
        }

        assign(updates)
    }

    /// Restore from `linear1.*` / `linear2.*` into the first two layers
    fn load_legacy(&self, weights: &HashMap<String, Tensor>) -> Result<()> {
        if self.layers.len() < LEGACY_LAYERS.len() {
            return Err(HypernetError::mismatch(
                LEGACY_LAYERS[1],
                "legacy format needs a block with two layers",
            ));
        }

        let mut updates = Vec::with_capacity(4);
        for (layer, prefix) in self.layers.iter().zip(LEGACY_LAYERS) {
            let weight = lookup(weights, &format!("{prefix}.weight"), &layer.weight)?;
            let bias = lookup(weights, &format!("{prefix}.bias"), &layer.bias)?;
            updates.push((&layer.weight, weight));
            updates.push((&layer.bias, bias));
        }

        debug!(dim = self.dim(), "Loaded legacy two-layer weights");
        assign(updates)
    }
}

fn layer_key(index: usize, param: &str) -> String {
    format!("linear.{index}.{param}")
}

fn parse_layer_index(key: &str) -> Option<usize> {
    let rest = key.strip_prefix("linear.")?;
    let (index, _) = rest.split_once('.')?;
    index.parse().ok()
}

/// Fetch a stored tensor and check it fits `target`
fn lookup<'a>(
    weights: &'a HashMap<String, Tensor>,
    key: &str,
    target: &Var,
) -> Result<&'a Tensor> {
    let tensor = weights
        .get(key)
        .ok_or_else(|| HypernetError::mismatch(key, "missing"))?;

    if tensor.dims() != target.dims() {
        return Err(HypernetError::mismatch(
            key,
            format!("expected shape {:?}, got {:?}", target.dims(), tensor.dims()),
        ));
    }

    Ok(tensor)
}

/// Copy validated tensors into their variables
fn assign(updates: Vec<(&Var, &Tensor)>) -> Result<()> {
    for (var, tensor) in updates {
        let src = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
        var.set(&src)?;
    }
    Ok(())
}
