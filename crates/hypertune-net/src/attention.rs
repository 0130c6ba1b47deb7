//! Cross-attention with the hypernetwork hook
//!
//! The hook only touches the context fed to the key and value projections:
//!
//! ```text
//! x ─────────────► to_q ─┐
//! context ─► hyper_k ─► to_k ─┼─► softmax(q·kᵀ·scale) · v ─► to_out
//! context ─► hyper_v ─► to_v ─┘
//! ```
//!
//! Without a block pair for the context width the hook is the identity, and
//! the layer computes plain cross-attention.

use std::sync::{Mutex, PoisonError};

use candle_core::{DType, Module, Tensor, D};
use candle_nn::{Linear, VarBuilder};

use crate::context::HypernetworkContext;
use crate::hypernetwork::BlockPair;
use crate::Result;

/// Last block pair an attention layer applied, kept for inspection
#[derive(Debug, Default)]
pub struct AttachedHypernetwork {
    slot: Mutex<Option<BlockPair>>,
}

impl AttachedHypernetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the pair used by the latest call
    pub fn attach(&self, pair: &BlockPair) {
        *self.slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(pair.clone());
    }

    /// The most recently recorded pair
    pub fn get(&self) -> Option<BlockPair> {
        self.slot
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// Route an attention context through the matching block pair
///
/// Returns `(context_k, context_v)`. The pair is looked up by the width of the
/// context's last dimension; without one both outputs are the unchanged context.
/// When `layer` is given, the applied pair is recorded on it.
pub fn apply_hypernetwork(
    hypernetwork: &HypernetworkContext<'_>,
    context: &Tensor,
    layer: Option<&AttachedHypernetwork>,
) -> Result<(Tensor, Tensor)> {
    let dim = context.dim(D::Minus1)?;

    let Some(pair) = hypernetwork.blocks_for(dim) else {
        return Ok((context.clone(), context.clone()));
    };

    if let Some(layer) = layer {
        layer.attach(pair);
    }

    let strength = hypernetwork.strength();
    let context_k = pair.key.forward(context, strength)?;
    let context_v = pair.value.forward(context, strength)?;
    Ok((context_k, context_v))
}

/// Multi-head cross-attention that consults the hypernetwork on every call
pub struct CrossAttention {
    to_q: Linear,
    to_k: Linear,
    to_v: Linear,
    to_out: Linear,
    heads: usize,
    scale: f64,
    attached: AttachedHypernetwork,
}

impl CrossAttention {
    /// Build the layer from a var builder
    ///
    /// Weight names follow the usual `to_q`, `to_k`, `to_v`, `to_out.0` layout.
    pub fn new(
        vb: VarBuilder,
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        dim_head: usize,
    ) -> Result<Self> {
        let inner_dim = heads * dim_head;
        let context_dim = context_dim.unwrap_or(query_dim);

        Ok(Self {
            to_q: candle_nn::linear_no_bias(query_dim, inner_dim, vb.pp("to_q"))?,
            to_k: candle_nn::linear_no_bias(context_dim, inner_dim, vb.pp("to_k"))?,
            to_v: candle_nn::linear_no_bias(context_dim, inner_dim, vb.pp("to_v"))?,
            to_out: candle_nn::linear(inner_dim, query_dim, vb.pp("to_out.0"))?,
            heads,
            scale: 1.0 / (dim_head as f64).sqrt(),
            attached: AttachedHypernetwork::new(),
        })
    }

    /// Block pair applied by the most recent forward call
    pub fn attached(&self) -> &AttachedHypernetwork {
        &self.attached
    }

    /// Attention forward pass
    ///
    /// # Arguments
    /// * `x` - Queries, `[batch, n, query_dim]`
    /// * `context` - Keys/values source, `[batch, m, context_dim]`; defaults to `x`
    /// * `mask` - Optional `[batch, m]` (or `[batch, ...]`) mask, non-zero keeps a position
    /// * `hypernetwork` - Hypernetwork to route the context through
    pub fn forward(
        &self,
        x: &Tensor,
        context: Option<&Tensor>,
        mask: Option<&Tensor>,
        hypernetwork: &HypernetworkContext<'_>,
    ) -> Result<Tensor> {
        let q = self.to_q.forward(x)?;
        let context = context.unwrap_or(x);

        let (context_k, context_v) =
            apply_hypernetwork(hypernetwork, context, Some(&self.attached))?;
        let k = self.to_k.forward(&context_k)?;
        let v = self.to_v.forward(&context_v)?;

        let (batch, _, _) = q.dims3()?;
        let q = self.split_heads(&q)?;
        let k = self.split_heads(&k)?;
        let v = self.split_heads(&v)?;

        let mut sim = (q.matmul(&k.t()?.contiguous()?)? * self.scale)?;

        if let Some(mask) = mask {
            let keys = mask.flatten_from(1)?;
            let len = keys.dim(1)?;
            let keep = keys
                .ne(0u8)?
                .unsqueeze(1)?
                .repeat((1, self.heads, 1))?
                .reshape((batch * self.heads, 1, len))?
                .broadcast_as(sim.shape())?;
            let fill = Tensor::new(f32::MIN, sim.device())?
                .to_dtype(sim.dtype())?
                .broadcast_as(sim.shape())?;
            sim = keep.where_cond(&sim, &fill)?;
        }

        let attn = candle_nn::ops::softmax_last_dim(&sim)?;
        let out = attn.matmul(&v)?;
        let out = self.merge_heads(&out, batch)?;
        Ok(self.to_out.forward(&out)?)
    }

    /// `[b, n, h*d]` -> `[b*h, n, d]`
    fn split_heads(&self, t: &Tensor) -> Result<Tensor> {
        let (batch, len, inner) = t.dims3()?;
        let dim_head = inner / self.heads;
        Ok(t
            .reshape((batch, len, self.heads, dim_head))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch * self.heads, len, dim_head))?)
    }

    /// `[b*h, n, d]` -> `[b, n, h*d]`
    fn merge_heads(&self, t: &Tensor, batch: usize) -> Result<Tensor> {
        let (_, len, dim_head) = t.dims3()?;
        Ok(t
            .reshape((batch, self.heads, len, dim_head))?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((batch, len, self.heads * dim_head))?)
    }
}

/// Mask helper: all positions kept
pub fn full_mask(batch: usize, len: usize, device: &candle_core::Device) -> Result<Tensor> {
    Ok(Tensor::ones((batch, len), DType::U8, device)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hypernetwork::Hypernetwork;
    use candle_core::Device;
    use candle_nn::VarMap;

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .flatten_all()
            .unwrap()
            .max(0)
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    fn layer(varmap: &VarMap) -> CrossAttention {
        let vb = VarBuilder::from_varmap(varmap, DType::F32, &Device::Cpu);
        CrossAttention::new(vb, 32, Some(16), 4, 8).unwrap()
    }

    #[test]
    fn test_attached_survives_poisoned_lock() {
        let hn = Hypernetwork::with_sizes("ctx", &[8], None, &Device::Cpu).unwrap();
        let pair = hn.blocks(8).unwrap();
        let attached = std::sync::Arc::new(AttachedHypernetwork::new());

        let poisoner = attached.clone();
        let _ = std::thread::spawn(move || {
            let _guard = poisoner.slot.lock().unwrap();
            panic!("poison the slot");
        })
        .join();
        assert!(attached.slot.is_poisoned());

        attached.attach(pair);
        assert_eq!(attached.get().unwrap().key.dim(), 8);
    }

    #[test]
    fn test_hook_without_hypernetwork_is_identity() {
        let context = Tensor::randn(0f32, 1.0, (1, 7, 16), &Device::Cpu).unwrap();
        let attached = AttachedHypernetwork::new();

        let ctx = HypernetworkContext::disabled();
        let (k, v) = apply_hypernetwork(&ctx, &context, Some(&attached)).unwrap();

        assert_eq!(max_abs_diff(&k, &context), 0.0);
        assert_eq!(max_abs_diff(&v, &context), 0.0);
        assert!(attached.get().is_none());
    }

    #[test]
    fn test_hook_without_matching_width_is_identity() {
        let hn = Hypernetwork::with_sizes("wide", &[32], None, &Device::Cpu).unwrap();
        let context = Tensor::randn(0f32, 1.0, (1, 7, 16), &Device::Cpu).unwrap();
        let attached = AttachedHypernetwork::new();

        let ctx = HypernetworkContext::active(&hn);
        let (k, v) = apply_hypernetwork(&ctx, &context, Some(&attached)).unwrap();

        assert_eq!(max_abs_diff(&k, &context), 0.0);
        assert_eq!(max_abs_diff(&v, &context), 0.0);
        assert!(attached.get().is_none());
    }

    #[test]
    fn test_hook_applies_key_and_value_blocks() {
        let hn = Hypernetwork::with_sizes("ctx", &[16], Some(&[1.0, 2.0, 1.0]), &Device::Cpu)
            .unwrap();
        let context = Tensor::randn(0f32, 1.0, (2, 7, 16), &Device::Cpu).unwrap();
        let attached = AttachedHypernetwork::new();

        let (k, v) = apply_hypernetwork(
            &HypernetworkContext::active(&hn).with_strength(50.0),
            &context,
            Some(&attached),
        )
        .unwrap();

        assert_eq!(k.dims(), context.dims());
        assert!(max_abs_diff(&k, &context) > 0.0);
        assert!(max_abs_diff(&k, &v) > 0.0);

        let recorded = attached.get().unwrap();
        assert_eq!(recorded.key.dim(), 16);
    }

    #[test]
    fn test_zero_strength_matches_plain_attention() {
        let varmap = VarMap::new();
        let attention = layer(&varmap);
        let hn = Hypernetwork::with_sizes("ctx", &[16], None, &Device::Cpu).unwrap();

        let x = Tensor::randn(0f32, 1.0, (2, 5, 32), &Device::Cpu).unwrap();
        let context = Tensor::randn(0f32, 1.0, (2, 7, 16), &Device::Cpu).unwrap();

        let plain = attention
            .forward(&x, Some(&context), None, &HypernetworkContext::disabled())
            .unwrap();
        let hooked = attention
            .forward(
                &x,
                Some(&context),
                None,
                &HypernetworkContext::active(&hn).with_strength(0.0),
            )
            .unwrap();

        assert_eq!(plain.dims(), &[2, 5, 32]);
        assert_eq!(max_abs_diff(&plain, &hooked), 0.0);
        assert!(attention.attached().get().is_some());
    }

    #[test]
    fn test_full_mask_matches_no_mask() {
        let varmap = VarMap::new();
        let attention = layer(&varmap);

        let x = Tensor::randn(0f32, 1.0, (2, 5, 32), &Device::Cpu).unwrap();
        let context = Tensor::randn(0f32, 1.0, (2, 7, 16), &Device::Cpu).unwrap();
        let mask = full_mask(2, 7, &Device::Cpu).unwrap();
        let ctx = HypernetworkContext::disabled();

        let unmasked = attention.forward(&x, Some(&context), None, &ctx).unwrap();
        let masked = attention.forward(&x, Some(&context), Some(&mask), &ctx).unwrap();

        assert!(max_abs_diff(&unmasked, &masked) < 1e-6);
    }

    #[test]
    fn test_self_attention_defaults_context() {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let attention = CrossAttention::new(vb, 16, None, 2, 8).unwrap();

        let x = Tensor::randn(0f32, 1.0, (1, 3, 16), &Device::Cpu).unwrap();
        let out = attention
            .forward(&x, None, None, &HypernetworkContext::disabled())
            .unwrap();
        assert_eq!(out.dims(), &[1, 3, 16]);
    }
}
