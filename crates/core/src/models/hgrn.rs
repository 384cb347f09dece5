//! HGRN (hierarchically gated linear recurrence) architecture.
//!
//! A pre-norm residual stack whose sequence mixer is a gated linear
//! recurrence instead of attention:
//!
//! ```text
//! Embedding -> [HgrnBlock x N] -> RMSNorm -> LM Head
//!
//! HgrnBlock:
//!   RMSNorm -> HgrnAttention -> (+residual)
//!   RMSNorm -> SwiGluMlp     -> (+residual)
//! ```
//!
//! Layers share a hierarchy of decay floors: the model owns one
//! parameter matrix whose per-layer rows compose into monotonically
//! increasing lower bounds on the forget gate, so deeper layers forget
//! more slowly.

use std::sync::Mutex;

use candle_core::{Device, Module, Result, Tensor};
use candle_nn::{embedding, linear_no_bias, Embedding, Linear, VarBuilder};

use crate::cache::{RecurrentCache, RecurrentStateManager};
use crate::config::HgrnConfig;
use crate::layers::hgrn::HgrnAttention;
use crate::layers::mlp::SwiGluMlp;
use crate::layers::normalization::{rms_norm, RmsNorm};

// ─── Block ──────────────────────────────────────────────────────────────────

pub struct HgrnBlock {
    attn_norm: RmsNorm,
    attn: HgrnAttention,
    mlp_norm: RmsNorm,
    mlp: SwiGluMlp,
}

impl HgrnBlock {
    pub fn new(cfg: &HgrnConfig, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        let attn_norm = rms_norm(cfg.hidden_size, cfg.norm_eps, vb.pp("attn_norm"))?;
        let attn = HgrnAttention::new(cfg, layer_idx, vb.pp("attn"))?;
        let mlp_norm = rms_norm(cfg.hidden_size, cfg.norm_eps, vb.pp("mlp_norm"))?;
        let mlp = SwiGluMlp::new(cfg.hidden_size, cfg.mlp_intermediate_size(), vb.pp("mlp"))?;
        Ok(Self {
            attn_norm,
            attn,
            mlp_norm,
            mlp,
        })
    }

    pub fn set_training(&mut self, training: bool) {
        self.attn.set_training(training);
    }

    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        cache: Option<&mut RecurrentCache>,
        lower_bound: Option<&Tensor>,
        cu_seqlens: Option<&[usize]>,
    ) -> Result<Tensor> {
        let normed = self.attn_norm.forward(hidden_states)?;
        let mixed = self
            .attn
            .forward(&normed, attention_mask, cache, lower_bound, cu_seqlens)?;
        let hidden = (hidden_states + mixed)?;

        let normed = self.mlp_norm.forward(&hidden)?;
        let fed = self.mlp.forward(&normed)?;
        hidden + fed
    }
}

// ─── Decay floor hierarchy ──────────────────────────────────────────────────

/// Compose per-layer decay floors from the raw parameter matrix.
///
/// Softmax over the layer axis turns the rows into a partition of one;
/// the running sum minus its first row yields floors that start at zero
/// for layer 0 and increase strictly with depth while staying below 1.
pub fn compose_lower_bounds(params: &Tensor) -> Result<Tensor> {
    let probs = candle_nn::ops::softmax(params, 0)?;
    let cumulative = probs.cumsum(0)?;
    let first = cumulative.narrow(0, 0, 1)?;
    cumulative.broadcast_sub(&first)
}

// ─── Model ──────────────────────────────────────────────────────────────────

pub struct HgrnModel {
    embeddings: Embedding,
    layers: Vec<HgrnBlock>,
    norm: RmsNorm,
    /// Raw floor parameters `[num_layers, input_dim]`; composed per
    /// forward pass.
    lower_bounds: Option<Tensor>,
}

impl HgrnModel {
    pub fn new(cfg: &HgrnConfig, vb: VarBuilder) -> Result<Self> {
        let embeddings = embedding(cfg.vocab_size, cfg.hidden_size, vb.pp("embeddings"))?;

        let mut layers = Vec::with_capacity(cfg.num_hidden_layers);
        let vb_layers = vb.pp("layers");
        for i in 0..cfg.num_hidden_layers {
            layers.push(HgrnBlock::new(cfg, i, vb_layers.pp(i))?);
        }

        let norm = rms_norm(cfg.hidden_size, cfg.norm_eps, vb.pp("norm"))?;

        let lower_bounds = if cfg.use_lower_bound {
            Some(vb.get((cfg.num_hidden_layers, cfg.input_dim()), "lower_bounds")?)
        } else {
            None
        };

        Ok(Self {
            embeddings,
            layers,
            norm,
            lower_bounds,
        })
    }

    pub fn num_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn set_training(&mut self, training: bool) {
        for layer in &mut self.layers {
            layer.set_training(training);
        }
    }

    /// Run the stack over token ids, returning normalized hidden states
    /// `[batch, seq_len, hidden_size]`.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        attention_mask: Option<&Tensor>,
        mut cache: Option<&mut RecurrentCache>,
        cu_seqlens: Option<&[usize]>,
    ) -> Result<Tensor> {
        let mut hidden = self.embeddings.forward(input_ids)?;

        let lower_bounds = match &self.lower_bounds {
            Some(params) => Some(compose_lower_bounds(params)?),
            None => None,
        };

        for (layer_idx, layer) in self.layers.iter().enumerate() {
            let lower_bound = match &lower_bounds {
                Some(bounds) => Some(bounds.narrow(0, layer_idx, 1)?.squeeze(0)?),
                None => None,
            };
            hidden = layer.forward(
                &hidden,
                attention_mask,
                cache.as_deref_mut(),
                lower_bound.as_ref(),
                cu_seqlens,
            )?;
        }

        self.norm.forward(&hidden)
    }
}

// ─── Causal LM ──────────────────────────────────────────────────────────────

pub struct HgrnForCausalLM {
    model: HgrnModel,
    lm_head: Linear,
    device: Device,
    /// Recurrent state is managed internally since the model has no KV
    /// cache; each request id owns an independent cache.
    state_mgr: Mutex<RecurrentStateManager>,
}

impl HgrnForCausalLM {
    pub fn new(cfg: &HgrnConfig, vb: VarBuilder) -> Result<Self> {
        let model = HgrnModel::new(cfg, vb.pp("model"))?;

        // LM head - may be tied to embeddings
        let lm_head = if cfg.tie_word_embeddings {
            let emb_weights = model.embeddings.embeddings().clone();
            Linear::new(emb_weights, None)
        } else {
            linear_no_bias(cfg.hidden_size, cfg.vocab_size, vb.pp("lm_head"))?
        };

        let state_mgr = RecurrentStateManager::new(cfg.num_hidden_layers);

        Ok(Self {
            model,
            lm_head,
            device: vb.device().clone(),
            state_mgr: Mutex::new(state_mgr),
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// Forward pass with internally managed recurrent state.
    ///
    /// `seqlen_offset` indicates whether this is a prefill (0) or decode
    /// (>0) step. Each request is identified by `request_id` for
    /// independent state tracking; a prefill replaces any state the
    /// request left behind.
    pub fn forward(
        &self,
        input_ids: &Tensor,
        seqlen_offset: usize,
        request_id: u64,
    ) -> Result<Tensor> {
        let mut state_mgr = self
            .state_mgr
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("state lock poisoned: {e}")))?;

        // Allocate state on first call (prefill)
        if seqlen_offset == 0 {
            state_mgr.free_state(request_id);
            state_mgr.allocate_state(request_id).map_err(|e| {
                candle_core::Error::Msg(format!("failed to allocate recurrent state: {e}"))
            })?;
        }

        let cache = state_mgr.get_state(request_id).ok_or_else(|| {
            candle_core::Error::Msg("recurrent state not found for request".into())
        })?;

        let hidden = self.model.forward(input_ids, None, Some(cache), None)?;
        self.lm_head.forward(&hidden)
    }

    /// Drop the state a finished request left behind.
    pub fn free_request(&self, request_id: u64) -> Result<()> {
        let mut state_mgr = self
            .state_mgr
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("state lock poisoned: {e}")))?;
        state_mgr.free_state(request_id);
        Ok(())
    }

    /// Number of requests currently holding state.
    pub fn num_active_requests(&self) -> Result<usize> {
        let state_mgr = self
            .state_mgr
            .lock()
            .map_err(|e| candle_core::Error::Msg(format!("state lock poisoned: {e}")))?;
        Ok(state_mgr.num_active_requests())
    }
}

// ─── Tests ──────────────────────────────────────────────────────────────────
