//! Hierarchically gated recurrence layer.
//!
//! The sequence-mixing block of the model: three projections feed a
//! data-dependent linear recurrence, a gated normalization rescales the
//! outputs, and a final projection maps back to the residual width.
//!
//! Per step, with forget logits `f_raw` and input logits `i_raw`:
//!
//! ```text
//!   f = log_sigmoid(f_raw)          (floored on layers above the first)
//!   i = swiglu(i_raw, 1 - exp(f))
//!   h = exp(f) * h_prev + i
//! ```
//!
//! Decode reuses the carried `h` (and conv windows) from a
//! [`RecurrentCache`], so generation cost is independent of context
//! length.

use candle_core::{bail, Module, Result, Tensor};
use candle_nn::{linear_no_bias, Linear, VarBuilder};

use crate::cache::RecurrentCache;
use crate::config::HgrnConfig;
use crate::layers::conv::{short_conv, ShortConvolution};
use crate::layers::normalization::{gated_rms_norm, GatedRmsNorm};
use crate::ops::{
    apply_decay_floor, chunk_scan, log_sigmoid, recurrent_scan, select_scan_mode, swiglu,
    ScanMode, DEFAULT_CHUNK_SIZE,
};

pub struct HgrnAttention {
    mode: ScanMode,
    layer_idx: usize,
    input_dim: usize,
    i_proj: Linear,
    f_proj: Linear,
    g_proj: Linear,
    o_proj: Linear,
    i_conv: Option<ShortConvolution>,
    f_conv: Option<ShortConvolution>,
    g_norm: GatedRmsNorm,
    training: bool,
}

impl HgrnAttention {
    pub fn new(cfg: &HgrnConfig, layer_idx: usize, vb: VarBuilder) -> Result<Self> {
        let hidden_size = cfg.hidden_size;
        let input_dim = cfg.input_dim();

        let i_proj = linear_no_bias(hidden_size, input_dim, vb.pp("i_proj"))?;
        let f_proj = linear_no_bias(hidden_size, input_dim, vb.pp("f_proj"))?;
        let g_proj = linear_no_bias(hidden_size, input_dim, vb.pp("g_proj"))?;
        let o_proj = linear_no_bias(input_dim, hidden_size, vb.pp("o_proj"))?;

        let (i_conv, f_conv) = if cfg.use_short_conv {
            let i_conv = short_conv(input_dim, cfg.conv_size, false, None, vb.pp("i_conv"))?;
            let f_conv = short_conv(input_dim, cfg.conv_size, false, None, vb.pp("f_conv"))?;
            (Some(i_conv), Some(f_conv))
        } else {
            (None, None)
        };

        let g_norm = gated_rms_norm(
            input_dim,
            cfg.elementwise_affine,
            cfg.norm_eps,
            vb.pp("g_norm"),
        )?;

        Ok(Self {
            mode: cfg.scan_mode()?,
            layer_idx,
            input_dim,
            i_proj,
            f_proj,
            g_proj,
            o_proj,
            i_conv,
            f_conv,
            g_norm,
            training: false,
        })
    }

    pub fn layer_idx(&self) -> usize {
        self.layer_idx
    }

    /// Training keeps the configured scan; inference falls back to the
    /// sequential scan for short inputs.
    pub fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    /// Elements of carried state per sequence: the recurrence plus any
    /// conv windows.
    pub fn state_size(&self) -> usize {
        let mut size = self.input_dim;
        if let Some(conv) = &self.i_conv {
            size += conv.state_size();
        }
        if let Some(conv) = &self.f_conv {
            size += conv.state_size();
        }
        size
    }

    /// Mix the sequence through the gated recurrence.
    ///
    /// # Arguments
    /// * `hidden_states` - `[batch, seq_len, hidden_size]`
    /// * `attention_mask` - Optional 0-1 padding mask `[batch, time_total]`
    ///   (0 marks padding); only its trailing `seq_len` columns apply here
    /// * `cache` - Per-request state; when present, the layer reads its
    ///   slot and writes the updated state back
    /// * `lower_bound` - Optional per-channel decay floor `[input_dim]`,
    ///   ignored on layer 0
    /// * `cu_seqlens` - Segment boundaries for a packed batch of size 1
    pub fn forward(
        &self,
        hidden_states: &Tensor,
        attention_mask: Option<&Tensor>,
        mut cache: Option<&mut RecurrentCache>,
        lower_bound: Option<&Tensor>,
        cu_seqlens: Option<&[usize]>,
    ) -> Result<Tensor> {
        let (_batch, seq_len, _hidden) = hidden_states.dims3()?;

        // Only flat padding masks make sense for a recurrence; square
        // attention masks have no counterpart here.
        let pad_mask = match attention_mask {
            Some(mask) => {
                if mask.dims().len() != 2 {
                    bail!(
                        "attention mask must be a 0-1 matrix [batch, seq_len], got rank {}",
                        mask.dims().len()
                    );
                }
                let (_, time_total) = mask.dims2()?;
                if time_total < seq_len {
                    bail!(
                        "attention mask covers {time_total} positions but input has {seq_len}"
                    );
                }
                Some(mask.narrow(1, time_total - seq_len, seq_len)?)
            }
            None => None,
        };

        let mode = select_scan_mode(self.mode, self.training, seq_len);
        let output_final_state = cache.is_some();

        let last_state = cache
            .as_deref()
            .and_then(|c| c.layer(self.layer_idx))
            .cloned();

        let (i, f, conv_i, conv_f) = match (&self.i_conv, &self.f_conv) {
            (Some(i_conv), Some(f_conv)) => {
                let (prev_i, prev_f) = match last_state.as_ref().and_then(|s| s.conv_state.clone())
                {
                    Some((ci, cf)) => (Some(ci), Some(cf)),
                    None => (None, None),
                };
                let (i, conv_i) = i_conv.forward(
                    &self.i_proj.forward(hidden_states)?,
                    pad_mask.as_ref(),
                    prev_i.as_ref(),
                    output_final_state,
                    cu_seqlens,
                )?;
                let (f, conv_f) = f_conv.forward(
                    &self.f_proj.forward(hidden_states)?,
                    pad_mask.as_ref(),
                    prev_f.as_ref(),
                    output_final_state,
                    cu_seqlens,
                )?;
                (i, f, conv_i, conv_f)
            }
            _ => (
                self.i_proj.forward(hidden_states)?,
                self.f_proj.forward(hidden_states)?,
                None,
                None,
            ),
        };

        let f = log_sigmoid(&f)?;
        // The first layer's decay stays unfloored.
        let f = match lower_bound {
            Some(bound) if self.layer_idx > 0 => apply_decay_floor(&f, bound)?,
            _ => f,
        };
        let one_minus_decay = (f.exp()?.neg()? + 1.0)?;
        let i = swiglu(&i, &one_minus_decay)?;

        // Left-padding: padded positions contribute nothing, while the
        // decay still runs so a masked step drains the carried state.
        let i = match &pad_mask {
            Some(mask) => i.broadcast_mul(&mask.unsqueeze(2)?.to_dtype(i.dtype())?)?,
            None => i,
        };

        let initial_state = last_state.as_ref().map(|s| s.recurrent_state.clone());
        let (o, recurrent_state) = match mode {
            ScanMode::Chunk => {
                if cu_seqlens.is_some() {
                    bail!("chunked scans do not support variable-length sequences");
                }
                chunk_scan(
                    &i,
                    &f,
                    initial_state.as_ref(),
                    output_final_state,
                    DEFAULT_CHUNK_SIZE,
                )?
            }
            ScanMode::Recurrent => {
                recurrent_scan(&i, &f, initial_state.as_ref(), output_final_state, cu_seqlens)?
            }
        };

        if let Some(cache) = cache.as_mut() {
            if let Some(state) = recurrent_state {
                let conv_state = match (conv_i, conv_f) {
                    (Some(ci), Some(cf)) => Some((ci, cf)),
                    _ => None,
                };
                cache.update(self.layer_idx, state, conv_state, seq_len);
            }
        }

        let o = self.g_norm.forward(&o, &self.g_proj.forward(hidden_states)?)?;
        self.o_proj.forward(&o)
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────
