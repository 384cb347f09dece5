//! Short depthwise causal convolution over the sequence dimension.
//!
//! Mixes a handful of trailing positions into each projection before the
//! recurrence sees them. The carried state is the last `kernel_size - 1`
//! input columns, so decoding one token at a time reproduces the full
//! prefill outputs exactly.
//!
//! Weight shape: `[dim, 1, kernel_size]` (depthwise, groups=dim).
//! Bias shape:   `[dim]` (optional).
//! Input shape:  `[batch, seq_len, dim]`.
//! State shape:  `[batch, dim, kernel_size - 1]`.

use candle_core::{bail, Result, Tensor};
use candle_nn::{Activation, VarBuilder};

/// Depthwise causal conv1d with a carried trailing window.
#[derive(Clone, Debug)]
pub struct ShortConvolution {
    weight: Tensor,
    bias: Option<Tensor>,
    activation: Option<Activation>,
    dim: usize,
    kernel_size: usize,
}

impl ShortConvolution {
    pub fn new(weight: Tensor, bias: Option<Tensor>, activation: Option<Activation>) -> Result<Self> {
        let (dim, groups, kernel_size) = weight.dims3()?;
        if groups != 1 {
            bail!(
                "depthwise conv weight must have shape [dim, 1, kernel_size], got {:?}",
                weight.dims()
            );
        }
        if kernel_size == 0 {
            bail!("conv kernel size must be nonzero");
        }
        Ok(Self {
            weight,
            bias,
            activation,
            dim,
            kernel_size,
        })
    }

    pub fn kernel_size(&self) -> usize {
        self.kernel_size
    }

    /// Elements of carried state per sequence.
    pub fn state_size(&self) -> usize {
        self.dim * (self.kernel_size - 1)
    }

    /// Convolve a sequence, optionally continuing from a cached window.
    ///
    /// # Arguments
    /// * `x` - `[batch, seq_len, dim]`
    /// * `mask` - Optional 0/1 padding mask `[batch, seq_len]`, applied to
    ///   the inputs before convolving
    /// * `cache` - Trailing window from the previous call
    /// * `output_final_state` - When true, also return the new window
    /// * `cu_seqlens` - Segment boundaries for a packed batch of size 1;
    ///   incompatible with `cache` and `output_final_state`
    ///
    /// # Returns
    /// Output `[batch, seq_len, dim]` and, when requested, the trailing
    /// window `[batch, dim, kernel_size - 1]`.
    pub fn forward(
        &self,
        x: &Tensor,
        mask: Option<&Tensor>,
        cache: Option<&Tensor>,
        output_final_state: bool,
        cu_seqlens: Option<&[usize]>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        let (batch, seq_len, dim) = x.dims3()?;
        if dim != self.dim {
            bail!("input has {dim} channels, conv expects {}", self.dim);
        }

        let x = match mask {
            Some(mask) => {
                let (mask_batch, mask_len) = mask.dims2()?;
                if mask_batch != batch || mask_len != seq_len {
                    bail!(
                        "mask shape [{mask_batch}, {mask_len}] does not match input [{batch}, {seq_len}]"
                    );
                }
                x.broadcast_mul(&mask.unsqueeze(2)?.to_dtype(x.dtype())?)?
            }
            None => x.clone(),
        };

        if let Some(bounds) = cu_seqlens {
            if cache.is_some() || output_final_state {
                bail!("cached conv state is not supported with variable-length sequences");
            }
            return self.forward_varlen(&x, bounds);
        }

        let state_len = self.kernel_size - 1;
        if let Some(state) = cache {
            let dims = state.dims3()?;
            if dims != (batch, self.dim, state_len) {
                bail!(
                    "conv state shape {:?} does not match [{batch}, {}, {state_len}]",
                    state.dims(),
                    self.dim
                );
            }
        }

        if seq_len == 0 {
            let final_state = if output_final_state {
                Some(match cache {
                    Some(state) => state.clone(),
                    None => Tensor::zeros((batch, self.dim, state_len), x.dtype(), x.device())?,
                })
            } else {
                None
            };
            return Ok((x, final_state));
        }

        let x_t = x.transpose(1, 2)?.contiguous()?; // [batch, dim, seq_len]

        // Single token against an existing window: convolve once, the
        // window's trailing columns become the next state.
        if seq_len == 1 {
            if let Some(state) = cache {
                let window = Tensor::cat(&[state, &x_t], 2)?; // [batch, dim, kernel_size]
                let out = self.conv_windows(&window, 1)?;
                let out = self.apply_activation(&out.transpose(1, 2)?)?;
                let final_state = if output_final_state {
                    Some(window.narrow(2, 1, state_len)?)
                } else {
                    None
                };
                return Ok((out, final_state));
            }
        }

        // Prefill: left-pad with the cached history (zeros when absent) so
        // position t only sees positions <= t.
        let history = match cache {
            Some(state) => state.clone(),
            None => Tensor::zeros((batch, self.dim, state_len), x.dtype(), x.device())?,
        };
        let padded = Tensor::cat(&[&history, &x_t], 2)?; // [batch, dim, state_len + seq_len]

        let out = self.conv_windows(&padded, seq_len)?;
        let out = self.apply_activation(&out.transpose(1, 2)?)?;

        let final_state = if output_final_state {
            Some(padded.narrow(2, seq_len, state_len)?)
        } else {
            None
        };
        Ok((out, final_state))
    }

    /// Convolve each packed segment from a zero-seeded window.
    fn forward_varlen(&self, x: &Tensor, bounds: &[usize]) -> Result<(Tensor, Option<Tensor>)> {
        let (batch, seq_len, _dim) = x.dims3()?;
        if batch != 1 {
            bail!("cu_seqlens requires a packed batch of size 1, got {batch}");
        }
        if bounds.len() < 2 || bounds[0] != 0 || bounds[bounds.len() - 1] != seq_len {
            bail!(
                "cu_seqlens must start at 0 and end at the packed length {seq_len}, got {:?}",
                bounds
            );
        }
        for w in bounds.windows(2) {
            if w[1] <= w[0] {
                bail!("cu_seqlens must be strictly increasing, got {:?}", bounds);
            }
        }

        let mut outputs = Vec::with_capacity(bounds.len() - 1);
        for w in bounds.windows(2) {
            let segment = x.narrow(1, w[0], w[1] - w[0])?;
            let (out, _) = self.forward(&segment, None, None, false, None)?;
            outputs.push(out);
        }
        Ok((Tensor::cat(&outputs, 1)?, None))
    }

    /// Slide the kernel over `[batch, dim, state_len + seq_len]`.
    fn conv_windows(&self, padded: &Tensor, seq_len: usize) -> Result<Tensor> {
        let w = self.weight.squeeze(1)?; // [dim, kernel_size]
        let w = w.unsqueeze(0)?; // [1, dim, kernel_size]

        let mut outputs = Vec::with_capacity(seq_len);
        for t in 0..seq_len {
            let window = padded.narrow(2, t, self.kernel_size)?; // [batch, dim, kernel_size]
            let mut out = window.broadcast_mul(&w)?.sum(2)?; // [batch, dim]
            if let Some(bias) = &self.bias {
                out = out.broadcast_add(bias)?;
            }
            outputs.push(out.unsqueeze(2)?);
        }
        Tensor::cat(&outputs, 2) // [batch, dim, seq_len]
    }

    fn apply_activation(&self, x: &Tensor) -> Result<Tensor> {
        match &self.activation {
            Some(act) => x.apply(act),
            None => Ok(x.clone()),
        }
    }
}

/// Create a short convolution, loading parameters from a VarBuilder.
pub fn short_conv(
    dim: usize,
    kernel_size: usize,
    bias: bool,
    activation: Option<Activation>,
    vb: VarBuilder,
) -> Result<ShortConvolution> {
    let weight = vb.get((dim, 1, kernel_size), "weight")?;
    let bias = if bias { Some(vb.get(dim, "bias")?) } else { None };
    ShortConvolution::new(weight, bias, activation)
}

// ─── Tests ───────────────────────────────────────────────────────────────────
