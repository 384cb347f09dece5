//! Exact step-by-step evaluation of the gated linear recurrence.
//!
//! ```text
//!   h_t = exp(g_t) * h_{t-1} + x_t
//!   o_t = h_t
//! ```
//!
//! `g` is the per-step log-decay (<= 0 elementwise), `x` the effective
//! input. This path is the numerical reference the chunked scan must
//! reproduce, and the only one that understands packed variable-length
//! segments.

use candle_core::{bail, Result, Tensor};

/// Run the recurrence one step at a time.
///
/// # Arguments
/// * `x` - Effective input `[batch, seq_len, dim]`
/// * `g` - Log-decay, same shape as `x`
/// * `initial_state` - Optional `h_{-1}`: `[batch, dim]`, or
///   `[num_seqs, dim]` when `cu_seqlens` is given
/// * `output_final_state` - When true, also return `h_{T-1}`
/// * `cu_seqlens` - Segment boundaries for a packed batch of size 1;
///   the state never crosses a boundary
///
/// # Returns
/// * Output `[batch, seq_len, dim]` (every `h_t`)
/// * Final state `[batch, dim]` (or `[num_seqs, dim]`) when requested
pub fn recurrent_scan(
    x: &Tensor,
    g: &Tensor,
    initial_state: Option<&Tensor>,
    output_final_state: bool,
    cu_seqlens: Option<&[usize]>,
) -> Result<(Tensor, Option<Tensor>)> {
    let (batch, seq_len, dim) = x.dims3()?;
    if x.dims() != g.dims() {
        bail!(
            "input and log-decay shapes differ: {:?} vs {:?}",
            x.dims(),
            g.dims()
        );
    }

    // Nothing to scan: the state passes through unchanged.
    if seq_len == 0 {
        let final_state = if output_final_state {
            Some(match initial_state {
                Some(s) => s.clone(),
                None => Tensor::zeros((batch, dim), x.dtype(), x.device())?,
            })
        } else {
            None
        };
        return Ok((x.clone(), final_state));
    }

    if let Some(bounds) = cu_seqlens {
        return scan_segments(x, g, initial_state, output_final_state, bounds);
    }

    if let Some(state) = initial_state {
        let (rows, state_dim) = state.dims2()?;
        if rows != batch || state_dim != dim {
            bail!(
                "initial state shape [{rows}, {state_dim}] does not match batch {batch}, dim {dim}"
            );
        }
    }

    let mut h = match initial_state {
        Some(s) => s.clone(),
        None => Tensor::zeros((batch, dim), x.dtype(), x.device())?,
    };

    let mut outputs = Vec::with_capacity(seq_len);
    for t in 0..seq_len {
        let x_t = x.narrow(1, t, 1)?.squeeze(1)?; // [batch, dim]
        let g_t = g.narrow(1, t, 1)?.squeeze(1)?;
        let decay = g_t.exp()?;

        h = ((&decay * &h)? + &x_t)?;
        outputs.push(h.unsqueeze(1)?);
    }

    let output = Tensor::cat(&outputs, 1)?;
    let final_state = if output_final_state { Some(h) } else { None };
    Ok((output, final_state))
}

/// Scan a packed batch segment by segment, resetting the carry at each
/// boundary.
fn scan_segments(
    x: &Tensor,
    g: &Tensor,
    initial_state: Option<&Tensor>,
    output_final_state: bool,
    bounds: &[usize],
) -> Result<(Tensor, Option<Tensor>)> {
    let (batch, seq_len, dim) = x.dims3()?;
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

    let num_seqs = bounds.len() - 1;
    if let Some(state) = initial_state {
        let (rows, state_dim) = state.dims2()?;
        if rows != num_seqs || state_dim != dim {
            bail!(
                "initial state shape [{rows}, {state_dim}] does not match {num_seqs} segments, dim {dim}"
            );
        }
    }

    let mut outputs = Vec::with_capacity(seq_len);
    let mut final_states = Vec::with_capacity(num_seqs);

    for (seq, w) in bounds.windows(2).enumerate() {
        let (start, end) = (w[0], w[1]);

        let mut h = match initial_state {
            Some(s) => s.narrow(0, seq, 1)?, // [1, dim]
            None => Tensor::zeros((1, dim), x.dtype(), x.device())?,
        };

        for t in start..end {
            let x_t = x.narrow(1, t, 1)?.squeeze(1)?;
            let g_t = g.narrow(1, t, 1)?.squeeze(1)?;
            let decay = g_t.exp()?;

            h = ((&decay * &h)? + &x_t)?;
            outputs.push(h.unsqueeze(1)?);
        }
        final_states.push(h);
    }

    let output = Tensor::cat(&outputs, 1)?;
    let final_state = if output_final_state {
        Some(Tensor::cat(&final_states, 0)?) // [num_seqs, dim]
    } else {
        None
    };
    Ok((output, final_state))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
