//! Chunked evaluation of the gated linear recurrence.
//!
//! The sequence is cut into fixed-size chunks. Within each chunk the
//! recurrence runs from a zero state, which exposes the per-position
//! work as a batched scan over all chunks at once. A second, much
//! shorter pass then stitches chunks together: the state entering
//! chunk `n` contributes `exp(cumsum(g)) * h` at every position, so one
//! broadcast multiply-add per chunk recovers the exact sequential
//! result.
//!
//! Sequences are right-padded to a chunk multiple with zeros. Padding
//! is inert: `g = 0` means decay 1 and `x = 0` adds nothing, so the
//! state parks at its last real value and the reported final state is
//! untouched.

use candle_core::{bail, DType, Result, Tensor};

use super::recurrent::recurrent_scan;

/// Run the recurrence chunk by chunk.
///
/// Matches [`recurrent_scan`] on every position up to floating-point
/// rounding; packed variable-length batches are not supported here and
/// must go through the sequential path.
///
/// # Arguments
/// * `x` - Effective input `[batch, seq_len, dim]`
/// * `g` - Log-decay, same shape as `x`
/// * `initial_state` - Optional `h_{-1}`: `[batch, dim]`
/// * `output_final_state` - When true, also return `h_{T-1}`
/// * `chunk_size` - Chunk length, must be nonzero
pub fn chunk_scan(
    x: &Tensor,
    g: &Tensor,
    initial_state: Option<&Tensor>,
    output_final_state: bool,
    chunk_size: usize,
) -> Result<(Tensor, Option<Tensor>)> {
    let (batch, seq_len, dim) = x.dims3()?;
    if x.dims() != g.dims() {
        bail!(
            "input and log-decay shapes differ: {:?} vs {:?}",
            x.dims(),
            g.dims()
        );
    }
    if chunk_size == 0 {
        bail!("chunk size must be nonzero");
    }
    if let Some(state) = initial_state {
        let (rows, state_dim) = state.dims2()?;
        if rows != batch || state_dim != dim {
            bail!(
                "initial state shape [{rows}, {state_dim}] does not match batch {batch}, dim {dim}"
            );
        }
    }

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

    // Right-pad to a chunk multiple with neutral steps.
    let pad = (chunk_size - seq_len % chunk_size) % chunk_size;
    let (x_padded, g_padded) = if pad > 0 {
        let x_pad = Tensor::zeros((batch, pad, dim), x.dtype(), x.device())?;
        let g_pad = Tensor::zeros((batch, pad, dim), g.dtype(), g.device())?;
        (
            Tensor::cat(&[x, &x_pad], 1)?,
            Tensor::cat(&[g, &g_pad], 1)?,
        )
    } else {
        (x.clone(), g.clone())
    };
    let padded_len = seq_len + pad;
    let num_chunks = padded_len / chunk_size;

    // Fold chunks into the batch dimension and scan them all from a
    // zero state.
    let x_folded = x_padded
        .contiguous()?
        .reshape((batch * num_chunks, chunk_size, dim))?;
    let g_folded = g_padded
        .contiguous()?
        .reshape((batch * num_chunks, chunk_size, dim))?;
    let (local_out, _) = recurrent_scan(&x_folded, &g_folded, None, false, None)?;

    // Cumulative decay from the chunk start, in F32 so long chunks do
    // not underflow the running product.
    let decay_from_start = g_folded
        .to_dtype(DType::F32)?
        .cumsum(1)?
        .exp()?
        .to_dtype(x.dtype())?;

    let local_flat = local_out.reshape((batch, padded_len, dim))?;
    let decay_flat = decay_from_start.reshape((batch, padded_len, dim))?;

    // Stitch: the incoming state decays through each position, then the
    // last position of the chunk becomes the next carry.
    let mut h = match initial_state {
        Some(s) => s.clone(),
        None => Tensor::zeros((batch, dim), x.dtype(), x.device())?,
    };
    let mut chunks = Vec::with_capacity(num_chunks);
    for n in 0..num_chunks {
        let local_n = local_flat.narrow(1, n * chunk_size, chunk_size)?;
        let decay_n = decay_flat.narrow(1, n * chunk_size, chunk_size)?;
        let carried = decay_n.broadcast_mul(&h.unsqueeze(1)?)?;
        let out_n = (local_n + carried)?;
        h = out_n.narrow(1, chunk_size - 1, 1)?.squeeze(1)?;
        chunks.push(out_n);
    }

    let output = Tensor::cat(&chunks, 1)?.narrow(1, 0, seq_len)?;
    let final_state = if output_final_state { Some(h) } else { None };
    Ok((output, final_state))
}

// ─── Tests ───────────────────────────────────────────────────────────────────
