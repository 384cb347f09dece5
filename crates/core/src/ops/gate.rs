//! Gate combinators for the hierarchically gated recurrence.
//!
//! The forget gate lives in log space: a raw projection `f` becomes the
//! per-step log-decay `log(sigmoid(f))`, optionally floored so the decay
//! never drops below a layer-specific minimum. All combinators run their
//! internal arithmetic in F32 and cast back to the input dtype, so reduced
//! precision activations do not degrade the gate math.

use candle_core::{DType, Result, Tensor};

/// Numerically stable `log(sigmoid(x))`.
///
/// Computed as `min(x, 0) - log(1 + exp(-|x|))`: finite and <= 0 for every
/// finite input, with no overflow at large positive or negative values.
pub fn log_sigmoid(x: &Tensor) -> Result<Tensor> {
    let xs = x.to_dtype(DType::F32)?;

    // min(x, 0) == x - relu(x)
    let min_part = (&xs - xs.relu()?)?;
    let softplus = (xs.abs()?.neg()?.exp()? + 1.0)?.log()?;

    (min_part - softplus)?.to_dtype(x.dtype())
}

/// Elementwise `log(exp(a) + exp(b))`, broadcasting `a` against `b`.
///
/// Uses the max-shift form `max + log(1 + exp(-|a - b|))`, which stays
/// finite even when one operand is -inf.
pub fn logaddexp(a: &Tensor, b: &Tensor) -> Result<Tensor> {
    let max = a.broadcast_maximum(b)?;
    let min = a.broadcast_minimum(b)?;
    let diff = (min - &max)?;
    let correction = (diff.exp()? + 1.0)?.log()?;
    max + correction
}

/// Floor a log-decay tensor so the decay never falls below `lower_bound`.
///
/// Given per-step log-decay `f` (<= 0) and a bound `lb` in probability
/// space, returns `log(lb + (1 - lb) * exp(f))`, computed in log space as
/// `logaddexp(log(lb), log(1 - lb) + f)`. The result still satisfies
/// `exp(out) < 1`, and `exp(out) >= lb` holds elementwise.
///
/// `lower_bound` values must lie in `[0, 1)`; a zero bound leaves the
/// decay unchanged.
pub fn apply_decay_floor(f: &Tensor, lower_bound: &Tensor) -> Result<Tensor> {
    let fs = f.to_dtype(DType::F32)?;
    let lb = lower_bound.to_dtype(DType::F32)?;

    let log_lb = lb.log()?;
    let log_one_minus_lb = (lb.neg()? + 1.0)?.log()?;
    let shifted = fs.broadcast_add(&log_one_minus_lb)?;

    logaddexp(&log_lb, &shifted)?.to_dtype(f.dtype())
}

/// Gated activation `x * sigmoid(x) * y`.
pub fn swiglu(x: &Tensor, y: &Tensor) -> Result<Tensor> {
    candle_nn::ops::silu(x)? * y
}

// ─── Tests ───────────────────────────────────────────────────────────────────
