use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::VarBuilder;

/// RMSNorm layer without bias.
///
/// Drop-in replacement for `candle_nn::RmsNorm`; keeps the weight and
/// epsilon inspectable for state-dict round-trips.
#[derive(Clone, Debug)]
pub struct RmsNorm {
    weight: Tensor,
    eps: f64,
}

impl RmsNorm {
    pub fn new(weight: Tensor, eps: f64) -> Self {
        Self { weight, eps }
    }

    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    pub fn eps(&self) -> f64 {
        self.eps
    }
}

impl Module for RmsNorm {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        candle_nn::ops::rms_norm(&xs.contiguous()?, &self.weight, self.eps as f32)
    }
}

/// Create an RMSNorm layer, loading the weight from a VarBuilder.
pub fn rms_norm(size: usize, eps: f64, vb: VarBuilder) -> Result<RmsNorm> {
    let weight = vb.get(size, "weight")?;
    Ok(RmsNorm::new(weight, eps))
}

/// Output normalization gated by a learned projection.
///
/// Normalizes first, then gates: `rms_norm(x) * silu(gate)`. The recurrence
/// output can grow with sequence length, so the normalization has to see it
/// before the gate rescales it.
///
/// The weight is optional; without one the layer only rescales to unit RMS.
#[derive(Clone, Debug)]
pub struct GatedRmsNorm {
    weight: Option<Tensor>,
    eps: f64,
}

impl GatedRmsNorm {
    pub fn new(weight: Option<Tensor>, eps: f64) -> Self {
        Self { weight, eps }
    }

    pub fn forward(&self, x: &Tensor, gate: &Tensor) -> Result<Tensor> {
        let normed = match &self.weight {
            Some(weight) => {
                candle_nn::ops::rms_norm(&x.contiguous()?, weight, self.eps as f32)?
            }
            None => rms_norm_unweighted(x, self.eps)?,
        };
        let gate = candle_nn::ops::silu(gate)?;
        normed.broadcast_mul(&gate)
    }
}

/// RMS normalization with no learnable scale: `x / rms(x)`.
fn rms_norm_unweighted(x: &Tensor, eps: f64) -> Result<Tensor> {
    let dtype = x.dtype();
    let xs = x.to_dtype(DType::F32)?;
    let mean_sq = xs.sqr()?.mean_keepdim(D::Minus1)?;
    let rms = (mean_sq + eps)?.sqrt()?;
    xs.broadcast_div(&rms)?.to_dtype(dtype)
}

/// Create a gated RMSNorm layer, loading the weight from a VarBuilder
/// when the layer is elementwise-affine.
pub fn gated_rms_norm(
    size: usize,
    elementwise_affine: bool,
    eps: f64,
    vb: VarBuilder,
) -> Result<GatedRmsNorm> {
    let weight = if elementwise_affine {
        Some(vb.get(size, "weight")?)
    } else {
        None
    };
    Ok(GatedRmsNorm::new(weight, eps))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};

    #[test]
    fn test_rms_norm_basic_shape() {
        let device = Device::Cpu;
        let hidden = 64;
        let weight = Tensor::ones(hidden, DType::F32, &device).unwrap();
        let norm = RmsNorm::new(weight, 1e-6);

        let input = Tensor::randn(0.0f32, 1.0, (4, hidden), &device).unwrap();
        let output = norm.forward(&input).unwrap();
        assert_eq!(output.dims(), &[4, hidden]);
    }

    #[test]
    fn test_rms_norm_unit_weight_is_normalized() {
        let device = Device::Cpu;
        let hidden = 32;
        let weight = Tensor::ones(hidden, DType::F32, &device).unwrap();
        let norm = RmsNorm::new(weight, 1e-6);

        let input = Tensor::randn(0.0f32, 1.0, (2, hidden), &device).unwrap();
        let output = norm.forward(&input).unwrap();

        // RMSNorm output should have RMS close to 1.0
        let output_data: Vec<f32> = output.flatten_all().unwrap().to_vec1().unwrap();
        for row in output_data.chunks(hidden) {
            let rms: f32 = (row.iter().map(|x| x * x).sum::<f32>() / hidden as f32).sqrt();
            assert!(
                (rms - 1.0).abs() < 0.1,
                "RMS should be close to 1.0, got {rms}"
            );
        }
    }

    #[test]
    fn test_rms_norm_3d_input() {
        let device = Device::Cpu;
        let hidden = 16;
        let weight = Tensor::ones(hidden, DType::F32, &device).unwrap();
        let norm = RmsNorm::new(weight, 1e-5);

        let input = Tensor::randn(0.0f32, 1.0, (2, 8, hidden), &device).unwrap();
        let output = norm.forward(&input).unwrap();
        assert_eq!(output.dims(), &[2, 8, hidden]);
    }

    #[test]
    fn test_rms_norm_matches_candle_nn() {
        let device = Device::Cpu;
        let hidden = 64;
        let eps = 1e-6;

        let weight_data: Vec<f32> = (0..hidden).map(|i| 0.5 + 0.01 * i as f32).collect();
        let weight = Tensor::from_vec(weight_data, hidden, &device).unwrap();

        let our_norm = RmsNorm::new(weight.clone(), eps);
        let candle_norm = candle_nn::RmsNorm::new(weight, eps);

        let input = Tensor::randn(0.0f32, 1.0, (4, hidden), &device).unwrap();
        let our_output = our_norm.forward(&input).unwrap();
        let candle_output = candle_norm.forward(&input).unwrap();

        let our_data: Vec<f32> = our_output.flatten_all().unwrap().to_vec1().unwrap();
        let candle_data: Vec<f32> = candle_output.flatten_all().unwrap().to_vec1().unwrap();

        for (i, (a, b)) in our_data.iter().zip(candle_data.iter()).enumerate() {
            assert!(
                (a - b).abs() < 1e-5,
                "Mismatch at index {i}: ours={a}, candle={b}"
            );
        }
    }

    #[test]
    fn test_rms_norm_varbuilder() {
        let device = Device::Cpu;
        let hidden = 32;
        let eps = 1e-5;

        let vb = candle_nn::VarBuilder::zeros(DType::F32, &device);
        let norm = rms_norm(hidden, eps, vb);
        assert!(norm.is_ok());

        let norm = norm.unwrap();
        assert_eq!(norm.weight().dims(), &[hidden]);
        assert_eq!(norm.eps(), eps);
    }

    #[test]
    fn test_gated_rms_norm_shape() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f32, 1.0, (2, 4, 8), &device).unwrap();
        let gate = Tensor::randn(0.0f32, 1.0, (2, 4, 8), &device).unwrap();
        let weight = Tensor::ones(8, DType::F32, &device).unwrap();
        let norm = GatedRmsNorm::new(Some(weight), 1e-6);
        let out = norm.forward(&x, &gate).unwrap();
        assert_eq!(out.dims(), &[2, 4, 8]);
    }

    #[test]
    fn test_gated_rms_norm_normalizes_before_gating() {
        // Constant x of any magnitude normalizes to 1.0 per element, so the
        // output is exactly silu(gate). Gating before normalization would
        // return 1.0 instead.
        let device = Device::Cpu;
        let x = (Tensor::ones((1, 1, 4), DType::F32, &device).unwrap() * 5.0).unwrap();
        let gate = Tensor::ones((1, 1, 4), DType::F32, &device).unwrap();
        let weight = Tensor::ones(4, DType::F32, &device).unwrap();
        let norm = GatedRmsNorm::new(Some(weight), 1e-6);

        let out = norm.forward(&x, &gate).unwrap();
        let vals = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let silu_one = 1.0 / (1.0 + (-1.0f32).exp());
        for &v in &vals {
            assert!(
                (v - silu_one).abs() < 1e-5,
                "expected silu(1) = {silu_one}, got {v}"
            );
        }
    }

    #[test]
    fn test_gated_rms_norm_zero_gate_zeros_output() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f32, 1.0, (1, 3, 4), &device).unwrap();
        let gate = Tensor::zeros((1, 3, 4), DType::F32, &device).unwrap();
        let weight = Tensor::ones(4, DType::F32, &device).unwrap();
        let norm = GatedRmsNorm::new(Some(weight), 1e-6);

        let out = norm.forward(&x, &gate).unwrap();
        let vals = out.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        for &v in &vals {
            assert!(v.abs() < 1e-6, "zero gate should zero the output, got {v}");
        }
    }

    #[test]
    fn test_gated_rms_norm_without_weight_matches_unit_weight() {
        let device = Device::Cpu;
        let x = Tensor::randn(0.0f32, 1.0, (2, 3, 8), &device).unwrap();
        let gate = Tensor::randn(0.0f32, 1.0, (2, 3, 8), &device).unwrap();

        let unit = Tensor::ones(8, DType::F32, &device).unwrap();
        let with_weight = GatedRmsNorm::new(Some(unit), 1e-6);
        let without_weight = GatedRmsNorm::new(None, 1e-6);

        let a: Vec<f32> = with_weight
            .forward(&x, &gate)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();
        let b: Vec<f32> = without_weight
            .forward(&x, &gate)
            .unwrap()
            .flatten_all()
            .unwrap()
            .to_vec1()
            .unwrap();

        for (i, (x, y)) in a.iter().zip(b.iter()).enumerate() {
            assert!((x - y).abs() < 1e-5, "mismatch at {i}: {x} vs {y}");
        }
    }

    #[test]
    fn test_gated_rms_norm_varbuilder_affine_flag() {
        let device = Device::Cpu;
        let vb = candle_nn::VarBuilder::zeros(DType::F32, &device);

        let affine = gated_rms_norm(16, true, 1e-6, vb.clone()).unwrap();
        assert!(affine.weight.is_some());

        let plain = gated_rms_norm(16, false, 1e-6, vb).unwrap();
        assert!(plain.weight.is_none());
    }
}
