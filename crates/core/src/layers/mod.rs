pub mod conv;
pub mod hgrn;
pub mod mlp;
pub mod normalization;

pub use conv::{short_conv, ShortConvolution};
pub use hgrn::HgrnAttention;
pub use mlp::SwiGluMlp;
pub use normalization::{gated_rms_norm, rms_norm, GatedRmsNorm, RmsNorm};
