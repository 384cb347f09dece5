use serde::Deserialize;

use crate::ops::ScanMode;

fn default_attn_mode() -> String {
    "chunk".to_string()
}

fn default_expand_ratio() -> usize {
    1
}

fn default_conv_size() -> usize {
    4
}

fn default_hidden_ratio() -> usize {
    4
}

fn default_use_lower_bound() -> bool {
    true
}

fn default_elementwise_affine() -> bool {
    true
}

fn default_norm_eps() -> f64 {
    1e-6
}

/// Model configuration, deserializable from a `config.json`.
///
/// Unknown fields are preserved in `extra` rather than rejected, so configs
/// written by other toolchains parse cleanly.
#[derive(Debug, Clone, Deserialize)]
pub struct HgrnConfig {
    #[serde(default = "default_attn_mode")]
    pub attn_mode: String,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub vocab_size: usize,
    pub max_position_embeddings: usize,

    #[serde(default = "default_expand_ratio")]
    pub expand_ratio: usize,
    #[serde(default)]
    pub use_short_conv: bool,
    #[serde(default = "default_conv_size")]
    pub conv_size: usize,
    #[serde(default = "default_use_lower_bound")]
    pub use_lower_bound: bool,

    #[serde(default = "default_hidden_ratio")]
    pub hidden_ratio: usize,
    #[serde(default)]
    pub intermediate_size: Option<usize>,

    #[serde(default = "default_elementwise_affine")]
    pub elementwise_affine: bool,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f64,

    #[serde(default)]
    pub tie_word_embeddings: bool,
    #[serde(default)]
    pub bos_token_id: u32,
    #[serde(default)]
    pub eos_token_id: u32,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl HgrnConfig {
    /// Parse the configured scan mode. Unknown mode strings are an error.
    pub fn scan_mode(&self) -> candle_core::Result<ScanMode> {
        self.attn_mode.parse()
    }

    /// Channel width of the recurrence (`hidden_size * expand_ratio`).
    pub fn input_dim(&self) -> usize {
        self.hidden_size * self.expand_ratio
    }

    /// MLP width: explicit when configured, otherwise derived from
    /// `hidden_ratio` (2/3 of the gated width, rounded up to a multiple
    /// of 256).
    pub fn mlp_intermediate_size(&self) -> usize {
        match self.intermediate_size {
            Some(size) => size,
            None => {
                let raw = self.hidden_size * self.hidden_ratio * 2 / 3;
                raw.div_ceil(256) * 256
            }
        }
    }
}

impl Default for HgrnConfig {
    fn default() -> Self {
        Self {
            attn_mode: default_attn_mode(),
            hidden_size: 2048,
            num_hidden_layers: 24,
            vocab_size: 32000,
            max_position_embeddings: 2048,
            expand_ratio: 1,
            use_short_conv: false,
            conv_size: 4,
            use_lower_bound: true,
            hidden_ratio: 4,
            intermediate_size: None,
            elementwise_affine: true,
            norm_eps: 1e-6,
            tie_word_embeddings: false,
            bos_token_id: 1,
            eos_token_id: 2,
            extra: serde_json::Map::new(),
        }
    }
}
