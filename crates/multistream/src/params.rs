//! Model configuration file (`config.json`) parsing.

use std::path::Path;

use serde::Deserialize;

use crate::error::{Result, ensure_config};
use crate::tokens::Token;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum NormKind {
    #[default]
    RmsNorm,
    LayerNorm,
}

fn default_hidden_scale() -> f32 {
    4.0
}

fn default_rope_theta() -> f32 {
    10_000.0
}

fn default_norm_eps() -> f32 {
    1e-5
}

/// Construction-time configuration of a multi-stream language model.
///
/// Codebook 0 is text. Codebooks `1..=dep_q` are generated by the depth
/// decoder, the remaining `n_q - dep_q` are supplied by the caller.
#[derive(Debug, Clone, Deserialize)]
pub struct LmConfig {
    pub n_q: usize,
    pub dep_q: usize,
    pub card: usize,
    pub text_card: usize,
    pub delays: Vec<usize>,
    #[serde(default)]
    pub existing_text_padding_id: Option<usize>,

    pub dim: usize,
    pub num_heads: usize,
    #[serde(default)]
    pub num_kv_heads: Option<usize>,
    pub num_layers: usize,
    #[serde(default = "default_hidden_scale")]
    pub hidden_scale: f32,
    #[serde(default)]
    pub norm: NormKind,
    #[serde(default)]
    pub norm_emb: bool,
    #[serde(default)]
    pub bias_proj: bool,
    /// Temporal attention window; `None` keeps the full history.
    #[serde(default)]
    pub context: Option<usize>,
    #[serde(default = "default_rope_theta")]
    pub rope_theta: f32,
    #[serde(default = "default_norm_eps")]
    pub norm_eps: f32,

    pub depformer_dim: usize,
    pub depformer_num_heads: usize,
    pub depformer_num_layers: usize,
    #[serde(default)]
    pub depformer_dim_feedforward: Option<usize>,
    #[serde(default)]
    pub depformer_multi_linear: bool,
    #[serde(default)]
    pub depformer_weights_per_step: bool,
}

impl LmConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let cfg: Self = serde_json::from_str(json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Small configuration used by tests and `--random-init` demos.
    pub fn tiny(n_q: usize, dep_q: usize, delays: Vec<usize>) -> Self {
        Self {
            n_q,
            dep_q,
            card: 32,
            text_card: 48,
            delays,
            existing_text_padding_id: None,
            dim: 16,
            num_heads: 4,
            num_kv_heads: Some(2),
            num_layers: 2,
            hidden_scale: 2.0,
            norm: NormKind::RmsNorm,
            norm_emb: false,
            bias_proj: false,
            context: Some(64),
            rope_theta: default_rope_theta(),
            norm_eps: default_norm_eps(),
            depformer_dim: 8,
            depformer_num_heads: 2,
            depformer_num_layers: 1,
            depformer_dim_feedforward: None,
            depformer_multi_linear: true,
            depformer_weights_per_step: false,
        }
    }

    pub fn validate(&self) -> Result<()> {
        ensure_config!(
            self.delays.len() == self.num_codebooks(),
            "expected {} delays (n_q + 1), got {}",
            self.num_codebooks(),
            self.delays.len()
        );
        ensure_config!(self.dep_q > 0, "dep_q must be > 0");
        ensure_config!(
            self.dep_q <= self.n_q,
            "dep_q ({}) cannot exceed n_q ({})",
            self.dep_q,
            self.n_q
        );
        ensure_config!(self.card > 0, "card must be > 0");
        ensure_config!(self.text_card > 0, "text_card must be > 0");
        if let Some(pad) = self.existing_text_padding_id {
            ensure_config!(
                pad < self.text_card,
                "existing_text_padding_id {pad} outside text vocabulary"
            );
        }
        ensure_config!(self.dim > 0, "dim must be > 0");
        ensure_config!(self.num_layers > 0, "num_layers must be > 0");
        ensure_config!(
            self.num_heads > 0 && self.dim.is_multiple_of(self.num_heads),
            "num_heads must divide dim"
        );
        ensure_config!(
            self.num_heads.is_multiple_of(self.kv_heads()),
            "num_heads must be divisible by num_kv_heads"
        );
        ensure_config!(self.hidden_scale > 0.0, "hidden_scale must be > 0");
        ensure_config!(self.depformer_dim > 0, "depformer_dim must be > 0");
        ensure_config!(
            self.depformer_num_heads > 0 && self.depformer_dim.is_multiple_of(self.depformer_num_heads),
            "depformer_num_heads must divide depformer_dim"
        );
        ensure_config!(
            self.depformer_num_layers > 0,
            "depformer_num_layers must be > 0"
        );
        ensure_config!(self.context != Some(0), "context must be > 0 when set");
        Ok(())
    }

    pub fn num_codebooks(&self) -> usize {
        self.n_q + 1
    }

    pub fn num_audio_codebooks(&self) -> usize {
        self.n_q
    }

    /// Codebooks the caller must feed on every step.
    pub fn num_external_codebooks(&self) -> usize {
        self.num_codebooks() - self.dep_q - 1
    }

    pub fn max_delay(&self) -> usize {
        self.delays.iter().copied().max().unwrap_or(0)
    }

    pub fn kv_heads(&self) -> usize {
        self.num_kv_heads.unwrap_or(self.num_heads)
    }

    pub fn hidden_dim(&self) -> usize {
        (self.hidden_scale * self.dim as f32) as usize
    }

    pub fn depformer_hidden_dim(&self) -> usize {
        self.depformer_dim_feedforward
            .unwrap_or((self.hidden_scale * self.depformer_dim as f32) as usize)
    }

    /// Width of the text head; one extra slot for padding when the
    /// tokenizer has no padding token of its own.
    pub fn text_out_vocab(&self) -> usize {
        self.text_card + usize::from(self.existing_text_padding_id.is_none())
    }

    /// Start-of-sequence token for audio streams.
    pub fn initial_token_id(&self) -> Token {
        self.card as Token
    }

    /// Start-of-sequence token for the text stream.
    pub fn text_initial_token_id(&self) -> Token {
        self.text_card as Token
    }

    pub fn text_padding_token_id(&self) -> Token {
        self.existing_text_padding_id.unwrap_or(self.text_card) as Token
    }

    /// Optionally marks the last padding step of a word.
    pub fn end_of_text_padding_id(&self) -> Token {
        0
    }

    /// `[text_initial, audio_initial x n_q]`.
    pub fn initial_tokens(&self) -> Vec<Token> {
        let mut initial = Vec::with_capacity(self.num_codebooks());
        initial.push(self.text_initial_token_id());
        initial.extend(std::iter::repeat_n(
            self.initial_token_id(),
            self.num_audio_codebooks(),
        ));
        initial
    }
}

#[cfg(test)]
mod tests {
    use super::{LmConfig, NormKind};
    use crate::error::Error;

    const FULL_SIZE: &str = r#"
    {
      "n_q": 16,
      "dep_q": 8,
      "card": 2048,
      "text_card": 32000,
      "delays": [0, 0, 1, 1, 1, 1, 1, 1, 1, 0, 1, 1, 1, 1, 1, 1, 1],
      "existing_text_padding_id": 3,
      "dim": 4096,
      "num_heads": 32,
      "num_layers": 32,
      "norm": "rms_norm",
      "context": 3000,
      "depformer_dim": 1024,
      "depformer_num_heads": 16,
      "depformer_num_layers": 6,
      "depformer_dim_feedforward": 4224,
      "depformer_multi_linear": true,
      "depformer_weights_per_step": true
    }
    "#;

    #[test]
    fn parse_config_and_derived_values() {
        let cfg = LmConfig::from_json_str(FULL_SIZE).expect("config");
        assert_eq!(cfg.num_codebooks(), 17);
        assert_eq!(cfg.num_external_codebooks(), 8);
        assert_eq!(cfg.max_delay(), 1);
        assert_eq!(cfg.norm, NormKind::RmsNorm);
        assert_eq!(cfg.hidden_dim(), 4 * 4096);
        assert_eq!(cfg.depformer_hidden_dim(), 4224);
        assert_eq!(cfg.text_out_vocab(), 32000);
        assert_eq!(cfg.text_padding_token_id(), 3);
        assert_eq!(cfg.text_initial_token_id(), 32000);
        assert_eq!(cfg.initial_token_id(), 2048);

        let initial = cfg.initial_tokens();
        assert_eq!(initial.len(), 17);
        assert_eq!(initial[0], 32000);
        assert!(initial[1..].iter().all(|&t| t == 2048));
    }

    #[test]
    fn padding_slot_added_without_existing_padding_id() {
        let cfg = LmConfig::tiny(8, 8, vec![0; 9]);
        assert_eq!(cfg.text_out_vocab(), cfg.text_card + 1);
        assert_eq!(cfg.text_padding_token_id(), cfg.text_card as i32);
        assert_eq!(cfg.num_external_codebooks(), 0);
    }

    #[test]
    fn rejects_delay_length_mismatch() {
        let cfg = LmConfig::tiny(8, 8, vec![0; 8]);
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));
    }

    #[test]
    fn rejects_dep_q_larger_than_n_q() {
        let cfg = LmConfig::tiny(2, 3, vec![0; 3]);
        assert!(matches!(cfg.validate(), Err(Error::Configuration(_))));
    }
}
