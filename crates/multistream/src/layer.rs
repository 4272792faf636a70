//! One pre-norm transformer layer, run a single token at a time.

use anyhow::Result;
use rand::Rng;

use crate::kv::RollingKvCache;
use crate::math::{rms_norm_rows, rope_interleaved_inplace};
use crate::ops::{AttentionShape, add_inplace, attention_step, linear, swiglu_inplace};
use crate::weights::{WeightError, WeightStore};

#[derive(Debug, Clone, Copy)]
pub struct LayerConfig {
    pub dim: usize,
    pub hidden_dim: usize,
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
    /// `0` means unbounded attention history.
    pub context: usize,
    pub norm_eps: f32,
    pub rope_theta: f32,
}

impl LayerConfig {
    pub fn validate(self) -> Result<()> {
        anyhow::ensure!(self.dim > 0, "dim must be > 0");
        anyhow::ensure!(self.hidden_dim > 0, "hidden_dim must be > 0");
        anyhow::ensure!(self.n_heads > 0, "n_heads must be > 0");
        anyhow::ensure!(self.n_kv_heads > 0, "n_kv_heads must be > 0");
        anyhow::ensure!(
            self.head_dim > 0 && self.head_dim.is_multiple_of(2),
            "head_dim must be a positive even number"
        );
        anyhow::ensure!(
            self.n_heads.is_multiple_of(self.n_kv_heads),
            "n_heads must be divisible by n_kv_heads"
        );
        Ok(())
    }

    pub fn q_dim(self) -> usize {
        self.n_heads * self.head_dim
    }

    pub fn kv_dim(self) -> usize {
        self.n_kv_heads * self.head_dim
    }
}

#[derive(Debug, Clone)]
pub struct LayerWeights {
    pub attention_norm: Vec<f32>, // [dim]
    pub wq: Vec<f32>,             // [n_heads*head_dim, dim]
    pub wk: Vec<f32>,             // [n_kv_heads*head_dim, dim]
    pub wv: Vec<f32>,             // [n_kv_heads*head_dim, dim]
    pub wo: Vec<f32>,             // [dim, n_heads*head_dim]
    pub ffn_norm: Vec<f32>,       // [dim]
    pub w1: Vec<f32>,             // [hidden_dim, dim]
    pub w2: Vec<f32>,             // [dim, hidden_dim]
    pub w3: Vec<f32>,             // [hidden_dim, dim]
}

impl LayerWeights {
    /// Load `{prefix}.attention.wq.weight` and friends.
    pub fn load(
        store: &WeightStore,
        prefix: &str,
        cfg: LayerConfig,
    ) -> std::result::Result<Self, WeightError> {
        let (q_dim, kv_dim) = (cfg.q_dim(), cfg.kv_dim());
        let get = |name: &str, shape: &[usize]| store.tensor_shaped(&format!("{prefix}.{name}"), shape);
        Ok(Self {
            attention_norm: get("attention_norm.weight", &[cfg.dim])?,
            wq: get("attention.wq.weight", &[q_dim, cfg.dim])?,
            wk: get("attention.wk.weight", &[kv_dim, cfg.dim])?,
            wv: get("attention.wv.weight", &[kv_dim, cfg.dim])?,
            wo: get("attention.wo.weight", &[cfg.dim, q_dim])?,
            ffn_norm: get("ffn_norm.weight", &[cfg.dim])?,
            w1: get("feed_forward.w1.weight", &[cfg.hidden_dim, cfg.dim])?,
            w2: get("feed_forward.w2.weight", &[cfg.dim, cfg.hidden_dim])?,
            w3: get("feed_forward.w3.weight", &[cfg.hidden_dim, cfg.dim])?,
        })
    }

    pub fn random(cfg: LayerConfig, rng: &mut impl Rng) -> Self {
        let mut init = |n: usize, scale: f32| -> Vec<f32> {
            (0..n).map(|_| rng.gen_range(-scale..scale)).collect()
        };
        let (q_dim, kv_dim) = (cfg.q_dim(), cfg.kv_dim());
        let s_in = 1.0 / (cfg.dim as f32).sqrt();
        let s_hidden = 1.0 / (cfg.hidden_dim as f32).sqrt();
        Self {
            attention_norm: vec![1.0; cfg.dim],
            wq: init(q_dim * cfg.dim, s_in),
            wk: init(kv_dim * cfg.dim, s_in),
            wv: init(kv_dim * cfg.dim, s_in),
            wo: init(cfg.dim * q_dim, s_in),
            ffn_norm: vec![1.0; cfg.dim],
            w1: init(cfg.hidden_dim * cfg.dim, s_in),
            w2: init(cfg.dim * cfg.hidden_dim, s_hidden),
            w3: init(cfg.hidden_dim * cfg.dim, s_in),
        }
    }

    pub fn validate(&self, cfg: LayerConfig) -> Result<()> {
        let (q_dim, kv_dim) = (cfg.q_dim(), cfg.kv_dim());
        anyhow::ensure!(
            self.attention_norm.len() == cfg.dim,
            "attention_norm shape mismatch"
        );
        anyhow::ensure!(self.wq.len() == q_dim * cfg.dim, "wq shape mismatch");
        anyhow::ensure!(self.wk.len() == kv_dim * cfg.dim, "wk shape mismatch");
        anyhow::ensure!(self.wv.len() == kv_dim * cfg.dim, "wv shape mismatch");
        anyhow::ensure!(self.wo.len() == cfg.dim * q_dim, "wo shape mismatch");
        anyhow::ensure!(self.ffn_norm.len() == cfg.dim, "ffn_norm shape mismatch");
        anyhow::ensure!(
            self.w1.len() == cfg.hidden_dim * cfg.dim,
            "w1 shape mismatch"
        );
        anyhow::ensure!(
            self.w2.len() == cfg.dim * cfg.hidden_dim,
            "w2 shape mismatch"
        );
        anyhow::ensure!(
            self.w3.len() == cfg.hidden_dim * cfg.dim,
            "w3 shape mismatch"
        );
        Ok(())
    }
}

/// Run layer `layer_idx` for one token of one sequence at position `pos`.
///
/// Config and weights are validated once at construction by the owning
/// transformer, not here.
pub fn layer_forward_step(
    cfg: LayerConfig,
    layer_idx: usize,
    weights: &LayerWeights,
    cache: &mut RollingKvCache,
    hidden: &[f32], // [dim]
    pos: usize,
) -> Result<Vec<f32>> {
    anyhow::ensure!(
        hidden.len() == cfg.dim,
        "hidden size mismatch: expected {}, got {}",
        cfg.dim,
        hidden.len()
    );
    let (q_dim, kv_dim) = (cfg.q_dim(), cfg.kv_dim());

    let mut x_norm = vec![0.0f32; cfg.dim];
    rms_norm_rows(
        &mut x_norm,
        hidden,
        &weights.attention_norm,
        cfg.dim,
        cfg.norm_eps,
    );

    let mut q = linear(&x_norm, 1, cfg.dim, &weights.wq, q_dim, None);
    let mut k = linear(&x_norm, 1, cfg.dim, &weights.wk, kv_dim, None);
    let v = linear(&x_norm, 1, cfg.dim, &weights.wv, kv_dim, None);

    rope_interleaved_inplace(&mut q, cfg.n_heads, cfg.head_dim, pos, cfg.rope_theta);
    rope_interleaved_inplace(&mut k, cfg.n_kv_heads, cfg.head_dim, pos, cfg.rope_theta);

    cache.push(layer_idx, &k, &v);
    let (keys, values) = cache.keys_values(layer_idx);
    let attn = attention_step(
        &q,
        keys,
        values,
        AttentionShape {
            n_heads: cfg.n_heads,
            n_kv_heads: cfg.n_kv_heads,
            head_dim: cfg.head_dim,
        },
    );
    let mut h = hidden.to_vec();
    add_inplace(&mut h, &linear(&attn, 1, q_dim, &weights.wo, cfg.dim, None));

    let mut h_norm = vec![0.0f32; cfg.dim];
    rms_norm_rows(&mut h_norm, &h, &weights.ffn_norm, cfg.dim, cfg.norm_eps);
    let mut gate = linear(&h_norm, 1, cfg.dim, &weights.w1, cfg.hidden_dim, None);
    let up = linear(&h_norm, 1, cfg.dim, &weights.w3, cfg.hidden_dim, None);
    swiglu_inplace(&mut gate, &up);
    add_inplace(&mut h, &linear(&gate, 1, cfg.hidden_dim, &weights.w2, cfg.dim, None));

    Ok(h)
}
