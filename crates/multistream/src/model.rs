//! Model directory loading: `config.json` plus `model.safetensors`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use crate::lm::{LmModel, depformer_transformer_config, temporal_transformer_config};
use crate::params::{LmConfig, NormKind};
use crate::transformer::TransformerConfig;
use crate::weights::WeightStore;

#[derive(Debug)]
pub struct ModelBundle {
    pub config: LmConfig,
    pub weights: WeightStore,
}

pub fn config_path(dir: &Path) -> PathBuf {
    dir.join("config.json")
}

pub fn weights_path(dir: &Path) -> PathBuf {
    dir.join("model.safetensors")
}

impl ModelBundle {
    pub fn load_config(dir: impl AsRef<Path>) -> Result<LmConfig> {
        LmConfig::from_path(config_path(dir.as_ref())).context("load config.json")
    }

    pub fn load_from_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let config = Self::load_config(dir)?;
        let weights = WeightStore::open(weights_path(dir)).context("load model.safetensors")?;
        Ok(Self { config, weights })
    }

    pub fn build_model(&self) -> Result<LmModel> {
        LmModel::load(self.config.clone(), &self.weights).context("build language model")
    }

    /// Names from [`expected_tensors`] absent from the weight file.
    pub fn missing_tensors(&self) -> Vec<String> {
        expected_tensors(&self.config)
            .into_iter()
            .map(|(name, _)| name)
            .filter(|name| !self.weights.contains(name))
            .collect()
    }
}

/// Every tensor [`LmModel::load`] reads for `cfg`, with its shape.
pub fn expected_tensors(cfg: &LmConfig) -> Vec<(String, Vec<usize>)> {
    let mut out = Vec::new();
    let dep_dim = cfg.depformer_dim;
    let embedding = |out: &mut Vec<(String, Vec<usize>)>, prefix: String, vocab: usize, dim: usize, normed: bool| {
        out.push((format!("{prefix}.weight"), vec![vocab, dim]));
        if normed {
            push_norm(out, &format!("{prefix}.norm"), cfg.norm, dim);
        }
    };

    for i in 0..cfg.n_q {
        embedding(&mut out, format!("emb.{i}"), cfg.card + 1, cfg.dim, cfg.norm_emb);
    }
    embedding(&mut out, "text_emb".to_string(), cfg.text_card + 1, cfg.dim, cfg.norm_emb);
    push_transformer(&mut out, "transformer", &temporal_transformer_config(cfg));
    push_norm(&mut out, "out_norm", cfg.norm, cfg.dim);
    push_linear(&mut out, "text_linear", cfg.dim, cfg.text_out_vocab(), cfg.bias_proj);

    let n_in = if cfg.depformer_multi_linear { cfg.dep_q } else { 1 };
    for i in 0..n_in {
        push_linear(&mut out, &format!("depformer_in.{i}"), cfg.dim, dep_dim, false);
    }
    for i in 0..cfg.dep_q.saturating_sub(1) {
        embedding(&mut out, format!("depformer_emb.{i}"), cfg.card + 1, dep_dim, false);
    }
    embedding(&mut out, "depformer_text_emb".to_string(), cfg.text_card + 1, dep_dim, false);
    push_transformer(&mut out, "depformer", &depformer_transformer_config(cfg));
    for i in 0..cfg.dep_q {
        push_linear(&mut out, &format!("linears.{i}"), dep_dim, cfg.card, cfg.bias_proj);
    }
    out
}

fn push_norm(out: &mut Vec<(String, Vec<usize>)>, prefix: &str, kind: NormKind, dim: usize) {
    out.push((format!("{prefix}.weight"), vec![dim]));
    if kind == NormKind::LayerNorm {
        out.push((format!("{prefix}.bias"), vec![dim]));
    }
}

fn push_linear(out: &mut Vec<(String, Vec<usize>)>, prefix: &str, in_dim: usize, out_dim: usize, bias: bool) {
    out.push((format!("{prefix}.weight"), vec![out_dim, in_dim]));
    if bias {
        out.push((format!("{prefix}.bias"), vec![out_dim]));
    }
}

fn push_transformer(out: &mut Vec<(String, Vec<usize>)>, prefix: &str, cfg: &TransformerConfig) {
    let stacks: Vec<String> = match cfg.weights_per_step {
        None => vec![prefix.to_string()],
        Some(n) => (0..n).map(|s| format!("{prefix}.steps.{s}")).collect(),
    };
    let l = cfg.layer;
    for stack in stacks {
        for i in 0..cfg.n_layers {
            let p = format!("{stack}.layers.{i}");
            out.push((format!("{p}.attention_norm.weight"), vec![l.dim]));
            out.push((format!("{p}.attention.wq.weight"), vec![l.q_dim(), l.dim]));
            out.push((format!("{p}.attention.wk.weight"), vec![l.kv_dim(), l.dim]));
            out.push((format!("{p}.attention.wv.weight"), vec![l.kv_dim(), l.dim]));
            out.push((format!("{p}.attention.wo.weight"), vec![l.dim, l.q_dim()]));
            out.push((format!("{p}.ffn_norm.weight"), vec![l.dim]));
            out.push((format!("{p}.feed_forward.w1.weight"), vec![l.hidden_dim, l.dim]));
            out.push((format!("{p}.feed_forward.w2.weight"), vec![l.dim, l.hidden_dim]));
            out.push((format!("{p}.feed_forward.w3.weight"), vec![l.hidden_dim, l.dim]));
        }
    }
}
