//! Incremental transformer stacks behind the [`StreamingTransformer`] seam.

use anyhow::Result;
use rand::Rng;

use crate::kv::RollingKvCache;
use crate::layer::{LayerConfig, LayerWeights, layer_forward_step};
use crate::weights::{WeightError, WeightStore};

/// A causal model advanced one timestep at a time.
///
/// Weights live in the implementor and are never mutated by a step; all
/// incremental state lives in `State`, which the caller owns. Dropping a
/// state releases it.
pub trait StreamingTransformer {
    type State;

    fn dim(&self) -> usize;

    fn init_state(&self, batch_size: usize) -> Self::State;

    /// `xs` is `[batch, dim]` for exactly one timestep; returns the same shape.
    fn step(&self, state: &mut Self::State, xs: &[f32]) -> Result<Vec<f32>>;
}

#[derive(Debug, Clone, Copy)]
pub struct TransformerConfig {
    pub layer: LayerConfig,
    pub n_layers: usize,
    /// When set, step `i` runs its own layer stack (`i < weights_per_step`).
    pub weights_per_step: Option<usize>,
}

#[derive(Debug, Clone)]
pub struct Transformer {
    cfg: TransformerConfig,
    /// Indexed `[step][layer]`; a single entry when weights are shared.
    stacks: Vec<Vec<LayerWeights>>,
}

#[derive(Debug, Clone)]
pub struct TransformerState {
    caches: Vec<RollingKvCache>,
    pos: usize,
}

impl TransformerState {
    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn batch_size(&self) -> usize {
        self.caches.len()
    }
}

impl Transformer {
    pub fn new(cfg: TransformerConfig, stacks: Vec<Vec<LayerWeights>>) -> Result<Self> {
        cfg.layer.validate()?;
        let expected_stacks = cfg.weights_per_step.unwrap_or(1);
        anyhow::ensure!(
            stacks.len() == expected_stacks,
            "expected {expected_stacks} weight stacks, got {}",
            stacks.len()
        );
        for stack in &stacks {
            anyhow::ensure!(
                stack.len() == cfg.n_layers,
                "expected {} layers, got {}",
                cfg.n_layers,
                stack.len()
            );
            for layer in stack {
                layer.validate(cfg.layer)?;
            }
        }
        Ok(Self { cfg, stacks })
    }

    pub fn random(cfg: TransformerConfig, rng: &mut impl Rng) -> Result<Self> {
        let stacks = (0..cfg.weights_per_step.unwrap_or(1))
            .map(|_| {
                (0..cfg.n_layers)
                    .map(|_| LayerWeights::random(cfg.layer, &mut *rng))
                    .collect::<Vec<_>>()
            })
            .collect();
        Self::new(cfg, stacks)
    }

    /// Shared weights live under `{prefix}.layers.{l}`, per-step weights
    /// under `{prefix}.steps.{s}.layers.{l}`.
    pub fn load(store: &WeightStore, prefix: &str, cfg: TransformerConfig) -> Result<Self> {
        let load_stack = |stack_prefix: String| -> std::result::Result<Vec<LayerWeights>, WeightError> {
            (0..cfg.n_layers)
                .map(|l| LayerWeights::load(store, &format!("{stack_prefix}.layers.{l}"), cfg.layer))
                .collect()
        };
        let stacks = match cfg.weights_per_step {
            None => vec![load_stack(prefix.to_string())?],
            Some(n) => (0..n)
                .map(|s| load_stack(format!("{prefix}.steps.{s}")))
                .collect::<std::result::Result<_, _>>()?,
        };
        Self::new(cfg, stacks)
    }

    pub fn config(&self) -> &TransformerConfig {
        &self.cfg
    }

    fn stack_for(&self, pos: usize) -> Result<&[LayerWeights]> {
        match self.cfg.weights_per_step {
            None => Ok(&self.stacks[0]),
            Some(n) => {
                anyhow::ensure!(pos < n, "step {pos} beyond the {n} per-step weight stacks");
                Ok(&self.stacks[pos])
            }
        }
    }
}

impl StreamingTransformer for Transformer {
    type State = TransformerState;

    fn dim(&self) -> usize {
        self.cfg.layer.dim
    }

    fn init_state(&self, batch_size: usize) -> TransformerState {
        let lc = self.cfg.layer;
        let window = (lc.context > 0).then_some(lc.context);
        TransformerState {
            caches: (0..batch_size)
                .map(|_| RollingKvCache::new(self.cfg.n_layers, lc.n_kv_heads, lc.head_dim, window))
                .collect(),
            pos: 0,
        }
    }

    fn step(&self, state: &mut TransformerState, xs: &[f32]) -> Result<Vec<f32>> {
        let dim = self.dim();
        anyhow::ensure!(
            xs.len() == state.caches.len() * dim,
            "transformer input: expected {}x{dim} values, got {}",
            state.caches.len(),
            xs.len()
        );
        let stack = self.stack_for(state.pos)?;

        let mut out = Vec::with_capacity(xs.len());
        for (x, cache) in xs.chunks_exact(dim).zip(state.caches.iter_mut()) {
            let mut h = x.to_vec();
            for (l, weights) in stack.iter().enumerate() {
                h = layer_forward_step(self.cfg.layer, l, weights, cache, &h, state.pos)?;
            }
            out.extend_from_slice(&h);
        }
        state.pos += 1;
        Ok(out)
    }
}
