//! Multi-stream language model: the temporal model and the per-codebook
//! depth model the streaming engine drives.

use rand::SeedableRng;
use rand::rngs::StdRng;
use tracing::debug;

use crate::error::{Error, Result};
use crate::layer::LayerConfig;
use crate::nn::{Linear, Norm, ScaledEmbedding};
use crate::params::LmConfig;
use crate::tokens::{Token, TokenFrame};
use crate::transformer::{StreamingTransformer, Transformer, TransformerConfig};
use crate::weights::WeightStore;

/// Hidden representation and text logits for one timestep.
#[derive(Debug, Clone)]
pub struct TemporalOutput {
    /// `[batch, dim]`.
    pub hidden: Vec<f32>,
    /// `[batch, text_out_vocab]`.
    pub text_logits: Vec<f32>,
}

/// What the streaming engine needs from a model.
///
/// Both incremental states are owned by the caller. The temporal state lives
/// as long as a session; a depth state is created at the start of every outer
/// step and dropped at its end.
pub trait LanguageModel {
    type TemporalState;
    type DepthState;

    fn config(&self) -> &LmConfig;

    fn init_temporal_state(&self, batch_size: usize) -> Self::TemporalState;

    /// Advance the temporal model by one step on a `[batch, num_codebooks]` slice.
    fn forward_text(
        &self,
        state: &mut Self::TemporalState,
        tokens: &TokenFrame,
    ) -> Result<TemporalOutput>;

    fn init_depth_state(&self, batch_size: usize) -> Self::DepthState;

    /// Logits `[batch, card]` for depth codebook `cb_index`, given the token
    /// sampled just before it in the chain (`[batch]`) and the fixed hidden
    /// representation `[batch, dim]` of this timestep.
    fn forward_depformer(
        &self,
        state: &mut Self::DepthState,
        cb_index: usize,
        prev_tokens: &[Token],
        hidden: &[f32],
    ) -> Result<Vec<f32>>;
}

impl<M: LanguageModel> LanguageModel for &M {
    type TemporalState = M::TemporalState;
    type DepthState = M::DepthState;

    fn config(&self) -> &LmConfig {
        (**self).config()
    }

    fn init_temporal_state(&self, batch_size: usize) -> Self::TemporalState {
        (**self).init_temporal_state(batch_size)
    }

    fn forward_text(
        &self,
        state: &mut Self::TemporalState,
        tokens: &TokenFrame,
    ) -> Result<TemporalOutput> {
        (**self).forward_text(state, tokens)
    }

    fn init_depth_state(&self, batch_size: usize) -> Self::DepthState {
        (**self).init_depth_state(batch_size)
    }

    fn forward_depformer(
        &self,
        state: &mut Self::DepthState,
        cb_index: usize,
        prev_tokens: &[Token],
        hidden: &[f32],
    ) -> Result<Vec<f32>> {
        (**self).forward_depformer(state, cb_index, prev_tokens, hidden)
    }
}

/// Projection from the temporal hidden state into the depth model's space.
#[derive(Debug, Clone)]
pub enum DepformerInput {
    Shared(Linear),
    PerCodebook(Vec<Linear>),
}

impl DepformerInput {
    fn for_codebook(&self, cb_index: usize) -> &Linear {
        match self {
            Self::Shared(linear) => linear,
            Self::PerCodebook(linears) => &linears[cb_index],
        }
    }
}

#[derive(Debug, Clone)]
pub struct LmModel<T = Transformer, D = Transformer> {
    cfg: LmConfig,
    /// One per audio codebook, `card + 1` rows (the extra row is the initial token).
    emb: Vec<ScaledEmbedding>,
    text_emb: ScaledEmbedding,
    transformer: T,
    out_norm: Norm,
    text_linear: Linear,
    depformer_in: DepformerInput,
    /// Inputs for depth steps `1..dep_q`; the last codebook never feeds back.
    depformer_emb: Vec<ScaledEmbedding>,
    depformer_text_emb: ScaledEmbedding,
    depformer: D,
    linears: Vec<Linear>,
}

pub fn temporal_transformer_config(cfg: &LmConfig) -> TransformerConfig {
    TransformerConfig {
        layer: LayerConfig {
            dim: cfg.dim,
            hidden_dim: cfg.hidden_dim(),
            n_heads: cfg.num_heads,
            n_kv_heads: cfg.kv_heads(),
            head_dim: cfg.dim / cfg.num_heads,
            context: cfg.context.unwrap_or(0),
            norm_eps: cfg.norm_eps,
            rope_theta: cfg.rope_theta,
        },
        n_layers: cfg.num_layers,
        weights_per_step: None,
    }
}

pub fn depformer_transformer_config(cfg: &LmConfig) -> TransformerConfig {
    TransformerConfig {
        layer: LayerConfig {
            dim: cfg.depformer_dim,
            hidden_dim: cfg.depformer_hidden_dim(),
            n_heads: cfg.depformer_num_heads,
            n_kv_heads: cfg.depformer_num_heads,
            head_dim: cfg.depformer_dim / cfg.depformer_num_heads,
            context: 0,
            norm_eps: cfg.norm_eps,
            rope_theta: cfg.rope_theta,
        },
        n_layers: cfg.depformer_num_layers,
        weights_per_step: cfg.depformer_weights_per_step.then_some(cfg.dep_q),
    }
}

impl LmModel<Transformer, Transformer> {
    /// Deterministic random weights, for tests and demos.
    pub fn random(cfg: LmConfig, seed: u64) -> Result<Self> {
        cfg.validate()?;
        let mut rng = StdRng::seed_from_u64(seed);
        let emb_norm = || {
            cfg.norm_emb
                .then(|| Norm::identity(cfg.norm, cfg.dim, cfg.norm_eps))
        };
        let dep_dim = cfg.depformer_dim;

        let emb = (0..cfg.n_q)
            .map(|_| ScaledEmbedding::random(cfg.card + 1, cfg.dim, emb_norm(), &mut rng))
            .collect();
        let text_emb = ScaledEmbedding::random(cfg.text_card + 1, cfg.dim, emb_norm(), &mut rng);
        let transformer = Transformer::random(temporal_transformer_config(&cfg), &mut rng)?;
        let out_norm = Norm::identity(cfg.norm, cfg.dim, cfg.norm_eps);
        let text_linear = Linear::random(cfg.dim, cfg.text_out_vocab(), cfg.bias_proj, &mut rng);
        let depformer_in = if cfg.depformer_multi_linear {
            DepformerInput::PerCodebook(
                (0..cfg.dep_q)
                    .map(|_| Linear::random(cfg.dim, dep_dim, false, &mut rng))
                    .collect(),
            )
        } else {
            DepformerInput::Shared(Linear::random(cfg.dim, dep_dim, false, &mut rng))
        };
        let depformer_emb = (0..cfg.dep_q - 1)
            .map(|_| ScaledEmbedding::random(cfg.card + 1, dep_dim, None, &mut rng))
            .collect();
        let depformer_text_emb = ScaledEmbedding::random(cfg.text_card + 1, dep_dim, None, &mut rng);
        let depformer = Transformer::random(depformer_transformer_config(&cfg), &mut rng)?;
        let linears = (0..cfg.dep_q)
            .map(|_| Linear::random(dep_dim, cfg.card, cfg.bias_proj, &mut rng))
            .collect();

        Self::new(
            cfg,
            emb,
            text_emb,
            transformer,
            out_norm,
            text_linear,
            depformer_in,
            depformer_emb,
            depformer_text_emb,
            depformer,
            linears,
        )
    }

    pub fn load(cfg: LmConfig, store: &WeightStore) -> Result<Self> {
        cfg.validate()?;
        let emb_norm = cfg.norm_emb.then_some((cfg.norm, cfg.norm_eps));
        let dep_dim = cfg.depformer_dim;

        let emb = (0..cfg.n_q)
            .map(|i| ScaledEmbedding::load(store, &format!("emb.{i}"), cfg.card + 1, cfg.dim, emb_norm))
            .collect::<Result<Vec<_>>>()?;
        let text_emb =
            ScaledEmbedding::load(store, "text_emb", cfg.text_card + 1, cfg.dim, emb_norm)?;
        let transformer =
            Transformer::load(store, "transformer", temporal_transformer_config(&cfg))?;
        let out_norm = Norm::load(store, "out_norm", cfg.norm, cfg.dim, cfg.norm_eps)?;
        let text_linear = Linear::load(
            store,
            "text_linear",
            cfg.dim,
            cfg.text_out_vocab(),
            cfg.bias_proj,
        )?;
        let depformer_in = if cfg.depformer_multi_linear {
            DepformerInput::PerCodebook(
                (0..cfg.dep_q)
                    .map(|i| Linear::load(store, &format!("depformer_in.{i}"), cfg.dim, dep_dim, false))
                    .collect::<Result<Vec<_>>>()?,
            )
        } else {
            DepformerInput::Shared(Linear::load(store, "depformer_in.0", cfg.dim, dep_dim, false)?)
        };
        let depformer_emb = (0..cfg.dep_q - 1)
            .map(|i| {
                ScaledEmbedding::load(store, &format!("depformer_emb.{i}"), cfg.card + 1, dep_dim, None)
            })
            .collect::<Result<Vec<_>>>()?;
        let depformer_text_emb =
            ScaledEmbedding::load(store, "depformer_text_emb", cfg.text_card + 1, dep_dim, None)?;
        let depformer = Transformer::load(store, "depformer", depformer_transformer_config(&cfg))?;
        let linears = (0..cfg.dep_q)
            .map(|i| Linear::load(store, &format!("linears.{i}"), dep_dim, cfg.card, cfg.bias_proj))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            n_q = cfg.n_q,
            dep_q = cfg.dep_q,
            dim = cfg.dim,
            depformer_dim = dep_dim,
            "loaded language model weights"
        );
        Self::new(
            cfg,
            emb,
            text_emb,
            transformer,
            out_norm,
            text_linear,
            depformer_in,
            depformer_emb,
            depformer_text_emb,
            depformer,
            linears,
        )
    }
}

impl<T: StreamingTransformer, D: StreamingTransformer> LmModel<T, D> {
    /// Assemble a model from parts, checking every per-codebook collection
    /// has the size the configuration fixes.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: LmConfig,
        emb: Vec<ScaledEmbedding>,
        text_emb: ScaledEmbedding,
        transformer: T,
        out_norm: Norm,
        text_linear: Linear,
        depformer_in: DepformerInput,
        depformer_emb: Vec<ScaledEmbedding>,
        depformer_text_emb: ScaledEmbedding,
        depformer: D,
        linears: Vec<Linear>,
    ) -> Result<Self> {
        cfg.validate()?;
        let check = |what: &'static str, expected: usize, got: usize| {
            if expected == got {
                Ok(())
            } else {
                Err(Error::shape(what, expected, got))
            }
        };
        check("audio embeddings", cfg.n_q, emb.len())?;
        check("depformer embeddings", cfg.dep_q - 1, depformer_emb.len())?;
        check("output heads", cfg.dep_q, linears.len())?;
        check("temporal transformer dim", cfg.dim, transformer.dim())?;
        check("depformer dim", cfg.depformer_dim, depformer.dim())?;
        check("text head width", cfg.text_out_vocab(), text_linear.out_dim())?;
        if let DepformerInput::PerCodebook(linears) = &depformer_in {
            check("depformer input projections", cfg.dep_q, linears.len())?;
        }
        Ok(Self {
            cfg,
            emb,
            text_emb,
            transformer,
            out_norm,
            text_linear,
            depformer_in,
            depformer_emb,
            depformer_text_emb,
            depformer,
            linears,
        })
    }

    pub fn transformer(&self) -> &T {
        &self.transformer
    }

    pub fn depformer(&self) -> &D {
        &self.depformer
    }
}

impl<T: StreamingTransformer, D: StreamingTransformer> LanguageModel for LmModel<T, D> {
    type TemporalState = T::State;
    type DepthState = D::State;

    fn config(&self) -> &LmConfig {
        &self.cfg
    }

    fn init_temporal_state(&self, batch_size: usize) -> T::State {
        self.transformer.init_state(batch_size)
    }

    fn forward_text(&self, state: &mut T::State, tokens: &TokenFrame) -> Result<TemporalOutput> {
        if tokens.codebooks() != self.cfg.num_codebooks() {
            return Err(Error::shape(
                "temporal input codebooks",
                self.cfg.num_codebooks(),
                tokens.codebooks(),
            ));
        }
        let mut input = self.text_emb.forward(&tokens.column(0))?;
        for (i, emb) in self.emb.iter().enumerate() {
            let audio = emb.forward(&tokens.column(i + 1))?;
            for (acc, v) in input.iter_mut().zip(audio) {
                *acc += v;
            }
        }
        let out = self.transformer.step(state, &input)?;
        let hidden = self.out_norm.forward(&out);
        let text_logits = self.text_linear.forward(&hidden)?;
        Ok(TemporalOutput {
            hidden,
            text_logits,
        })
    }

    fn init_depth_state(&self, batch_size: usize) -> D::State {
        self.depformer.init_state(batch_size)
    }

    fn forward_depformer(
        &self,
        state: &mut D::State,
        cb_index: usize,
        prev_tokens: &[Token],
        hidden: &[f32],
    ) -> Result<Vec<f32>> {
        if cb_index >= self.cfg.dep_q {
            return Err(Error::shape("depformer codebook", format!("< {}", self.cfg.dep_q), cb_index));
        }
        let mut input = self.depformer_in.for_codebook(cb_index).forward(hidden)?;
        let prev = if cb_index == 0 {
            self.depformer_text_emb.forward(prev_tokens)?
        } else {
            self.depformer_emb[cb_index - 1].forward(prev_tokens)?
        };
        if prev.len() != input.len() {
            return Err(Error::shape("depformer input", input.len(), prev.len()));
        }
        for (acc, v) in input.iter_mut().zip(prev) {
            *acc += v;
        }
        let out = self.depformer.step(state, &input)?;
        self.linears[cb_index].forward(&out)
    }
}
