//! Streaming generation engine.
//!
//! One [`LmGen::step`] call consumes one timestep of caller-supplied tokens,
//! runs the temporal model once and the depth chain once, and after the
//! warm-up window yields one delay-aligned frame of generated tokens.

use std::ops::{Deref, DerefMut};

use tracing::{debug, trace, warn};

use crate::cache::DelayCache;
use crate::depformer::depformer_step;
use crate::error::{Error, Result};
use crate::lm::LanguageModel;
use crate::params::LmConfig;
use crate::sampling::{GenConfig, Sampler};
use crate::tokens::{Token, TokenFrame, UNGENERATED_TOKEN, ZERO_TOKEN};

/// Result of a step past the warm-up window.
#[derive(Debug, Clone)]
pub struct StepOutput {
    /// Delay-aligned `[batch, 1 + dep_q]`: text then generated audio.
    pub tokens: TokenFrame,
    /// `[batch, num_codebooks]` slice fed to the temporal model this step.
    pub input_tokens: TokenFrame,
    /// `[batch]` text tokens sampled this step.
    pub text_tokens: Vec<Token>,
    /// `[batch, dep_q]` audio tokens sampled this step.
    pub audio_tokens: TokenFrame,
    /// `[batch, dim]`.
    pub hidden: Vec<f32>,
    /// `[batch, text_out_vocab]`.
    pub text_logits: Vec<f32>,
    /// `[batch, dep_q, card]`.
    pub audio_logits: Vec<f32>,
}

struct GenState<S> {
    cache: DelayCache,
    temporal: S,
    sampler: Sampler,
    offset: usize,
    poisoned: bool,
}

pub struct LmGen<M: LanguageModel> {
    model: M,
    gen_cfg: GenConfig,
    state: Option<GenState<M::TemporalState>>,
}

impl<M: LanguageModel> LmGen<M> {
    pub fn new(model: M, gen_cfg: GenConfig) -> Result<Self> {
        model.config().validate()?;
        gen_cfg.validate()?;
        Ok(Self {
            model,
            gen_cfg,
            state: None,
        })
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn config(&self) -> &LmConfig {
        self.model.config()
    }

    pub fn gen_config(&self) -> &GenConfig {
        &self.gen_cfg
    }

    pub fn max_delay(&self) -> usize {
        self.config().max_delay()
    }

    pub fn is_active(&self) -> bool {
        self.state.is_some()
    }

    /// Completed steps in the open session.
    pub fn offset(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.offset)
    }

    pub fn batch_size(&self) -> Option<usize> {
        self.state.as_ref().map(|s| s.cache.batch())
    }

    pub fn open_session(&mut self, batch_size: usize) -> Result<()> {
        if self.state.is_some() {
            return Err(Error::SessionState("a session is already open"));
        }
        if batch_size == 0 {
            return Err(Error::shape("batch size", "> 0", 0));
        }
        let cfg = self.model.config();
        let cache = DelayCache::new(
            batch_size,
            cfg.delays.clone(),
            cfg.initial_tokens(),
            cfg.dep_q + 1,
        )?;
        debug!(
            batch_size,
            capacity = cache.capacity(),
            max_delay = cache.max_delay(),
            "opened generation session"
        );
        self.state = Some(GenState {
            cache,
            temporal: self.model.init_temporal_state(batch_size),
            sampler: Sampler::new(self.gen_cfg.seed),
            offset: 0,
            poisoned: false,
        });
        Ok(())
    }

    /// Re-seed the open session: buffer, offset, model state and sampler.
    pub fn reset_session(&mut self) -> Result<()> {
        let state = self
            .state
            .as_mut()
            .ok_or(Error::SessionState("no open session to reset"))?;
        state.cache.reset();
        state.temporal = self.model.init_temporal_state(state.cache.batch());
        state.sampler = Sampler::new(self.gen_cfg.seed);
        state.offset = 0;
        state.poisoned = false;
        debug!("reset generation session");
        Ok(())
    }

    pub fn close_session(&mut self) -> Result<()> {
        match self.state.take() {
            Some(state) => {
                debug!(offset = state.offset, "closed generation session");
                Ok(())
            }
            None => Err(Error::SessionState("no open session to close")),
        }
    }

    /// Open a session that closes itself when the guard is dropped.
    pub fn streaming(&mut self, batch_size: usize) -> Result<StreamingSession<'_, M>> {
        self.open_session(batch_size)?;
        Ok(StreamingSession { lm_gen: self })
    }

    /// Advance by one timestep.
    ///
    /// `input` holds the `[batch, num_codebooks - dep_q - 1]` caller-supplied
    /// tokens. Returns `None` for the first `max_delay` calls of a session.
    /// Any error poisons the session; it must then be reset or closed.
    pub fn step(&mut self, input: &TokenFrame) -> Result<Option<StepOutput>> {
        let Self {
            model,
            gen_cfg,
            state,
        } = self;
        let state = state
            .as_mut()
            .ok_or(Error::SessionState("step called without an open session"))?;
        if state.poisoned {
            return Err(Error::SessionState(
                "session poisoned by an earlier failure; reset or close it",
            ));
        }
        let res = step_inner(model, gen_cfg, state, input);
        if let Err(err) = &res {
            warn!(offset = state.offset, error = %err, "generation step failed, session poisoned");
            state.poisoned = true;
        }
        res
    }
}

fn step_inner<M: LanguageModel>(
    model: &M,
    gen_cfg: &GenConfig,
    state: &mut GenState<M::TemporalState>,
    input: &TokenFrame,
) -> Result<Option<StepOutput>> {
    let cfg = model.config();
    let batch = state.cache.batch();
    let n_ext = cfg.num_external_codebooks();
    if input.batch() != batch || input.codebooks() != n_ext {
        return Err(Error::shape(
            "external tokens",
            format!("{batch}x{n_ext}"),
            format!("{}x{}", input.batch(), input.codebooks()),
        ));
    }
    let offset = state.offset;
    if gen_cfg.check {
        check_external(cfg, input, offset)?;
    }

    for q in 0..n_ext {
        let k = cfg.dep_q + 1 + q;
        state.cache.write(k, &input.column(q), offset)?;
    }
    state.cache.seed_initial(offset);
    let input_tokens = state.cache.read_current(offset);
    // Externals were checked on ingestion and sampled tokens stay inside the
    // heads' vocabularies, so this only trips on a slot left ungenerated.
    if gen_cfg.check {
        check_slice(cfg, &input_tokens, offset)?;
    }

    let temporal = model.forward_text(&mut state.temporal, &input_tokens)?;
    let text_tokens =
        state
            .sampler
            .sample_rows(&temporal.text_logits, cfg.text_out_vocab(), gen_cfg.text())?;
    let depth = depformer_step(
        model,
        &text_tokens,
        &temporal.hidden,
        &mut state.sampler,
        gen_cfg.audio(),
    )?;

    state.offset += 1;
    let text_frame = TokenFrame::new(batch, 1, text_tokens.clone())?;
    let generated = TokenFrame::concat(&[&text_frame, &depth.tokens])?;
    state.cache.write_generated(state.offset, &generated)?;
    trace!(offset = state.offset, text = ?text_tokens, "generation step");

    if state.offset <= state.cache.max_delay() {
        return Ok(None);
    }
    let tokens = state.cache.gather_output(state.offset)?;
    Ok(Some(StepOutput {
        tokens,
        input_tokens,
        text_tokens,
        audio_tokens: depth.tokens,
        hidden: temporal.hidden,
        text_logits: temporal.text_logits,
        audio_logits: depth.logits,
    }))
}

/// Upper bound (inclusive) of valid ids for codebook `k`; the bound itself
/// is the stream's initial token.
fn max_token(cfg: &LmConfig, codebook: usize) -> Token {
    if codebook == 0 {
        cfg.text_card as Token
    } else {
        cfg.card as Token
    }
}

fn check_external(cfg: &LmConfig, input: &TokenFrame, offset: usize) -> Result<()> {
    for b in 0..input.batch() {
        for q in 0..input.codebooks() {
            let codebook = cfg.dep_q + 1 + q;
            check_token(cfg, codebook, b, input.get(b, q), offset)?;
        }
    }
    Ok(())
}

/// Consistency check on the slice about to reach the model.
pub(crate) fn check_slice(cfg: &LmConfig, tokens: &TokenFrame, offset: usize) -> Result<()> {
    for b in 0..tokens.batch() {
        for k in 0..tokens.codebooks() {
            check_token(cfg, k, b, tokens.get(b, k), offset)?;
        }
    }
    Ok(())
}

fn check_token(cfg: &LmConfig, codebook: usize, batch: usize, value: Token, offset: usize) -> Result<()> {
    let reason = if value == UNGENERATED_TOKEN {
        "ungenerated token"
    } else if value < ZERO_TOKEN {
        "unknown sentinel"
    } else if value > max_token(cfg, codebook) {
        "token above vocabulary range"
    } else {
        return Ok(());
    };
    Err(Error::ConsistencyViolation {
        offset,
        codebook,
        batch,
        value,
        reason,
    })
}

/// Open session that closes on drop.
pub struct StreamingSession<'a, M: LanguageModel> {
    lm_gen: &'a mut LmGen<M>,
}

impl<M: LanguageModel> Deref for StreamingSession<'_, M> {
    type Target = LmGen<M>;

    fn deref(&self) -> &LmGen<M> {
        self.lm_gen
    }
}

impl<M: LanguageModel> DerefMut for StreamingSession<'_, M> {
    fn deref_mut(&mut self) -> &mut LmGen<M> {
        self.lm_gen
    }
}

impl<M: LanguageModel> Drop for StreamingSession<'_, M> {
    fn drop(&mut self) {
        if self.lm_gen.is_active() {
            let _ = self.lm_gen.close_session();
        }
    }
}
