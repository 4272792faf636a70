//! Reference mode driven by caller-aligned tokens.
//!
//! Takes already time-aligned tokens for one timestep, with no delay
//! bookkeeping, and runs the same temporal step and depth chain as
//! [`crate::generate::LmGen`]. With sampling disabled its outputs match the
//! streaming engine's once the delays have been undone by the caller.

use tracing::trace;

use crate::depformer::depformer_step;
use crate::error::{Error, Result};
use crate::generate::check_slice;
use crate::lm::LanguageModel;
use crate::sampling::{GenConfig, Sampler};
use crate::tokens::{Token, TokenFrame};

#[derive(Debug, Clone)]
pub struct NoStreamOutput {
    /// `[batch]`: forced when given, otherwise sampled from the text head.
    pub text_tokens: Vec<Token>,
    /// `[batch, dep_q]`.
    pub audio_tokens: TokenFrame,
    pub hidden: Vec<f32>,
    pub text_logits: Vec<f32>,
    pub audio_logits: Vec<f32>,
}

pub struct LmNoStream<M: LanguageModel> {
    model: M,
    gen_cfg: GenConfig,
    batch: usize,
    temporal: M::TemporalState,
    sampler: Sampler,
    steps: usize,
}

impl<M: LanguageModel> LmNoStream<M> {
    pub fn new(model: M, gen_cfg: GenConfig, batch_size: usize) -> Result<Self> {
        model.config().validate()?;
        gen_cfg.validate()?;
        if batch_size == 0 {
            return Err(Error::shape("batch size", "> 0", 0));
        }
        let temporal = model.init_temporal_state(batch_size);
        let sampler = Sampler::new(gen_cfg.seed);
        Ok(Self {
            model,
            gen_cfg,
            batch: batch_size,
            temporal,
            sampler,
            steps: 0,
        })
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn reset(&mut self) {
        self.temporal = self.model.init_temporal_state(self.batch);
        self.sampler = Sampler::new(self.gen_cfg.seed);
        self.steps = 0;
    }

    /// One timestep from aligned parts: `text` `[batch]`, `audio` `[batch, dep_q]`
    /// and `external` `[batch, num_codebooks - dep_q - 1]`.
    ///
    /// `forced_text` replaces the sampled text token as the depth-chain seed.
    pub fn step(
        &mut self,
        text: &[Token],
        audio: &TokenFrame,
        external: &TokenFrame,
        forced_text: Option<&[Token]>,
    ) -> Result<NoStreamOutput> {
        let cfg = self.model.config();
        let batch = self.batch;
        if text.len() != batch {
            return Err(Error::shape("text tokens", batch, text.len()));
        }
        if audio.batch() != batch || audio.codebooks() != cfg.dep_q {
            return Err(Error::shape(
                "audio tokens",
                format!("{batch}x{}", cfg.dep_q),
                format!("{}x{}", audio.batch(), audio.codebooks()),
            ));
        }
        let n_ext = cfg.num_external_codebooks();
        if external.batch() != batch || external.codebooks() != n_ext {
            return Err(Error::shape(
                "external tokens",
                format!("{batch}x{n_ext}"),
                format!("{}x{}", external.batch(), external.codebooks()),
            ));
        }
        if let Some(forced) = forced_text.filter(|f| f.len() != batch) {
            return Err(Error::shape("forced text tokens", batch, forced.len()));
        }

        let text_frame = TokenFrame::new(batch, 1, text.to_vec())?;
        let input = TokenFrame::concat(&[&text_frame, audio, external])?;
        if self.gen_cfg.check {
            check_slice(cfg, &input, self.steps)?;
        }

        let temporal = self.model.forward_text(&mut self.temporal, &input)?;
        let text_tokens = match forced_text {
            Some(forced) => forced.to_vec(),
            None => self.sampler.sample_rows(
                &temporal.text_logits,
                cfg.text_out_vocab(),
                self.gen_cfg.text(),
            )?,
        };
        let depth = depformer_step(
            &self.model,
            &text_tokens,
            &temporal.hidden,
            &mut self.sampler,
            self.gen_cfg.audio(),
        )?;
        trace!(step = self.steps, "reference step");
        self.steps += 1;

        Ok(NoStreamOutput {
            text_tokens,
            audio_tokens: depth.tokens,
            hidden: temporal.hidden,
            text_logits: temporal.text_logits,
            audio_logits: depth.logits,
        })
    }
}
