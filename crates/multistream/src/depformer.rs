//! Per-timestep autoregressive depth decoding over the audio codebooks.

use crate::error::{Error, Result};
use crate::lm::LanguageModel;
use crate::sampling::{Sampler, SamplingParams};
use crate::tokens::{Token, TokenFrame};

#[derive(Debug, Clone)]
pub struct DepthOutput {
    /// `[batch, dep_q]`, in codebook order.
    pub tokens: TokenFrame,
    /// `[batch, dep_q, card]`.
    pub logits: Vec<f32>,
}

/// Run the depth chain for one timestep.
///
/// `text_tokens` (`[batch]`) seeds the chain; each later codebook is
/// conditioned on the token sampled just before it and on the same
/// `hidden` (`[batch, dim]`). The depth state is acquired here and dropped
/// on every exit path, so nothing carries over between timesteps.
pub fn depformer_step<M: LanguageModel>(
    model: &M,
    text_tokens: &[Token],
    hidden: &[f32],
    sampler: &mut Sampler,
    params: SamplingParams,
) -> Result<DepthOutput> {
    let cfg = model.config();
    let batch = text_tokens.len();
    let (dep_q, card) = (cfg.dep_q, cfg.card);
    if hidden.len() != batch * cfg.dim {
        return Err(Error::shape("hidden", batch * cfg.dim, hidden.len()));
    }

    let mut state = model.init_depth_state(batch);
    let mut tokens = TokenFrame::filled(batch, dep_q, 0);
    let mut logits_all = vec![0.0f32; batch * dep_q * card];
    let mut prev = text_tokens.to_vec();

    for cb in 0..dep_q {
        let logits = model.forward_depformer(&mut state, cb, &prev, hidden)?;
        if logits.len() != batch * card {
            return Err(Error::shape("depformer logits", batch * card, logits.len()));
        }
        let next = sampler.sample_rows(&logits, card, params)?;
        for (b, row) in logits.chunks_exact(card).enumerate() {
            let dst = (b * dep_q + cb) * card;
            logits_all[dst..dst + card].copy_from_slice(row);
            tokens.set(b, cb, next[b]);
        }
        prev = next;
    }

    Ok(DepthOutput {
        tokens,
        logits: logits_all,
    })
}
