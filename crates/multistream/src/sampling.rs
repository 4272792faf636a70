//! Token selection from logits: arg-max or temperature + top-k sampling.

use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::Deserialize;

use crate::error::{Error, Result, ensure_config};
use crate::math::softmax_inplace;
use crate::tokens::Token;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplingParams {
    pub use_sampling: bool,
    pub temperature: f32,
    pub top_k: usize,
}

impl SamplingParams {
    pub fn greedy() -> Self {
        Self {
            use_sampling: false,
            temperature: 1.0,
            top_k: 1,
        }
    }

    pub fn validate(self) -> Result<()> {
        ensure_config!(
            self.temperature.is_finite() && self.temperature > 0.0,
            "temperature must be a positive number, got {}",
            self.temperature
        );
        ensure_config!(self.top_k >= 1, "top_k must be >= 1");
        Ok(())
    }
}

fn default_use_sampling() -> bool {
    true
}

fn default_temp() -> f32 {
    0.8
}

fn default_temp_text() -> f32 {
    0.7
}

fn default_top_k() -> usize {
    250
}

fn default_top_k_text() -> usize {
    25
}

fn default_seed() -> u64 {
    299_792_458
}

/// Per-session sampling surface; applies uniformly to every step.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GenConfig {
    #[serde(default = "default_use_sampling")]
    pub use_sampling: bool,
    #[serde(default = "default_temp")]
    pub temp: f32,
    #[serde(default = "default_temp_text")]
    pub temp_text: f32,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_top_k_text")]
    pub top_k_text: usize,
    /// Assert that every slice fed to the model is free of sentinels and in range.
    #[serde(default)]
    pub check: bool,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for GenConfig {
    fn default() -> Self {
        Self {
            use_sampling: default_use_sampling(),
            temp: default_temp(),
            temp_text: default_temp_text(),
            top_k: default_top_k(),
            top_k_text: default_top_k_text(),
            check: false,
            seed: default_seed(),
        }
    }
}

impl GenConfig {
    pub fn greedy() -> Self {
        Self {
            use_sampling: false,
            ..Self::default()
        }
    }

    pub fn text(&self) -> SamplingParams {
        SamplingParams {
            use_sampling: self.use_sampling,
            temperature: self.temp_text,
            top_k: self.top_k_text,
        }
    }

    pub fn audio(&self) -> SamplingParams {
        SamplingParams {
            use_sampling: self.use_sampling,
            temperature: self.temp,
            top_k: self.top_k,
        }
    }

    pub fn validate(&self) -> Result<()> {
        self.text().validate()?;
        self.audio().validate()
    }
}

/// Index of the largest logit; ties go to the lowest index.
pub fn argmax(logits: &[f32]) -> usize {
    let mut best = 0;
    for (i, &v) in logits.iter().enumerate().skip(1) {
        if v > logits[best] {
            best = i;
        }
    }
    best
}

/// Indices of the `k` largest logits, ties broken by lowest index.
pub fn top_k_indices(logits: &[f32], k: usize) -> Vec<usize> {
    let mut order: Vec<usize> = (0..logits.len()).collect();
    order.sort_by(|&a, &b| logits[b].total_cmp(&logits[a]).then(a.cmp(&b)));
    order.truncate(k.min(logits.len()));
    order
}

/// Seeded token sampler. The only source of randomness in a session.
#[derive(Debug, Clone)]
pub struct Sampler {
    rng: StdRng,
}

impl Sampler {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    pub fn sample(&mut self, logits: &[f32], params: SamplingParams) -> Result<Token> {
        if logits.is_empty() {
            return Err(Error::shape("logits", "at least one entry", 0));
        }
        if !params.use_sampling {
            return Ok(argmax(logits) as Token);
        }

        let candidates = top_k_indices(logits, params.top_k);
        let mut probs: Vec<f32> = candidates
            .iter()
            .map(|&i| logits[i] / params.temperature)
            .collect();
        softmax_inplace(&mut probs);
        let dist = WeightedIndex::new(&probs)?;
        Ok(candidates[dist.sample(&mut self.rng)] as Token)
    }

    /// Sample one token per row of `[rows, vocab]` logits.
    pub fn sample_rows(
        &mut self,
        logits: &[f32],
        vocab: usize,
        params: SamplingParams,
    ) -> Result<Vec<Token>> {
        if vocab == 0 || !logits.len().is_multiple_of(vocab) {
            return Err(Error::shape(
                "logits rows",
                format!("multiple of {vocab}"),
                logits.len(),
            ));
        }
        logits
            .chunks_exact(vocab)
            .map(|row| self.sample(row, params))
            .collect()
    }
}
