//! Embedding tables, linear heads and norms around the transformer stacks.

use rand::Rng;

use crate::error::{Error, Result};
use crate::math::{layer_norm_rows, rms_norm_rows};
use crate::ops::linear;
use crate::params::NormKind;
use crate::tokens::{Token, ZERO_TOKEN};
use crate::weights::WeightStore;

#[derive(Debug, Clone)]
pub struct Norm {
    kind: NormKind,
    weight: Vec<f32>,
    bias: Option<Vec<f32>>,
    eps: f32,
}

impl Norm {
    pub fn identity(kind: NormKind, dim: usize, eps: f32) -> Self {
        let bias = (kind == NormKind::LayerNorm).then(|| vec![0.0; dim]);
        Self {
            kind,
            weight: vec![1.0; dim],
            bias,
            eps,
        }
    }

    pub fn load(store: &WeightStore, prefix: &str, kind: NormKind, dim: usize, eps: f32) -> Result<Self> {
        let weight = store.tensor_shaped(&format!("{prefix}.weight"), &[dim])?;
        let bias = match kind {
            NormKind::RmsNorm => None,
            NormKind::LayerNorm => Some(store.tensor_shaped(&format!("{prefix}.bias"), &[dim])?),
        };
        Ok(Self {
            kind,
            weight,
            bias,
            eps,
        })
    }

    pub fn dim(&self) -> usize {
        self.weight.len()
    }

    /// Normalise each `dim`-wide row of `xs`.
    pub fn forward(&self, xs: &[f32]) -> Vec<f32> {
        let mut out = vec![0.0f32; xs.len()];
        match self.kind {
            NormKind::RmsNorm => rms_norm_rows(&mut out, xs, &self.weight, self.dim(), self.eps),
            NormKind::LayerNorm => layer_norm_rows(
                &mut out,
                xs,
                &self.weight,
                self.bias.as_deref(),
                self.dim(),
                self.eps,
            ),
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Linear {
    weight: Vec<f32>, // [out_dim, in_dim]
    bias: Option<Vec<f32>>,
    in_dim: usize,
    out_dim: usize,
}

impl Linear {
    pub fn new(weight: Vec<f32>, bias: Option<Vec<f32>>, in_dim: usize, out_dim: usize) -> Result<Self> {
        if weight.len() != in_dim * out_dim {
            return Err(Error::shape("linear weight", in_dim * out_dim, weight.len()));
        }
        if let Some(len) = bias.as_ref().map(Vec::len).filter(|&len| len != out_dim) {
            return Err(Error::shape("linear bias", out_dim, len));
        }
        Ok(Self {
            weight,
            bias,
            in_dim,
            out_dim,
        })
    }

    pub fn load(store: &WeightStore, prefix: &str, in_dim: usize, out_dim: usize, with_bias: bool) -> Result<Self> {
        let weight = store.tensor_shaped(&format!("{prefix}.weight"), &[out_dim, in_dim])?;
        let bias = if with_bias {
            Some(store.tensor_shaped(&format!("{prefix}.bias"), &[out_dim])?)
        } else {
            None
        };
        Self::new(weight, bias, in_dim, out_dim)
    }

    pub fn random(in_dim: usize, out_dim: usize, with_bias: bool, rng: &mut impl Rng) -> Self {
        let scale = 1.0 / (in_dim as f32).sqrt();
        Self {
            weight: (0..in_dim * out_dim).map(|_| rng.gen_range(-scale..scale)).collect(),
            bias: with_bias.then(|| (0..out_dim).map(|_| rng.gen_range(-scale..scale)).collect()),
            in_dim,
            out_dim,
        }
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    /// `[rows, in_dim] -> [rows, out_dim]`.
    pub fn forward(&self, xs: &[f32]) -> Result<Vec<f32>> {
        if !xs.len().is_multiple_of(self.in_dim) {
            return Err(Error::shape("linear input", format!("rows of {}", self.in_dim), xs.len()));
        }
        let rows = xs.len() / self.in_dim;
        Ok(linear(xs, rows, self.in_dim, &self.weight, self.out_dim, self.bias.as_deref()))
    }
}

/// Embedding table where [`ZERO_TOKEN`] maps to an exact zero vector.
///
/// Other negative ids are clamped to row 0 before lookup.
#[derive(Debug, Clone)]
pub struct ScaledEmbedding {
    table: Vec<f32>, // [vocab, dim]
    vocab: usize,
    dim: usize,
    norm: Option<Norm>,
}

impl ScaledEmbedding {
    pub fn new(table: Vec<f32>, vocab: usize, dim: usize, norm: Option<Norm>) -> Result<Self> {
        if table.len() != vocab * dim {
            return Err(Error::shape("embedding table", vocab * dim, table.len()));
        }
        Ok(Self {
            table,
            vocab,
            dim,
            norm,
        })
    }

    pub fn load(
        store: &WeightStore,
        prefix: &str,
        vocab: usize,
        dim: usize,
        norm: Option<(NormKind, f32)>,
    ) -> Result<Self> {
        let table = store.tensor_shaped(&format!("{prefix}.weight"), &[vocab, dim])?;
        let norm = match norm {
            Some((kind, eps)) => Some(Norm::load(store, &format!("{prefix}.norm"), kind, dim, eps)?),
            None => None,
        };
        Self::new(table, vocab, dim, norm)
    }

    pub fn random(vocab: usize, dim: usize, norm: Option<Norm>, rng: &mut impl Rng) -> Self {
        Self {
            table: (0..vocab * dim).map(|_| rng.gen_range(-1.0f32..1.0)).collect(),
            vocab,
            dim,
            norm,
        }
    }

    pub fn vocab(&self) -> usize {
        self.vocab
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    /// `[n] -> [n, dim]`.
    pub fn forward(&self, tokens: &[Token]) -> Result<Vec<f32>> {
        let mut out = vec![0.0f32; tokens.len() * self.dim];
        for (&token, row) in tokens.iter().zip(out.chunks_exact_mut(self.dim)) {
            if token == ZERO_TOKEN {
                continue;
            }
            let idx = token.max(0) as usize;
            if idx >= self.vocab {
                return Err(Error::TokenOutOfVocab {
                    token,
                    vocab: self.vocab,
                });
            }
            let src = &self.table[idx * self.dim..(idx + 1) * self.dim];
            match &self.norm {
                Some(norm) => row.copy_from_slice(&norm.forward(src)),
                None => row.copy_from_slice(src),
            }
        }
        Ok(out)
    }
}
