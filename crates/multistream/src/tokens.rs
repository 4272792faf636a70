//! Token values, sentinels and the per-step token block.

use crate::error::{Error, Result};

/// Token id. Valid ids are non-negative; sentinels are negative.
pub type Token = i32;

/// No sampling for this stream at this step; embeds to an all-zero row.
pub const ZERO_TOKEN: Token = -1;

/// Ring-buffer fill value: not produced yet, must never be read.
pub const UNGENERATED_TOKEN: Token = -2;

#[inline]
pub fn is_sentinel(token: Token) -> bool {
    token < 0
}

/// `[batch, codebooks]` block of tokens for a single timestep.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenFrame {
    batch: usize,
    codebooks: usize,
    data: Vec<Token>,
}

impl TokenFrame {
    pub fn new(batch: usize, codebooks: usize, data: Vec<Token>) -> Result<Self> {
        if data.len() != batch * codebooks {
            return Err(Error::shape(
                "token frame",
                format!("{batch}x{codebooks} = {} tokens", batch * codebooks),
                data.len(),
            ));
        }
        Ok(Self {
            batch,
            codebooks,
            data,
        })
    }

    pub fn filled(batch: usize, codebooks: usize, value: Token) -> Self {
        Self {
            batch,
            codebooks,
            data: vec![value; batch * codebooks],
        }
    }

    /// Single batch entry.
    pub fn from_row(row: &[Token]) -> Self {
        Self {
            batch: 1,
            codebooks: row.len(),
            data: row.to_vec(),
        }
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn codebooks(&self) -> usize {
        self.codebooks
    }

    pub fn get(&self, batch: usize, codebook: usize) -> Token {
        self.data[batch * self.codebooks + codebook]
    }

    pub fn set(&mut self, batch: usize, codebook: usize, value: Token) {
        self.data[batch * self.codebooks + codebook] = value;
    }

    pub fn row(&self, batch: usize) -> &[Token] {
        &self.data[batch * self.codebooks..(batch + 1) * self.codebooks]
    }

    pub fn column(&self, codebook: usize) -> Vec<Token> {
        (0..self.batch).map(|b| self.get(b, codebook)).collect()
    }

    pub fn as_slice(&self) -> &[Token] {
        &self.data
    }

    /// Stack `parts` along the codebook axis. All parts must share the batch size.
    pub fn concat(parts: &[&TokenFrame]) -> Result<Self> {
        let batch = parts.first().map_or(0, |p| p.batch);
        if let Some(bad) = parts.iter().find(|p| p.batch != batch) {
            return Err(Error::shape("concatenated frame batch", batch, bad.batch));
        }
        let codebooks = parts.iter().map(|p| p.codebooks).sum();
        let mut data = Vec::with_capacity(batch * codebooks);
        for b in 0..batch {
            for part in parts {
                data.extend_from_slice(part.row(b));
            }
        }
        Ok(Self {
            batch,
            codebooks,
            data,
        })
    }
}
