//! Library error type.

use thiserror::Error;

use crate::tokens::Token;
use crate::weights::WeightError;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    #[error("shape mismatch for {what}: expected {expected}, got {got}")]
    Shape {
        what: &'static str,
        expected: String,
        got: String,
    },
    #[error("session state error: {0}")]
    SessionState(&'static str),
    #[error(
        "consistency violation at offset {offset}: codebook {codebook} batch {batch} holds {value} ({reason})"
    )]
    ConsistencyViolation {
        offset: usize,
        codebook: usize,
        batch: usize,
        value: Token,
        reason: &'static str,
    },
    #[error("invalid configuration: {0}")]
    Configuration(String),
    #[error("cannot sample from logits: {0}")]
    Sampling(#[from] rand::distributions::WeightedError),
    #[error("token {token} outside embedding table of {vocab} rows")]
    TokenOutOfVocab { token: Token, vocab: usize },
    #[error(transparent)]
    Weights(#[from] WeightError),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

impl Error {
    pub(crate) fn shape(
        what: &'static str,
        expected: impl std::fmt::Display,
        got: impl std::fmt::Display,
    ) -> Self {
        Self::Shape {
            what,
            expected: expected.to_string(),
            got: got.to_string(),
        }
    }

    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }
}

/// Like `anyhow::ensure!`, but yields [`Error::Configuration`].
macro_rules! ensure_config {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::Error::config(format!($($arg)+)));
        }
    };
}

pub(crate) use ensure_config;
