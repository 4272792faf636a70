//! Delay-aware streaming generation over parallel token streams.
//!
//! One text stream and several audio codebooks are generated one timestep
//! at a time. Each codebook is shifted by its own delay; the engine keeps
//! the shift in a small ring buffer so callers only ever see aligned frames.
//!
//! - [`generate::LmGen`]: streaming engine, one call per timestep
//! - [`no_stream::LmNoStream`]: reference mode over caller-aligned tokens
//! - [`lm::LanguageModel`]: seam to the temporal and depth models
//! - [`lm::LmModel`]: CPU reference model loaded from safetensors

pub mod cache;
pub mod depformer;
pub mod error;
pub mod generate;
pub mod kv;
pub mod layer;
pub mod lm;
pub mod math;
pub mod model;
pub mod nn;
pub mod no_stream;
pub mod ops;
pub mod params;
pub mod sampling;
pub mod tokens;
pub mod transformer;
pub mod weights;

pub use error::{Error, Result};
pub use generate::{LmGen, StepOutput, StreamingSession};
pub use lm::{LanguageModel, LmModel, TemporalOutput};
pub use no_stream::{LmNoStream, NoStreamOutput};
pub use params::LmConfig;
pub use sampling::GenConfig;
pub use tokens::{Token, TokenFrame, UNGENERATED_TOKEN, ZERO_TOKEN};
