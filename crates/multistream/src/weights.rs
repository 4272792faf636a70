//! Memory-mapped safetensors weights, decoded to `f32` on demand.

use std::collections::BTreeMap;
use std::path::Path;

use memmap2::{Mmap, MmapOptions};
use safetensors::SafeTensors;
use safetensors::tensor::{Dtype, SafeTensorError};
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum WeightError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("safetensors error: {0}")]
    SafeTensors(#[from] SafeTensorError),
    #[error("missing tensor {0}")]
    Missing(String),
    #[error("unsupported dtype for {name}: {dtype:?}")]
    UnsupportedDtype { name: String, dtype: Dtype },
    #[error("shape mismatch for {name}: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        name: String,
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

#[derive(Debug, Clone)]
struct TensorMeta {
    dtype: Dtype,
    shape: Vec<usize>,
}

/// The header is parsed once at open; tensor bytes stay in the mapping
/// until a tensor is requested.
#[derive(Debug)]
pub struct WeightStore {
    mmap: Mmap,
    index: BTreeMap<String, TensorMeta>,
}

impl WeightStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, WeightError> {
        let path = path.as_ref();
        let file = std::fs::File::open(path)?;
        // SAFETY: read-only mapping; the file is not modified while mapped.
        let mmap = unsafe { MmapOptions::new().map(&file)? };
        let index = SafeTensors::deserialize(&mmap)?
            .tensors()
            .into_iter()
            .map(|(name, view)| {
                let meta = TensorMeta {
                    dtype: view.dtype(),
                    shape: view.shape().to_vec(),
                };
                (name, meta)
            })
            .collect::<BTreeMap<_, _>>();
        info!(
            path = %path.display(),
            bytes = mmap.len(),
            tensors = index.len(),
            "mapped weights"
        );
        Ok(Self { mmap, index })
    }

    /// Tensor names in sorted order.
    pub fn names(&self) -> Vec<String> {
        self.index.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    pub fn shape(&self, name: &str) -> Option<&[usize]> {
        self.index.get(name).map(|m| m.shape.as_slice())
    }

    /// Decode `name` to `f32`, whatever its stored float type.
    pub fn tensor(&self, name: &str) -> Result<Vec<f32>, WeightError> {
        let meta = self
            .index
            .get(name)
            .ok_or_else(|| WeightError::Missing(name.to_string()))?;
        let st = SafeTensors::deserialize(&self.mmap)?;
        let view = st.tensor(name)?;
        let raw = view.data();
        let data = match meta.dtype {
            Dtype::F32 => raw
                .chunks_exact(4)
                .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
                .collect(),
            Dtype::BF16 => raw
                .chunks_exact(2)
                .map(|c| f32::from_bits(u32::from(u16::from_le_bytes([c[0], c[1]])) << 16))
                .collect(),
            Dtype::F16 => raw
                .chunks_exact(2)
                .map(|c| f16_to_f32(u16::from_le_bytes([c[0], c[1]])))
                .collect(),
            dtype => {
                return Err(WeightError::UnsupportedDtype {
                    name: name.to_string(),
                    dtype,
                });
            }
        };
        Ok(data)
    }

    /// Like [`Self::tensor`], but the stored shape must equal `shape`.
    pub fn tensor_shaped(&self, name: &str, shape: &[usize]) -> Result<Vec<f32>, WeightError> {
        let got = self
            .shape(name)
            .ok_or_else(|| WeightError::Missing(name.to_string()))?;
        if got != shape {
            return Err(WeightError::ShapeMismatch {
                name: name.to_string(),
                expected: shape.to_vec(),
                got: got.to_vec(),
            });
        }
        self.tensor(name)
    }
}

fn f16_to_f32(h: u16) -> f32 {
    let sign = u32::from(h >> 15) << 31;
    let exp = u32::from((h >> 10) & 0x1f);
    let mant = u32::from(h & 0x3ff);
    let bits = match (exp, mant) {
        (0, 0) => sign,
        (0, m) => {
            // Subnormal: m * 2^-24.
            let v = m as f32 * f32::powi(2.0, -24);
            return if sign == 0 { v } else { -v };
        }
        (0x1f, 0) => sign | 0x7f80_0000,
        (0x1f, m) => sign | 0x7fc0_0000 | (m << 13),
        (e, m) => sign | ((e + 112) << 23) | (m << 13),
    };
    f32::from_bits(bits)
}
