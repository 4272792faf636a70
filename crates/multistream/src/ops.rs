//! Dense building blocks for the reference transformer.

use crate::math::{silu_inplace, softmax_inplace};

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// `y = x W^T + b` over `n_rows` rows.
///
/// `input` is `[n_rows, in_dim]`, `weight` is `[out_dim, in_dim]`, the result
/// is `[n_rows, out_dim]`.
pub fn linear(
    input: &[f32],
    n_rows: usize,
    in_dim: usize,
    weight: &[f32],
    out_dim: usize,
    bias: Option<&[f32]>,
) -> Vec<f32> {
    debug_assert_eq!(input.len(), n_rows * in_dim);
    debug_assert_eq!(weight.len(), out_dim * in_dim);
    debug_assert!(bias.is_none_or(|b| b.len() == out_dim));

    let mut out = Vec::with_capacity(n_rows * out_dim);
    for x in input.chunks_exact(in_dim) {
        out.extend(
            weight
                .chunks_exact(in_dim)
                .enumerate()
                .map(|(o, w)| dot(x, w) + bias.map_or(0.0, |b| b[o])),
        );
    }
    out
}

pub fn add_inplace(dst: &mut [f32], src: &[f32]) {
    debug_assert_eq!(dst.len(), src.len());
    dst.iter_mut().zip(src).for_each(|(d, s)| *d += s);
}

/// `gate <- silu(gate) * up`.
pub fn swiglu_inplace(gate: &mut [f32], up: &[f32]) {
    debug_assert_eq!(gate.len(), up.len());
    silu_inplace(gate);
    gate.iter_mut().zip(up).for_each(|(g, u)| *g *= u);
}

#[derive(Debug, Clone, Copy)]
pub struct AttentionShape {
    pub n_heads: usize,
    pub n_kv_heads: usize,
    pub head_dim: usize,
}

/// Grouped-query attention of one query position over a cached history.
///
/// `query` is `[n_heads, head_dim]`; `keys` and `values` are
/// `[len, n_kv_heads, head_dim]`. Every cached position is attended to, so
/// any window must already be applied by the cache.
pub fn attention_step(query: &[f32], keys: &[f32], values: &[f32], shape: AttentionShape) -> Vec<f32> {
    let AttentionShape {
        n_heads,
        n_kv_heads,
        head_dim,
    } = shape;
    let stride = n_kv_heads * head_dim;
    debug_assert_eq!(query.len(), n_heads * head_dim);
    debug_assert_eq!(keys.len(), values.len());
    debug_assert!(keys.len().is_multiple_of(stride));
    debug_assert!(n_heads.is_multiple_of(n_kv_heads));

    let group = n_heads / n_kv_heads;
    let scale = (head_dim as f32).sqrt().recip();
    let mut out = vec![0.0f32; n_heads * head_dim];

    for (h, (q, out_h)) in query
        .chunks_exact(head_dim)
        .zip(out.chunks_exact_mut(head_dim))
        .enumerate()
    {
        let off = (h / group) * head_dim;
        let mut weights: Vec<f32> = keys
            .chunks_exact(stride)
            .map(|k| dot(q, &k[off..off + head_dim]) * scale)
            .collect();
        softmax_inplace(&mut weights);
        for (a, v) in weights.iter().zip(values.chunks_exact(stride)) {
            for (o, x) in out_h.iter_mut().zip(&v[off..off + head_dim]) {
                *o += a * x;
            }
        }
    }
    out
}
