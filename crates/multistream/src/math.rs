//! Scalar kernels: norms, rotary embedding, activations, softmax.

#[inline]
pub fn silu_inplace(x: &mut [f32]) {
    for v in x {
        *v /= 1.0 + (-*v).exp();
    }
}

pub fn rms_norm_rows(output: &mut [f32], input: &[f32], weight: &[f32], dim: usize, eps: f32) {
    debug_assert_eq!(input.len(), output.len());
    debug_assert_eq!(weight.len(), dim);

    for (x, y) in input.chunks_exact(dim).zip(output.chunks_exact_mut(dim)) {
        let mean_sq = x.iter().map(|v| v * v).sum::<f32>() / dim as f32;
        let inv = (mean_sq + eps).sqrt().recip();
        for ((y, x), w) in y.iter_mut().zip(x).zip(weight) {
            *y = x * inv * w;
        }
    }
}

pub fn layer_norm_rows(
    output: &mut [f32],
    input: &[f32],
    weight: &[f32],
    bias: Option<&[f32]>,
    dim: usize,
    eps: f32,
) {
    debug_assert_eq!(input.len(), output.len());
    debug_assert_eq!(weight.len(), dim);

    for (x, y) in input.chunks_exact(dim).zip(output.chunks_exact_mut(dim)) {
        let mean = x.iter().sum::<f32>() / dim as f32;
        let var = x.iter().map(|v| (v - mean) * (v - mean)).sum::<f32>() / dim as f32;
        let inv = (var + eps).sqrt().recip();
        for (i, (y, x)) in y.iter_mut().zip(x).enumerate() {
            *y = (x - mean) * inv * weight[i] + bias.map_or(0.0, |b| b[i]);
        }
    }
}

/// Rotate adjacent pairs of every head in `[n_heads, head_dim]` data by the
/// angle for absolute position `pos`.
pub fn rope_interleaved_inplace(data: &mut [f32], n_heads: usize, head_dim: usize, pos: usize, theta: f32) {
    debug_assert_eq!(data.len(), n_heads * head_dim);
    debug_assert!(head_dim.is_multiple_of(2));

    let rot: Vec<(f32, f32)> = (0..head_dim / 2)
        .map(|pair| {
            let inv_freq = theta.powf(-((2 * pair) as f32) / head_dim as f32);
            (pos as f32 * inv_freq).sin_cos()
        })
        .collect();
    for head in data.chunks_exact_mut(head_dim) {
        for (xy, &(sin, cos)) in head.chunks_exact_mut(2).zip(&rot) {
            let (x, y) = (xy[0], xy[1]);
            xy[0] = x * cos - y * sin;
            xy[1] = x * sin + y * cos;
        }
    }
}

/// Numerically stable softmax; `-inf` entries get zero mass.
pub fn softmax_inplace(x: &mut [f32]) {
    let max = x.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    if !max.is_finite() {
        return;
    }
    let mut sum = 0.0f32;
    for v in x.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    x.iter_mut().for_each(|v| *v /= sum);
}
