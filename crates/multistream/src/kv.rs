//! Per-sequence key/value history for single-token decoding.
//!
//! The temporal transformer keeps one of these per batch entry for the whole
//! session; the depth transformer gets a fresh one every outer step. With a
//! window set, the oldest position is dropped once the history is full.
//! Dropped entries stay in the buffers until a whole window of them has
//! piled up, then they are compacted away in one move.

#[derive(Debug, Clone, Default)]
struct LayerKv {
    /// `[start + len, n_kv_heads, head_dim]`; the first `start` entries are dead.
    keys: Vec<f32>,
    values: Vec<f32>,
    start: usize,
    len: usize,
    /// Absolute position of the oldest retained entry.
    first_pos: usize,
}

#[derive(Debug, Clone)]
pub struct RollingKvCache {
    stride: usize,
    window: Option<usize>,
    layers: Vec<LayerKv>,
}

impl RollingKvCache {
    /// `window = None` keeps every position.
    #[must_use]
    pub fn new(n_layers: usize, n_kv_heads: usize, head_dim: usize, window: Option<usize>) -> Self {
        debug_assert!(n_layers > 0 && n_kv_heads > 0 && head_dim > 0);
        debug_assert!(window != Some(0));
        Self {
            stride: n_kv_heads * head_dim,
            window,
            layers: vec![LayerKv::default(); n_layers],
        }
    }

    /// Append one position's `[n_kv_heads, head_dim]` key and value to `layer`.
    pub fn push(&mut self, layer: usize, key: &[f32], value: &[f32]) {
        debug_assert_eq!(key.len(), self.stride);
        debug_assert_eq!(value.len(), self.stride);
        let stride = self.stride;
        let kv = &mut self.layers[layer];
        if let Some(window) = self.window.filter(|&w| kv.len >= w) {
            kv.start += 1;
            kv.len -= 1;
            kv.first_pos += 1;
            if kv.start >= window {
                kv.keys.drain(..kv.start * stride);
                kv.values.drain(..kv.start * stride);
                kv.start = 0;
            }
        }
        kv.keys.extend_from_slice(key);
        kv.values.extend_from_slice(value);
        kv.len += 1;
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    /// Retained positions in `layer`.
    pub fn len(&self, layer: usize) -> usize {
        self.layers[layer].len
    }

    pub fn first_position(&self, layer: usize) -> usize {
        self.layers[layer].first_pos
    }

    /// Absolute position of the next entry pushed to `layer`.
    pub fn next_position(&self, layer: usize) -> usize {
        let kv = &self.layers[layer];
        kv.first_pos + kv.len
    }

    /// `(keys, values)`, each `[len, n_kv_heads, head_dim]`, oldest first.
    pub fn keys_values(&self, layer: usize) -> (&[f32], &[f32]) {
        let kv = &self.layers[layer];
        let from = kv.start * self.stride;
        (&kv.keys[from..], &kv.values[from..])
    }
}

#[cfg(test)]
mod tests {
    use super::RollingKvCache;

    fn entry(base: f32) -> Vec<f32> {
        vec![base, base + 0.5]
    }

    #[test]
    fn window_drops_oldest_position() {
        let mut kv = RollingKvCache::new(1, 1, 2, Some(3));
        for p in 0..5 {
            kv.push(0, &entry(p as f32), &entry(100.0 + p as f32));
        }
        assert_eq!(kv.len(0), 3);
        assert_eq!(kv.first_position(0), 2);
        assert_eq!(kv.next_position(0), 5);

        let (k, v) = kv.keys_values(0);
        assert_eq!(k, &[2.0, 2.5, 3.0, 3.5, 4.0, 4.5]);
        assert_eq!(&v[..2], &[102.0, 102.5]);
    }

    #[test]
    fn compaction_keeps_the_window_contents() {
        let mut kv = RollingKvCache::new(1, 1, 2, Some(3));
        for p in 0..20 {
            kv.push(0, &entry(p as f32), &entry(-(p as f32)));
            let retained = (p + 1).min(3);
            assert_eq!(kv.len(0), retained);
            assert_eq!(kv.next_position(0), p + 1);

            let (k, v) = kv.keys_values(0);
            assert_eq!(k.len(), retained * 2);
            let want: Vec<f32> = (p + 1 - retained..=p).flat_map(|q| entry(q as f32)).collect();
            assert_eq!(k, want.as_slice());
            assert_eq!(v[0], -((p + 1 - retained) as f32));
        }
        assert!(kv.layers[0].keys.len() <= 2 * 3 * 2);
    }

    #[test]
    fn unbounded_history_keeps_everything() {
        let mut kv = RollingKvCache::new(1, 1, 2, None);
        for p in 0..50 {
            kv.push(0, &entry(p as f32), &entry(p as f32));
        }
        assert_eq!(kv.len(0), 50);
        assert_eq!(kv.first_position(0), 0);
    }

    #[test]
    fn layers_are_isolated() {
        let mut kv = RollingKvCache::new(2, 1, 2, Some(4));
        kv.push(0, &[1.0, 2.0], &[3.0, 4.0]);
        kv.push(1, &[10.0, 20.0], &[50.0, 60.0]);
        kv.push(1, &[30.0, 40.0], &[70.0, 80.0]);

        assert_eq!(kv.n_layers(), 2);
        assert_eq!(kv.len(0), 1);
        assert_eq!(kv.len(1), 2);
        assert_eq!(kv.keys_values(0).0, &[1.0, 2.0]);
        assert_eq!(kv.keys_values(1).0, &[10.0, 20.0, 30.0, 40.0]);
    }
}
