//! Delay ring buffer: per-codebook rolling token window.
//!
//! Slots are addressed modulo `capacity = max_delay + 2`. Inputs are written
//! `delay[k]` slots ahead of the read position, generated tokens are written
//! at the (undelayed) next offset, and output alignment is recovered when
//! gathering. Codebooks `0..num_generated` are produced by the model, the
//! rest are supplied by the caller.

use crate::error::{Error, Result};
use crate::tokens::{Token, TokenFrame, UNGENERATED_TOKEN};

#[derive(Debug, Clone)]
pub struct DelayCache {
    batch: usize,
    delays: Vec<usize>,
    max_delay: usize,
    capacity: usize,
    num_generated: usize,
    initial: Vec<Token>,
    /// `[batch, codebooks, capacity]`.
    slots: Vec<Token>,
}

impl DelayCache {
    /// `initial[k]` seeds codebook `k` during its warm-up window.
    pub fn new(
        batch: usize,
        delays: Vec<usize>,
        initial: Vec<Token>,
        num_generated: usize,
    ) -> Result<Self> {
        if initial.len() != delays.len() {
            return Err(Error::shape("initial tokens", delays.len(), initial.len()));
        }
        if num_generated == 0 || num_generated > delays.len() {
            return Err(Error::shape(
                "generated codebooks",
                format!("1..={}", delays.len()),
                num_generated,
            ));
        }
        let max_delay = delays.iter().copied().max().unwrap_or(0);
        let capacity = max_delay + 2;
        let slots = vec![UNGENERATED_TOKEN; batch * delays.len() * capacity];
        Ok(Self {
            batch,
            delays,
            max_delay,
            capacity,
            num_generated,
            initial,
            slots,
        })
    }

    /// Refill with [`UNGENERATED_TOKEN`], keeping the allocation.
    pub fn reset(&mut self) {
        self.slots.fill(UNGENERATED_TOKEN);
    }

    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn num_codebooks(&self) -> usize {
        self.delays.len()
    }

    pub fn num_generated(&self) -> usize {
        self.num_generated
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_delay(&self) -> usize {
        self.max_delay
    }

    #[inline]
    fn index(&self, batch: usize, codebook: usize, slot: usize) -> usize {
        (batch * self.delays.len() + codebook) * self.capacity + slot
    }

    pub fn slot(&self, batch: usize, codebook: usize, slot: usize) -> Token {
        self.slots[self.index(batch, codebook, slot % self.capacity)]
    }

    fn set(&mut self, batch: usize, codebook: usize, slot: usize, value: Token) {
        let idx = self.index(batch, codebook, slot % self.capacity);
        self.slots[idx] = value;
    }

    /// Write one value per batch entry at `(offset + delay[codebook]) % capacity`.
    pub fn write(&mut self, codebook: usize, values: &[Token], offset: usize) -> Result<()> {
        self.check_column(values)?;
        let slot = offset + self.delays[codebook];
        for (b, &v) in values.iter().enumerate() {
            self.set(b, codebook, slot, v);
        }
        Ok(())
    }

    /// For every codebook still inside its warm-up (`offset <= delay[k]`),
    /// overwrite slot `offset % capacity` with the stream's initial token.
    pub fn seed_initial(&mut self, offset: usize) {
        for k in 0..self.delays.len() {
            if offset <= self.delays[k] {
                let initial = self.initial[k];
                for b in 0..self.batch {
                    self.set(b, k, offset, initial);
                }
            }
        }
    }

    /// `[batch, codebooks]` slice at `offset % capacity`: the model input for this step.
    pub fn read_current(&self, offset: usize) -> TokenFrame {
        let k_total = self.delays.len();
        let mut frame = TokenFrame::filled(self.batch, k_total, UNGENERATED_TOKEN);
        for b in 0..self.batch {
            for k in 0..k_total {
                frame.set(b, k, self.slot(b, k, offset));
            }
        }
        frame
    }

    /// Write generated tokens (text first, then audio) at
    /// `offset_next % capacity`, with no delay applied.
    pub fn write_generated(&mut self, offset_next: usize, generated: &TokenFrame) -> Result<()> {
        if generated.batch() != self.batch || generated.codebooks() != self.num_generated {
            return Err(Error::shape(
                "generated tokens",
                format!("{}x{}", self.batch, self.num_generated),
                format!("{}x{}", generated.batch(), generated.codebooks()),
            ));
        }
        for b in 0..self.batch {
            for k in 0..generated.codebooks() {
                self.set(b, k, offset_next, generated.get(b, k));
            }
        }
        Ok(())
    }

    /// Delay-aligned output for the generated codebooks: codebook `k` is read
    /// from slot `(offset - max_delay + delay[k]) % capacity`.
    ///
    /// Only meaningful once `offset > max_delay`; earlier calls are rejected.
    /// Caller-supplied codebooks are not gathered: with `max_delay == 0` their
    /// slot for `offset` is only written on the next step.
    pub fn gather_output(&self, offset: usize) -> Result<TokenFrame> {
        if offset <= self.max_delay {
            return Err(Error::SessionState(
                "delay-aligned output requested inside the warm-up window",
            ));
        }
        let base = offset - self.max_delay;
        let mut frame = TokenFrame::filled(self.batch, self.num_generated, UNGENERATED_TOKEN);
        for b in 0..self.batch {
            for (k, &delay) in self.delays[..self.num_generated].iter().enumerate() {
                frame.set(b, k, self.slot(b, k, base + delay));
            }
        }
        Ok(frame)
    }

    fn check_column(&self, values: &[Token]) -> Result<()> {
        if values.len() != self.batch {
            return Err(Error::shape("cache column", self.batch, values.len()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::DelayCache;
    use crate::tokens::{Token, TokenFrame, UNGENERATED_TOKEN};

    const TEXT_INIT: Token = 1000;
    const AUDIO_INIT: Token = 2000;

    fn initial(n: usize) -> Vec<Token> {
        let mut v = vec![AUDIO_INIT; n];
        v[0] = TEXT_INIT;
        v
    }

    fn gen_value(offset: usize, codebook: usize) -> Token {
        (offset * 100 + codebook) as Token
    }

    fn ext_value(step: usize, codebook: usize) -> Token {
        (500_000 + step * 100 + codebook) as Token
    }

    #[test]
    fn capacity_is_max_delay_plus_two() {
        let c = DelayCache::new(1, vec![0, 3, 1], initial(3), 3).expect("cache");
        assert_eq!(c.capacity(), 5);
        assert_eq!(c.max_delay(), 3);
        assert!(c.read_current(0).as_slice().iter().all(|&t| t == UNGENERATED_TOKEN));
    }

    #[test]
    fn write_applies_codebook_delay() {
        let mut c = DelayCache::new(2, vec![0, 2], initial(2), 1).expect("cache");
        c.write(1, &[7, 8], 3).expect("write");
        assert_eq!(c.slot(0, 1, 5), 7);
        assert_eq!(c.slot(1, 1, 5), 8);
        assert!(c.write(1, &[7], 3).is_err());
    }

    #[test]
    fn seed_initial_covers_only_warm_up_codebooks() {
        let mut c = DelayCache::new(1, vec![0, 1, 2], initial(3), 3).expect("cache");
        c.seed_initial(0);
        assert_eq!(c.read_current(0).row(0), &[TEXT_INIT, AUDIO_INIT, AUDIO_INIT]);
        c.seed_initial(1);
        assert_eq!(c.read_current(1).row(0), &[UNGENERATED_TOKEN, AUDIO_INIT, AUDIO_INIT]);
        c.seed_initial(2);
        assert_eq!(
            c.read_current(2).row(0),
            &[UNGENERATED_TOKEN, UNGENERATED_TOKEN, AUDIO_INIT]
        );
    }

    #[test]
    fn rejects_bad_generated_count() {
        assert!(DelayCache::new(1, vec![0, 1], initial(2), 0).is_err());
        assert!(DelayCache::new(1, vec![0, 1], initial(2), 3).is_err());
        let mut c = DelayCache::new(1, vec![0, 1], initial(2), 1).expect("cache");
        assert!(c.write_generated(1, &TokenFrame::from_row(&[1, 2])).is_err());
    }

    #[test]
    fn gather_before_warm_up_is_rejected() {
        let c = DelayCache::new(1, vec![0, 2], initial(2), 2).expect("cache");
        assert!(c.gather_output(2).is_err());
    }

    #[test]
    fn zero_delays_gather_what_was_just_generated() {
        let mut c = DelayCache::new(1, vec![0; 4], initial(4), 4).expect("cache");
        for offset in 1..20 {
            let row: Vec<Token> = (0..4).map(|k| gen_value(offset, k)).collect();
            c.write_generated(offset, &TokenFrame::from_row(&row)).expect("write");
            assert_eq!(c.gather_output(offset).expect("gather").row(0), row.as_slice());
        }
    }

    #[test]
    fn reset_refills_with_ungenerated() {
        let mut c = DelayCache::new(1, vec![0, 1], initial(2), 2).expect("cache");
        c.seed_initial(0);
        c.reset();
        assert!(c.read_current(0).as_slice().iter().all(|&t| t == UNGENERATED_TOKEN));
    }

    /// Drive the cache exactly like the engine does over random delay
    /// patterns, and check every gathered value is the one written for the
    /// slot, i.e. nothing was overwritten before it was read.
    #[test]
    fn no_slot_is_overwritten_before_it_is_gathered() {
        let mut seed = 0x1234_5678u32;
        let mut next = move |modulo: u32| {
            seed = seed.wrapping_mul(1664525).wrapping_add(1013904223);
            (seed >> 8) % modulo
        };

        for _ in 0..200 {
            let n_gen = 1 + next(4) as usize;
            let n_ext = next(3) as usize;
            let k_total = n_gen + n_ext;
            let delays: Vec<usize> = (0..k_total).map(|_| next(6) as usize).collect();
            let max_delay = delays.iter().copied().max().unwrap_or(0);
            let steps = max_delay + 1 + next(24) as usize;
            let mut c =
                DelayCache::new(1, delays.clone(), initial(k_total), n_gen).expect("cache");

            for step in 0..steps {
                let offset = step;
                for k in n_gen..k_total {
                    c.write(k, &[ext_value(step, k)], offset).expect("write ext");
                }
                c.seed_initial(offset);
                let input = c.read_current(offset);
                assert!(
                    input.as_slice().iter().all(|&t| t != UNGENERATED_TOKEN),
                    "ungenerated read at offset {offset} with delays {delays:?}"
                );

                let next_offset = offset + 1;
                let row: Vec<Token> = (0..n_gen).map(|k| gen_value(next_offset, k)).collect();
                c.write_generated(next_offset, &TokenFrame::from_row(&row))
                    .expect("write gen");

                if next_offset <= max_delay {
                    continue;
                }
                let out = c.gather_output(next_offset).expect("gather");
                assert_eq!(out.codebooks(), n_gen);
                for (k, &delay) in delays[..n_gen].iter().enumerate() {
                    let src = next_offset - max_delay + delay;
                    assert_eq!(
                        out.get(0, k),
                        gen_value(src, k),
                        "codebook {k} at offset {next_offset} with delays {delays:?}"
                    );
                }
            }
        }
    }
}
