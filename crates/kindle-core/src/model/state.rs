//! Per-model mutable evaluation state

use super::ring_history::RingHistory;
use crate::backend::Token;

/// Bookkeeping for incremental evaluation against one backend
///
/// Exclusively owned by the generation currently holding the model lock.
#[derive(Debug, Clone)]
pub struct ModelState {
    context_size: usize,
    tokens_consumed: usize,
    all_tokens: Vec<Token>,
    past_offset: usize,
    ring: RingHistory,
}

impl ModelState {
    pub fn new(context_size: usize, ring_capacity: usize) -> Self {
        Self {
            context_size,
            tokens_consumed: 0,
            all_tokens: Vec::new(),
            past_offset: 0,
            ring: RingHistory::new(ring_capacity),
        }
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub fn tokens_consumed(&self) -> usize {
        self.tokens_consumed
    }

    /// Every token evaluated since the last reset
    pub fn all_tokens(&self) -> &[Token] {
        &self.all_tokens
    }

    /// Positions the backend already holds in its internal cache
    pub fn past_offset(&self) -> usize {
        self.past_offset
    }

    pub fn ring(&self) -> &RingHistory {
        &self.ring
    }

    /// Clear everything and reinitialize the ring at its configured capacity
    pub fn reset(&mut self) {
        self.tokens_consumed = 0;
        self.all_tokens.clear();
        self.past_offset = 0;
        self.ring = RingHistory::new(self.ring.capacity());
    }

    /// Past offset to hand the backend for a batch of `batch_len` tokens
    pub fn past_for_batch(&self, batch_len: usize) -> usize {
        self.context_size
            .saturating_sub(batch_len)
            .min(self.tokens_consumed)
    }

    /// Record a batch the backend evaluated at `past`
    pub fn record_batch(&mut self, batch: &[Token], past: usize) {
        self.past_offset = past;
        self.all_tokens.extend_from_slice(batch);
        self.ring.append(batch);
        self.tokens_consumed += batch.len();
    }

    /// Adopt `prefix` as already evaluated, after restoring a saved session
    pub fn restore_prefix(&mut self, prefix: &[Token]) {
        self.reset();
        self.past_offset = prefix.len();
        self.tokens_consumed = prefix.len();
        self.all_tokens.extend_from_slice(prefix);
        self.ring.append(prefix);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_batch_advances_counters() {
        let mut state = ModelState::new(16, 4);
        let past = state.past_for_batch(3);
        assert_eq!(past, 0);
        state.record_batch(&[1, 2, 3], past);

        let past = state.past_for_batch(1);
        assert_eq!(past, 3);
        state.record_batch(&[4], past);

        assert_eq!(state.tokens_consumed(), 4);
        assert_eq!(state.past_offset(), 3);
        assert_eq!(state.all_tokens(), &[1, 2, 3, 4]);
        assert_eq!(state.ring().read_last_n(4), vec![1, 2, 3, 4]);
    }

    #[test]
    fn test_past_is_capped_by_context() {
        let mut state = ModelState::new(8, 4);
        state.record_batch(&[1, 2, 3, 4, 5, 6, 7], 0);
        assert_eq!(state.past_for_batch(4), 4);
    }

    #[test]
    fn test_reset_clears_everything() {
        let mut state = ModelState::new(8, 2);
        state.record_batch(&[1, 2, 3], 0);
        state.reset();

        assert_eq!(state.tokens_consumed(), 0);
        assert_eq!(state.past_offset(), 0);
        assert!(state.all_tokens().is_empty());
        assert!(state.ring().is_empty());
        assert_eq!(state.ring().capacity(), 2);
        assert_eq!(state.context_size(), 8);
    }

    #[test]
    fn test_restore_prefix() {
        let mut state = ModelState::new(8, 4);
        state.record_batch(&[9, 9], 0);
        state.restore_prefix(&[1, 2, 3]);

        assert_eq!(state.past_offset(), 3);
        assert_eq!(state.tokens_consumed(), 3);
        assert_eq!(state.all_tokens(), &[1, 2, 3]);
        assert_eq!(state.ring().read_last_n(4), vec![1, 2, 3]);
    }
}
