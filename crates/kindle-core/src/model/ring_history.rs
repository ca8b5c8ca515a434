//! Fixed-capacity history of recently evaluated tokens

use crate::backend::Token;

/// Bounded circular buffer holding the most recent tokens in write order
///
/// Once full, every write overwrites the oldest entry. The capacity is fixed
/// at construction and never changes.
#[derive(Debug, Clone)]
pub struct RingHistory {
    buf: Vec<Token>,
    capacity: usize,
    /// Index of the oldest live entry
    start: usize,
    /// Number of live entries, never above `capacity`
    len: usize,
}

impl RingHistory {
    /// Create an empty history holding at most `capacity` tokens
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            capacity,
            start: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Number of tokens currently held
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Append `tokens` in order, overwriting the oldest entries on overflow
    pub fn append(&mut self, tokens: &[Token]) {
        if self.capacity == 0 || tokens.is_empty() {
            return;
        }

        // Only the tail of an oversized write can survive.
        if tokens.len() >= self.capacity {
            let tail = &tokens[tokens.len() - self.capacity..];
            self.buf.copy_from_slice(tail);
            self.start = 0;
            self.len = self.capacity;
            return;
        }

        for &token in tokens {
            let slot = (self.start + self.len) % self.capacity;
            self.buf[slot] = token;
            if self.len < self.capacity {
                self.len += 1;
            } else {
                self.start = (self.start + 1) % self.capacity;
            }
        }
    }

    /// Up to `n` most recent tokens in chronological order
    pub fn read_last_n(&self, n: usize) -> Vec<Token> {
        let take = n.min(self.len);
        let skip = self.len - take;
        (skip..self.len)
            .map(|i| self.buf[(self.start + i) % self.capacity])
            .collect()
    }

    /// Drop every entry, keeping the capacity
    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }
}
