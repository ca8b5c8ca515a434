//! Working candidate set for the sampling pipeline
//!
//! Every filter mutates the same set of `(token, logit, probability)` entries.
//! Probabilities are only ever produced by [`Candidates::softmax`], which
//! also sorts the set by descending logit when it is not sorted already.

use crate::backend::Token;
use rand::distributions::{Distribution, WeightedIndex};
use rand::Rng;
use std::collections::HashMap;

/// One candidate token
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenData {
    pub id: Token,
    pub logit: f32,
    pub p: f32,
}

/// Candidate set with a sortedness flag
#[derive(Debug, Clone)]
pub struct Candidates {
    data: Vec<TokenData>,
    sorted: bool,
}

impl Candidates {
    /// One candidate per vocabulary id, in id order
    pub fn from_logits(logits: &[f32]) -> Self {
        let data = logits
            .iter()
            .enumerate()
            .map(|(id, &logit)| TokenData {
                id: id as Token,
                logit,
                p: 0.0,
            })
            .collect();
        Self { data, sorted: false }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn as_slice(&self) -> &[TokenData] {
        &self.data
    }

    /// Current logit of `token`, if it is still a candidate
    pub fn logit(&self, token: Token) -> Option<f32> {
        self.data.iter().find(|c| c.id == token).map(|c| c.logit)
    }

    pub fn set_logit(&mut self, token: Token, logit: f32) {
        if let Some(candidate) = self.data.iter_mut().find(|c| c.id == token) {
            candidate.logit = logit;
            self.sorted = false;
        }
    }

    /// Discourage every candidate present in `recent`
    ///
    /// Positive logits are divided by `penalty`, non-positive ones multiplied,
    /// so a penalty above 1 always lowers the logit.
    pub fn apply_repetition_penalty(&mut self, recent: &[Token], penalty: f32) {
        if recent.is_empty() || penalty == 1.0 {
            return;
        }

        let counts = token_counts(recent);
        for candidate in self.data.iter_mut() {
            if !counts.contains_key(&candidate.id) {
                continue;
            }
            if candidate.logit <= 0.0 {
                candidate.logit *= penalty;
            } else {
                candidate.logit /= penalty;
            }
        }
        self.sorted = false;
    }

    /// Subtract `count * frequency + presence` for every token seen in `recent`
    pub fn apply_frequency_presence(&mut self, recent: &[Token], frequency: f32, presence: f32) {
        if recent.is_empty() || (frequency == 0.0 && presence == 0.0) {
            return;
        }

        let counts = token_counts(recent);
        for candidate in self.data.iter_mut() {
            if let Some(&count) = counts.get(&candidate.id) {
                candidate.logit -= count as f32 * frequency + presence;
            }
        }
        self.sorted = false;
    }

    /// Sort by descending logit (if needed) and fill in probabilities
    pub fn softmax(&mut self) {
        if self.data.is_empty() {
            return;
        }

        if !self.sorted {
            self.data.sort_by(|a, b| b.logit.total_cmp(&a.logit));
            self.sorted = true;
        }

        let max = self.data[0].logit;
        if max == f32::INFINITY {
            // Forced tokens share all of the mass.
            let forced = self.data.iter().filter(|c| c.logit == f32::INFINITY).count();
            for candidate in self.data.iter_mut() {
                candidate.p = if candidate.logit == f32::INFINITY {
                    1.0 / forced as f32
                } else {
                    0.0
                };
            }
            return;
        }
        if !max.is_finite() {
            let uniform = 1.0 / self.data.len() as f32;
            for candidate in self.data.iter_mut() {
                candidate.p = uniform;
            }
            return;
        }

        let mut sum = 0.0;
        for candidate in self.data.iter_mut() {
            candidate.p = (candidate.logit - max).exp();
            sum += candidate.p;
        }
        for candidate in self.data.iter_mut() {
            candidate.p /= sum;
        }
    }

    /// Keep the `k` highest-logit candidates; `k == 0` keeps everything
    pub fn top_k(&mut self, k: usize, min_keep: usize) {
        let k = if k == 0 { self.data.len() } else { k };
        self.keep_top(k.max(min_keep));
    }

    fn keep_top(&mut self, k: usize) {
        let k = k.min(self.data.len());
        if !self.sorted {
            self.data.sort_by(|a, b| b.logit.total_cmp(&a.logit));
            self.sorted = true;
        }
        self.data.truncate(k);
    }

    /// Tail-free filter: cut where the second derivative of the sorted
    /// probability curve has accumulated more than `z` of its mass
    pub fn tail_free(&mut self, z: f32, min_keep: usize) {
        if z >= 1.0 || self.data.len() <= 2 {
            return;
        }

        self.softmax();

        let first: Vec<f32> = self.data.windows(2).map(|w| w[0].p - w[1].p).collect();
        let mut second: Vec<f32> = first.windows(2).map(|w| (w[0] - w[1]).abs()).collect();

        let total: f32 = second.iter().sum();
        if total > 0.0 {
            for value in second.iter_mut() {
                *value /= total;
            }
        }

        let mut cumulative = 0.0;
        let mut last = self.data.len();
        for (i, value) in second.iter().enumerate() {
            cumulative += value;
            if cumulative > z && i >= min_keep {
                last = i;
                break;
            }
        }

        self.data.truncate(last);
    }

    /// Locally typical filter: keep the candidates whose surprise is closest
    /// to the distribution entropy until `p` of the mass is covered
    pub fn typical(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 {
            return;
        }

        self.softmax();

        let entropy: f32 = self
            .data
            .iter()
            .filter(|c| c.p > 0.0)
            .map(|c| -c.p * c.p.ln())
            .sum();

        let mut order: Vec<(usize, f32)> = self
            .data
            .iter()
            .enumerate()
            .map(|(i, c)| (i, (-c.p.ln() - entropy).abs()))
            .collect();
        order.sort_by(|a, b| a.1.total_cmp(&b.1));

        let mut cumulative = 0.0;
        let mut last = order.len();
        for (i, &(idx, _)) in order.iter().enumerate() {
            cumulative += self.data[idx].p;
            if cumulative > p && i + 1 >= min_keep {
                last = i + 1;
                break;
            }
        }

        self.data = order[..last].iter().map(|&(idx, _)| self.data[idx]).collect();
        self.sorted = false;
    }

    /// Nucleus filter: smallest prefix whose cumulative probability reaches `p`
    pub fn top_p(&mut self, p: f32, min_keep: usize) {
        if p >= 1.0 {
            return;
        }

        self.softmax();

        let mut cumulative = 0.0;
        let mut last = self.data.len();
        for (i, candidate) in self.data.iter().enumerate() {
            cumulative += candidate.p;
            if cumulative >= p && i + 1 >= min_keep {
                last = i + 1;
                break;
            }
        }

        self.data.truncate(last);
    }

    /// Rescale logits by `1 / temperature`
    ///
    /// A zero temperature collapses the set onto its best candidate.
    pub fn temperature(&mut self, temperature: f32) {
        if temperature == 0.0 {
            self.keep_top(1);
            return;
        }
        for candidate in self.data.iter_mut() {
            candidate.logit /= temperature;
        }
    }

    /// Highest-logit candidate; ties resolve to the earliest entry
    pub fn greedy(&self) -> Option<Token> {
        let mut best: Option<&TokenData> = None;
        for candidate in &self.data {
            match best {
                Some(current) if candidate.logit <= current.logit => {}
                _ => best = Some(candidate),
            }
        }
        best.map(|c| c.id)
    }

    /// Weighted random draw over the surviving candidates
    pub fn draw<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<Token> {
        self.draw_index(rng).map(|idx| self.data[idx].id)
    }

    fn draw_index<R: Rng + ?Sized>(&mut self, rng: &mut R) -> Option<usize> {
        if self.data.is_empty() {
            return None;
        }
        self.softmax();
        match WeightedIndex::new(self.data.iter().map(|c| c.p)) {
            Ok(dist) => Some(dist.sample(rng)),
            Err(_) => Some(0),
        }
    }

    /// Mirostat 1.0: estimate the Zipf exponent from the top `m` candidates,
    /// derive a top-k cut that targets surprise `mu`, draw, then adapt `mu`
    pub fn mirostat_v1<R: Rng + ?Sized>(
        &mut self,
        tau: f32,
        eta: f32,
        m: usize,
        mu: &mut f32,
        rng: &mut R,
    ) -> Option<Token> {
        let n_vocab = self.data.len() as f32;
        self.softmax();

        let mut sum_ti_bi = 0.0f32;
        let mut sum_ti_sq = 0.0f32;
        let limit = m.saturating_sub(1).min(self.data.len().saturating_sub(1));
        for i in 0..limit {
            let t_i = ((i as f32 + 2.0) / (i as f32 + 1.0)).ln();
            let b_i = (self.data[i].p / self.data[i + 1].p).ln();
            sum_ti_bi += t_i * b_i;
            sum_ti_sq += t_i * t_i;
        }
        let s_hat = sum_ti_bi / sum_ti_sq;

        let epsilon_hat = s_hat - 1.0;
        let k = ((epsilon_hat * 2f32.powf(*mu)) / (1.0 - n_vocab.powf(-epsilon_hat)))
            .powf(1.0 / s_hat);

        // NaN and sub-1 estimates fall back to a single candidate.
        self.keep_top(k.max(1.0) as usize);

        let idx = self.draw_index(rng)?;
        let observed = -self.data[idx].p.log2();
        *mu -= eta * (observed - tau);
        Some(self.data[idx].id)
    }

    /// Mirostat 2.0: drop candidates whose surprise exceeds `mu`, draw,
    /// then adapt `mu`
    pub fn mirostat_v2<R: Rng + ?Sized>(
        &mut self,
        tau: f32,
        eta: f32,
        mu: &mut f32,
        rng: &mut R,
    ) -> Option<Token> {
        self.softmax();

        let keep = self
            .data
            .iter()
            .position(|c| -c.p.log2() > *mu)
            .unwrap_or(self.data.len())
            .max(1);
        self.data.truncate(keep);

        let idx = self.draw_index(rng)?;
        let observed = -self.data[idx].p.log2();
        *mu -= eta * (observed - tau);
        Some(self.data[idx].id)
    }
}

fn token_counts(tokens: &[Token]) -> HashMap<Token, usize> {
    let mut counts = HashMap::with_capacity(tokens.len());
    for &token in tokens {
        *counts.entry(token).or_insert(0) += 1;
    }
    counts
}
