//! Inference backend contract
//!
//! The engine never touches evaluation kernels directly. Everything it needs
//! from the neural backend goes through [`InferenceBackend`], and backends are
//! created per configured model through a [`BackendLoader`].

use crate::config::ModelConfig;
use async_trait::async_trait;
use std::path::Path;

/// Opaque token identifier from the backend vocabulary
pub type Token = u32;

/// Primitives the generation engine requires from a neural backend
///
/// Implementations own their internal evaluation state (key/value cache,
/// logits buffer). All mutating calls take `&mut self`; the engine serializes
/// access through the per-model lock.
pub trait InferenceBackend: Send {
    /// Convert text into tokens, optionally prefixing the boundary token
    fn tokenize(&self, text: &str, add_boundary: bool) -> anyhow::Result<Vec<Token>>;

    /// Convert a single token into its text fragment
    fn detokenize(&self, token: Token) -> String;

    /// Evaluate `tokens` on top of `past` cached positions
    ///
    /// On success the backend exposes fresh logits for the last position.
    fn evaluate(&mut self, tokens: &[Token], past: usize, threads: usize) -> anyhow::Result<()>;

    /// Flat logits buffer of `rows * vocab_size()` values, last row last
    fn logits(&self, rows: usize) -> Vec<f32>;

    /// Number of entries in the vocabulary
    fn vocab_size(&self) -> usize;

    /// Context window fixed when the backend was initialized
    fn context_size(&self) -> usize;

    /// End-of-sequence sentinel
    fn eos_token(&self) -> Token;

    /// Newline sentinel
    fn newline_token(&self) -> Token;

    /// Persist the current evaluation state together with `tokens`
    fn save_state(&mut self, path: &Path, tokens: &[Token]) -> anyhow::Result<()>;

    /// Restore evaluation state, returning at most `max_tokens` stored tokens
    ///
    /// A missing file yields an empty token list, not an error.
    fn load_state(&mut self, path: &Path, max_tokens: usize) -> anyhow::Result<Vec<Token>>;

    /// Embedding vector for the most recent evaluation
    fn embeddings(&self) -> anyhow::Result<Vec<f32>> {
        anyhow::bail!("embeddings are not enabled for this backend")
    }
}

/// Creates backends for configured models
#[async_trait]
pub trait BackendLoader: Send + Sync {
    /// Instantiate the backend described by `config`
    async fn load(&self, config: &ModelConfig) -> anyhow::Result<Box<dyn InferenceBackend>>;
}
