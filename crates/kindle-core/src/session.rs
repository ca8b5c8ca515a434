//! Session continuity: persisted token prefixes per conversation
//!
//! A session is the backend state saved at the end of a chat generation,
//! stored as `{dir}/{model}-{identity}.dat`. The next request for the same
//! conversation loads it back and skips re-evaluating the shared prefix.

use crate::backend::{InferenceBackend, Token};
use crate::config::SessionConfig;
use crate::{CoreError, Result};
use std::path::PathBuf;
use tracing::{debug, info};

/// Length of the longest common prefix of `stored` and `prompt`
pub fn match_prefix(stored: &[Token], prompt: &[Token]) -> usize {
    stored
        .iter()
        .zip(prompt)
        .take_while(|(a, b)| a == b)
        .count()
}

/// Fraction of the finished generation already covered by the cached prefix
pub fn similarity(match_count: usize, prompt_len: usize, output_len: usize) -> f32 {
    let total = prompt_len + output_len;
    if total == 0 {
        return 0.0;
    }
    match_count as f32 / total as f32
}

/// Session files for one model
#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
    model_name: String,
    threshold: f32,
}

impl SessionStore {
    pub fn new(config: &SessionConfig, model_name: impl Into<String>) -> Self {
        Self {
            dir: config.path.clone(),
            model_name: model_name.into(),
            threshold: config.threshold,
        }
    }

    /// File backing the session of `identity`
    pub fn path_for(&self, identity: &str) -> Result<PathBuf> {
        if identity.contains(['/', '\\']) || identity.contains("..") {
            return Err(CoreError::invalid_parameter(
                "INVALID_SESSION_ID",
                format!("Conversation id '{}' is not a valid file name component", identity),
                "Use an id without path separators",
                "id",
                identity,
                "no '/', '\\' or '..'",
            ));
        }
        Ok(self
            .dir
            .join(format!("{}-{}.dat", self.model_name, identity)))
    }

    /// Restore the stored session of `identity` into `backend`
    ///
    /// Returns the stored tokens, or an empty list when no session exists.
    pub fn load(
        &self,
        backend: &mut dyn InferenceBackend,
        identity: &str,
        max_tokens: usize,
    ) -> Result<Vec<Token>> {
        let path = self.path_for(identity)?;
        if !path.exists() {
            debug!("No session at {:?}", path);
            return Ok(Vec::new());
        }

        let tokens = backend.load_state(&path, max_tokens).map_err(|e| {
            CoreError::session_io("Failed to load session state", &path, Some(e))
        })?;
        debug!("Loaded session {:?} with {} tokens", path, tokens.len());
        Ok(tokens)
    }

    /// Persist `tokens` for `identity` unless the cached prefix already
    /// covered enough of this generation
    ///
    /// Returns whether the session was written.
    pub fn maybe_save(
        &self,
        backend: &mut dyn InferenceBackend,
        identity: &str,
        tokens: &[Token],
        match_count: usize,
        prompt_len: usize,
        output_len: usize,
    ) -> Result<bool> {
        let ratio = similarity(match_count, prompt_len, output_len);
        if ratio >= self.threshold {
            debug!(
                "Session '{}' similarity {:.3} >= {:.3}, skipping save",
                identity, ratio, self.threshold
            );
            return Ok(false);
        }

        let path = self.path_for(identity)?;
        std::fs::create_dir_all(&self.dir).map_err(|e| {
            CoreError::session_io("Failed to create session directory", &self.dir, Some(e.into()))
        })?;
        backend.save_state(&path, tokens).map_err(|e| {
            CoreError::session_io("Failed to save session state", &path, Some(e))
        })?;

        info!(
            "Saved session {:?} ({} tokens, similarity {:.3})",
            path,
            tokens.len(),
            ratio
        );
        Ok(true)
    }
}
