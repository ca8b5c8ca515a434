//! Kindle Core - generation and session-continuity engine
//!
//! This crate sits between a request-facing service and a neural inference
//! backend. It turns token prompts into bounded, cancellable streams of
//! sampled tokens, owns the per-model mutable state, and reuses prior
//! computation across requests through persisted session prefixes.

pub mod backend;
pub mod config;
pub mod engine;
pub mod generation;
pub mod model;
pub mod prompt;
pub mod sampling;
pub mod session;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum CoreError {
    /// Prompt (or prompt plus requested tokens) does not fit the context window
    #[error("Context overflow [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    ContextOverflow {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        prompt_tokens: usize,
        max_tokens: Option<usize>,
        context_size: usize,
    },

    /// Backend tokenizer rejected the input
    #[error("Tokenize error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Tokenize {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Backend evaluation failed mid-generation
    #[error("Evaluate error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Evaluate {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        past_offset: usize,
        batch_len: usize,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Session state could not be loaded or persisted
    #[error("Session IO error [{code}]: {message}\nPath: {path:?}\nSuggestion: {suggestion}")]
    SessionIo {
        code: &'static str,
        message: String,
        suggestion: String,
        path: std::path::PathBuf,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// Generation was cancelled by the caller
    #[error("Generation cancelled [{code}]: {context}")]
    Cancelled {
        code: &'static str,
        context: String,
    },

    /// Input validation and parameter errors
    #[error("Invalid input [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    InvalidInput {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        parameter_name: Option<String>,
        value: Option<String>,
        valid_range: Option<String>,
    },

    /// Configuration parsing and validation errors
    #[error("Configuration error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Configuration {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        config_path: Option<std::path::PathBuf>,
        field_name: Option<String>,
    },

    /// Requested model is not configured
    #[error("Model not found [{code}]: {name}")]
    ModelNotFound {
        code: &'static str,
        name: String,
    },

    /// Any other backend primitive failure (loading, embeddings)
    #[error("Backend error [{code}]: {message}\nContext: {context}\nSuggestion: {suggestion}")]
    Backend {
        code: &'static str,
        message: String,
        context: String,
        suggestion: String,
        #[source]
        source: Option<anyhow::Error>,
    },

    /// File system and I/O errors
    #[error("IO error [{code}]: {message}\nPath: {path:?}\nSuggestion: {suggestion}")]
    Io {
        code: &'static str,
        message: String,
        path: Option<std::path::PathBuf>,
        suggestion: String,
        #[source]
        source: std::io::Error,
    },

    /// Other unexpected errors
    #[error("Internal error [{code}]: {message}\nContext: {context}")]
    Internal {
        code: &'static str,
        message: String,
        context: String,
        #[source]
        source: Option<anyhow::Error>,
    },
}

pub type Result<T> = std::result::Result<T, CoreError>;

impl CoreError {
    /// Create a context overflow error
    pub fn context_overflow(
        prompt_tokens: usize,
        max_tokens: Option<usize>,
        context_size: usize,
    ) -> Self {
        let message = match max_tokens {
            Some(max) => format!(
                "Prompt of {} tokens plus {} requested tokens exceeds context size {}",
                prompt_tokens, max, context_size
            ),
            None => format!(
                "Prompt of {} tokens exceeds context size {}",
                prompt_tokens, context_size
            ),
        };
        Self::ContextOverflow {
            code: "CONTEXT_OVERFLOW",
            message,
            context: "Validating prompt against the context window".to_string(),
            suggestion: "Shorten the prompt or request fewer tokens".to_string(),
            prompt_tokens,
            max_tokens,
            context_size,
        }
    }

    /// Create a tokenize error wrapping the backend failure
    pub fn tokenize<S: Into<String>>(context: S, source: anyhow::Error) -> Self {
        Self::Tokenize {
            code: "TOKENIZE_FAILED",
            message: source.to_string(),
            context: context.into(),
            suggestion: "Check the prompt encoding and the backend vocabulary".to_string(),
            source: Some(source),
        }
    }

    /// Create an evaluate error wrapping the backend failure
    pub fn evaluate(past_offset: usize, batch_len: usize, source: anyhow::Error) -> Self {
        Self::Evaluate {
            code: "EVALUATE_FAILED",
            message: source.to_string(),
            context: format!(
                "Evaluating batch of {} tokens at past offset {}",
                batch_len, past_offset
            ),
            suggestion: "Inspect backend logs; the generation was aborted".to_string(),
            past_offset,
            batch_len,
            source: Some(source),
        }
    }

    /// Create a session IO error
    pub fn session_io<S, P>(message: S, path: P, source: Option<anyhow::Error>) -> Self
    where
        S: Into<String>,
        P: Into<std::path::PathBuf>,
    {
        Self::SessionIo {
            code: "SESSION_IO_FAILED",
            message: message.into(),
            suggestion: "Check the session directory exists and is writable".to_string(),
            path: path.into(),
            source,
        }
    }

    /// Create a cancellation marker
    pub fn cancelled<S: Into<String>>(context: S) -> Self {
        Self::Cancelled {
            code: "CANCELLED",
            context: context.into(),
        }
    }

    /// Create an invalid input error with parameter details
    pub fn invalid_parameter<S1, S2, S3, S4, S5>(
        code: &'static str,
        message: S1,
        suggestion: S2,
        param_name: S3,
        value: S4,
        valid_range: S5,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
        S4: Into<String>,
        S5: Into<String>,
    {
        Self::InvalidInput {
            code,
            message: message.into(),
            context: "Request parameter validation".to_string(),
            suggestion: suggestion.into(),
            parameter_name: Some(param_name.into()),
            value: Some(value.into()),
            valid_range: Some(valid_range.into()),
        }
    }

    /// Create a configuration error
    pub fn configuration<S1, S2, S3>(
        code: &'static str,
        message: S1,
        context: S2,
        suggestion: S3,
    ) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
        S3: Into<String>,
    {
        Self::Configuration {
            code,
            message: message.into(),
            context: context.into(),
            suggestion: suggestion.into(),
            config_path: None,
            field_name: None,
        }
    }

    /// Create a backend error wrapping the backend failure
    pub fn backend<S1, S2>(code: &'static str, context: S1, suggestion: S2, source: anyhow::Error) -> Self
    where
        S1: Into<String>,
        S2: Into<String>,
    {
        Self::Backend {
            code,
            message: source.to_string(),
            context: context.into(),
            suggestion: suggestion.into(),
            source: Some(source),
        }
    }

    /// Get the error code for programmatic handling
    pub fn code(&self) -> &'static str {
        match self {
            Self::ContextOverflow { code, .. } => *code,
            Self::Tokenize { code, .. } => *code,
            Self::Evaluate { code, .. } => *code,
            Self::SessionIo { code, .. } => *code,
            Self::Cancelled { code, .. } => *code,
            Self::InvalidInput { code, .. } => *code,
            Self::Configuration { code, .. } => *code,
            Self::ModelNotFound { code, .. } => *code,
            Self::Backend { code, .. } => *code,
            Self::Io { code, .. } => *code,
            Self::Internal { code, .. } => *code,
        }
    }

    /// Whether this error is a caller-initiated cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }
}

/// File errors outside the session path: model configuration files and the
/// models directory
impl From<std::io::Error> for CoreError {
    fn from(err: std::io::Error) -> Self {
        let (code, suggestion) = match err.kind() {
            std::io::ErrorKind::NotFound => (
                "CONFIG_FILE_MISSING",
                "Point the engine at an existing configuration file or models directory",
            ),
            std::io::ErrorKind::PermissionDenied => (
                "CONFIG_FILE_DENIED",
                "Make the configuration files readable (and writable when saving)",
            ),
            _ => ("CONFIG_FILE_IO", "Retry once the configuration storage is reachable"),
        };

        Self::Io {
            code,
            message: err.to_string(),
            path: None,
            suggestion: suggestion.to_string(),
            source: err,
        }
    }
}

/// Backend failures that reach the engine without a typed wrapper
impl From<anyhow::Error> for CoreError {
    fn from(err: anyhow::Error) -> Self {
        Self::Internal {
            code: "UNCLASSIFIED_BACKEND_FAILURE",
            message: err.to_string(),
            context: "Backend call outside tokenize, evaluate, session and load".to_string(),
            source: Some(err),
        }
    }
}

/// Prelude module for common imports
pub mod prelude {
    pub use crate::{
        backend::{BackendLoader, InferenceBackend, Token},
        config::{EngineConfig, ModelConfig, SessionConfig},
        engine::{InferenceEngine, ModelInfo},
        generation::{
            ChatRequest, CompletionRequest, EmbeddingResult, FinishReason, GenerationChunk,
            GenerationResult, GenerationStream, Usage,
        },
        model::{LanguageModel, ModelState, RingHistory},
        prompt::{ChatMessage, PromptTemplate},
        sampling::{MirostatMode, SampleParams},
        session::SessionStore,
        CoreError, Result,
    };
}

// Re-export key types at the crate root
pub use backend::{BackendLoader, InferenceBackend, Token};
pub use config::EngineConfig;
pub use engine::InferenceEngine;
pub use model::LanguageModel;
pub use tokio_util::sync::CancellationToken;

pub mod error {
    pub use super::{CoreError, Result};
}
