//! Generation requests, results and streamed chunks

pub mod pipeline;

pub use pipeline::{GenerationLoop, GenerationStream, LoopOutcome, StreamSink};

use crate::prompt::ChatMessage;
use crate::sampling::SampleParams;
use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

fn default_max_tokens() -> usize {
    16
}

/// Plain text completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompletionRequest {
    pub prompt: String,

    /// Stop strings; the model's own stops are appended
    #[serde(default)]
    pub stops: Vec<String>,

    /// Appended to the generated text
    #[serde(default)]
    pub suffix: Option<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    /// Prefix the prompt to the generated text
    #[serde(default)]
    pub echo: bool,

    #[serde(default)]
    pub params: SampleParams,
}

impl CompletionRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            stops: Vec::new(),
            suffix: None,
            max_tokens: default_max_tokens(),
            echo: false,
            params: SampleParams::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_max_tokens(self.max_tokens)?;
        self.params.validate()
    }
}

/// Chat completion request
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatRequest {
    /// Conversation identity keying the persisted session
    #[serde(default)]
    pub user: String,

    pub messages: Vec<ChatMessage>,

    #[serde(default)]
    pub stops: Vec<String>,

    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,

    #[serde(default)]
    pub params: SampleParams,
}

impl ChatRequest {
    pub fn new(user: impl Into<String>, messages: Vec<ChatMessage>) -> Self {
        Self {
            user: user.into(),
            messages,
            stops: Vec::new(),
            max_tokens: default_max_tokens(),
            params: SampleParams::default(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        validate_max_tokens(self.max_tokens)?;
        self.params.validate()
    }
}

fn validate_max_tokens(max_tokens: usize) -> Result<()> {
    if max_tokens == 0 {
        return Err(CoreError::invalid_parameter(
            "INVALID_MAX_TOKENS",
            "max_tokens must be greater than 0",
            "Request at least one token",
            "max_tokens",
            "0",
            ">= 1",
        ));
    }
    Ok(())
}

/// Why a generation ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    /// End-of-sequence token or a stop string
    Stop,
    /// Token budget or context window exhausted
    Length,
}

impl FinishReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Length => "length",
        }
    }
}

/// Token accounting
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

impl Usage {
    pub fn new(prompt_tokens: usize, completion_tokens: usize) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// Complete answer of a buffered generation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationResult {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub text: String,
    pub usage: Usage,
    pub finish_reason: FinishReason,
}

/// One streamed delta; only the last chunk carries a finish reason
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationChunk {
    pub id: String,
    pub created: u64,
    pub model: String,
    pub delta: String,
    pub finish_reason: Option<FinishReason>,
}

/// Embedding vectors, one per input, in input order
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingResult {
    pub model: String,
    pub data: Vec<Vec<f32>>,
    pub usage: Usage,
}

/// Seconds since the unix epoch
pub(crate) fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
