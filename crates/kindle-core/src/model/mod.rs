//! Per-model generation front end
//!
//! A [`LanguageModel`] owns one backend together with its [`ModelState`]
//! behind a single async lock. Every generation holds that lock from prompt
//! evaluation through the final emitted token.

pub mod ring_history;
pub mod state;

pub use ring_history::RingHistory;
pub use state::ModelState;

use crate::{
    backend::InferenceBackend,
    config::ModelConfig,
    generation::{
        pipeline::evaluate_batches, unix_timestamp, ChatRequest, CompletionRequest,
        EmbeddingResult, GenerationChunk, GenerationLoop, GenerationResult, GenerationStream,
        LoopOutcome, StreamSink, Usage,
    },
    prompt::PromptTemplate,
    sampling::SampleParams,
    session::{match_prefix, SessionStore},
    CoreError, Result,
};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Everything guarded by the model lock
struct ModelSlot {
    backend: Box<dyn InferenceBackend>,
    state: ModelState,
    rng: StdRng,
}

/// How the prompt is checked against the context window
#[derive(Debug, Clone, Copy)]
enum ContextRule {
    /// Prompt plus requested tokens must fit
    PromptPlusMax,
    /// Prompt alone must leave room for one token
    PromptOnly,
}

/// Generation settings after request defaults and model stops are merged
struct Job<'r> {
    mode: &'static str,
    prompt: String,
    stops: Vec<String>,
    max_tokens: usize,
    params: &'r SampleParams,
    rule: ContextRule,
    session: Option<&'r str>,
}

/// Loaded model with its serialized mutable state
pub struct LanguageModel {
    config: ModelConfig,
    template: PromptTemplate,
    sessions: Option<SessionStore>,
    context_size: usize,
    vocab_size: usize,
    slot: Arc<Mutex<ModelSlot>>,
}

impl std::fmt::Debug for LanguageModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LanguageModel")
            .field("name", &self.config.name)
            .field("context_size", &self.context_size)
            .field("vocab_size", &self.vocab_size)
            .finish()
    }
}

impl LanguageModel {
    /// Wrap a freshly initialized backend
    pub fn new(config: ModelConfig, backend: Box<dyn InferenceBackend>) -> Result<Self> {
        config.validate()?;

        let context_size = backend.context_size();
        if context_size == 0 {
            return Err(CoreError::configuration(
                "BACKEND_CONTEXT_EMPTY",
                format!("Backend for '{}' reports a zero context window", config.name),
                "Initializing model",
                "Set a positive `context` in the model configuration",
            ));
        }
        if let Some(configured) = config.context {
            if configured != context_size {
                warn!(
                    "Model '{}' configured with context {} but backend reports {}",
                    config.name, configured, context_size
                );
            }
        }

        let vocab_size = backend.vocab_size();
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let sessions = config
            .session
            .enable
            .then(|| SessionStore::new(&config.session, config.name.clone()));

        info!(
            "Model '{}' ready: context {}, vocab {}, sessions {}",
            config.name,
            context_size,
            vocab_size,
            if sessions.is_some() { "on" } else { "off" }
        );

        let slot = ModelSlot {
            backend,
            state: ModelState::new(context_size, config.last_n_token_size),
            rng,
        };

        Ok(Self {
            template: PromptTemplate::from_config(&config),
            sessions,
            context_size,
            vocab_size,
            slot: Arc::new(Mutex::new(slot)),
            config,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn sessions_enabled(&self) -> bool {
        self.sessions.is_some()
    }

    /// Clear the model state; waits for any in-flight generation
    pub async fn reset(&self) {
        self.slot.lock().await.state.reset();
    }

    /// Buffered text completion
    pub async fn completion(
        &self,
        request: CompletionRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        request.validate()?;
        let job = Job {
            mode: "completion",
            prompt: self.template.render_completion(&request.prompt),
            stops: self.merge_stops(&request.stops),
            max_tokens: request.max_tokens,
            params: &request.params,
            rule: ContextRule::PromptPlusMax,
            session: None,
        };

        let (mut outcome, prompt_len) = self.generate(job, None, cancel).await?;

        let mut text = std::mem::take(&mut outcome.text);
        if request.echo {
            text.insert_str(0, &request.prompt);
        }
        if let Some(suffix) = &request.suffix {
            text.push_str(suffix);
        }

        Ok(self.result(text, prompt_len, &outcome))
    }

    /// Streamed text completion; the channel closes when this returns
    pub async fn completion_stream(
        &self,
        request: CompletionRequest,
        sender: mpsc::Sender<GenerationChunk>,
        cancel: CancellationToken,
    ) -> Result<()> {
        request.validate()?;
        let job = Job {
            mode: "completion",
            prompt: self.template.render_completion(&request.prompt),
            stops: self.merge_stops(&request.stops),
            max_tokens: request.max_tokens,
            params: &request.params,
            rule: ContextRule::PromptOnly,
            session: None,
        };

        let sink = self.sink(sender);
        self.generate(job, Some(&sink), &cancel).await.map(|_| ())
    }

    /// Buffered chat completion
    pub async fn chat_completion(
        &self,
        request: ChatRequest,
        cancel: &CancellationToken,
    ) -> Result<GenerationResult> {
        request.validate()?;
        let job = Job {
            mode: "chat",
            prompt: self.template.render_chat(&request.messages),
            stops: self.merge_stops(&request.stops),
            max_tokens: request.max_tokens,
            params: &request.params,
            rule: ContextRule::PromptOnly,
            session: Some(request.user.as_str()),
        };

        let (mut outcome, prompt_len) = self.generate(job, None, cancel).await?;
        let text = std::mem::take(&mut outcome.text);
        Ok(self.result(text, prompt_len, &outcome))
    }

    /// Streamed chat completion; the channel closes when this returns
    pub async fn chat_completion_stream(
        &self,
        request: ChatRequest,
        sender: mpsc::Sender<GenerationChunk>,
        cancel: CancellationToken,
    ) -> Result<()> {
        request.validate()?;
        let job = Job {
            mode: "chat",
            prompt: self.template.render_chat(&request.messages),
            stops: self.merge_stops(&request.stops),
            max_tokens: request.max_tokens,
            params: &request.params,
            rule: ContextRule::PromptOnly,
            session: Some(request.user.as_str()),
        };

        let sink = self.sink(sender);
        self.generate(job, Some(&sink), &cancel).await.map(|_| ())
    }

    /// Run [`Self::completion_stream`] on a task
    pub fn spawn_completion_stream(
        self: &Arc<Self>,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> (GenerationStream, JoinHandle<Result<()>>) {
        let (sender, receiver) = mpsc::channel(1);
        let stream = GenerationStream::new(receiver, cancel.clone());
        let model = Arc::clone(self);
        let handle =
            tokio::spawn(async move { model.completion_stream(request, sender, cancel).await });
        (stream, handle)
    }

    /// Run [`Self::chat_completion_stream`] on a task
    pub fn spawn_chat_stream(
        self: &Arc<Self>,
        request: ChatRequest,
        cancel: CancellationToken,
    ) -> (GenerationStream, JoinHandle<Result<()>>) {
        let (sender, receiver) = mpsc::channel(1);
        let stream = GenerationStream::new(receiver, cancel.clone());
        let model = Arc::clone(self);
        let handle =
            tokio::spawn(async move { model.chat_completion_stream(request, sender, cancel).await });
        (stream, handle)
    }

    /// Embedding vector per input
    ///
    /// The token count accumulates across inputs and must stay within the
    /// context window.
    pub async fn embeddings(
        &self,
        inputs: &[String],
        cancel: &CancellationToken,
    ) -> Result<EmbeddingResult> {
        let mut guard = self.slot.lock().await;
        let ModelSlot { backend, state, .. } = &mut *guard;
        let threads = self.config.thread_count();

        let mut data = Vec::with_capacity(inputs.len());
        let mut total_tokens = 0;
        for input in inputs {
            if cancel.is_cancelled() {
                debug!("Embeddings for '{}' cancelled", self.config.name);
                return Err(CoreError::cancelled("Embedding request cancelled"));
            }

            state.reset();
            let tokens = backend
                .tokenize(input, true)
                .map_err(|e| CoreError::tokenize("Tokenizing embedding input", e))?;

            total_tokens += tokens.len();
            if total_tokens > self.context_size {
                return Err(CoreError::context_overflow(total_tokens, None, self.context_size));
            }

            evaluate_batches(&mut **backend, state, &tokens, self.config.batch, threads)?;

            let embedding = backend.embeddings().map_err(|e| {
                CoreError::backend(
                    "EMBEDDINGS_FAILED",
                    "Reading embedding vector",
                    "Enable `embedding` in the model configuration",
                    e,
                )
            })?;
            data.push(embedding);
        }

        Ok(EmbeddingResult {
            model: self.config.name.clone(),
            data,
            usage: Usage::new(total_tokens, 0),
        })
    }

    fn merge_stops(&self, stops: &[String]) -> Vec<String> {
        stops.iter().chain(&self.config.stops).cloned().collect()
    }

    fn sink(&self, sender: mpsc::Sender<GenerationChunk>) -> StreamSink {
        StreamSink::new(
            sender,
            Uuid::new_v4().to_string(),
            unix_timestamp(),
            self.config.name.clone(),
        )
    }

    fn result(&self, text: String, prompt_len: usize, outcome: &LoopOutcome) -> GenerationResult {
        GenerationResult {
            id: Uuid::new_v4().to_string(),
            created: unix_timestamp(),
            model: self.config.name.clone(),
            text,
            usage: Usage::new(prompt_len, outcome.completion_tokens),
            finish_reason: outcome.finish_reason,
        }
    }

    /// Lock, tokenize, check the context, reuse a session prefix, run the
    /// loop and refresh the session
    ///
    /// Returns the loop outcome and the full prompt length.
    async fn generate(
        &self,
        job: Job<'_>,
        sink: Option<&StreamSink>,
        cancel: &CancellationToken,
    ) -> Result<(LoopOutcome, usize)> {
        let span = info_span!(
            "generation",
            model = %self.config.name,
            mode = job.mode,
            stream = sink.is_some()
        );

        let outcome = self.generate_locked(job, sink, cancel).instrument(span).await;
        if let Err(err) = &outcome {
            if err.is_cancelled() {
                debug!("Generation on '{}' cancelled", self.config.name);
            } else {
                warn!("Generation on '{}' failed: {}", self.config.name, err.code());
            }
        }
        outcome
    }

    async fn generate_locked(
        &self,
        job: Job<'_>,
        sink: Option<&StreamSink>,
        cancel: &CancellationToken,
    ) -> Result<(LoopOutcome, usize)> {
        let mut guard = Arc::clone(&self.slot).lock_owned().await;
        let ModelSlot {
            backend,
            state,
            rng,
        } = &mut *guard;

        debug!("Rendered prompt: {:?}", job.prompt);
        let tokens = backend
            .tokenize(&job.prompt, true)
            .map_err(|e| CoreError::tokenize("Tokenizing prompt", e))?;
        let prompt_len = tokens.len();
        if prompt_len == 0 {
            return Err(CoreError::invalid_parameter(
                "EMPTY_PROMPT",
                "Prompt tokenized to zero tokens",
                "Provide a non-empty prompt",
                "prompt",
                "",
                "at least one token",
            ));
        }

        let overflow = match job.rule {
            ContextRule::PromptPlusMax => prompt_len + job.max_tokens > self.context_size,
            ContextRule::PromptOnly => prompt_len >= self.context_size,
        };
        if overflow {
            let max = matches!(job.rule, ContextRule::PromptPlusMax).then_some(job.max_tokens);
            return Err(CoreError::context_overflow(prompt_len, max, self.context_size));
        }

        state.reset();

        let session = match (&self.sessions, job.session) {
            (Some(store), Some(identity)) => Some((store, identity)),
            _ => None,
        };

        let mut match_count = 0;
        let mut pending = tokens;
        if let Some((store, identity)) = session {
            let stored = store.load(&mut **backend, identity, self.context_size)?;
            match_count = match_prefix(&stored, &pending);
            // The last prompt token is always re-evaluated so fresh logits exist.
            let reuse = match_count.min(prompt_len - 1);
            if reuse > 0 {
                state.restore_prefix(&pending[..reuse]);
                pending = pending.split_off(reuse);
            }
            debug!(
                "Session '{}' matched {} of {} prompt tokens, evaluating {}",
                identity,
                match_count,
                prompt_len,
                pending.len()
            );
        }

        let outcome = GenerationLoop::new(
            &mut **backend,
            state,
            rng,
            self.config.batch,
            self.config.thread_count(),
        )
        .run(
            pending,
            prompt_len,
            job.params,
            &job.stops,
            job.max_tokens,
            sink,
            cancel,
        )
        .await?;

        if let Some((store, identity)) = session {
            store.maybe_save(
                &mut **backend,
                identity,
                state.all_tokens(),
                match_count,
                prompt_len,
                outcome.completion_tokens,
            )?;
        }

        if self.config.verbose {
            let per_token = |elapsed: std::time::Duration, n: usize| {
                elapsed.as_secs_f64() * 1000.0 / n.max(1) as f64
            };
            info!(
                "Timings for '{}': prompt eval {:.2} ms ({} tokens, {:.2} ms/token), generation {:.2} ms ({} tokens, {:.2} ms/token)",
                self.config.name,
                outcome.prompt_eval_time.as_secs_f64() * 1000.0,
                outcome.prompt_tokens_evaluated,
                per_token(outcome.prompt_eval_time, outcome.prompt_tokens_evaluated),
                outcome.generation_time.as_secs_f64() * 1000.0,
                outcome.completion_tokens,
                per_token(outcome.generation_time, outcome.completion_tokens),
            );
        }

        Ok((outcome, prompt_len))
    }
}
