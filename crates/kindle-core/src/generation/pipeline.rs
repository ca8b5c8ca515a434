//! Evaluate, sample, emit, check-stop loop shared by every generation mode

use crate::{
    backend::{InferenceBackend, Token},
    generation::{FinishReason, GenerationChunk},
    model::ModelState,
    sampling::{self, MirostatState, SampleParams},
    CoreError, Result,
};
use rand::rngs::StdRng;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

/// Evaluate `tokens` in chunks of `batch_size`, recording each chunk in `state`
pub(crate) fn evaluate_batches(
    backend: &mut dyn InferenceBackend,
    state: &mut ModelState,
    tokens: &[Token],
    batch_size: usize,
    threads: usize,
) -> Result<()> {
    for chunk in tokens.chunks(batch_size.max(1)) {
        let past = state.past_for_batch(chunk.len());
        backend
            .evaluate(chunk, past, threads)
            .map_err(|e| CoreError::evaluate(past, chunk.len(), e))?;
        state.record_batch(chunk, past);
    }
    Ok(())
}

/// Producing side of a streamed generation
///
/// Every chunk is handed over through a capacity-1 channel, so the loop
/// waits for the consumer before producing the next token.
pub struct StreamSink {
    sender: mpsc::Sender<GenerationChunk>,
    id: String,
    created: u64,
    model: String,
}

impl StreamSink {
    pub fn new(
        sender: mpsc::Sender<GenerationChunk>,
        id: String,
        created: u64,
        model: String,
    ) -> Self {
        Self {
            sender,
            id,
            created,
            model,
        }
    }

    async fn deliver(
        &self,
        delta: String,
        finish_reason: Option<FinishReason>,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let chunk = GenerationChunk {
            id: self.id.clone(),
            created: self.created,
            model: self.model.clone(),
            delta,
            finish_reason,
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(CoreError::cancelled("Cancelled while delivering a chunk")),
            sent = self.sender.send(chunk) => {
                sent.map_err(|_| CoreError::cancelled("Stream receiver dropped"))
            }
        }
    }
}

/// Consumer end of a streamed generation
///
/// Yields chunks in generation order and stops yielding as soon as the
/// cancellation token fires, even if a chunk is already buffered.
pub struct GenerationStream {
    receiver: mpsc::Receiver<GenerationChunk>,
    cancel: CancellationToken,
}

impl GenerationStream {
    pub fn new(receiver: mpsc::Receiver<GenerationChunk>, cancel: CancellationToken) -> Self {
        Self { receiver, cancel }
    }

    /// Next chunk, or `None` once the generation finished or was cancelled
    pub async fn recv(&mut self) -> Option<GenerationChunk> {
        if self.cancel.is_cancelled() {
            self.receiver.close();
            return None;
        }

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => {
                self.receiver.close();
                None
            }
            chunk = self.receiver.recv() => chunk,
        }
    }

    /// Cancel the producing generation
    pub fn cancel(&self) {
        self.cancel.cancel();
    }
}

/// Summary of a finished loop
#[derive(Debug, Clone)]
pub struct LoopOutcome {
    pub text: String,
    pub completion_tokens: usize,
    pub finish_reason: FinishReason,
    /// Tokens evaluated before the first sample
    pub prompt_tokens_evaluated: usize,
    pub prompt_eval_time: Duration,
    pub generation_time: Duration,
}

/// One generation over a locked model slot
pub struct GenerationLoop<'a> {
    backend: &'a mut dyn InferenceBackend,
    state: &'a mut ModelState,
    rng: &'a mut StdRng,
    batch_size: usize,
    threads: usize,
}

impl<'a> GenerationLoop<'a> {
    pub fn new(
        backend: &'a mut dyn InferenceBackend,
        state: &'a mut ModelState,
        rng: &'a mut StdRng,
        batch_size: usize,
        threads: usize,
    ) -> Self {
        Self {
            backend,
            state,
            rng,
            batch_size,
            threads,
        }
    }

    /// Run until end-of-sequence, the token budget, the context window or a
    /// stop string ends the generation
    ///
    /// `pending` holds the prompt tokens not yet cached by the backend and
    /// must not be empty. `prompt_len` is the full prompt length, cached
    /// prefix included.
    #[allow(clippy::too_many_arguments)]
    pub async fn run(
        &mut self,
        pending: Vec<Token>,
        prompt_len: usize,
        params: &SampleParams,
        stops: &[String],
        max_tokens: usize,
        sink: Option<&StreamSink>,
        cancel: &CancellationToken,
    ) -> Result<LoopOutcome> {
        let context_size = self.state.context_size();
        let vocab_size = self.backend.vocab_size();
        let eos = self.backend.eos_token();
        let newline = self.backend.newline_token();

        let mut mirostat = MirostatState::new(params.mirostat_tau);
        let mut text = String::new();
        let mut completion_tokens = 0;

        let prompt_tokens_evaluated = pending.len();
        let mut prompt_eval_time = Duration::ZERO;
        let mut input = pending;
        let started = Instant::now();

        loop {
            if cancel.is_cancelled() {
                return Err(CoreError::cancelled("Cancelled before evaluation"));
            }

            let eval_started = Instant::now();
            evaluate_batches(
                &mut *self.backend,
                &mut *self.state,
                &input,
                self.batch_size,
                self.threads,
            )?;
            if completion_tokens == 0 {
                prompt_eval_time = eval_started.elapsed();
            }

            let logits = self.backend.logits(1);
            let row = &logits[logits.len().saturating_sub(vocab_size)..];
            let recent = params.penalty_window(self.state.ring(), context_size);
            let token = sampling::sample(row, params, &recent, newline, &mut mirostat, &mut *self.rng)?;

            completion_tokens += 1;
            let piece = self.backend.detokenize(token);
            trace!("Generated token {} {:?}", token, piece);
            text.push_str(&piece);

            let finish_reason = if token == eos {
                Some(FinishReason::Stop)
            } else if completion_tokens >= max_tokens
                || prompt_len + completion_tokens >= context_size
            {
                Some(FinishReason::Length)
            } else if matches_stop(&text, stops) {
                Some(FinishReason::Stop)
            } else {
                None
            };

            if let Some(sink) = sink {
                sink.deliver(piece, finish_reason, cancel).await?;
            }

            if let Some(finish_reason) = finish_reason {
                debug!(
                    "Generation finished: {} after {} tokens",
                    finish_reason.as_str(),
                    completion_tokens
                );
                return Ok(LoopOutcome {
                    text,
                    completion_tokens,
                    finish_reason,
                    prompt_tokens_evaluated,
                    prompt_eval_time,
                    generation_time: started.elapsed().saturating_sub(prompt_eval_time),
                });
            }

            input = vec![token];
        }
    }
}

/// Whether `text` ends with any non-empty stop string
pub(crate) fn matches_stop(text: &str, stops: &[String]) -> bool {
    stops
        .iter()
        .any(|stop| !stop.is_empty() && text.ends_with(stop.as_str()))
}
