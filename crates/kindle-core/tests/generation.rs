//! End-to-end generation tests over the scripted backend

mod common;

use common::*;
use kindle_core::prelude::*;
use kindle_core::CancellationToken;
use std::time::Duration;

fn completion(prompt: &str, max_tokens: usize) -> CompletionRequest {
    CompletionRequest {
        max_tokens,
        params: greedy(),
        ..CompletionRequest::new(prompt)
    }
}

fn chat(content: &str, max_tokens: usize) -> ChatRequest {
    ChatRequest {
        max_tokens,
        params: greedy(),
        ..ChatRequest::new("", vec![ChatMessage::user(content)])
    }
}

#[tokio::test]
async fn test_eos_on_first_sample() {
    init_tracing();
    let (model, log) = scripted_model(model_config("m"), 10, vec![EOS]);

    let result = model
        .completion(completion("hello", 3), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.usage, Usage::new(2, 1));
    assert_eq!(result.finish_reason, FinishReason::Stop);
    assert_eq!(result.text, "");
    assert_eq!(result.model, "m");
    assert_eq!(log.lock().unwrap().evaluations, vec![(vec![BOS, HELLO], 0)]);
}

#[tokio::test]
async fn test_length_after_max_tokens() {
    let (model, log) = scripted_model(model_config("m"), 64, vec![WORLD, FOO, BAR]);

    let result = model
        .completion(completion("hello", 2), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.finish_reason, FinishReason::Length);
    assert_eq!(result.usage.completion_tokens, 2);
    assert_eq!(result.text, " world foo");
    // Prompt, then the first sampled token fed back
    assert_eq!(
        log.lock().unwrap().evaluations,
        vec![(vec![BOS, HELLO], 0), (vec![WORLD], 2)]
    );
}

#[tokio::test]
async fn test_length_at_context_window() {
    let (model, _) = scripted_model(model_config("m"), 5, vec![FOO]);

    // "user: hello\n" is three tokens; two more fill the window
    let result = model
        .chat_completion(chat("hello", 100), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(result.finish_reason, FinishReason::Length);
    assert_eq!(result.usage, Usage::new(3, 2));
}

#[tokio::test]
async fn test_stop_string_halts_on_the_matching_step() {
    let (model, _) = scripted_model(model_config("m"), 64, vec![WORLD, FOO, USER_TAG, BAR]);

    let mut request = completion("hello", 50);
    request.stops = vec!["User:".to_string()];
    let result = model.completion(request, &CancellationToken::new()).await.unwrap();
    assert_eq!(result.finish_reason, FinishReason::Stop);
    assert_eq!(result.text, " world foo User:");
    assert_eq!(result.usage.completion_tokens, 3);

    let mut request = completion("hello", 50);
    request.stops = vec!["foo".to_string()];
    let result = model.completion(request, &CancellationToken::new()).await.unwrap();
    assert_eq!(result.text, " world foo");
    assert_eq!(result.usage.completion_tokens, 2);
}

#[tokio::test]
async fn test_model_stops_are_appended() {
    let mut config = model_config("m");
    config.stops = vec!["bar".to_string()];
    let (model, _) = scripted_model(config, 64, vec![WORLD, BAR, FOO]);

    let result = model
        .completion(completion("hello", 50), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.finish_reason, FinishReason::Stop);
    assert_eq!(result.text, " world bar");
}

#[tokio::test]
async fn test_eos_wins_over_length() {
    let (model, _) = scripted_model(model_config("m"), 64, vec![EOS]);

    let result = model
        .completion(completion("hello", 1), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(result.finish_reason, FinishReason::Stop);
}

#[tokio::test]
async fn test_echo_and_suffix() {
    let (model, _) = scripted_model(model_config("m"), 64, vec![WORLD, EOS]);

    let mut request = completion("hello", 10);
    request.echo = true;
    request.suffix = Some("!".to_string());
    let result = model.completion(request, &CancellationToken::new()).await.unwrap();

    assert_eq!(result.text, "hello world!");
    assert_eq!(result.usage.completion_tokens, 2);
}

#[tokio::test]
async fn test_prompt_is_evaluated_in_batches() {
    let mut config = model_config("m");
    config.batch = 2;
    let (model, log) = scripted_model(config, 64, vec![EOS]);

    model
        .completion(completion("hello world foo bar", 4), &CancellationToken::new())
        .await
        .unwrap();

    assert_eq!(
        log.lock().unwrap().evaluations,
        vec![
            (vec![BOS, HELLO], 0),
            (vec![WORLD, FOO], 2),
            (vec![BAR], 4),
        ]
    );
}

#[tokio::test]
async fn test_completion_context_overflow_counts_max_tokens() {
    let (model, log) = scripted_model(model_config("m"), 4, vec![EOS]);

    let err = model
        .completion(completion("hello", 3), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CoreError::ContextOverflow {
            prompt_tokens: 2,
            max_tokens: Some(3),
            context_size: 4,
            ..
        }
    ));
    assert!(log.lock().unwrap().evaluations.is_empty());
}

#[tokio::test]
async fn test_prompt_filling_context_is_rejected_before_evaluate() {
    // "user: hello\n" is three tokens
    let (model, log) = scripted_model(model_config("m"), 3, vec![EOS]);

    let err = model
        .chat_completion(chat("hello", 1), &CancellationToken::new())
        .await
        .unwrap_err();

    assert_eq!(err.code(), "CONTEXT_OVERFLOW");
    assert!(log.lock().unwrap().evaluations.is_empty());

    let (sender, _receiver) = tokio::sync::mpsc::channel(1);
    let err = model
        .chat_completion_stream(chat("hello", 1), sender, CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONTEXT_OVERFLOW");
    assert!(log.lock().unwrap().evaluations.is_empty());
}

#[tokio::test]
async fn test_tokenize_failure() {
    let (model, _) = scripted_model(model_config("m"), 64, vec![EOS]);

    let err = model
        .completion(completion("hello <fail>", 3), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "TOKENIZE_FAILED");
}

#[tokio::test]
async fn test_evaluate_failure_aborts() {
    let (backend, log) = ScriptedBackend::failing(64);
    let model = LanguageModel::new(model_config("m"), Box::new(backend)).unwrap();

    let err = model
        .completion(completion("hello", 3), &CancellationToken::new())
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        CoreError::Evaluate {
            past_offset: 0,
            batch_len: 2,
            ..
        }
    ));
    assert_eq!(log.lock().unwrap().evaluations.len(), 1);
}

#[tokio::test]
async fn test_request_validation() {
    let (model, log) = scripted_model(model_config("m"), 64, vec![EOS]);

    let err = model
        .completion(completion("hello", 0), &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "INVALID_MAX_TOKENS");

    let outcome = model
        .completion(
            CompletionRequest {
                max_tokens: 3,
                ..CompletionRequest::new("")
            },
            &CancellationToken::new(),
        )
        .await;
    // The boundary token alone is a valid prompt
    assert!(outcome.is_ok());
    assert_eq!(log.lock().unwrap().evaluations[0], (vec![BOS], 0));
}

#[tokio::test]
async fn test_cancelled_before_start() {
    let (model, log) = scripted_model(model_config("m"), 64, vec![FOO]);
    let cancel = CancellationToken::new();
    cancel.cancel();

    let err = model
        .completion(completion("hello", 10), &cancel)
        .await
        .unwrap_err();

    assert!(err.is_cancelled());
    assert!(log.lock().unwrap().evaluations.is_empty());
}

#[tokio::test]
async fn test_stream_delivers_chunks_in_order() {
    let (model, _) = scripted_model(model_config("m"), 64, vec![HELLO, WORLD, EOS]);

    let (mut stream, handle) =
        model.spawn_completion_stream(completion("hello", 10), CancellationToken::new());

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.recv().await {
        chunks.push(chunk);
    }
    handle.await.unwrap().unwrap();

    let deltas: Vec<&str> = chunks.iter().map(|c| c.delta.as_str()).collect();
    assert_eq!(deltas, vec![" hello", " world", ""]);

    let reasons: Vec<Option<FinishReason>> = chunks.iter().map(|c| c.finish_reason).collect();
    assert_eq!(reasons, vec![None, None, Some(FinishReason::Stop)]);
    assert!(chunks.iter().all(|c| c.id == chunks[0].id && c.model == "m"));
}

#[tokio::test]
async fn test_chat_stream_length() {
    let (model, _) = scripted_model(model_config("m"), 64, vec![FOO]);

    let (mut stream, handle) = model.spawn_chat_stream(chat("hello", 2), CancellationToken::new());

    let mut chunks = Vec::new();
    while let Some(chunk) = stream.recv().await {
        chunks.push(chunk);
    }
    handle.await.unwrap().unwrap();

    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[1].finish_reason, Some(FinishReason::Length));
}

#[tokio::test]
async fn test_cancel_mid_stream_closes_channel() {
    let (model, _) = scripted_model(model_config("m"), 1024, vec![FOO]);

    let (mut stream, handle) =
        model.spawn_completion_stream(completion("hello", 500), CancellationToken::new());

    assert!(stream.recv().await.is_some());
    assert!(stream.recv().await.is_some());

    stream.cancel();
    assert!(stream.recv().await.is_none());

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("producer did not stop")
        .unwrap();
    assert!(outcome.unwrap_err().is_cancelled());
}

#[tokio::test]
async fn test_dropped_consumer_cancels_generation() {
    let (model, _) = scripted_model(model_config("m"), 1024, vec![FOO]);

    let (mut stream, handle) =
        model.spawn_completion_stream(completion("hello", 500), CancellationToken::new());
    assert!(stream.recv().await.is_some());
    drop(stream);

    let outcome = tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("producer did not stop")
        .unwrap();
    assert!(outcome.unwrap_err().is_cancelled());
}

#[tokio::test]
async fn test_same_model_requests_are_serialized() {
    let (model, _) = scripted_model(model_config("m"), 1024, vec![FOO]);

    let (mut stream, handle) =
        model.spawn_completion_stream(completion("hello", 500), CancellationToken::new());
    assert!(stream.recv().await.is_some());

    // The stream holds the model until its consumer goes away.
    let blocked = tokio::time::timeout(
        Duration::from_millis(100),
        model.completion(completion("hello", 1), &CancellationToken::new()),
    )
    .await;
    assert!(blocked.is_err());

    drop(stream);
    let _ = handle.await.unwrap();

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        model.completion(completion("hello", 1), &CancellationToken::new()),
    )
    .await
    .expect("lock was not released")
    .unwrap();
    assert_eq!(result.usage.completion_tokens, 1);
}

#[tokio::test]
async fn test_different_models_run_in_parallel() {
    let (busy, _) = scripted_model(model_config("busy"), 1024, vec![FOO]);
    let (idle, _) = scripted_model(model_config("idle"), 64, vec![EOS]);

    let (mut stream, _handle) =
        busy.spawn_completion_stream(completion("hello", 500), CancellationToken::new());
    assert!(stream.recv().await.is_some());

    let result = tokio::time::timeout(
        Duration::from_secs(5),
        idle.completion(completion("hello", 3), &CancellationToken::new()),
    )
    .await
    .expect("independent model was blocked")
    .unwrap();
    assert_eq!(result.finish_reason, FinishReason::Stop);
}

#[tokio::test]
async fn test_concurrent_buffered_requests_all_complete() {
    let (model, log) = scripted_model(model_config("m"), 64, vec![WORLD, EOS]);

    let requests = (0..4).map(|_| {
        let model = model.clone();
        async move {
            model
                .completion(completion("hello", 5), &CancellationToken::new())
                .await
        }
    });
    let results = futures::future::join_all(requests).await;

    for result in results {
        let result = result.unwrap();
        assert_eq!(result.text, " world");
        assert_eq!(result.usage, Usage::new(2, 2));
    }
    // Each generation starts from a reset state.
    let pasts: Vec<usize> = log
        .lock()
        .unwrap()
        .evaluations
        .iter()
        .map(|(_, past)| *past)
        .collect();
    assert_eq!(pasts, vec![0, 2, 0, 2, 0, 2, 0, 2]);
}

#[tokio::test]
async fn test_embeddings() {
    let mut config = model_config("m");
    config.embedding = true;
    let (model, _) = scripted_model(config, 6, vec![EOS]);

    let inputs = vec!["hello world".to_string(), "foo".to_string()];
    let result = model.embeddings(&inputs, &CancellationToken::new()).await.unwrap();
    assert_eq!(result.data, vec![vec![3.0, 1.0], vec![2.0, 1.0]]);
    assert_eq!(result.usage, Usage::new(5, 0));

    let inputs = vec!["hello world".to_string(), "foo bar baz".to_string()];
    let err = model
        .embeddings(&inputs, &CancellationToken::new())
        .await
        .unwrap_err();
    assert_eq!(err.code(), "CONTEXT_OVERFLOW");
}

#[tokio::test]
async fn test_reset_then_generate() {
    let (model, log) = scripted_model(model_config("m"), 64, vec![EOS]);
    model.reset().await;

    model
        .completion(completion("hello", 3), &CancellationToken::new())
        .await
        .unwrap();
    assert_eq!(log.lock().unwrap().evaluations[0].1, 0);
}
