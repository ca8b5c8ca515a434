//! Scripted backend for integration tests
//!
//! Tokenization is word-based over a tiny fixed vocabulary. Logits always
//! favour the next token of a script, so greedy sampling replays the script
//! exactly. The script position restarts whenever a prompt is tokenized.

#![allow(dead_code)]

use async_trait::async_trait;
use kindle_core::prelude::*;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

pub const BOS: Token = 0;
pub const EOS: Token = 1;
pub const NEWLINE: Token = 2;
pub const UNK: Token = 3;
pub const HELLO: Token = 4;
pub const WORLD: Token = 5;
pub const USER_TAG: Token = 6;
pub const FOO: Token = 7;
pub const BAR: Token = 8;
pub const USER_ROLE: Token = 9;

const VOCAB: &[&str] = &[
    "<s>", "</s>", "\n", "<unk>", "hello", "world", "User:", "foo", "bar", "user:", "baz", "qux",
];

/// Everything a test may want to inspect after the fact
#[derive(Debug, Default)]
pub struct BackendLog {
    /// `(tokens, past)` of every evaluate call
    pub evaluations: Vec<(Vec<Token>, usize)>,
    pub saves: Vec<(std::path::PathBuf, Vec<Token>)>,
    pub loads: usize,
}

pub type SharedLog = Arc<Mutex<BackendLog>>;

pub struct ScriptedBackend {
    context_size: usize,
    script: Vec<Token>,
    step: AtomicUsize,
    fail_evaluate: bool,
    log: SharedLog,
}

impl ScriptedBackend {
    pub fn new(context_size: usize, script: Vec<Token>) -> (Self, SharedLog) {
        let log = SharedLog::default();
        let backend = Self {
            context_size,
            script,
            step: AtomicUsize::new(0),
            fail_evaluate: false,
            log: Arc::clone(&log),
        };
        (backend, log)
    }

    pub fn failing(context_size: usize) -> (Self, SharedLog) {
        let (mut backend, log) = Self::new(context_size, vec![HELLO]);
        backend.fail_evaluate = true;
        (backend, log)
    }

    fn scripted(&self, step: usize) -> Token {
        match self.script.get(step) {
            Some(&token) => token,
            None => self.script.last().copied().unwrap_or(EOS),
        }
    }
}

impl InferenceBackend for ScriptedBackend {
    fn tokenize(&self, text: &str, add_boundary: bool) -> anyhow::Result<Vec<Token>> {
        self.step.store(0, Ordering::SeqCst);

        let mut tokens = Vec::new();
        if add_boundary {
            tokens.push(BOS);
        }
        for word in text.split_whitespace() {
            if word == "<fail>" {
                anyhow::bail!("untokenizable input");
            }
            let id = VOCAB.iter().position(|v| *v == word).unwrap_or(UNK as usize);
            tokens.push(id as Token);
        }
        Ok(tokens)
    }

    fn detokenize(&self, token: Token) -> String {
        match token {
            BOS | EOS => String::new(),
            NEWLINE => "\n".to_string(),
            other => format!(" {}", VOCAB.get(other as usize).copied().unwrap_or("?")),
        }
    }

    fn evaluate(&mut self, tokens: &[Token], past: usize, _threads: usize) -> anyhow::Result<()> {
        self.log
            .lock()
            .unwrap()
            .evaluations
            .push((tokens.to_vec(), past));
        if self.fail_evaluate {
            anyhow::bail!("device lost");
        }
        if past + tokens.len() > self.context_size {
            anyhow::bail!("evaluation beyond the context window");
        }
        Ok(())
    }

    fn logits(&self, rows: usize) -> Vec<f32> {
        let step = self.step.fetch_add(1, Ordering::SeqCst);
        let target = self.scripted(step) as usize;
        let mut logits = vec![0.0; rows * VOCAB.len()];
        let last_row = (rows.max(1) - 1) * VOCAB.len();
        logits[last_row + target] = 10.0;
        logits
    }

    fn vocab_size(&self) -> usize {
        VOCAB.len()
    }

    fn context_size(&self) -> usize {
        self.context_size
    }

    fn eos_token(&self) -> Token {
        EOS
    }

    fn newline_token(&self) -> Token {
        NEWLINE
    }

    fn save_state(&mut self, path: &Path, tokens: &[Token]) -> anyhow::Result<()> {
        std::fs::write(path, serde_json::to_vec(tokens)?)?;
        self.log
            .lock()
            .unwrap()
            .saves
            .push((path.to_path_buf(), tokens.to_vec()));
        Ok(())
    }

    fn load_state(&mut self, path: &Path, max_tokens: usize) -> anyhow::Result<Vec<Token>> {
        self.log.lock().unwrap().loads += 1;
        if !path.exists() {
            return Ok(Vec::new());
        }
        let mut tokens: Vec<Token> = serde_json::from_slice(&std::fs::read(path)?)?;
        tokens.truncate(max_tokens);
        Ok(tokens)
    }

    fn embeddings(&self) -> anyhow::Result<Vec<f32>> {
        let log = self.log.lock().unwrap();
        let last = log
            .evaluations
            .last()
            .map(|(tokens, _)| tokens.len() as f32)
            .unwrap_or_default();
        Ok(vec![last, 1.0])
    }
}

/// Loader handing out scripted backends and counting loads
pub struct ScriptedLoader {
    pub script: Vec<Token>,
    pub loads: AtomicUsize,
}

impl ScriptedLoader {
    pub fn new(script: Vec<Token>) -> Self {
        Self {
            script,
            loads: AtomicUsize::new(0),
        }
    }
}

#[async_trait]
impl BackendLoader for ScriptedLoader {
    async fn load(&self, config: &ModelConfig) -> anyhow::Result<Box<dyn InferenceBackend>> {
        if config.path.as_os_str() == "missing.bin" {
            anyhow::bail!("no such model file");
        }
        self.loads.fetch_add(1, Ordering::SeqCst);
        let (backend, _) = ScriptedBackend::new(config.context.unwrap_or(64), self.script.clone());
        Ok(Box::new(backend))
    }
}

pub fn model_config(name: &str) -> ModelConfig {
    ModelConfig {
        name: name.to_string(),
        threads: Some(1),
        ..Default::default()
    }
}

/// Build a model over a scripted backend
pub fn scripted_model(
    config: ModelConfig,
    context_size: usize,
    script: Vec<Token>,
) -> (Arc<LanguageModel>, SharedLog) {
    let (backend, log) = ScriptedBackend::new(context_size, script);
    let model = LanguageModel::new(config, Box::new(backend)).unwrap();
    (Arc::new(model), log)
}

/// Parameters that make sampling replay the script
pub fn greedy() -> SampleParams {
    SampleParams::greedy()
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}
