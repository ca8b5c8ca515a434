//! Configuration for the generation engine

use crate::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Main configuration for the inference engine
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Directory holding one `*.toml` file per model
    pub models_dir: PathBuf,

    /// Model configurations keyed by model name
    #[serde(default)]
    pub models: HashMap<String, ModelConfig>,
}

/// Per-model configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Name requests use to address this model
    pub name: String,

    /// Model weights location, interpreted by the backend loader
    #[serde(default)]
    pub path: PathBuf,

    /// Context window size; backend default when absent
    #[serde(default)]
    pub context: Option<usize>,

    /// Sampling seed; entropy when absent
    #[serde(default)]
    pub seed: Option<u64>,

    /// Threads handed to every evaluate call
    #[serde(default)]
    pub threads: Option<usize>,

    /// Prompt tokens evaluated per backend call
    #[serde(default = "default_batch")]
    pub batch: usize,

    /// Capacity of the recent-token ring feeding the penalties
    #[serde(default = "default_last_n_token_size")]
    pub last_n_token_size: usize,

    #[serde(default)]
    pub f16_kv: Option<bool>,

    #[serde(default)]
    pub use_mmap: Option<bool>,

    #[serde(default)]
    pub use_mlock: Option<bool>,

    #[serde(default)]
    pub gpu_layers: usize,

    #[serde(default)]
    pub lora_base: Option<PathBuf>,

    #[serde(default)]
    pub lora_path: Option<PathBuf>,

    /// Whether the backend should expose embeddings
    #[serde(default)]
    pub embedding: bool,

    #[serde(default)]
    pub logits_all: bool,

    /// Log timings after every generation
    #[serde(default)]
    pub verbose: bool,

    /// Stop strings appended to every request for this model
    #[serde(default)]
    pub stops: Vec<String>,

    /// Chat role remapping (request role -> prompt role)
    #[serde(default)]
    pub roles: HashMap<String, String>,

    /// Prompt templates keyed by mode (`completion`, `chat`)
    #[serde(default)]
    pub prompt_templates: HashMap<String, String>,

    /// Session continuity settings
    #[serde(default)]
    pub session: SessionConfig,
}

fn default_batch() -> usize {
    8
}

fn default_last_n_token_size() -> usize {
    64
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            path: PathBuf::new(),
            context: None,
            seed: None,
            threads: None,
            batch: default_batch(),
            last_n_token_size: default_last_n_token_size(),
            f16_kv: None,
            use_mmap: None,
            use_mlock: None,
            gpu_layers: 0,
            lora_base: None,
            lora_path: None,
            embedding: false,
            logits_all: false,
            verbose: false,
            stops: Vec::new(),
            roles: HashMap::new(),
            prompt_templates: HashMap::new(),
            session: SessionConfig::default(),
        }
    }
}

/// Session continuity configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Reuse cached prefixes across chat requests
    #[serde(default)]
    pub enable: bool,

    /// Directory where session blobs are stored
    #[serde(default)]
    pub path: PathBuf,

    /// Re-save a session only when the match ratio falls below this value
    #[serde(default = "default_threshold")]
    pub threshold: f32,
}

fn default_threshold() -> f32 {
    0.75
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            enable: false,
            path: PathBuf::from("sessions"),
            threshold: default_threshold(),
        }
    }
}

impl ModelConfig {
    /// Threads for evaluate calls, falling back to the CPU count
    pub fn thread_count(&self) -> usize {
        self.threads.unwrap_or_else(num_cpus::get)
    }

    /// Load a single model configuration file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| CoreError::Io {
            code: "CONFIG_READ_FAILED",
            message: e.to_string(),
            path: Some(path.to_path_buf()),
            suggestion: "Check the configuration file exists and is readable".to_string(),
            source: e,
        })?;
        let mut config: Self = toml::from_str(&content).map_err(|e| CoreError::Configuration {
            code: "CONFIG_PARSE_FAILED",
            message: e.to_string(),
            context: "Parsing model configuration".to_string(),
            suggestion: "Fix the TOML syntax or field types".to_string(),
            config_path: Some(path.to_path_buf()),
            field_name: None,
        })?;
        config.name = config.name.trim().to_string();
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        if self.name.is_empty() {
            return Err(self.invalid("name", "model name must not be empty"));
        }

        if self.batch == 0 {
            return Err(self.invalid("batch", "batch must be greater than 0"));
        }

        if self.last_n_token_size == 0 {
            return Err(self.invalid(
                "last_n_token_size",
                "last_n_token_size must be greater than 0",
            ));
        }

        if let Some(0) = self.context {
            return Err(self.invalid("context", "context must be greater than 0"));
        }

        if !(0.0..=1.0).contains(&self.session.threshold) {
            return Err(self.invalid(
                "session.threshold",
                "session threshold must be between 0 and 1",
            ));
        }

        if self.session.enable && self.session.path.as_os_str().is_empty() {
            return Err(self.invalid(
                "session.path",
                "session path is required when sessions are enabled",
            ));
        }

        Ok(())
    }

    fn invalid(&self, field: &str, message: &str) -> CoreError {
        CoreError::Configuration {
            code: "CONFIG_INVALID",
            message: message.to_string(),
            context: format!("Validating model '{}'", self.name),
            suggestion: format!("Fix the '{}' field", field),
            config_path: None,
            field_name: Some(field.to_string()),
        }
    }
}

impl EngineConfig {
    /// Build a configuration from every model file in `models_dir`
    pub fn load_model_configs<P: AsRef<Path>>(models_dir: P) -> Result<Self> {
        let models_dir = models_dir.as_ref();
        let entries = std::fs::read_dir(models_dir).map_err(|e| CoreError::Io {
            code: "MODELS_DIR_UNREADABLE",
            message: e.to_string(),
            path: Some(models_dir.to_path_buf()),
            suggestion: "Check the models directory exists".to_string(),
            source: e,
        })?;

        let mut models = HashMap::new();
        for entry in entries {
            let path = entry?.path();
            if path.is_dir() || path.extension().map_or(true, |ext| ext != "toml") {
                continue;
            }

            let config = ModelConfig::from_file(&path)?;
            info!("Loaded model config '{}' from {:?}", config.name, path);
            if models.contains_key(&config.name) {
                warn!("Duplicate model name '{}', {:?} overrides earlier entry", config.name, path);
            }
            models.insert(config.name.clone(), config);
        }

        Ok(Self {
            models_dir: models_dir.to_path_buf(),
            models,
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&content).map_err(|e| CoreError::Configuration {
            code: "CONFIG_PARSE_FAILED",
            message: e.to_string(),
            context: "Parsing engine configuration".to_string(),
            suggestion: "Fix the TOML syntax or field types".to_string(),
            config_path: Some(path.to_path_buf()),
            field_name: None,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a file
    pub fn to_file(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| {
            CoreError::configuration(
                "CONFIG_SERIALIZE_FAILED",
                e.to_string(),
                "Serializing engine configuration",
                "Report this as a bug",
            )
        })?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<()> {
        for (name, model) in &self.models {
            model.validate()?;
            if name != &model.name {
                return Err(CoreError::configuration(
                    "CONFIG_NAME_MISMATCH",
                    format!("Model key '{}' does not match model name '{}'", name, model.name),
                    "Validating engine configuration",
                    "Use the model name as its table key",
                ));
            }
        }
        Ok(())
    }

    /// Look up the configuration for `name`
    pub fn model(&self, name: &str) -> Option<&ModelConfig> {
        self.models.get(name)
    }
}
