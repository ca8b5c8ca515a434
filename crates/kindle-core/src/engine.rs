//! Model registry
//!
//! The engine owns the configuration of every known model and instantiates
//! each one lazily, on first use, through the [`BackendLoader`].

use crate::{
    backend::BackendLoader,
    config::EngineConfig,
    model::LanguageModel,
    CoreError, Result,
};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::info;

/// Registry of lazily loaded models
pub struct InferenceEngine {
    config: EngineConfig,
    loader: Arc<dyn BackendLoader>,
    models: Mutex<HashMap<String, Arc<LanguageModel>>>,
    /// Serializes backend loading so a model is never loaded twice
    load_lock: tokio::sync::Mutex<()>,
}

impl InferenceEngine {
    pub fn new(config: EngineConfig, loader: Arc<dyn BackendLoader>) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            loader,
            models: Mutex::new(HashMap::new()),
            load_lock: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Configured model names, sorted
    pub fn model_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.config.models.keys().cloned().collect();
        names.sort();
        names
    }

    /// The model called `name`, loading it on first use
    pub async fn model(&self, name: &str) -> Result<Arc<LanguageModel>> {
        let cached = self.models.lock().get(name).cloned();
        if let Some(model) = cached {
            return Ok(model);
        }

        let config = self
            .config
            .model(name)
            .ok_or_else(|| CoreError::ModelNotFound {
                code: "MODEL_NOT_FOUND",
                name: name.to_string(),
            })?
            .clone();

        let _loading = self.load_lock.lock().await;
        let cached = self.models.lock().get(name).cloned();
        if let Some(model) = cached {
            return Ok(model);
        }

        info!("Loading model '{}' from {:?}", name, config.path);
        let backend = self.loader.load(&config).await.map_err(|e| {
            CoreError::backend(
                "MODEL_LOAD_FAILED",
                format!("Loading model '{}'", name),
                "Check the model path and backend options",
                e,
            )
        })?;

        let model = Arc::new(LanguageModel::new(config, backend)?);
        self.models
            .lock()
            .insert(name.to_string(), Arc::clone(&model));
        Ok(model)
    }

    /// Names of the models currently loaded, sorted
    pub fn loaded_models(&self) -> Vec<String> {
        let mut names: Vec<String> = self.models.lock().keys().cloned().collect();
        names.sort();
        names
    }

    /// Drop the loaded instance of `name`
    ///
    /// In-flight generations keep their handle and finish normally.
    pub fn unload(&self, name: &str) -> bool {
        let removed = self.models.lock().remove(name).is_some();
        if removed {
            info!("Unloaded model '{}'", name);
        }
        removed
    }

    /// Information about a loaded model
    pub fn model_info(&self, name: &str) -> Option<ModelInfo> {
        self.models.lock().get(name).map(|m| ModelInfo {
            name: m.name().to_string(),
            context_size: m.context_size(),
            vocab_size: m.vocab_size(),
            batch_size: m.config().batch,
            sessions_enabled: m.sessions_enabled(),
        })
    }
}

/// Information about a loaded model
#[derive(Debug, Clone, Serialize)]
pub struct ModelInfo {
    pub name: String,
    pub context_size: usize,
    pub vocab_size: usize,
    pub batch_size: usize,
    pub sessions_enabled: bool,
}
