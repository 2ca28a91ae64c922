//! Shard inference engine
//!
//! Executes forward passes over the shard a pipeline stage currently owns.
//!
//! # Architecture
//!
//! The engine keeps at most one loaded shard: the descriptor, its executor and
//! its tokenizer. A request naming a different shard replaces all three at
//! once; a request naming an equal shard reuses them. Prompt and tensor
//! requests are thin adapters over one forward path, which also applies
//! completion detection.
//!
//! Operations take `&mut self`: one engine serves one pipeline stage with one
//! request in flight. Callers that need to share an engine wrap it in a mutex.

use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, info};

use crate::inference::completion::is_finished;
use crate::inference::model::{DownloadProgress, ExecutorFactory, ModelExecutor};
use crate::inference::tokenizer::{ShardTokenizer, TokenizerFactory, TokenizerOptions};
use crate::shard::Shard;
use crate::storage::settings::{DevicePreference, EngineSettings};
use crate::storage::StorageError;
use crate::tensor::{Device, Tensor};

/// Errors that can occur during inference operations
#[derive(Debug, Error, Clone)]
pub enum EngineError {
    #[error("Invalid shard: {0}")]
    InvalidShard(String),

    #[error("Model not found: {0}")]
    ModelNotFound(String),

    #[error("Failed to load shard {shard}: {reason}")]
    ShardLoad { shard: String, reason: String },

    #[error("Model validation failed: {0}")]
    ModelValidation(String),

    #[error("Failed to initialize backend: {0}")]
    BackendInit(String),

    #[error("Tokenization failed: {0}")]
    Tokenization(String),

    #[error("Invalid tensor shape: {0}")]
    InvalidShape(String),

    #[error("Inference failed: {0}")]
    Inference(String),

    #[error("Worker thread error: {0}")]
    WorkerError(String),
}

impl EngineError {
    /// True for failures raised while (re)loading a shard
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            EngineError::InvalidShard(_)
                | EngineError::ModelNotFound(_)
                | EngineError::ShardLoad { .. }
                | EngineError::ModelValidation(_)
                | EngineError::BackendInit(_)
        )
    }
}

impl From<StorageError> for EngineError {
    fn from(e: StorageError) -> Self {
        EngineError::ModelValidation(e.to_string())
    }
}

/// Outcome of one forward pass through this stage
#[derive(Debug, Clone, PartialEq)]
pub struct InferenceResult {
    /// Raw executor output; activations for the next shard or the selected token
    pub output: Tensor,
    /// Opaque state for the next call. Always empty: no cache is carried yet.
    pub inference_state: String,
    /// True when the output is a lone end-of-sequence token
    pub is_finished: bool,
}

/// The capability an orchestrator drives on every pipeline stage.
#[async_trait]
pub trait InferenceEngine: Send {
    /// Tokenize `prompt` and run it through `shard`.
    ///
    /// `image_str` and `inference_state` are accepted for interface
    /// compatibility and currently ignored.
    async fn infer_prompt(
        &mut self,
        request_id: &str,
        shard: &Shard,
        prompt: &str,
        image_str: Option<&str>,
        inference_state: Option<&str>,
    ) -> Result<InferenceResult, EngineError>;

    /// Run an upstream tensor (rank 1 or 2) through `shard`.
    async fn infer_tensor(
        &mut self,
        request_id: &str,
        shard: &Shard,
        input: Tensor,
        inference_state: Option<&str>,
    ) -> Result<InferenceResult, EngineError>;

    /// Register an observer for weight download progress.
    fn set_on_download_progress(&mut self, callback: DownloadProgress);
}

/// Tokenizers are always loaded appending EOS and on the fast path.
const SHARD_TOKENIZER_OPTIONS: TokenizerOptions = TokenizerOptions {
    add_eos: true,
    use_fast: true,
};

struct LoadedShard {
    shard: Shard,
    executor: Box<dyn ModelExecutor>,
    tokenizer: Box<dyn ShardTokenizer>,
}

enum ShardState {
    Unloaded,
    Loaded(LoadedShard),
}

/// Inference engine for one pipeline stage
pub struct ShardInferenceEngine {
    executors: Arc<dyn ExecutorFactory>,
    tokenizers: Arc<dyn TokenizerFactory>,
    /// Chosen once at construction
    device: Device,
    state: ShardState,
    on_download_progress: Option<DownloadProgress>,
    reloads: u64,
}

impl ShardInferenceEngine {
    /// Creates an engine on the best available device
    pub fn new(executors: Arc<dyn ExecutorFactory>, tokenizers: Arc<dyn TokenizerFactory>) -> Self {
        Self::with_device(executors, tokenizers, Device::probe(DevicePreference::Auto))
    }

    /// Creates an engine honoring the configured device preference
    pub fn from_settings(
        settings: &EngineSettings,
        executors: Arc<dyn ExecutorFactory>,
        tokenizers: Arc<dyn TokenizerFactory>,
    ) -> Self {
        Self::with_device(executors, tokenizers, Device::probe(settings.device))
    }

    pub fn with_device(
        executors: Arc<dyn ExecutorFactory>,
        tokenizers: Arc<dyn TokenizerFactory>,
        device: Device,
    ) -> Self {
        info!(device = %device, "Shard inference engine created");
        Self {
            executors,
            tokenizers,
            device,
            state: ShardState::Unloaded,
            on_download_progress: None,
            reloads: 0,
        }
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    /// The shard currently loaded, if any
    pub fn current_shard(&self) -> Option<&Shard> {
        match &self.state {
            ShardState::Loaded(loaded) => Some(&loaded.shard),
            ShardState::Unloaded => None,
        }
    }

    /// Number of shard loads performed since construction
    pub fn reload_count(&self) -> u64 {
        self.reloads
    }

    /// Make `shard` the loaded shard, reloading only if it differs by value.
    ///
    /// The new executor and tokenizer are both built before the old ones are
    /// dropped, so a failed load leaves the previous shard in place.
    pub async fn ensure_shard(&mut self, shard: &Shard) -> Result<(), EngineError> {
        if self.current_shard() == Some(shard) {
            return Ok(());
        }

        shard.validate()?;
        info!(shard = %shard, device = %self.device, "Loading new shard");

        let executor = self
            .executors
            .load(shard, &self.device, self.on_download_progress.clone())
            .await?;
        let tokenizer = self
            .tokenizers
            .load(&shard.model_id, SHARD_TOKENIZER_OPTIONS)
            .await?;

        self.state = ShardState::Loaded(LoadedShard {
            shard: shard.clone(),
            executor,
            tokenizer,
        });
        self.reloads += 1;

        info!(shard = %shard, "Shard loaded successfully");
        Ok(())
    }

    fn loaded(&self) -> Result<&LoadedShard, EngineError> {
        match &self.state {
            ShardState::Loaded(loaded) => Ok(loaded),
            ShardState::Unloaded => Err(EngineError::Inference("no shard loaded".to_string())),
        }
    }

    fn tokenize(&self, prompt: &str) -> Result<Tensor, EngineError> {
        let ids = self.loaded()?.tokenizer.encode(prompt)?;
        Ok(Tensor::from_token_ids(&ids, &self.device))
    }

    /// The forward path shared by prompt and tensor requests
    fn run_forward(&self, input: &Tensor) -> Result<(Tensor, bool), EngineError> {
        let loaded = self.loaded()?;
        let output = loaded.executor.forward(input)?;
        let finished = is_finished(&output, loaded.tokenizer.eos_token_id());
        Ok((output, finished))
    }
}

#[async_trait]
impl InferenceEngine for ShardInferenceEngine {
    async fn infer_prompt(
        &mut self,
        request_id: &str,
        shard: &Shard,
        prompt: &str,
        image_str: Option<&str>,
        _inference_state: Option<&str>,
    ) -> Result<InferenceResult, EngineError> {
        if image_str.is_some() {
            debug!(request_id, "Image input is not supported, ignoring");
        }

        self.ensure_shard(shard).await?;

        let tokens = self.tokenize(prompt)?;
        debug!(request_id, shape = ?tokens.shape, "Prompt tokenized");

        let (output, is_finished) = self.run_forward(&tokens)?;
        debug!(request_id, shape = ?output.shape, is_finished, "Prompt forward pass done");

        Ok(InferenceResult {
            output,
            inference_state: String::new(),
            is_finished,
        })
    }

    async fn infer_tensor(
        &mut self,
        request_id: &str,
        shard: &Shard,
        input: Tensor,
        _inference_state: Option<&str>,
    ) -> Result<InferenceResult, EngineError> {
        let input = input.into_batched()?.into_device(&self.device);

        self.ensure_shard(shard).await?;

        let (output, is_finished) = self.run_forward(&input)?;
        debug!(request_id, shape = ?output.shape, is_finished, "Tensor forward pass done");

        Ok(InferenceResult {
            output: output.into_host(),
            inference_state: String::new(),
            is_finished,
        })
    }

    fn set_on_download_progress(&mut self, callback: DownloadProgress) {
        self.on_download_progress = Some(callback);
    }
}
