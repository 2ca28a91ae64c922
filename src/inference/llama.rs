//! llama.cpp backend
//!
//! Executor and tokenizer factories backed by llama-cpp-2.
//!
//! # Architecture
//!
//! Since llama-cpp-2 types (`LlamaBackend`, `LlamaModel`, `LlamaContext`) contain
//! raw pointers that are not `Send`, every llama.cpp call runs on one dedicated
//! worker thread that owns the backend and all loaded models. Executors and
//! tokenizers hold a handle to a model on that thread and talk to it over
//! channels. A shard's executor and tokenizer share one resident copy of the
//! model; it is unloaded when the last of them drops.
//!
//! llama.cpp evaluates whole models, so the executor accepts full-model shards
//! only. Its forward pass decodes the input token ids in a fresh context and
//! greedily selects the next token, producing a one-element output.

use std::collections::HashMap;
use std::num::NonZeroU32;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::thread::{self, JoinHandle};

use async_trait::async_trait;
use llama_cpp_2::context::params::LlamaContextParams;
use llama_cpp_2::llama_backend::LlamaBackend;
use llama_cpp_2::llama_batch::LlamaBatch;
use llama_cpp_2::model::params::LlamaModelParams;
use llama_cpp_2::model::{AddBos, LlamaModel};
use llama_cpp_2::sampling::LlamaSampler;
use llama_cpp_2::token::LlamaToken;
use tokio::sync::oneshot;

use crate::inference::engine::EngineError;
use crate::inference::model::{DownloadProgress, ExecutorFactory, ModelExecutor};
use crate::inference::tokenizer::{ShardTokenizer, TokenizerFactory, TokenizerOptions};
use crate::shard::Shard;
use crate::storage::models::resolve_model;
use crate::storage::settings::EngineSettings;
use crate::tensor::{Device, Tensor};

type ModelId = u64;

/// A model resident on the worker thread
#[derive(Debug, Clone, Copy)]
struct ModelHandle {
    id: ModelId,
    eos_token_id: u32,
    n_layers: u32,
}

/// Commands sent to the worker thread
enum WorkerCommand {
    LoadModel {
        path: PathBuf,
        gpu_layers: u32,
        response_tx: oneshot::Sender<Result<ModelHandle, EngineError>>,
    },
    UnloadModel {
        id: ModelId,
    },
    Tokenize {
        id: ModelId,
        text: String,
        add_eos: bool,
        response_tx: Sender<Result<Vec<u32>, EngineError>>,
    },
    Forward {
        id: ModelId,
        tokens: Vec<u32>,
        context_size: u32,
        response_tx: Sender<Result<u32, EngineError>>,
    },
    Shutdown,
}

/// Owner of the worker thread; shuts it down when the last handle drops
struct Worker {
    command_tx: Sender<WorkerCommand>,
    worker_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Worker {
    fn send(&self, command: WorkerCommand) -> Result<(), EngineError> {
        self.command_tx
            .send(command)
            .map_err(|e| EngineError::WorkerError(e.to_string()))
    }
}

impl Drop for Worker {
    fn drop(&mut self) {
        let _ = self.command_tx.send(WorkerCommand::Shutdown);
        let handle = match self.worker_handle.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

/// Models on the worker thread, keyed by file, alive while anyone holds them
struct ResidentCache<T> {
    entries: Mutex<HashMap<PathBuf, Weak<T>>>,
}

impl<T> ResidentCache<T> {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<PathBuf, Weak<T>>> {
        match self.entries.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// A live entry for `path` that satisfies `accept`
    fn get(&self, path: &Path, accept: impl Fn(&T) -> bool) -> Option<Arc<T>> {
        self.entries()
            .get(path)
            .and_then(Weak::upgrade)
            .filter(|value| accept(value))
    }

    fn insert(&self, path: PathBuf, value: &Arc<T>) {
        let mut entries = self.entries();
        entries.retain(|_, weak| weak.strong_count() > 0);
        entries.insert(path, Arc::downgrade(value));
    }
}

/// llama.cpp runtime serving as both executor and tokenizer factory
pub struct LlamaRuntime {
    worker: Arc<Worker>,
    settings: EngineSettings,
    residents: ResidentCache<ResidentModel>,
}

impl LlamaRuntime {
    /// Initializes the llama.cpp backend on a dedicated worker thread
    pub fn start(settings: EngineSettings) -> Result<Self, EngineError> {
        let (command_tx, command_rx) = mpsc::channel::<WorkerCommand>();
        let (init_tx, init_rx) = mpsc::channel();

        let handle = thread::Builder::new()
            .name("llama-worker".to_string())
            .spawn(move || match LlamaBackend::init() {
                Ok(backend) => {
                    let _ = init_tx.send(Ok(()));
                    worker_thread_main(backend, command_rx);
                }
                Err(e) => {
                    let _ = init_tx.send(Err(EngineError::BackendInit(e.to_string())));
                }
            })
            .map_err(|e| EngineError::WorkerError(e.to_string()))?;

        init_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;

        tracing::info!("llama.cpp worker thread started");
        Ok(Self {
            worker: Arc::new(Worker {
                command_tx,
                worker_handle: Mutex::new(Some(handle)),
            }),
            settings,
            residents: ResidentCache::new(),
        })
    }

    fn resolve_path(&self, model_id: &str) -> Result<PathBuf, EngineError> {
        let (model, metadata) = resolve_model(&self.settings.models_directory, model_id)?
            .ok_or_else(|| EngineError::ModelNotFound(model_id.to_string()))?;
        tracing::debug!(
            "Resolved {} to {} (GGUF v{}, {} tensors)",
            model_id,
            model.path.display(),
            metadata.version,
            metadata.tensor_count
        );
        Ok(model.path)
    }

    /// The resident model for `path`, loading it if nothing holds one.
    ///
    /// `gpu_layers: None` accepts a copy with any offload.
    async fn resident(
        &self,
        path: &Path,
        gpu_layers: Option<u32>,
    ) -> Result<Arc<ResidentModel>, EngineError> {
        let wanted = |model: &ResidentModel| gpu_layers.map_or(true, |g| g == model.gpu_layers);
        if let Some(model) = self.residents.get(path, wanted) {
            tracing::debug!("Reusing resident model {}", model.handle.id);
            return Ok(model);
        }

        let gpu_layers = gpu_layers.unwrap_or(0);
        let handle = self.load_model(path, gpu_layers).await?;
        let model = Arc::new(ResidentModel {
            worker: self.worker.clone(),
            handle,
            gpu_layers,
        });
        self.residents.insert(path.to_path_buf(), &model);
        Ok(model)
    }

    async fn load_model(&self, path: &Path, gpu_layers: u32) -> Result<ModelHandle, EngineError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.worker.send(WorkerCommand::LoadModel {
            path: path.to_path_buf(),
            gpu_layers,
            response_tx,
        })?;
        response_rx
            .await
            .map_err(|e| EngineError::WorkerError(e.to_string()))?
    }
}

/// Unloads its model from the worker thread on drop
struct ResidentModel {
    worker: Arc<Worker>,
    handle: ModelHandle,
    gpu_layers: u32,
}

impl Drop for ResidentModel {
    fn drop(&mut self) {
        let _ = self
            .worker
            .send(WorkerCommand::UnloadModel { id: self.handle.id });
    }
}

struct LlamaExecutor {
    model: Arc<ResidentModel>,
    device: Device,
    context_size: u32,
}

impl ModelExecutor for LlamaExecutor {
    fn forward(&self, input: &Tensor) -> Result<Tensor, EngineError> {
        if input.rank() != 2 || input.shape[0] != 1 {
            return Err(EngineError::InvalidShape(format!(
                "llama.cpp executor expects a [1, n] token batch, got {:?}",
                input.shape
            )));
        }
        let tokens = input.to_token_ids()?;

        let (response_tx, response_rx) = mpsc::channel();
        self.model.worker.send(WorkerCommand::Forward {
            id: self.model.handle.id,
            tokens,
            context_size: self.context_size,
            response_tx,
        })?;
        let next = response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))??;

        Ok(Tensor::from_vec(vec![next as f32]).into_device(&self.device))
    }
}

struct LlamaTokenizer {
    model: Arc<ResidentModel>,
    add_eos: bool,
}

impl ShardTokenizer for LlamaTokenizer {
    fn encode(&self, text: &str) -> Result<Vec<u32>, EngineError> {
        let (response_tx, response_rx) = mpsc::channel();
        self.model.worker.send(WorkerCommand::Tokenize {
            id: self.model.handle.id,
            text: text.to_string(),
            add_eos: self.add_eos,
            response_tx,
        })?;
        response_rx
            .recv()
            .map_err(|e| EngineError::WorkerError(e.to_string()))?
    }

    fn eos_token_id(&self) -> u32 {
        self.model.handle.eos_token_id
    }
}

#[async_trait]
impl ExecutorFactory for LlamaRuntime {
    async fn load(
        &self,
        shard: &Shard,
        device: &Device,
        progress: Option<DownloadProgress>,
    ) -> Result<Box<dyn ModelExecutor>, EngineError> {
        if !shard.is_full_model() {
            return Err(EngineError::ShardLoad {
                shard: shard.to_string(),
                reason: "llama.cpp can only execute full-model shards".to_string(),
            });
        }

        let path = self.resolve_path(&shard.model_id)?;
        let gpu_layers = if device.is_accelerator() {
            self.settings.gpu_layers
        } else {
            0
        };

        let model = self.resident(&path, Some(gpu_layers)).await?;
        shard.check_model_layers(model.handle.n_layers)?;
        if let Some(progress) = progress {
            let layers = u64::from(model.handle.n_layers);
            progress(layers, layers);
        }

        Ok(Box::new(LlamaExecutor {
            model,
            device: device.clone(),
            context_size: self.settings.context_size,
        }))
    }
}

#[async_trait]
impl TokenizerFactory for LlamaRuntime {
    async fn load(
        &self,
        model_id: &str,
        options: TokenizerOptions,
    ) -> Result<Box<dyn ShardTokenizer>, EngineError> {
        let path = self.resolve_path(model_id)?;
        // Shares the executor's copy when the shard's executor is already loaded
        let model = self.resident(&path, None).await?;

        Ok(Box::new(LlamaTokenizer {
            model,
            add_eos: options.add_eos,
        }))
    }
}

/// Worker thread main loop
///
/// Owns the LlamaBackend and every loaded LlamaModel.
fn worker_thread_main(backend: LlamaBackend, command_rx: Receiver<WorkerCommand>) {
    let mut models: HashMap<ModelId, LlamaModel> = HashMap::new();
    let mut next_id: ModelId = 0;

    loop {
        match command_rx.recv() {
            Ok(WorkerCommand::LoadModel {
                path,
                gpu_layers,
                response_tx,
            }) => {
                let model_params = LlamaModelParams::default().with_n_gpu_layers(gpu_layers);
                let result = match LlamaModel::load_from_file(&backend, &path, &model_params) {
                    Ok(model) => {
                        let handle = ModelHandle {
                            id: next_id,
                            eos_token_id: model.token_eos().0 as u32,
                            n_layers: model.n_layer(),
                        };
                        tracing::info!(
                            "Model loaded: {} ({} params, {} layers, {} vocab)",
                            path.display(),
                            model.n_params(),
                            handle.n_layers,
                            model.n_vocab()
                        );
                        models.insert(next_id, model);
                        next_id += 1;
                        Ok(handle)
                    }
                    Err(e) => Err(EngineError::ShardLoad {
                        shard: path.display().to_string(),
                        reason: e.to_string(),
                    }),
                };
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::UnloadModel { id }) => {
                if models.remove(&id).is_some() {
                    tracing::debug!("Model {} unloaded in worker thread", id);
                }
            }
            Ok(WorkerCommand::Tokenize {
                id,
                text,
                add_eos,
                response_tx,
            }) => {
                let result = match models.get(&id) {
                    Some(model) => tokenize(model, &text, add_eos),
                    None => Err(EngineError::WorkerError(format!("model {} not loaded", id))),
                };
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Forward {
                id,
                tokens,
                context_size,
                response_tx,
            }) => {
                let result = match models.get(&id) {
                    Some(model) => run_forward(&backend, model, &tokens, context_size),
                    None => Err(EngineError::WorkerError(format!("model {} not loaded", id))),
                };
                let _ = response_tx.send(result);
            }
            Ok(WorkerCommand::Shutdown) => {
                tracing::info!("Worker thread shutting down");
                break;
            }
            Err(_) => {
                tracing::debug!("Command channel closed, worker exiting");
                break;
            }
        }
    }
}

fn tokenize(model: &LlamaModel, text: &str, add_eos: bool) -> Result<Vec<u32>, EngineError> {
    let mut tokens = model
        .str_to_token(text, AddBos::Always)
        .map_err(|e| EngineError::Tokenization(e.to_string()))?;
    if add_eos {
        tokens.push(model.token_eos());
    }
    Ok(tokens.into_iter().map(|t| t.0 as u32).collect())
}

/// Decode `tokens` in a fresh context and greedily pick the next token
fn run_forward(
    backend: &LlamaBackend,
    model: &LlamaModel,
    tokens: &[u32],
    context_size: u32,
) -> Result<u32, EngineError> {
    if tokens.is_empty() {
        return Err(EngineError::InvalidShape("empty token batch".to_string()));
    }

    let n_tokens = tokens.len() as u32;
    let n_ctx = context_size.max(n_tokens + 1);
    let ctx_params = LlamaContextParams::default()
        .with_n_ctx(NonZeroU32::new(n_ctx))
        .with_n_batch(n_ctx);

    let mut ctx = model
        .new_context(backend, ctx_params)
        .map_err(|e| EngineError::Inference(format!("Failed to create context: {}", e)))?;

    let mut batch = LlamaBatch::new(tokens.len(), 1);
    let last = tokens.len() - 1;
    for (i, &token) in tokens.iter().enumerate() {
        batch
            .add(LlamaToken(token as i32), i as i32, &[0], i == last)
            .map_err(|e| EngineError::Inference(format!("Failed to add token to batch: {}", e)))?;
    }

    ctx.decode(&mut batch)
        .map_err(|e| EngineError::Inference(format!("Failed to decode: {}", e)))?;

    let mut sampler = LlamaSampler::greedy();
    let next = sampler.sample(&ctx, batch.n_tokens() - 1);
    Ok(next.0 as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resident_cache_shares_live_entries() {
        let cache = ResidentCache::new();
        let path = PathBuf::from("/models/m.gguf");
        let model = Arc::new(99u32);
        cache.insert(path.clone(), &model);

        let shared = cache.get(&path, |_| true).unwrap();
        assert!(Arc::ptr_eq(&model, &shared));
        assert!(cache.get(&path, |layers| *layers == 0).is_none());
    }

    #[test]
    fn test_resident_cache_forgets_dropped_entries() {
        let cache = ResidentCache::new();
        let path = PathBuf::from("/models/m.gguf");
        let model = Arc::new(0u32);
        cache.insert(path.clone(), &model);
        drop(model);

        assert!(cache.get(&path, |_| true).is_none());

        let other = Arc::new(1u32);
        cache.insert(PathBuf::from("/models/n.gguf"), &other);
        assert_eq!(cache.entries().len(), 1);
    }
}
