//! Shard inference
//!
//! The engine a pipeline stage runs, and the seams it loads models and
//! tokenizers through.

pub mod completion;
pub mod engine;
#[cfg(feature = "llama")]
pub mod llama;
pub mod model;
pub mod tokenizer;

// Re-export main types for convenience
pub use completion::is_finished;
pub use engine::{EngineError, InferenceEngine, InferenceResult, ShardInferenceEngine};
pub use model::{DownloadProgress, ExecutorFactory, ModelExecutor};
pub use tokenizer::{ShardTokenizer, TokenizerFactory, TokenizerOptions};
