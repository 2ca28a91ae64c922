//! Tokenizer adapters
//!
//! Convert prompt text into token ids for the first shard of a pipeline.

use async_trait::async_trait;

use crate::inference::engine::EngineError;

/// How a tokenizer should be configured when loaded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TokenizerOptions {
    /// Append the end-of-sequence token to every encoding
    pub add_eos: bool,
    /// Prefer the fast tokenization path when the backend has one
    pub use_fast: bool,
}

/// Text to token id conversion for one model.
pub trait ShardTokenizer: Send + Sync {
    /// Encode text to token ids.
    ///
    /// # Errors
    /// Returns [`EngineError::Tokenization`] if encoding fails.
    fn encode(&self, text: &str) -> Result<Vec<u32>, EngineError>;

    /// Get the end-of-sequence token ID.
    fn eos_token_id(&self) -> u32;
}

/// Builds tokenizers for a model identifier.
#[async_trait]
pub trait TokenizerFactory: Send + Sync {
    async fn load(
        &self,
        model_id: &str,
        options: TokenizerOptions,
    ) -> Result<Box<dyn ShardTokenizer>, EngineError>;
}
