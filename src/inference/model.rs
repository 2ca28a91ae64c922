//! Model executors
//!
//! An executor runs the forward pass over the layers of one shard. Executors
//! are built by an [`ExecutorFactory`], which may download or materialize
//! weights and can therefore take an unbounded amount of time.

use std::sync::Arc;

use async_trait::async_trait;

use crate::inference::engine::EngineError;
use crate::shard::Shard;
use crate::tensor::{Device, Tensor};

/// Observer for weight download/materialization progress: `(completed, total)`
pub type DownloadProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// Runs the layers of a single shard.
pub trait ModelExecutor: Send + Sync {
    /// Evaluate the shard's layers over a `[batch, seq]` input.
    ///
    /// First-layer shards receive token ids; later shards receive the
    /// activations produced upstream. The output shape is executor-defined;
    /// a pipeline-final shard collapses it to the selected token id.
    fn forward(&self, input: &Tensor) -> Result<Tensor, EngineError>;
}

/// Builds executors bound to a shard.
#[async_trait]
pub trait ExecutorFactory: Send + Sync {
    /// Load only the layers in `shard`'s range onto `device`.
    ///
    /// Implementations may report progress through `progress`; doing so is
    /// optional.
    async fn load(
        &self,
        shard: &Shard,
        device: &Device,
        progress: Option<DownloadProgress>,
    ) -> Result<Box<dyn ModelExecutor>, EngineError>;
}
