//! Shardline Library
//!
//! One stage of a pipelined, layer-sharded LLM inference system: loads the
//! shard it is asked for, runs forward passes over it, and reports when the
//! pipeline has produced its end-of-sequence token.

pub mod inference;
pub mod shard;
pub mod storage;
pub mod system;
pub mod tensor;

pub use inference::{EngineError, InferenceEngine, InferenceResult, ShardInferenceEngine};
pub use shard::Shard;
pub use tensor::{Device, Tensor};
