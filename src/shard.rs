//! Shard descriptors
//!
//! A shard names a model and the contiguous, half-open layer range
//! `[start_layer, end_layer)` that one pipeline stage executes.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::inference::EngineError;

/// A contiguous slice of a model's layers assigned to one pipeline stage.
///
/// Two shards are interchangeable iff every field is equal; the engine relies
/// on this to skip reloads between calls of the same generation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Shard {
    /// Model identifier (e.g. "llama-3.2-1b")
    pub model_id: String,
    /// First layer owned by this shard (inclusive)
    pub start_layer: u32,
    /// Layer after the last one owned by this shard (exclusive)
    pub end_layer: u32,
    /// Total number of layers in the model
    pub n_layers: u32,
}

impl Shard {
    /// Create a validated shard
    pub fn new(
        model_id: impl Into<String>,
        start_layer: u32,
        end_layer: u32,
        n_layers: u32,
    ) -> Result<Self, EngineError> {
        let shard = Self {
            model_id: model_id.into(),
            start_layer,
            end_layer,
            n_layers,
        };
        shard.validate()?;
        Ok(shard)
    }

    /// A shard covering every layer of the model
    pub fn full(model_id: impl Into<String>, n_layers: u32) -> Result<Self, EngineError> {
        Self::new(model_id, 0, n_layers, n_layers)
    }

    /// Check the layer range against the model's layer count.
    ///
    /// Descriptors can arrive deserialized from the network, so the engine
    /// re-validates before loading anything.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.model_id.trim().is_empty() {
            return Err(EngineError::InvalidShard(
                "model id must not be empty".to_string(),
            ));
        }
        if self.start_layer >= self.end_layer || self.end_layer > self.n_layers {
            return Err(EngineError::InvalidShard(format!(
                "layer range {}..{} is not within a {}-layer model",
                self.start_layer, self.end_layer, self.n_layers
            )));
        }
        Ok(())
    }

    /// Check this shard against the layer count of the model it resolved to
    pub fn check_model_layers(&self, model_layers: u32) -> Result<(), EngineError> {
        if self.n_layers != model_layers {
            return Err(EngineError::ShardLoad {
                shard: self.to_string(),
                reason: format!(
                    "shard expects {} layers but the model has {}",
                    self.n_layers, model_layers
                ),
            });
        }
        Ok(())
    }

    /// Number of layers this shard executes
    pub fn layer_count(&self) -> u32 {
        self.end_layer.saturating_sub(self.start_layer)
    }

    /// True if this shard receives raw token ids
    pub fn is_first_layer(&self) -> bool {
        self.start_layer == 0
    }

    /// True if this shard produces the pipeline's final output
    pub fn is_last_layer(&self) -> bool {
        self.end_layer == self.n_layers
    }

    pub fn is_full_model(&self) -> bool {
        self.is_first_layer() && self.is_last_layer()
    }

    pub fn contains_layer(&self, layer: u32) -> bool {
        layer >= self.start_layer && layer < self.end_layer
    }
}

impl fmt::Display for Shard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}..{}/{}]",
            self.model_id, self.start_layer, self.end_layer, self.n_layers
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_equal_fields_are_equal_shards() {
        let a = Shard::new("m", 0, 12, 24).unwrap();
        let b = Shard::new(String::from("m"), 0, 12, 24).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, Shard::new("m", 12, 24, 24).unwrap());
        assert_ne!(a, Shard::new("other", 0, 12, 24).unwrap());
    }

    #[test]
    fn test_invalid_ranges_rejected() {
        assert!(matches!(
            Shard::new("m", 12, 12, 24),
            Err(EngineError::InvalidShard(_))
        ));
        assert!(matches!(
            Shard::new("m", 0, 25, 24),
            Err(EngineError::InvalidShard(_))
        ));
        assert!(matches!(
            Shard::new("  ", 0, 1, 24),
            Err(EngineError::InvalidShard(_))
        ));
    }

    #[test]
    fn test_layer_queries() {
        let first = Shard::new("m", 0, 12, 24).unwrap();
        let last = Shard::new("m", 12, 24, 24).unwrap();

        assert_eq!(first.layer_count(), 12);
        assert!(first.is_first_layer());
        assert!(!first.is_last_layer());
        assert!(last.is_last_layer());
        assert!(!last.is_first_layer());
        assert!(first.contains_layer(11));
        assert!(!first.contains_layer(12));
        assert!(Shard::full("m", 24).unwrap().is_full_model());
    }

    #[test]
    fn test_model_layer_count_must_match() {
        let shard = Shard::full("foo", 5).unwrap();
        assert!(shard.check_model_layers(5).is_ok());

        let err = shard.check_model_layers(32).unwrap_err();
        assert!(err.is_load_error());
        assert!(err.to_string().contains("32"));
    }

    #[test]
    fn test_display() {
        let shard = Shard::new("m", 12, 24, 24).unwrap();
        assert_eq!(shard.to_string(), "m[12..24/24]");
    }

    #[test]
    fn test_deserialized_shard_equals_original() {
        let shard = Shard::new("m", 0, 12, 24).unwrap();
        let json = serde_json::to_string(&shard).unwrap();
        let decoded: Shard = serde_json::from_str(&json).unwrap();
        assert_eq!(shard, decoded);
    }
}
