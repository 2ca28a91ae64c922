//! Tensors exchanged between pipeline stages
//!
//! A [`Tensor`] carries row-major `f32` data, its shape, and the device it is
//! placed on. Token ids travel as exact `f32` values so that token batches and
//! intermediate activations share one representation on the wire.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::inference::EngineError;
use crate::storage::settings::DevicePreference;
use crate::system::gpu::detect_gpu;

/// Where a tensor's data lives
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
pub enum Device {
    /// Host memory, general-purpose processor
    #[default]
    Cpu,
    /// An accelerator exposed by the execution backend
    Accelerator { name: String },
}

impl Device {
    /// Select the execution device once, at engine construction.
    ///
    /// Prefers an available accelerator and silently falls back to the CPU.
    pub fn probe(preference: DevicePreference) -> Self {
        if preference == DevicePreference::Cpu {
            return Device::Cpu;
        }

        let gpu = detect_gpu();
        if gpu.is_available {
            Device::Accelerator { name: gpu.name }
        } else {
            tracing::debug!("No accelerator available, using CPU");
            Device::Cpu
        }
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator { .. })
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator { name } => write!(f, "{}", name),
        }
    }
}

/// N-dimensional tensor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Row-major data storage
    pub data: Vec<f32>,
    /// Dimension sizes, outermost first
    pub shape: Vec<usize>,
    /// Placement of `data`
    #[serde(default)]
    pub device: Device,
}

impl Tensor {
    /// Create a host tensor, checking that `data` fills `shape` exactly
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self, EngineError> {
        let tensor = Self {
            data,
            shape,
            device: Device::Cpu,
        };
        tensor.validate()?;
        Ok(tensor)
    }

    /// Check that `data` fills `shape` exactly.
    ///
    /// Tensors deserialized from an upstream stage bypass [`Tensor::new`].
    pub fn validate(&self) -> Result<(), EngineError> {
        let expected: usize = self.shape.iter().product();
        if self.data.len() != expected {
            return Err(EngineError::InvalidShape(format!(
                "data length {} doesn't match shape {:?} ({} elements)",
                self.data.len(),
                self.shape,
                expected
            )));
        }
        Ok(())
    }

    /// Rank-1 host tensor
    pub fn from_vec(data: Vec<f32>) -> Self {
        let len = data.len();
        Self {
            data,
            shape: vec![len],
            device: Device::Cpu,
        }
    }

    /// Single-batch `[1, n]` tensor of token ids placed on `device`
    pub fn from_token_ids(ids: &[u32], device: &Device) -> Self {
        Self {
            data: ids.iter().map(|&id| id as f32).collect(),
            shape: vec![1, ids.len()],
            device: device.clone(),
        }
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    /// Total number of elements
    pub fn numel(&self) -> usize {
        self.data.len()
    }

    /// The only element, if the tensor holds exactly one
    pub fn single_value(&self) -> Option<f32> {
        match self.data.as_slice() {
            [value] => Some(*value),
            _ => None,
        }
    }

    /// Interpret every element as a token id.
    ///
    /// Fails if an element is negative or not integral.
    pub fn to_token_ids(&self) -> Result<Vec<u32>, EngineError> {
        self.data
            .iter()
            .map(|&v| {
                if v >= 0.0 && v.fract() == 0.0 && v <= u32::MAX as f32 {
                    Ok(v as u32)
                } else {
                    Err(EngineError::InvalidShape(format!(
                        "value {} is not a token id",
                        v
                    )))
                }
            })
            .collect()
    }

    /// Promote to the `[batch, seq]` layout executors expect.
    ///
    /// A rank-1 tensor of length `n` becomes `[1, n]`; rank-2 passes through.
    pub fn into_batched(self) -> Result<Self, EngineError> {
        self.validate()?;
        match self.rank() {
            1 => {
                let len = self.shape[0];
                Ok(Self {
                    shape: vec![1, len],
                    ..self
                })
            }
            2 => Ok(self),
            rank => Err(EngineError::InvalidShape(format!(
                "expected a rank 1 or 2 tensor, got rank {} {:?}",
                rank, self.shape
            ))),
        }
    }

    pub fn into_device(self, device: &Device) -> Self {
        Self {
            device: device.clone(),
            ..self
        }
    }

    /// Move into host-addressable memory
    pub fn into_host(self) -> Self {
        if self.device == Device::Cpu {
            return self;
        }
        Self {
            device: Device::Cpu,
            ..self
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_checks_shape() {
        assert!(Tensor::new(vec![0.0; 6], vec![2, 3]).is_ok());
        assert!(matches!(
            Tensor::new(vec![0.0; 5], vec![2, 3]),
            Err(EngineError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_into_batched_promotes_rank_one() {
        let t = Tensor::from_vec(vec![1.0, 2.0, 3.0]).into_batched().unwrap();
        assert_eq!(t.shape, vec![1, 3]);
        assert_eq!(t.data, vec![1.0, 2.0, 3.0]);

        let t = Tensor::new(vec![0.0; 4], vec![2, 2])
            .unwrap()
            .into_batched()
            .unwrap();
        assert_eq!(t.shape, vec![2, 2]);
    }

    #[test]
    fn test_into_batched_rejects_inconsistent_data() {
        let t: Tensor = serde_json::from_str(r#"{"data":[2.0],"shape":[4]}"#).unwrap();
        assert_eq!(t.device, Device::Cpu);
        assert!(matches!(
            t.into_batched(),
            Err(EngineError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_into_batched_rejects_other_ranks() {
        let scalar = Tensor::new(vec![1.0], vec![]).unwrap();
        assert!(scalar.into_batched().is_err());

        let cube = Tensor::new(vec![0.0; 8], vec![2, 2, 2]).unwrap();
        assert!(matches!(
            cube.into_batched(),
            Err(EngineError::InvalidShape(_))
        ));
    }

    #[test]
    fn test_token_ids() {
        let device = Device::Accelerator {
            name: "cuda".to_string(),
        };
        let t = Tensor::from_token_ids(&[5, 7, 2], &device);
        assert_eq!(t.shape, vec![1, 3]);
        assert_eq!(t.device, device);
        assert_eq!(t.to_token_ids().unwrap(), vec![5, 7, 2]);

        let bad = Tensor::from_vec(vec![0.5]);
        assert!(bad.to_token_ids().is_err());
    }

    #[test]
    fn test_single_value() {
        assert_eq!(Tensor::from_vec(vec![4.0]).single_value(), Some(4.0));
        assert_eq!(Tensor::from_vec(vec![4.0, 4.0]).single_value(), None);
        assert_eq!(Tensor::from_vec(vec![]).single_value(), None);
    }

    #[test]
    fn test_device_transfer() {
        let gpu = Device::Accelerator {
            name: "cuda".to_string(),
        };
        let t = Tensor::from_vec(vec![1.0]).into_device(&gpu);
        assert!(t.device.is_accelerator());

        let host = t.into_host();
        assert_eq!(host.device, Device::Cpu);
        assert_eq!(host.data, vec![1.0]);
    }

    #[test]
    fn test_probe_respects_cpu_preference() {
        assert_eq!(Device::probe(DevicePreference::Cpu), Device::Cpu);
    }
}
