//! Accelerator detection
//!
//! Asks the execution backend which devices it can reach. Builds without a
//! backend fall back to the GPU features compiled in.

/// Accelerator information
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GpuInfo {
    pub name: String,
    pub is_available: bool,
}

impl GpuInfo {
    fn unavailable() -> Self {
        Self {
            name: "none".to_string(),
            is_available: false,
        }
    }
}

/// A device as reported by the execution backend
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendDevice {
    pub name: String,
    pub backend: String,
    pub is_gpu: bool,
}

/// Detect an available accelerator.
///
/// Nothing is reported when the process has been fenced off from devices
/// through `CUDA_VISIBLE_DEVICES`.
pub fn detect_gpu() -> GpuInfo {
    let visible = std::env::var("CUDA_VISIBLE_DEVICES").ok();
    if devices_hidden(visible.as_deref()) {
        tracing::debug!("Accelerators hidden by CUDA_VISIBLE_DEVICES");
        return GpuInfo::unavailable();
    }

    if let Some(devices) = backend_devices() {
        tracing::debug!("Backend reports {} device(s)", devices.len());
        return pick_accelerator(&devices);
    }

    match compiled_backend() {
        Some(name) => GpuInfo {
            name: name.to_string(),
            is_available: true,
        },
        None => GpuInfo::unavailable(),
    }
}

#[cfg(feature = "llama")]
fn backend_devices() -> Option<Vec<BackendDevice>> {
    use llama_cpp_2::{list_llama_ggml_backend_devices, LlamaBackendDeviceType};

    let devices = list_llama_ggml_backend_devices()
        .into_iter()
        .map(|device| BackendDevice {
            name: device.name,
            backend: device.backend,
            is_gpu: matches!(device.device_type, LlamaBackendDeviceType::Gpu),
        })
        .collect();
    Some(devices)
}

#[cfg(not(feature = "llama"))]
fn backend_devices() -> Option<Vec<BackendDevice>> {
    None
}

/// First GPU in the backend's device list
fn pick_accelerator(devices: &[BackendDevice]) -> GpuInfo {
    devices
        .iter()
        .find(|device| device.is_gpu)
        .map(|device| GpuInfo {
            name: device.name.clone(),
            is_available: true,
        })
        .unwrap_or_else(GpuInfo::unavailable)
}

fn compiled_backend() -> Option<&'static str> {
    if cfg!(feature = "cuda") {
        Some("cuda")
    } else if cfg!(feature = "vulkan") {
        Some("vulkan")
    } else {
        None
    }
}

fn devices_hidden(visible: Option<&str>) -> bool {
    matches!(visible.map(str::trim), Some("") | Some("-1"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device(name: &str, backend: &str, is_gpu: bool) -> BackendDevice {
        BackendDevice {
            name: name.to_string(),
            backend: backend.to_string(),
            is_gpu,
        }
    }

    #[test]
    fn test_devices_hidden() {
        assert!(devices_hidden(Some("")));
        assert!(devices_hidden(Some("-1")));
        assert!(!devices_hidden(Some("0,1")));
        assert!(!devices_hidden(None));
    }

    #[test]
    fn test_cpu_only_backend_has_no_accelerator() {
        let info = pick_accelerator(&[device("CPU", "CPU", false)]);
        assert!(!info.is_available);
        assert!(!pick_accelerator(&[]).is_available);
    }

    #[test]
    fn test_first_gpu_is_picked() {
        let devices = [
            device("CPU", "CPU", false),
            device("CUDA0", "CUDA", true),
            device("CUDA1", "CUDA", true),
        ];
        let info = pick_accelerator(&devices);
        assert!(info.is_available);
        assert_eq!(info.name, "CUDA0");
    }

    #[test]
    fn test_detect_without_any_backend() {
        if backend_devices().is_none() && compiled_backend().is_none() {
            assert!(!detect_gpu().is_available);
        }
    }
}
