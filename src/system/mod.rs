//! Host system probing

pub mod gpu;

pub use gpu::{detect_gpu, GpuInfo};
