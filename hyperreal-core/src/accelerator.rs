use candle_core::utils::cuda_is_available;
use candle_core::Device;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Accelerator classes the engine knows how to drive.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
pub enum AcceleratorKind {
    /// CPU and GPU share one memory pool (Apple Silicon).
    UnifiedMemory,
    /// Dedicated GPU memory (NVIDIA CUDA).
    DiscreteGpu,
    Unsupported,
}

/// Classifies the current host.
///
/// Unified memory is decided from the OS family and architecture alone and,
/// when it matches, the CUDA runtime is never queried.
pub fn detect() -> AcceleratorKind {
    let kind = classify(
        std::env::consts::OS,
        std::env::consts::ARCH,
        discrete_gpu_present,
    );
    match kind {
        AcceleratorKind::UnifiedMemory => {
            info!("Detected Apple Silicon (unified memory) environment")
        }
        AcceleratorKind::DiscreteGpu => info!("Detected NVIDIA CUDA device"),
        AcceleratorKind::Unsupported => warn!("No supported accelerator detected"),
    }
    kind
}

/// Pure classification over host facts. `discrete_gpu` is only invoked when
/// the host is not a unified-memory machine.
pub fn classify(
    os: &str,
    arch: &str,
    discrete_gpu: impl FnOnce() -> bool,
) -> AcceleratorKind {
    if is_unified_memory(os, arch) {
        AcceleratorKind::UnifiedMemory
    } else if discrete_gpu() {
        AcceleratorKind::DiscreteGpu
    } else {
        AcceleratorKind::Unsupported
    }
}

fn is_unified_memory(os: &str, arch: &str) -> bool {
    let arch = arch.to_lowercase();
    os == "macos" && (arch.contains("arm") || arch == "aarch64")
}

fn discrete_gpu_present() -> bool {
    if !cuda_is_available() {
        debug!("CUDA support not compiled in");
        return false;
    }
    match Device::new_cuda(0) {
        Ok(_) => true,
        Err(e) => {
            debug!("CUDA device 0 unavailable: {e}");
            false
        }
    }
}
