use candle_core::utils::metal_is_available;
use tracing::info;

use crate::{
    accelerator, AcceleratorKind, AcceleratorUnavailableError, Configuration, DeviceMap,
    EngineVariant, FactoryError, FluxLoader, GenerationEngine, Loader,
};

/// Detects the host accelerator and binds the matching FLUX engine.
///
/// No weights are loaded here, so a host without a usable accelerator fails
/// before anything expensive happens.
pub fn build(config: &Configuration) -> Result<GenerationEngine<FluxLoader>, FactoryError> {
    let kind = accelerator::detect();
    require_backend(kind, metal_is_available())?;
    let variant = variant_for(kind)?;
    let spec = config.active_model()?.clone();
    let loader = FluxLoader::new(&config.generation.model, spec);
    build_for(variant, config, loader)
}

/// Binds `loader` to a pre-selected variant. The trigger phrase comes from the
/// active model's configuration.
pub fn build_for<L: Loader>(
    variant: EngineVariant,
    config: &Configuration,
    loader: L,
) -> Result<GenerationEngine<L>, FactoryError> {
    let trigger = config.active_model()?.trigger_word.clone();
    info!("Selected {} for model {:?}", variant.name(), config.generation.model);
    Ok(GenerationEngine::new(variant, loader, trigger))
}

/// Maps an accelerator class to the engine variant that drives it.
pub fn variant_for(kind: AcceleratorKind) -> Result<EngineVariant, AcceleratorUnavailableError> {
    match kind {
        AcceleratorKind::UnifiedMemory => Ok(EngineVariant::UnifiedMemory {
            device: DeviceMap::Metal(0),
        }),
        AcceleratorKind::DiscreteGpu => Ok(EngineVariant::DiscreteGpu {
            device: DeviceMap::Cuda(0),
        }),
        AcceleratorKind::Unsupported => Err(unavailable(
            kind,
            "need Apple Silicon or an NVIDIA CUDA GPU",
        )),
    }
}

/// Rejects a unified-memory host when this build cannot drive its GPU, so the
/// server stops at startup instead of failing every request at load time.
pub fn require_backend(
    kind: AcceleratorKind,
    metal_compiled: bool,
) -> Result<(), AcceleratorUnavailableError> {
    if kind == AcceleratorKind::UnifiedMemory && !metal_compiled {
        return Err(unavailable(
            kind,
            "built without Metal support, rebuild with `--features metal`",
        ));
    }
    Ok(())
}

fn unavailable(kind: AcceleratorKind, reason: &'static str) -> AcceleratorUnavailableError {
    AcceleratorUnavailableError {
        kind,
        reason,
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    }
}
