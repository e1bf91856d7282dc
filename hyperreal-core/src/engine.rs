use std::sync::{Arc, Mutex};

use image::DynamicImage;
use tracing::{debug, info};

use crate::{DeviceMap, EngineError, Loader, ModelLike, SynthesisRequest};

/// The engine shared between the orchestrator and whoever else needs to
/// reach it (warm-up, shutdown). All access is serialized by the mutex.
pub type SharedEngine<L> = Arc<Mutex<GenerationEngine<L>>>;

/// Hardware-specific flavour of the engine. The public contract is the same
/// for every variant; only how weights are placed in memory differs.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EngineVariant {
    /// Quantized transformer on the GPU. Text encoders are loaded per prompt
    /// and released before denoising, since CPU and GPU share one memory pool.
    UnifiedMemory { device: DeviceMap },
    /// Full-precision weights, everything resident on the GPU.
    DiscreteGpu { device: DeviceMap },
}

impl EngineVariant {
    pub fn name(&self) -> &'static str {
        match self {
            EngineVariant::UnifiedMemory { .. } => "UnifiedMemoryEngine",
            EngineVariant::DiscreteGpu { .. } => "DiscreteGpuEngine",
        }
    }

    pub fn device_map(&self) -> DeviceMap {
        match *self {
            EngineVariant::UnifiedMemory { device } | EngineVariant::DiscreteGpu { device } => {
                device
            }
        }
    }

    /// Whether the diffusion transformer is loaded from compressed (GGUF) weights.
    pub fn quantized(&self) -> bool {
        matches!(self, EngineVariant::UnifiedMemory { .. })
    }

    /// Whether the text encoders are loaded for each prompt instead of staying
    /// resident next to the transformer.
    pub fn on_demand_encoders(&self) -> bool {
        matches!(self, EngineVariant::UnifiedMemory { .. })
    }
}

/// Owns the model and loads it on first use.
pub struct GenerationEngine<L: Loader> {
    variant: EngineVariant,
    loader: L,
    trigger_phrase: String,
    model: Option<L::Model>,
}

impl<L: Loader> GenerationEngine<L> {
    /// Binds a variant and loader. Nothing is loaded until [`load_models`](Self::load_models).
    pub fn new(variant: EngineVariant, loader: L, trigger_phrase: impl Into<String>) -> Self {
        let engine = Self {
            variant,
            loader,
            trigger_phrase: trigger_phrase.into(),
            model: None,
        };
        info!(
            "[{}] Initialized on {} (quantized: {})",
            variant.name(),
            variant.device_map(),
            variant.quantized()
        );
        engine
    }

    pub fn is_loaded(&self) -> bool {
        self.model.is_some()
    }

    /// Wraps the engine for sharing with the orchestrator.
    pub fn into_shared(self) -> SharedEngine<L> {
        Arc::new(Mutex::new(self))
    }

    /// Loads the weights on first call; later calls return immediately. A
    /// failed load leaves the engine unloaded so the next call tries again.
    pub fn load_models(&mut self) -> Result<(), EngineError> {
        if self.model.is_some() {
            return Ok(());
        }
        info!("[{}] Loading models on {}", self.variant.name(), self.variant.device_map());
        let model = self
            .loader
            .load(self.variant)
            .map_err(EngineError::ModelLoad)?;
        self.model = Some(model);
        info!("[{}] Models loaded", self.variant.name());
        Ok(())
    }

    /// Renders one image. Loads the models first if needed.
    #[allow(clippy::too_many_arguments)]
    pub fn generate(
        &mut self,
        prompt: &str,
        negative_prompt: &str,
        width: u32,
        height: u32,
        steps: u32,
        guidance: f64,
        seed: i64,
    ) -> Result<DynamicImage, EngineError> {
        self.load_models()?;

        let prompt = apply_trigger_phrase(prompt, &self.trigger_phrase);
        let request = SynthesisRequest {
            prompt,
            negative_prompt: negative_prompt.to_string(),
            width,
            height,
            steps,
            guidance,
            seed: reproducible_seed(seed),
        };
        debug!(
            "[{}] Generating {}x{} in {} steps for prompt {:?} (seed {:?})",
            self.variant.name(),
            width,
            height,
            steps,
            request.prompt.chars().take(50).collect::<String>(),
            request.seed
        );

        let Some(model) = self.model.as_mut() else {
            return Err(EngineError::ModelLoad(anyhow::anyhow!(
                "model missing after load"
            )));
        };
        model.run(&request).map_err(EngineError::Generation)
    }
}

/// Prepends `phrase` unless it already occurs in `prompt` (case-sensitive).
pub fn apply_trigger_phrase(prompt: &str, phrase: &str) -> String {
    if phrase.is_empty() || prompt.contains(phrase) {
        prompt.to_string()
    } else {
        format!("{phrase} {prompt}")
    }
}

/// Only strictly positive seeds pin the RNG.
pub fn reproducible_seed(seed: i64) -> Option<u64> {
    (seed > 0).then_some(seed as u64)
}
