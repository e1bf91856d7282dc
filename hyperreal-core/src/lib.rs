pub mod accelerator;
pub mod config;
pub mod device_map;
pub mod engine;
mod error;
mod flux;
pub mod loader;
mod loader_factory;
mod orchestrator;
mod persist;
mod queue;
mod request;
mod seed;
pub mod style;
mod util;

pub use accelerator::AcceleratorKind;
pub use config::{
    ConfigError, Configuration, GenerationDefaults, GenerationSettings, ModelSpec, StyleSpec,
    DEFAULT_STYLE,
};
pub use device_map::*;
pub use engine::{EngineVariant, GenerationEngine, SharedEngine};
pub use error::*;
pub use flux::{FluxLoader, FluxModel, FluxVariant};
pub use loader::*;
pub use loader_factory::*;
pub use orchestrator::Orchestrator;
pub use persist::{new_batch_id, OutputStore};
pub use queue::{spawn_worker, OrchestratorHandle, PendingGeneration};
pub use request::*;
pub use seed::ResolvedSeedSet;
pub(crate) use util::*;
