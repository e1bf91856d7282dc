use std::path::PathBuf;

use thiserror::Error;

use crate::{AcceleratorKind, ConfigError};

/// Raised at startup when the host has neither a usable unified-memory chip
/// nor a CUDA device. The process must not go on to serve requests.
#[derive(Debug, Error)]
#[error("no compatible accelerator found (detected {kind:?} on {os}/{arch}); {reason}")]
pub struct AcceleratorUnavailableError {
    pub kind: AcceleratorKind,
    pub reason: &'static str,
    pub os: String,
    pub arch: String,
}

/// Why the engine could not be constructed at startup.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error(transparent)]
    AcceleratorUnavailable(#[from] AcceleratorUnavailableError),
    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Failures at the engine boundary.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Weight fetch, device creation or allocation failed. The engine is left
    /// unloaded and the next call will try again.
    #[error("failed to load models: {0:#}")]
    ModelLoad(anyhow::Error),
    /// Anything that went wrong inside a single synthesis call.
    #[error("generation failed: {0:#}")]
    Generation(anyhow::Error),
}

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("failed to create output directory {path}: {source}")]
    Directory {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write image {path}: {source}")]
    Image {
        path: PathBuf,
        #[source]
        source: image::ImageError,
    },
    #[error("failed to write archive {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write archive {path}: {source}")]
    Zip {
        path: PathBuf,
        #[source]
        source: zip::result::ZipError,
    },
}

/// Why a single batch item (or the batch archive) did not make it.
#[derive(Debug, Error)]
pub enum ItemError {
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error(transparent)]
    Persistence(#[from] PersistError),
}

#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Neither the requested style nor the default style is configured.
    #[error("style {requested:?} is not configured and the default style {default:?} is missing too")]
    UnknownStyle { requested: String, default: String },
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    /// A batch stopped part way. Items in `persisted` are on disk and stay there.
    #[error("batch {batch_id} failed after {completed} completed item(s): {source}")]
    Batch {
        batch_id: String,
        completed: usize,
        persisted: Vec<PathBuf>,
        #[source]
        source: ItemError,
    },
    /// Engine failure outside a batch, e.g. during warm-up.
    #[error(transparent)]
    Engine(#[from] EngineError),
    #[error("generation worker is no longer running")]
    WorkerUnavailable,
}

impl OrchestratorError {
    /// Number of items that were generated and persisted before the failure.
    pub fn completed(&self) -> usize {
        match self {
            OrchestratorError::Batch { completed, .. } => *completed,
            _ => 0,
        }
    }
}
