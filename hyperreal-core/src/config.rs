use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::info;

use crate::request::{GUIDANCE_RANGE, SIDE_RANGE, STEPS_RANGE};

/// Style used when a request names a preset that isn't configured.
pub const DEFAULT_STYLE: &str = "Style Zero";

/// The slot a style template substitutes the user prompt into.
pub const PROMPT_SLOT: &str = "{prompt}";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read configuration file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Process-wide settings, loaded once at startup and read-only after that.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Configuration {
    pub generation: GenerationSettings,
    pub models: BTreeMap<String, ModelSpec>,
    pub styles: BTreeMap<String, StyleSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GenerationSettings {
    /// Key into [`Configuration::models`].
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    pub defaults: GenerationDefaults,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GenerationDefaults {
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f64,
    /// Inclusive upper bound for randomly drawn seeds.
    pub seed_max: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelSpec {
    pub trigger_word: String,
    /// Full-precision weights, used on discrete GPUs.
    #[serde(default = "default_repo")]
    pub repo: String,
    #[serde(default = "default_weights")]
    pub weights: String,
    /// Quantized weights, used on unified-memory hosts.
    #[serde(default = "default_quantized_repo")]
    pub quantized_repo: String,
    #[serde(default = "default_quantized_weights")]
    pub quantized_weights: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StyleSpec {
    pub prompt: String,
}

fn default_model() -> String {
    "dev".to_string()
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("outputs")
}

fn default_repo() -> String {
    "black-forest-labs/FLUX.1-dev".to_string()
}

fn default_weights() -> String {
    "flux1-dev.safetensors".to_string()
}

fn default_quantized_repo() -> String {
    "lmz/candle-flux".to_string()
}

fn default_quantized_weights() -> String {
    "flux1-dev.gguf".to_string()
}

impl Configuration {
    /// Reads and validates a YAML configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config = Self::from_yaml(&raw)?;
        info!(
            "Loaded configuration from {} ({} styles, model {:?})",
            path.display(),
            config.styles.len(),
            config.generation.model
        );
        Ok(config)
    }

    pub fn from_yaml(raw: &str) -> Result<Self, ConfigError> {
        let config: Configuration = serde_yaml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if !self.models.contains_key(&self.generation.model) {
            return Err(ConfigError::Invalid(format!(
                "active model {:?} has no entry under `models`",
                self.generation.model
            )));
        }
        for (name, style) in &self.styles {
            let slots = style.prompt.matches(PROMPT_SLOT).count();
            if slots != 1 {
                return Err(ConfigError::Invalid(format!(
                    "style {name:?} must contain exactly one {PROMPT_SLOT} slot, found {slots}"
                )));
            }
        }

        let defaults = &self.generation.defaults;
        if !SIDE_RANGE.contains(&defaults.width) || !SIDE_RANGE.contains(&defaults.height) {
            return Err(ConfigError::Invalid(format!(
                "default size {}x{} is outside {:?}",
                defaults.width, defaults.height, SIDE_RANGE
            )));
        }
        if !STEPS_RANGE.contains(&defaults.steps) {
            return Err(ConfigError::Invalid(format!(
                "default steps {} is outside {:?}",
                defaults.steps, STEPS_RANGE
            )));
        }
        if !GUIDANCE_RANGE.contains(&defaults.guidance) {
            return Err(ConfigError::Invalid(format!(
                "default guidance {} is outside {:?}",
                defaults.guidance, GUIDANCE_RANGE
            )));
        }
        if defaults.seed_max < 0 {
            return Err(ConfigError::Invalid("seed_max must not be negative".to_string()));
        }
        Ok(())
    }

    /// Settings of the model selected by `generation.model`.
    pub fn active_model(&self) -> Result<&ModelSpec, ConfigError> {
        self.models.get(&self.generation.model).ok_or_else(|| {
            ConfigError::Invalid(format!("unknown model {:?}", self.generation.model))
        })
    }
}
