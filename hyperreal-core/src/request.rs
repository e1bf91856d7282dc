use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use image::DynamicImage;
use serde::{Deserialize, Serialize};

use crate::{GenerationDefaults, OrchestratorError, ResolvedSeedSet};

pub const SIDE_RANGE: RangeInclusive<u32> = 512..=1536;
pub const GUIDANCE_RANGE: RangeInclusive<f64> = 1.0..=20.0;
pub const STEPS_RANGE: RangeInclusive<u32> = 1..=50;
pub const BATCH_RANGE: RangeInclusive<u32> = 1..=4;

/// Seed value asking for random seeds.
pub const RANDOM_SEED: i64 = -1;

/// One user submission. Omitted numeric fields take the configured defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub style: Option<String>,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default)]
    pub width: Option<u32>,
    #[serde(default)]
    pub height: Option<u32>,
    #[serde(default)]
    pub guidance_scale: Option<f64>,
    #[serde(default)]
    pub steps: Option<u32>,
    #[serde(default = "random_seed")]
    pub seed: i64,
    #[serde(default = "single")]
    pub batch_size: u32,
}

fn random_seed() -> i64 {
    RANDOM_SEED
}

fn single() -> u32 {
    1
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            style: None,
            negative_prompt: None,
            width: None,
            height: None,
            guidance_scale: None,
            steps: None,
            seed: RANDOM_SEED,
            batch_size: 1,
        }
    }

    /// Fills defaults and checks every value against its bounds.
    pub(crate) fn resolve(
        &self,
        defaults: &GenerationDefaults,
    ) -> Result<ResolvedParams, OrchestratorError> {
        let width = self.width.unwrap_or(defaults.width);
        let height = self.height.unwrap_or(defaults.height);
        let steps = self.steps.unwrap_or(defaults.steps);
        let guidance = self.guidance_scale.unwrap_or(defaults.guidance);

        check("width", width, &SIDE_RANGE)?;
        check("height", height, &SIDE_RANGE)?;
        check("steps", steps, &STEPS_RANGE)?;
        check("batch_size", self.batch_size, &BATCH_RANGE)?;
        if !GUIDANCE_RANGE.contains(&guidance) {
            return Err(OrchestratorError::InvalidRequest(format!(
                "guidance_scale {guidance} is outside {GUIDANCE_RANGE:?}"
            )));
        }

        Ok(ResolvedParams {
            negative_prompt: self.negative_prompt.clone().unwrap_or_default(),
            width,
            height,
            steps,
            guidance,
            batch_size: self.batch_size as usize,
        })
    }
}

fn check(name: &str, value: u32, range: &RangeInclusive<u32>) -> Result<(), OrchestratorError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(OrchestratorError::InvalidRequest(format!(
            "{name} {value} is outside {range:?}"
        )))
    }
}

#[derive(Debug, Clone, PartialEq)]
pub(crate) struct ResolvedParams {
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f64,
    pub batch_size: usize,
}

/// What a completed request hands back to the caller.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    /// In seed order.
    pub images: Vec<DynamicImage>,
    pub seeds: ResolvedSeedSet,
    pub elapsed: Duration,
    pub batch_id: String,
    /// Where each image was written, in the same order as `images`.
    pub paths: Vec<PathBuf>,
    /// Present iff the batch had more than one item.
    pub archive: Option<PathBuf>,
}

impl GenerationResult {
    pub fn info_text(&self) -> String {
        format!(
            "Generation complete in **{:.2}s**. Seeds: {:?}",
            self.elapsed.as_secs_f64(),
            self.seeds.as_slice()
        )
    }
}
