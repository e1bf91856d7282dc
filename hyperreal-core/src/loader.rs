use anyhow::Result;
use image::DynamicImage;

use crate::EngineVariant;

/// Fully resolved parameters for one synthesis call.
#[derive(Debug, Clone, PartialEq)]
pub struct SynthesisRequest {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: u32,
    pub height: u32,
    pub steps: u32,
    pub guidance: f64,
    /// `None` means the model should draw fresh randomness.
    pub seed: Option<u64>,
}

/// A loaded text-to-image model.
pub trait ModelLike: Send {
    fn run(&mut self, request: &SynthesisRequest) -> Result<DynamicImage>;
}

/// Knows how to bring a model's weights onto the device bound by `variant`,
/// using that variant's memory strategy.
pub trait Loader: Send {
    type Model: ModelLike;

    fn load(&self, variant: EngineVariant) -> Result<Self::Model>;
}
