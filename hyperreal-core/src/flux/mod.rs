use std::path::PathBuf;

use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::clip::text_model::{
    Activation, ClipTextConfig, ClipTextTransformer,
};
use candle_transformers::models::flux::{
    self, autoencoder::AutoEncoder, sampling, WithForward,
};
use candle_transformers::models::t5::{self, T5EncoderModel};
use candle_transformers::quantized_var_builder;
use hf_hub::api::sync::{Api, ApiRepo};
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info};

use crate::{tensor_to_image, EngineVariant, Loader, ModelLike, ModelSpec, SynthesisRequest};

const T5_MAX_TOKENS: usize = 256;
const CLIP_MAX_TOKENS: usize = 77;

/// FLUX.1 release the weights belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    /// Detect the variant from a model identifier or repository name.
    pub fn from_name(model_name: &str) -> Self {
        if model_name.to_uppercase().contains("SCHNELL") {
            FluxVariant::Schnell
        } else {
            FluxVariant::Dev
        }
    }

    fn autoencoder_config(&self) -> flux::autoencoder::Config {
        match self {
            FluxVariant::Schnell => flux::autoencoder::Config::schnell(),
            FluxVariant::Dev => flux::autoencoder::Config::dev(),
        }
    }

    fn model_config(&self) -> flux::model::Config {
        match self {
            FluxVariant::Schnell => flux::model::Config::schnell(),
            FluxVariant::Dev => flux::model::Config::dev(),
        }
    }

    /// Dev shifts the timestep schedule towards high noise for large images.
    fn schedule(&self, steps: usize, image_seq_len: usize) -> Vec<f64> {
        match self {
            FluxVariant::Schnell => sampling::get_schedule(steps, None),
            FluxVariant::Dev => sampling::get_schedule(steps, Some((image_seq_len, 0.5, 1.15))),
        }
    }
}

enum Transformer {
    Full(flux::model::Flux),
    Quantized(flux::quantized_model::Flux),
}

pub struct FluxModel {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    encoder_files: EncoderFiles,
    /// `None` when the encoders are loaded per prompt.
    encoders: Option<TextEncoders>,
    autoencoder: AutoEncoder,
    transformer: Transformer,
}

impl FluxModel {
    /// Encodes `prompt` with T5 and CLIP. Encoders that are not kept resident
    /// are loaded here and dropped before the transformer runs.
    fn embed(&mut self, prompt: &str) -> Result<(Tensor, Tensor)> {
        match self.encoders.as_mut() {
            Some(encoders) => encoders.embed(prompt),
            None => {
                debug!("Loading text encoders for this prompt");
                TextEncoders::load(&self.encoder_files, self.dtype, &self.device)?.embed(prompt)
            }
        }
    }

    fn denoise<M: WithForward>(
        &self,
        model: &M,
        state: &sampling::State,
        steps: usize,
        guidance: f64,
    ) -> Result<Tensor> {
        let timesteps = self.variant.schedule(steps, state.img.dim(1)?);
        Ok(sampling::denoise(
            model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            guidance,
        )?)
    }
}

impl ModelLike for FluxModel {
    fn run(&mut self, request: &SynthesisRequest) -> Result<DynamicImage> {
        let width = request.width as usize;
        let height = request.height as usize;
        let steps = request.steps as usize;

        // Without a pinned seed, reseed from OS entropy so runs differ.
        let seed = request.seed.unwrap_or_else(rand::random);
        self.device.set_seed(seed)?;

        if !request.negative_prompt.is_empty() {
            debug!("FLUX is guidance-distilled, negative prompt is not used");
        }

        let noise = sampling::get_noise(1, height, width, &self.device)?.to_dtype(self.dtype)?;
        let (t5_emb, clip_emb) = self.embed(&request.prompt)?;

        let latent = match &self.transformer {
            Transformer::Full(model) => {
                let state = sampling::State::new(&t5_emb, &clip_emb, &noise)?;
                self.denoise(model, &state, steps, request.guidance)?
            }
            // The quantized transformer runs in f32.
            Transformer::Quantized(model) => {
                let state = sampling::State::new(
                    &t5_emb.to_dtype(DType::F32)?,
                    &clip_emb.to_dtype(DType::F32)?,
                    &noise.to_dtype(DType::F32)?,
                )?;
                self.denoise(model, &state, steps, request.guidance)?
                    .to_dtype(self.dtype)?
            }
        };
        let unpacked = sampling::unpack(&latent, height, width)?;
        debug!("Generated latent image");

        let decoded = self.autoencoder.decode(&unpacked)?;
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }
}

/// Local paths of the text encoder weights and tokenizers.
struct EncoderFiles {
    t5_weights: PathBuf,
    t5_config: PathBuf,
    t5_tokenizer: PathBuf,
    clip_weights: PathBuf,
    clip_tokenizer: PathBuf,
}

impl EncoderFiles {
    fn fetch(api: &Api) -> Result<Self> {
        let t5_repo: ApiRepo = api.repo(hf_hub::Repo::with_revision(
            "google/t5-v1_1-xxl".to_string(),
            hf_hub::RepoType::Model,
            "refs/pr/2".to_string(),
        ));
        let clip_repo = api.repo(hf_hub::Repo::model(
            "openai/clip-vit-large-patch14".to_string(),
        ));
        Ok(Self {
            t5_weights: t5_repo
                .get("model.safetensors")
                .context("failed to load T5 model file")?,
            t5_config: t5_repo.get("config.json").context("failed to get T5 config")?,
            t5_tokenizer: api
                .model("lmz/mt5-tokenizers".to_string())
                .get("t5-v1_1-xxl.tokenizer.json")
                .context("failed to get T5 tokenizer")?,
            clip_weights: clip_repo
                .get("model.safetensors")
                .context("failed to get CLIP model file")?,
            clip_tokenizer: clip_repo
                .get("tokenizer.json")
                .context("failed to get CLIP tokenizer")?,
        })
    }
}

struct TextEncoders {
    device: Device,
    dtype: DType,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
}

impl TextEncoders {
    fn load(files: &EncoderFiles, dtype: DType, device: &Device) -> Result<Self> {
        let t5_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[&files.t5_weights], dtype, device)
                .context("failed to build T5 var builder")?
        };
        let config_str =
            std::fs::read_to_string(&files.t5_config).context("failed to read T5 config")?;
        let t5_config: t5::Config =
            serde_json::from_str(&config_str).context("failed to parse T5 config")?;
        let t5_model = T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
        let t5_tokenizer = Tokenizer::from_file(&files.t5_tokenizer)
            .map_err(Error::msg)
            .context("failed to load T5 tokenizer")?;

        let clip_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[&files.clip_weights], dtype, device)
                .context("failed to build CLIP var builder")?
        };
        let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config())
            .context("failed to load CLIP model")?;
        let clip_tokenizer = Tokenizer::from_file(&files.clip_tokenizer)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;

        Ok(Self {
            device: device.clone(),
            dtype,
            t5_model,
            t5_tokenizer,
            clip_model,
            clip_tokenizer,
        })
    }

    fn embed(&mut self, prompt: &str) -> Result<(Tensor, Tensor)> {
        let mut tokens = self
            .t5_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        tokens.resize(T5_MAX_TOKENS, 0);
        let input_ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        let t5_emb = self.t5_model.forward(&input_ids)?.to_dtype(self.dtype)?;

        let tokens = self
            .clip_tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let tokens = clip_token_window(tokens);
        let input_ids = Tensor::new(&*tokens, &self.device)?.unsqueeze(0)?;
        let clip_emb = self.clip_model.forward(&input_ids)?.to_dtype(self.dtype)?;
        Ok((t5_emb, clip_emb))
    }
}

/// Cuts CLIP input to its context length, keeping the trailing end-of-text id.
fn clip_token_window(mut tokens: Vec<u32>) -> Vec<u32> {
    if tokens.len() > CLIP_MAX_TOKENS {
        if let Some(&eot) = tokens.last() {
            tokens.truncate(CLIP_MAX_TOKENS - 1);
            tokens.push(eot);
        }
    }
    tokens
}

fn clip_config() -> ClipTextConfig {
    ClipTextConfig {
        vocab_size: 49408,
        projection_dim: 768,
        activation: Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: CLIP_MAX_TOKENS,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
    }
}

/// Fetches FLUX weights from the Hugging Face hub and places them according
/// to the engine variant.
pub struct FluxLoader {
    variant: FluxVariant,
    spec: ModelSpec,
}

impl FluxLoader {
    pub fn new(model_id: &str, spec: ModelSpec) -> Self {
        let variant = match FluxVariant::from_name(model_id) {
            FluxVariant::Schnell => FluxVariant::Schnell,
            FluxVariant::Dev => FluxVariant::from_name(&spec.repo),
        };
        Self { variant, spec }
    }

    pub fn variant(&self) -> FluxVariant {
        self.variant
    }
}

impl Loader for FluxLoader {
    type Model = FluxModel;

    fn load(&self, engine: EngineVariant) -> Result<FluxModel> {
        let device = engine
            .device_map()
            .create()
            .with_context(|| format!("failed to set up device {}", engine.device_map()))?;
        let dtype = device.bf16_default_to_f32();

        let api = Api::new().context("failed to create hf hub API")?;

        let encoder_files = EncoderFiles::fetch(&api)?;
        let encoders = if engine.on_demand_encoders() {
            info!("Text encoders will be loaded per prompt");
            None
        } else {
            Some(TextEncoders::load(&encoder_files, dtype, &device)?)
        };

        // --- Autoencoder ---
        let bf_repo = api.model(self.spec.repo.clone());
        let autoencoder_file = bf_repo
            .get("ae.safetensors")
            .context("failed to get autoencoder model file")?;
        let autoencoder_vb = unsafe {
            candle_nn::VarBuilder::from_mmaped_safetensors(&[autoencoder_file], dtype, &device)
                .context("failed to build autoencoder var builder")?
        };
        let autoencoder = AutoEncoder::new(&self.variant.autoencoder_config(), autoencoder_vb)
            .context("failed to load autoencoder")?;

        // --- Diffusion transformer ---
        let config = self.variant.model_config();
        let transformer = if engine.quantized() {
            info!(
                "Loading quantized transformer {}/{}",
                self.spec.quantized_repo, self.spec.quantized_weights
            );
            let file = api
                .model(self.spec.quantized_repo.clone())
                .get(&self.spec.quantized_weights)
                .context("failed to get quantized flux weights")?;
            let vb = quantized_var_builder::VarBuilder::from_gguf(file, &device)
                .context("failed to read gguf weights")?;
            Transformer::Quantized(
                flux::quantized_model::Flux::new(&config, vb)
                    .context("failed to load quantized flux model")?,
            )
        } else {
            info!("Loading transformer {}/{}", self.spec.repo, self.spec.weights);
            let file = bf_repo
                .get(&self.spec.weights)
                .context("failed to get flux model file")?;
            let vb = unsafe {
                candle_nn::VarBuilder::from_mmaped_safetensors(&[file], dtype, &device)
                    .context("failed to build flux var builder")?
            };
            Transformer::Full(
                flux::model::Flux::new(&config, vb).context("failed to load flux model")?,
            )
        };

        Ok(FluxModel {
            variant: self.variant,
            device,
            dtype,
            encoder_files,
            encoders,
            autoencoder,
            transformer,
        })
    }
}
