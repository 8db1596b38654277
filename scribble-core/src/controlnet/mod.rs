mod model;

use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context, Error, Result};
use async_trait::async_trait;
use candle_core::{DType, Device, IndexOp, Module, Tensor};
use candle_nn::VarBuilder;
use candle_transformers::models::stable_diffusion::{
    self,
    clip::ClipTextTransformer,
    unet_2d::{BlockConfig, UNet2DConditionModel, UNet2DConditionModelConfig},
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tokenizers::Tokenizer;
use tracing::debug;

use crate::{
    fetch, gray_to_tensor, tensor_to_image, ComputeTarget, ConditioningImage, GenerationRequest,
    Loader, ModelRepos, SketchPipeline, CONDITIONING_SIZE,
};

const VAE_SCALE: f64 = 0.18215;
const LATENT_CHANNELS: usize = 4;
const END_OF_TEXT: &str = "<|endoftext|>";

/// UNet layout of Stable Diffusion 1.5, shared by its ControlNets.
fn sd15_unet_config(sliced_attention_size: Option<usize>) -> UNet2DConditionModelConfig {
    let bc = |out_channels, use_cross_attn, attention_head_dim| BlockConfig {
        out_channels,
        use_cross_attn,
        attention_head_dim,
    };
    UNet2DConditionModelConfig {
        blocks: vec![
            bc(320, Some(1), 8),
            bc(640, Some(1), 8),
            bc(1280, Some(1), 8),
            bc(1280, None, 8),
        ],
        center_input_sample: false,
        cross_attention_dim: 768,
        downsample_padding: 1,
        flip_sin_to_cos: true,
        freq_shift: 0.,
        layers_per_block: 2,
        mid_block_scale_factor: 1.,
        norm_eps: 1e-5,
        norm_num_groups: 32,
        sliced_attention_size,
        use_linear_projection: false,
    }
}

/// Stable Diffusion 1.5 steered by a scribble ControlNet.
pub struct ControlNetPipeline {
    device: Device,
    dtype: DType,
    sd_config: StableDiffusionConfig,
    tokenizer: Tokenizer,
    pad_id: u32,
    text_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    controlnet: model::ControlNet,
    vae: AutoEncoderKL,
}

impl ControlNetPipeline {
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let max_len = self.sd_config.clip.max_position_embeddings;
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > max_len {
            tracing::warn!(tokens = tokens.len(), max_len, "prompt truncated");
            tokens.truncate(max_len - 1);
            tokens.push(self.pad_id);
        }
        tokens.resize(max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.text_model.forward(&tokens)?)
    }

    /// Unconditional (negative) embeddings first, then the prompt's, when guidance is on.
    fn text_embeddings(&self, request: &GenerationRequest, use_guidance: bool) -> Result<Tensor> {
        let cond = self.encode_prompt(&request.prompt)?;
        let embeddings = if use_guidance {
            let uncond = self.encode_prompt(&request.negative_prompt)?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        Ok(embeddings.to_dtype(self.dtype)?)
    }
}

impl SketchPipeline for ControlNetPipeline {
    fn run(
        &self,
        request: &GenerationRequest,
        conditioning: &ConditioningImage,
    ) -> Result<DynamicImage> {
        let (width, height) = conditioning.dimensions();
        if width % 8 != 0 || height % 8 != 0 {
            bail!("conditioning image must be a multiple of 8 on both sides, got {width}x{height}");
        }
        if request.steps == 0 {
            bail!("at least one denoising step is required");
        }
        let use_guidance = request.guidance_scale > 1.0;

        let text_embeddings = self.text_embeddings(request, use_guidance)?;
        let cond = gray_to_tensor(conditioning.as_luma(), &self.device, self.dtype)?;
        let cond = if use_guidance {
            Tensor::cat(&[&cond, &cond], 0)?
        } else {
            cond
        };

        let mut scheduler = self.sd_config.build_scheduler(request.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latent_shape = (
            1,
            LATENT_CHANNELS,
            height as usize / 8,
            width as usize / 8,
        );
        let latents = initial_noise(request.seed, latent_shape, &self.device)?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        for (index, &timestep) in timesteps.iter().enumerate() {
            let start = Instant::now();
            let model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;

            let residuals = self.controlnet.forward(
                &model_input,
                timestep as f64,
                &text_embeddings,
                &cond,
                request.conditioning_scale,
            )?;
            let noise_pred = self.unet.forward_with_additional_residuals(
                &model_input,
                timestep as f64,
                &text_embeddings,
                Some(residuals.down.as_slice()),
                Some(&residuals.mid),
            )?;

            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&chunks[0], &chunks[1]);
                (uncond + ((text - uncond)? * request.guidance_scale)?)?
            } else {
                noise_pred
            };

            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(
                step = index + 1,
                of = timesteps.len(),
                elapsed = ?start.elapsed(),
                "denoising step done"
            );
        }

        let decoded = self.vae.decode(&(latents / VAE_SCALE)?)?;
        let image = ((decoded / 2.)? + 0.5)?.to_device(&Device::Cpu)?;
        let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&image)
    }
}

/// Standard normal latents, reproducible when a seed is given.
fn initial_noise(
    seed: Option<u64>,
    shape: (usize, usize, usize, usize),
    device: &Device,
) -> Result<Tensor> {
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let len = shape.0 * shape.1 * shape.2 * shape.3;
    let noise: Vec<f32> = (0..len).map(|_| standard_normal(&mut rng)).collect();
    Ok(Tensor::from_vec(noise, shape, device)?)
}

// Box-Muller; the first uniform is kept in (0, 1] so the log is finite.
fn standard_normal(rng: &mut impl Rng) -> f32 {
    let u1 = 1.0 - rng.gen::<f32>();
    let u2 = rng.gen::<f32>();
    (-2.0 * u1.ln()).sqrt() * (2.0 * std::f32::consts::PI * u2).cos()
}

pub struct ControlNetLoader {
    api: Api,
    repos: ModelRepos,
}

impl ControlNetLoader {
    pub fn new(api: Api, repos: ModelRepos) -> Self {
        Self { api, repos }
    }
}

#[async_trait]
impl Loader<dyn SketchPipeline> for ControlNetLoader {
    async fn load(&self, target: &ComputeTarget) -> Result<Arc<dyn SketchPipeline>> {
        let use_f16 = target.use_f16();
        let weights = |stem: &str| {
            if use_f16 {
                format!("{stem}.fp16.safetensors")
            } else {
                format!("{stem}.safetensors")
            }
        };
        let base = self.repos.base.as_str();

        let tokenizer_file = fetch(&self.api, &self.repos.tokenizer, "tokenizer.json").await?;
        let clip_file = fetch(&self.api, base, &weights("text_encoder/model")).await?;
        let unet_file = fetch(&self.api, base, &weights("unet/diffusion_pytorch_model")).await?;
        let vae_file = fetch(&self.api, base, &weights("vae/diffusion_pytorch_model")).await?;
        let controlnet_file =
            fetch(&self.api, &self.repos.controlnet, &weights("diffusion_pytorch_model")).await?;

        let device = target.device.clone();
        let dtype = target.dtype;
        let build = move || -> Result<ControlNetPipeline> {
            let use_flash_attn = cfg!(feature = "flash-attn");
            let size = Some(CONDITIONING_SIZE as usize);
            let sd_config = StableDiffusionConfig::v1_5(None, size, size);

            let tokenizer = Tokenizer::from_file(tokenizer_file)
                .map_err(Error::msg)
                .context("failed to load CLIP tokenizer")?;
            let pad_id = *tokenizer
                .get_vocab(true)
                .get(END_OF_TEXT)
                .context("CLIP tokenizer has no end-of-text token")?;

            // The text encoder stays in f32; its embeddings are cast per request.
            let text_model = stable_diffusion::build_clip_transformer(
                &sd_config.clip,
                clip_file,
                &device,
                DType::F32,
            )
            .context("failed to load CLIP text encoder")?;
            let unet = sd_config
                .build_unet(unet_file, &device, LATENT_CHANNELS, use_flash_attn, dtype)
                .context("failed to load UNet")?;
            let vae = sd_config
                .build_vae(vae_file, &device, dtype)
                .context("failed to load VAE")?;

            let controlnet_vb = unsafe {
                VarBuilder::from_mmaped_safetensors(&[controlnet_file], dtype, &device)
                    .context("failed to build ControlNet var builder")?
            };
            let controlnet = model::ControlNet::new(
                controlnet_vb,
                LATENT_CHANNELS,
                use_flash_attn,
                &sd15_unet_config(None),
            )
            .context("failed to load ControlNet")?;

            Ok(ControlNetPipeline {
                device,
                dtype,
                sd_config,
                tokenizer,
                pad_id,
                text_model,
                unet,
                controlnet,
                vae,
            })
        };

        let pipeline = tokio::task::spawn_blocking(build)
            .await
            .context("pipeline construction panicked")??;
        Ok(Arc::new(pipeline))
    }
}
