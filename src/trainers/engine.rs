//! The diffusion training-step engine.
//!
//! One engine covers text-to-image, LoRA, DreamBooth, ControlNet, T2I-Adapter and
//! IP-Adapter training.
//! [`ModelConfig`] selects the facets (text-conditioning strategy, conditioning network,
//! LoRA, loss, timestep sampling) once at construction; trainability is fixed at the same
//! time. A step turns a raw batch into a canonical [`Batch`], encodes latents and text,
//! noises the latents and returns the loss against the scheduler's target.

use anyhow::Result;
use candle_core::{Device, Tensor, Var};
use candle_nn::Optimizer;
use image::{DynamicImage, RgbImage};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

use super::candle_image_utils::{batch_to_rgb, open_image, resize_rgb, rgb_to_unit_tensor};
use super::ddpm_scheduler::{DdpmScheduler, PredictionType};
use super::loss::LossInputs;
use super::memory_utils::clear_cuda_cache;
use super::noise::NoiseSource;
use super::sampling::{apply_guidance, DdimSampler, SamplingConfig};
use super::{ConditioningConfig, ModelConfig};
use crate::data::{Batch, BatchNormalizer, RawBatch, TextBatch};
use crate::error::{contract_bail, EngineError};
use crate::loaders::pretrained::{load_controlnet_dir, load_image_encoder_dir, load_ip_adapter_dir, load_t2i_adapter_dir};
use crate::loaders::ModelSource;
use crate::models::{
    AddedConditions, Autoencoder, CompactUNet, ConditioningNetwork, ControlInputs, ControlNet, Denoiser, IpAdapter,
    IpAdapterConfig, Residuals, T2IAdapter, T2IAdapterConfig, TextEncoderOutput, TextStack, TimeIdsConfig,
};

/// Named losses of one step; always holds `"loss"`.
pub type LossDict = HashMap<String, Tensor>;

const DEFAULT_SAMPLE_SEED: u64 = 42;

/// Condition image handed to [`DiffusionEngine::infer`].
#[derive(Debug, Clone)]
pub enum ConditionImage {
    Path(PathBuf),
    Image(DynamicImage),
}

impl From<PathBuf> for ConditionImage {
    fn from(path: PathBuf) -> Self {
        Self::Path(path)
    }
}

impl From<&Path> for ConditionImage {
    fn from(path: &Path) -> Self {
        Self::Path(path.to_path_buf())
    }
}

impl From<DynamicImage> for ConditionImage {
    fn from(img: DynamicImage) -> Self {
        Self::Image(img)
    }
}

impl ConditionImage {
    /// RGB, resized to `height` x `width`, `[3, H, W]` in `[0, 1]`.
    fn to_tensor(&self, height: usize, width: usize, device: &Device) -> Result<Tensor> {
        let rgb = match self {
            Self::Path(path) => resize_rgb(&open_image(path)?, height, width),
            Self::Image(img) => resize_rgb(img, height, width),
        };
        rgb_to_unit_tensor(&rgb, device)
    }
}

#[derive(Debug, Clone)]
pub struct InferenceRequest {
    pub prompts: Vec<String>,
    /// One per prompt when a conditioning network is trained.
    pub condition_images: Vec<ConditionImage>,
    pub negative_prompt: Option<String>,
    pub height: usize,
    pub width: usize,
    pub num_inference_steps: usize,
}

impl InferenceRequest {
    pub fn new(prompts: Vec<String>, height: usize, width: usize) -> Self {
        Self {
            prompts,
            condition_images: Vec::new(),
            negative_prompt: None,
            height,
            width,
            num_inference_steps: SamplingConfig::default().num_inference_steps,
        }
    }

    pub fn with_condition_images(mut self, images: Vec<ConditionImage>) -> Self {
        self.condition_images = images;
        self
    }

    pub fn with_negative_prompt(mut self, negative_prompt: impl Into<String>) -> Self {
        self.negative_prompt = Some(negative_prompt.into());
        self
    }

    pub fn with_steps(mut self, num_inference_steps: usize) -> Self {
        self.num_inference_steps = num_inference_steps;
        self
    }
}

fn build_conditioning(
    config: &ConditioningConfig,
    source: &ModelSource,
    unet: &CompactUNet,
    vae_scale_factor: usize,
    device: &Device,
) -> Result<ConditioningNetwork> {
    match config {
        ConditioningConfig::T2iAdapter {
            pretrained: Some(dir),
            ..
        } => {
            info!("Loading T2I-Adapter from {}", dir.display());
            Ok(ConditioningNetwork::Adapter(load_t2i_adapter_dir(dir, device)?))
        }
        ConditioningConfig::T2iAdapter {
            pretrained: None,
            channels,
            downscale_factor,
            num_res_blocks,
        } => {
            let mut adapter_config = T2IAdapterConfig::default();
            if let Some(channels) = channels {
                adapter_config.channels = channels.clone();
            }
            if let Some(factor) = downscale_factor {
                adapter_config.downscale_factor = *factor;
            }
            if let Some(blocks) = num_res_blocks {
                adapter_config.num_res_blocks = *blocks;
            }
            info!(
                "Initialising T2I-Adapter with channels {:?} and downscale factor {}",
                adapter_config.channels, adapter_config.downscale_factor
            );
            Ok(ConditioningNetwork::Adapter(T2IAdapter::new(adapter_config, device)?))
        }
        ConditioningConfig::Controlnet { pretrained: Some(dir) } => {
            info!("Loading ControlNet from {}", dir.display());
            Ok(ConditioningNetwork::Control(load_controlnet_dir(dir, device)?))
        }
        ConditioningConfig::Controlnet { pretrained: None } => {
            info!("Initialising ControlNet from the UNet weights");
            Ok(ConditioningNetwork::Control(ControlNet::from_unet(unet, vae_scale_factor, device)?))
        }
        ConditioningConfig::IpAdapter {
            pretrained,
            image_encoder,
            num_tokens,
            scale,
        } => {
            let image_encoder = match image_encoder {
                Some(dir) => {
                    info!("Loading image encoder from {}", dir.display());
                    load_image_encoder_dir(dir, device)?
                }
                None => source.load_image_encoder(None, device)?,
            };
            let mut adapter = match pretrained {
                Some(dir) => {
                    info!("Loading IP-Adapter from {}", dir.display());
                    let adapter = load_ip_adapter_dir(dir, device)?;
                    if let Some(tokens) = num_tokens {
                        if *tokens != adapter.config().num_tokens {
                            contract_bail!(
                                "num_tokens {} does not match the pretrained IP-Adapter's {}",
                                tokens,
                                adapter.config().num_tokens
                            );
                        }
                    }
                    adapter
                }
                None => {
                    let mut adapter_config = IpAdapterConfig::for_unet(unet.config(), image_encoder.embed_dim());
                    if let Some(tokens) = num_tokens {
                        adapter_config.num_tokens = *tokens;
                    }
                    info!(
                        "Initialising IP-Adapter with {} image tokens over {} cross-attention layers",
                        adapter_config.num_tokens,
                        adapter_config.layer_channels.len()
                    );
                    IpAdapter::from_unet(unet, adapter_config, device)?
                }
            };
            if adapter.config().image_embed_dim != image_encoder.embed_dim() {
                contract_bail!(
                    "the IP-Adapter expects {}-dim image embeddings, the image encoder gives {}",
                    adapter.config().image_embed_dim,
                    image_encoder.embed_dim()
                );
            }
            if let Some(scale) = scale {
                adapter.set_scale(*scale);
            }
            Ok(ConditioningNetwork::ImagePrompt { adapter, image_encoder })
        }
    }
}

pub struct DiffusionEngine {
    config: ModelConfig,
    source: ModelSource,
    device: Device,
    vae: Box<dyn Autoencoder>,
    /// `None` when text embeddings are pre-computed.
    text: Option<TextStack>,
    unet: Box<dyn Denoiser>,
    scheduler: DdpmScheduler,
    conditioning: Option<ConditioningNetwork>,
    normalizer: BatchNormalizer,
    noise: NoiseSource,
    trainable: Vec<Var>,
}

impl DiffusionEngine {
    /// Reject contradictory facet combinations. Runs before anything is loaded.
    pub fn validate(config: &ModelConfig) -> Result<ModelSource> {
        if config.conditioning.is_some() {
            if let Some(lora) = &config.lora {
                contract_bail!(
                    "lora should be None when training a conditioning network, got rank {}",
                    lora.rank
                );
            }
            if config.finetune_text_encoder {
                contract_bail!("finetune_text_encoder should be false when training a conditioning network");
            }
        }
        if config.gradient_checkpointing {
            return Err(EngineError::NotImplemented(
                "gradient_checkpointing is not supported, candle's autograd keeps every activation".to_string(),
            )
            .into());
        }
        if config.pre_compute_text_embeddings && config.finetune_text_encoder {
            contract_bail!("finetune_text_encoder needs text encoders, but pre_compute_text_embeddings drops them");
        }
        if config.prior_loss_weight < 0.0 {
            contract_bail!("prior_loss_weight must be non-negative, got {}", config.prior_loss_weight);
        }
        config.source()
    }

    pub fn from_config(config: ModelConfig, device: &Device) -> Result<Self> {
        let source = Self::validate(&config)?;
        info!("Building diffusion engine from {}", source.describe());

        let vae = source.load_vae(config.vae.as_deref(), device)?;
        let text = if config.pre_compute_text_embeddings {
            info!("Text embeddings are pre-computed, no text encoder is loaded.");
            None
        } else {
            let lora = if config.finetune_text_encoder { config.lora } else { None };
            Some(source.load_text_stack(lora, device)?)
        };
        let unet = source.load_unet(config.lora, device)?;
        let scheduler_config = match &config.scheduler {
            Some(scheduler) => scheduler.clone(),
            None => source.scheduler_config()?,
        };
        let scheduler = DdpmScheduler::new(scheduler_config, device)?;
        let conditioning = match &config.conditioning {
            Some(cond) => Some(build_conditioning(cond, &source, &unet, vae.spatial_scale_factor(), device)?),
            None => None,
        };
        let normalizer = match conditioning {
            Some(ConditioningNetwork::ImagePrompt { .. }) => BatchNormalizer::ImagePrompt,
            Some(_) => BatchNormalizer::Conditioned,
            None => BatchNormalizer::Standard,
        };

        let mut engine = Self {
            noise: NoiseSource::new(config.seed),
            config,
            source,
            device: device.clone(),
            vae: Box::new(vae),
            text,
            unet: Box::new(unet),
            scheduler,
            conditioning,
            normalizer,
            trainable: Vec::new(),
        };
        engine.prepare_model()?;
        Ok(engine)
    }

    /// Decide once which parameters the optimizer sees.
    fn prepare_model(&mut self) -> Result<()> {
        let mut trainable = Vec::new();
        info!("Set VAE untrainable.");

        if let Some(text) = &self.text {
            if self.config.finetune_text_encoder {
                for (i, encoder) in text.encoders.iter().enumerate() {
                    let Some(weights) = encoder.weights() else {
                        contract_bail!("text encoder {} holds frozen pretrained weights and cannot be fine-tuned", i + 1);
                    };
                    if weights.lora.is_some() {
                        trainable.extend(weights.lora_vars());
                        info!("Set Text Encoder {} LoRA trainable.", i + 1);
                    } else {
                        trainable.extend(weights.base_vars());
                        info!("Set Text Encoder {} trainable.", i + 1);
                    }
                }
            } else {
                info!("Set Text Encoder untrainable.");
            }
        }

        let unet_weights = self.unet.weights();
        match &self.conditioning {
            Some(network) => {
                info!("Set UNet untrainable.");
                if network.image_encoder().is_some() {
                    info!("Set image encoder untrainable.");
                }
                trainable.extend(network.weights().base_vars());
                info!("Set {} trainable.", network.name());
            }
            None if unet_weights.lora.is_some() => {
                trainable.extend(unet_weights.lora_vars());
                info!("Set UNet untrainable, UNet LoRA trainable.");
            }
            None => {
                trainable.extend(unet_weights.base_vars());
                info!("Set UNet trainable.");
            }
        }

        let params: usize = trainable.iter().map(|v| v.elem_count()).sum();
        info!("{} trainable tensors, {} parameters", trainable.len(), params);
        self.trainable = trainable;
        Ok(())
    }

    pub fn config(&self) -> &ModelConfig {
        &self.config
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn source(&self) -> &ModelSource {
        &self.source
    }

    /// Parameters the optimizer updates.
    pub fn trainable_vars(&self) -> &[Var] {
        &self.trainable
    }

    pub fn vae(&self) -> &dyn Autoencoder {
        self.vae.as_ref()
    }

    pub fn unet(&self) -> &dyn Denoiser {
        self.unet.as_ref()
    }

    pub fn text_stack(&self) -> Option<&TextStack> {
        self.text.as_ref()
    }

    pub fn conditioning(&self) -> Option<&ConditioningNetwork> {
        self.conditioning.as_ref()
    }

    pub fn scheduler(&self) -> &DdpmScheduler {
        &self.scheduler
    }

    pub fn normalizer(&self) -> BatchNormalizer {
        self.normalizer
    }

    /// Restart every random draw of the step from `seed`.
    pub fn reseed(&mut self, seed: u64) {
        self.noise.reseed(seed);
    }

    /// `[B, 1, 1, 1]`: 1 for the instance half of the batch, `prior_loss_weight` for the
    /// class half.
    pub fn prior_loss_weights(&self, batch_size: usize) -> Result<Tensor> {
        if batch_size % 2 != 0 {
            contract_bail!("prior preservation needs an even batch, got {}", batch_size);
        }
        let half = batch_size / 2;
        let weights: Vec<f32> = std::iter::repeat(1.0)
            .take(half)
            .chain(std::iter::repeat(self.config.prior_loss_weight as f32).take(half))
            .collect();
        Ok(Tensor::from_vec(weights, (batch_size, 1, 1, 1), &self.device)?)
    }

    /// Sampled, scaled latents. The autoencoder is frozen, so the result is detached.
    fn encode_latents(&mut self, img: &Tensor) -> Result<Tensor> {
        let dist = self.vae.encode(&img.to_device(&self.device)?)?;
        let eps = self.noise.randn(dist.mean.shape().clone(), &self.device)?;
        let latents = (dist.sample_with(&eps)? * self.vae.scaling_factor())?;
        Ok(latents.detach())
    }

    /// Token-level hidden states and pooled embedding for the batch.
    fn text_conditioning(&self, text: &TextBatch) -> Result<(Tensor, Tensor)> {
        match (text, &self.text) {
            (TextBatch::Prompts(prompts), Some(stack)) => {
                let out = stack.encode(prompts, &self.device)?;
                if self.config.finetune_text_encoder {
                    Ok((out.hidden_states, out.pooled))
                } else {
                    Ok((out.hidden_states.detach(), out.pooled.detach()))
                }
            }
            (
                TextBatch::Embeddings {
                    prompt_embeds,
                    pooled_prompt_embeds,
                },
                None,
            ) => Ok((
                prompt_embeds.to_device(&self.device)?,
                pooled_prompt_embeds.to_device(&self.device)?,
            )),
            (TextBatch::Prompts(_), None) => {
                contract_bail!("text embeddings are pre-computed for this model, but the batch carries prompts")
            }
            (TextBatch::Embeddings { .. }, Some(_)) => {
                contract_bail!("the batch carries pre-computed embeddings, but pre_compute_text_embeddings is off")
            }
        }
    }

    fn added_conditions(&self, time_ids: Option<&Tensor>, pooled: &Tensor) -> Result<Option<AddedConditions>> {
        if !self.unet.uses_added_conditions() {
            return Ok(None);
        }
        match time_ids {
            Some(time_ids) => Ok(Some(AddedConditions {
                time_ids: time_ids.to_device(&self.device)?,
                text_embeds: pooled.clone(),
            })),
            None => contract_bail!("this denoiser is conditioned on resolution, but the batch has no time_ids"),
        }
    }

    /// Loss of one canonical batch.
    pub fn forward(&mut self, batch: &Batch) -> Result<LossDict> {
        let prediction_type = self.scheduler.prediction_type()?;
        let batch_size = batch.batch_size()?;

        let (encoder_hidden_states, pooled) = self.text_conditioning(&batch.text)?;
        let weight = if batch.prior_preservation {
            Some(self.prior_loss_weights(batch_size)?)
        } else {
            None
        };

        let latents = self.encode_latents(&batch.img)?;
        let noise = self.noise.latent_noise(&latents, self.config.noise_offset_weight)?;
        let timesteps = self.config.timestep_sampling.sample(
            &mut self.noise,
            batch_size,
            self.scheduler.num_train_timesteps(),
            &self.device,
        )?;
        let noisy_latents = self.scheduler.add_noise(&latents, &noise, &timesteps)?;
        let target = match prediction_type {
            PredictionType::Epsilon => noise,
            PredictionType::VPrediction => self.scheduler.get_velocity(&latents, &noise, &timesteps)?,
        };

        let added = self.added_conditions(batch.time_ids.as_ref(), &pooled)?;
        let condition = match &self.conditioning {
            Some(ConditioningNetwork::ImagePrompt { .. }) => batch.clip_img.as_ref(),
            _ => batch.condition_img.as_ref(),
        };
        let residuals = match (&self.conditioning, condition) {
            (Some(ConditioningNetwork::ImagePrompt { .. }), None) => {
                contract_bail!("clip_img is required when training an image-prompt adapter")
            }
            (Some(network), Some(condition)) => network.residuals(
                &condition.to_device(&self.device)?,
                &ControlInputs {
                    sample: &noisy_latents,
                    timesteps: &timesteps,
                    encoder_hidden_states: &encoder_hidden_states,
                    added: added.as_ref(),
                },
            )?,
            (Some(_), None) => contract_bail!("condition_img is required when training a conditioning network"),
            (None, _) => Residuals::None,
        };

        let model_pred = self.unet.forward(
            &noisy_latents,
            &timesteps,
            &encoder_hidden_states,
            added.as_ref(),
            &residuals,
        )?;

        let loss = self.config.loss.compute(&LossInputs {
            pred: &model_pred,
            target: &target,
            weight: weight.as_ref(),
            timesteps: &timesteps,
            alphas_cumprod: self.scheduler.alphas_cumprod(),
        })?;
        debug!("{} loss over {} examples", self.config.loss.name(), batch_size);

        let mut losses = LossDict::new();
        losses.insert("loss".to_string(), loss);
        Ok(losses)
    }

    /// Normalize a raw batch and compute its losses, without touching the weights.
    pub fn compute_losses(&mut self, raw: RawBatch) -> Result<LossDict> {
        let batch = self.normalizer.normalize(raw)?;
        self.forward(&batch)
    }

    /// One optimization step over `trainable_vars()`.
    pub fn train_step<O: Optimizer>(&mut self, raw: RawBatch, optimizer: &mut O) -> Result<LossDict> {
        let losses = self.compute_losses(raw)?;
        let loss = losses
            .get("loss")
            .ok_or_else(|| anyhow::anyhow!("loss dict has no `loss` entry"))?;
        optimizer.backward_step(loss)?;
        Ok(losses)
    }

    pub fn val_step(&mut self, _raw: RawBatch) -> Result<LossDict> {
        Err(EngineError::NotImplemented(
            "`val_step` is not implemented, sample images with `infer` instead".to_string(),
        )
        .into())
    }

    pub fn test_step(&mut self, _raw: RawBatch) -> Result<LossDict> {
        Err(EngineError::NotImplemented(
            "`test_step` is not implemented, sample images with `infer` instead".to_string(),
        )
        .into())
    }

    /// Generate one image per prompt with the networks currently held.
    ///
    /// When text embeddings are pre-computed the text encoders are loaded for this call only.
    /// The pipeline is dropped and the accelerator synchronized before returning.
    pub fn infer(&self, request: &InferenceRequest) -> Result<Vec<RgbImage>> {
        let n = request.prompts.len();
        if n == 0 {
            return Ok(Vec::new());
        }
        match &self.conditioning {
            Some(_) if request.condition_images.len() != n => contract_bail!(
                "got {} prompts but {} condition images",
                n,
                request.condition_images.len()
            ),
            None if !request.condition_images.is_empty() => {
                warn!("Ignoring condition images, no conditioning network is trained");
            }
            _ => {}
        }
        let vae_scale = self.vae.spatial_scale_factor();
        if request.height % vae_scale != 0 || request.width % vae_scale != 0 {
            contract_bail!(
                "height and width must be multiples of {}, got {}x{}",
                vae_scale,
                request.height,
                request.width
            );
        }
        if let Some(ConditioningNetwork::Adapter(adapter)) = &self.conditioning {
            let factor = adapter.total_downscale_factor();
            if request.height % factor != 0 || request.width % factor != 0 {
                contract_bail!(
                    "the adapter needs height and width divisible by {}, got {}x{}",
                    factor,
                    request.height,
                    request.width
                );
            }
        }
        let sampler = DdimSampler::new(&self.scheduler, request.num_inference_steps)?;

        let images = {
            let loaded;
            let text = match &self.text {
                Some(text) => text,
                None => {
                    info!("Loading text encoders from {} for sampling", self.source.describe());
                    loaded = self.source.load_text_stack(None, &self.device)?;
                    &loaded
                }
            };
            let pipeline = InferencePipeline {
                vae: self.vae.as_ref(),
                unet: self.unet.as_ref(),
                conditioning: self.conditioning.as_ref(),
                text,
                sampler,
                guidance_scale: self.config.guidance_scale,
                device: &self.device,
            };
            let mut noise = NoiseSource::new(Some(self.config.seed.unwrap_or(DEFAULT_SAMPLE_SEED)));
            pipeline.run(request, &mut noise)?
        };
        clear_cuda_cache(&self.device)?;
        Ok(images)
    }
}

/// Borrowed view over the networks for one `infer` call.
struct InferencePipeline<'a> {
    vae: &'a dyn Autoencoder,
    unet: &'a dyn Denoiser,
    conditioning: Option<&'a ConditioningNetwork>,
    text: &'a TextStack,
    sampler: DdimSampler,
    guidance_scale: f64,
    device: &'a Device,
}

impl InferencePipeline<'_> {
    /// Hidden states and pooled embeddings, batched `[uncond; cond]` under guidance.
    fn encode_prompts(&self, request: &InferenceRequest, guided: bool) -> Result<TextEncoderOutput> {
        let n = request.prompts.len();
        let cond = self.text.encode(&request.prompts, self.device)?;
        if !guided {
            return Ok(cond);
        }
        let uncond = match &request.negative_prompt {
            Some(negative) => self.text.encode(&vec![negative.clone(); n], self.device)?,
            None if self.text.is_dual() => TextEncoderOutput {
                hidden_states: cond.hidden_states.zeros_like()?,
                pooled: cond.pooled.zeros_like()?,
            },
            None => self.text.encode(&vec![String::new(); n], self.device)?,
        };
        Ok(TextEncoderOutput {
            hidden_states: Tensor::cat(&[&uncond.hidden_states, &cond.hidden_states], 0)?,
            pooled: Tensor::cat(&[&uncond.pooled, &cond.pooled], 0)?,
        })
    }

    fn run(&self, request: &InferenceRequest, noise: &mut NoiseSource) -> Result<Vec<RgbImage>> {
        let n = request.prompts.len();
        let (height, width) = (request.height, request.width);
        let guided = self.guidance_scale > 1.0;
        let text = self.encode_prompts(request, guided)?;
        let rows = text.hidden_states.dim(0)?;

        let added = if self.unet.uses_added_conditions() {
            let ids = vec![TimeIdsConfig::new(height, width); rows];
            Some(AddedConditions {
                time_ids: TimeIdsConfig::batch_tensor(&ids, self.device)?,
                text_embeds: text.pooled.clone(),
            })
        } else {
            None
        };

        let condition = match self.conditioning {
            Some(network) => {
                let (h, w) = match network.condition_size() {
                    Some(size) => (size, size),
                    None => (height, width),
                };
                let images = request
                    .condition_images
                    .iter()
                    .map(|img| img.to_tensor(h, w, self.device))
                    .collect::<Result<Vec<_>>>()?;
                Some(Tensor::stack(&images, 0)?)
            }
            None => None,
        };

        let scale = self.vae.spatial_scale_factor();
        let mut latents = noise.randn(
            (n, self.vae.latent_channels(), height / scale, width / scale),
            self.device,
        )?;
        let mut cached_residuals: Option<Residuals> = None;

        for (i, &t) in self.sampler.timesteps().iter().enumerate() {
            let model_input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let timesteps = Tensor::from_vec(vec![t as i64; rows], rows, self.device)?;

            let residuals = match (self.conditioning, &condition) {
                _ if cached_residuals.is_some() => cached_residuals.clone().unwrap_or_default(),
                (Some(network), Some(condition)) => {
                    let inputs = ControlInputs {
                        sample: &model_input,
                        timesteps: &timesteps,
                        encoder_hidden_states: &text.hidden_states,
                        added: added.as_ref(),
                    };
                    let residuals = if guided {
                        network.guided_residuals(condition, &inputs)?
                    } else {
                        network.residuals(condition, &inputs)?
                    };
                    if !network.depends_on_sample() {
                        cached_residuals = Some(residuals.clone());
                    }
                    residuals
                }
                _ => Residuals::None,
            };

            let pred = self.unet.forward(
                &model_input,
                &timesteps,
                &text.hidden_states,
                added.as_ref(),
                &residuals,
            )?;
            let pred = if guided {
                apply_guidance(&pred, self.guidance_scale)?
            } else {
                pred
            };
            latents = self.sampler.step(&pred, i, &latents)?.detach();
        }

        let decoded = self.vae.decode(&(latents / self.vae.scaling_factor())?)?;
        batch_to_rgb(&decoded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ClassImageBatch, TextInput};
    use crate::loaders::CompactPreset;
    use crate::models::LoraConfig;
    use crate::trainers::ddpm_scheduler::DdpmSchedulerConfig;
    use candle_core::DType;
    use candle_nn::{AdamW, ParamsAdamW};

    fn images(n: usize, size: usize, device: &Device) -> Result<Vec<Tensor>> {
        Ok((0..n)
            .map(|_| Tensor::rand(-1f32, 1.0, (3, size, size), device))
            .collect::<candle_core::Result<Vec<_>>>()?)
    }

    fn time_ids(n: usize, size: usize, device: &Device) -> Result<Vec<Tensor>> {
        (0..n)
            .map(|_| TimeIdsConfig::new(size, size).to_tensor(device))
            .collect()
    }

    fn prompt_batch(n: usize, device: &Device) -> Result<RawBatch> {
        let prompts = TextInput::Prompts(vec!["a photo of sks dog".to_string(); n]);
        Ok(RawBatch::new(images(n, 64, device)?, prompts).with_time_ids(time_ids(n, 64, device)?))
    }

    fn adapter_config() -> ModelConfig {
        let mut config = ModelConfig::compact(CompactPreset::TinyXl);
        config.conditioning = Some(ConditioningConfig::T2iAdapter {
            pretrained: None,
            channels: Some(vec![32, 64]),
            downscale_factor: Some(4),
            num_res_blocks: Some(1),
        });
        config
    }

    fn error_of<T>(result: Result<T>) -> Result<anyhow::Error> {
        match result {
            Ok(_) => anyhow::bail!("expected an error"),
            Err(err) => Ok(err),
        }
    }

    fn is_contract_violation(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<EngineError>(), Some(EngineError::ContractViolation(_)))
    }

    #[test]
    fn step_returns_scalar_loss() -> Result<()> {
        let device = Device::Cpu;
        let mut engine = DiffusionEngine::from_config(ModelConfig::compact(CompactPreset::TinyXl), &device)?;
        let losses = engine.compute_losses(prompt_batch(1, &device)?)?;
        let loss = losses.get("loss").ok_or_else(|| anyhow::anyhow!("no loss"))?;
        assert_eq!(loss.dims(), &[] as &[usize]);
        assert_eq!(loss.dtype(), DType::F32);
        assert!(loss.to_scalar::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn reseeding_makes_steps_reproducible() -> Result<()> {
        let device = Device::Cpu;
        let mut engine = DiffusionEngine::from_config(ModelConfig::compact(CompactPreset::TinyXl), &device)?;
        let batch = prompt_batch(2, &device)?;

        engine.reseed(7);
        let first = engine.compute_losses(batch.clone())?["loss"].to_scalar::<f32>()?;
        engine.reseed(7);
        let second = engine.compute_losses(batch)?["loss"].to_scalar::<f32>()?;
        assert_eq!(first, second);
        Ok(())
    }

    #[test]
    fn unknown_prediction_type_fails_the_step() -> Result<()> {
        let device = Device::Cpu;
        let mut config = ModelConfig::compact(CompactPreset::TinyXl);
        config.scheduler = Some(DdpmSchedulerConfig {
            prediction_type: "sample".to_string(),
            ..DdpmSchedulerConfig::default()
        });
        let mut engine = DiffusionEngine::from_config(config, &device)?;
        let err = error_of(engine.compute_losses(prompt_batch(1, &device)?))?;
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::UnknownPredictionType(name)) if name == "sample"
        ));
        Ok(())
    }

    #[test]
    fn v_prediction_trains() -> Result<()> {
        let device = Device::Cpu;
        let mut config = ModelConfig::compact(CompactPreset::Tiny);
        config.scheduler = Some(DdpmSchedulerConfig {
            prediction_type: "v_prediction".to_string(),
            ..DdpmSchedulerConfig::default()
        });
        let mut engine = DiffusionEngine::from_config(config, &device)?;
        let raw = RawBatch::new(images(1, 32, &device)?, TextInput::Prompts(vec!["a cat".to_string()]));
        let losses = engine.compute_losses(raw)?;
        assert!(losses["loss"].to_scalar::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn class_images_weight_the_second_half() -> Result<()> {
        let device = Device::Cpu;
        let mut config = ModelConfig::compact(CompactPreset::TinyXl);
        config.prior_loss_weight = 0.25;
        let mut engine = DiffusionEngine::from_config(config, &device)?;

        let weights = engine.prior_loss_weights(4)?;
        assert_eq!(weights.dims(), &[4, 1, 1, 1]);
        assert_eq!(weights.flatten_all()?.to_vec1::<f32>()?, vec![1.0, 1.0, 0.25, 0.25]);
        assert!(engine.prior_loss_weights(3).is_err());

        let raw = prompt_batch(1, &device)?.with_class_images(ClassImageBatch {
            img: images(1, 64, &device)?,
            text: TextInput::Prompts(vec!["a photo of dog".to_string()]),
            time_ids: Some(time_ids(1, 64, &device)?),
        });
        let losses = engine.compute_losses(raw)?;
        assert!(losses["loss"].to_scalar::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn missing_time_ids_are_rejected() -> Result<()> {
        let device = Device::Cpu;
        let mut engine = DiffusionEngine::from_config(ModelConfig::compact(CompactPreset::TinyXl), &device)?;
        let raw = RawBatch::new(images(1, 64, &device)?, TextInput::Prompts(vec!["a dog".to_string()]));
        let err = error_of(engine.compute_losses(raw))?;
        assert!(is_contract_violation(&err));
        Ok(())
    }

    #[test]
    fn conditioning_network_rejects_lora() -> Result<()> {
        let mut config = adapter_config();
        config.lora = Some(LoraConfig::new(4));
        let err = error_of(DiffusionEngine::from_config(config, &Device::Cpu))?;
        assert!(is_contract_violation(&err));

        let mut config = ModelConfig::compact(CompactPreset::TinyXl);
        config.conditioning = Some(ConditioningConfig::Controlnet { pretrained: None });
        config.finetune_text_encoder = true;
        let err = error_of(DiffusionEngine::from_config(config, &Device::Cpu))?;
        assert!(is_contract_violation(&err));
        Ok(())
    }

    #[test]
    fn rejection_happens_before_loading() -> Result<()> {
        // The directory does not exist: a load attempt would fail with a different error.
        let mut config = adapter_config();
        config.compact = None;
        config.pretrained_model_name_or_path = Some(PathBuf::from("/nonexistent/model"));
        config.lora = Some(LoraConfig::new(8));
        let err = error_of(DiffusionEngine::from_config(config, &Device::Cpu))?;
        assert!(is_contract_violation(&err));
        Ok(())
    }

    #[test]
    fn adapter_overrides_divide_the_resolution() -> Result<()> {
        let device = Device::Cpu;
        let mut engine = DiffusionEngine::from_config(adapter_config(), &device)?;
        let adapter = match engine.conditioning() {
            Some(ConditioningNetwork::Adapter(adapter)) => adapter,
            _ => anyhow::bail!("expected a T2I-Adapter"),
        };
        assert_eq!(adapter.config().channels, vec![32, 64]);
        assert_eq!(adapter.downscale_factor(), 4);
        assert_eq!(64 % adapter.downscale_factor(), 0);
        assert_eq!(64 % adapter.total_downscale_factor(), 0);

        let adapter_vars = adapter.weights().base_vars().len();
        assert_eq!(engine.trainable_vars().len(), adapter_vars);

        let raw = prompt_batch(1, &device)?.with_condition_img(vec![Tensor::rand(0f32, 1.0, (3, 64, 64), &device)?]);
        let losses = engine.compute_losses(raw)?;
        assert!(losses["loss"].to_scalar::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn conditioning_variant_rejects_class_images() -> Result<()> {
        let device = Device::Cpu;
        let mut engine = DiffusionEngine::from_config(adapter_config(), &device)?;
        let raw = prompt_batch(1, &device)?
            .with_condition_img(images(1, 64, &device)?)
            .with_class_images(ClassImageBatch {
                img: images(1, 64, &device)?,
                text: TextInput::Prompts(vec!["a dog".to_string()]),
                time_ids: Some(time_ids(1, 64, &device)?),
            });
        let err = error_of(engine.compute_losses(raw))?;
        assert!(is_contract_violation(&err));
        Ok(())
    }

    #[test]
    fn controlnet_step_runs() -> Result<()> {
        let device = Device::Cpu;
        let mut config = ModelConfig::compact(CompactPreset::TinyXl);
        config.conditioning = Some(ConditioningConfig::Controlnet { pretrained: None });
        let mut engine = DiffusionEngine::from_config(config, &device)?;
        assert_eq!(engine.conditioning().map(|c| c.name()), Some("controlnet"));
        let raw = prompt_batch(1, &device)?.with_condition_img(vec![Tensor::rand(0f32, 1.0, (3, 64, 64), &device)?]);
        let losses = engine.compute_losses(raw)?;
        assert!(losses["loss"].to_scalar::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn inference_returns_one_image_per_prompt() -> Result<()> {
        let device = Device::Cpu;
        let engine = DiffusionEngine::from_config(adapter_config(), &device)?;
        let dir = tempfile::tempdir()?;
        let cond_path = dir.path().join("edges.png");
        image::RgbImage::from_pixel(80, 80, image::Rgb([255, 255, 255])).save(&cond_path)?;

        let request = InferenceRequest::new(vec!["a photo of a dog".to_string()], 64, 64)
            .with_condition_images(vec![ConditionImage::from(cond_path.as_path())])
            .with_steps(3);
        let images = engine.infer(&request)?;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].dimensions(), (64, 64));
        assert_eq!(images[0].as_raw().len(), 64 * 64 * 3);
        Ok(())
    }

    #[test]
    fn inference_checks_condition_image_count() -> Result<()> {
        let engine = DiffusionEngine::from_config(adapter_config(), &Device::Cpu)?;
        let request = InferenceRequest::new(vec!["a".to_string(), "b".to_string()], 64, 64).with_condition_images(vec![
            ConditionImage::from(DynamicImage::new_rgb8(64, 64)),
        ]);
        let err = error_of(engine.infer(&request))?;
        assert!(is_contract_violation(&err));
        Ok(())
    }

    fn ip_adapter_config() -> ModelConfig {
        let mut config = ModelConfig::compact(CompactPreset::TinyXl);
        config.conditioning = Some(ConditioningConfig::IpAdapter {
            pretrained: None,
            image_encoder: None,
            num_tokens: None,
            scale: None,
        });
        config
    }

    #[test]
    fn ip_adapter_rejects_lora_and_text_encoder_finetuning() -> Result<()> {
        let mut config = ip_adapter_config();
        config.lora = Some(LoraConfig::new(8));
        assert!(is_contract_violation(&error_of(DiffusionEngine::from_config(config, &Device::Cpu))?));

        let mut config = ip_adapter_config();
        config.finetune_text_encoder = true;
        assert!(is_contract_violation(&error_of(DiffusionEngine::from_config(config, &Device::Cpu))?));
        Ok(())
    }

    #[test]
    fn ip_adapter_step_trains_only_the_adapter() -> Result<()> {
        let device = Device::Cpu;
        let mut engine = DiffusionEngine::from_config(ip_adapter_config(), &device)?;
        assert_eq!(engine.normalizer(), BatchNormalizer::ImagePrompt);
        let adapter_vars = match engine.conditioning() {
            Some(network @ ConditioningNetwork::ImagePrompt { .. }) => network.weights().base_vars().len(),
            _ => anyhow::bail!("expected an IP-Adapter"),
        };
        assert_eq!(engine.trainable_vars().len(), adapter_vars);

        let err = error_of(engine.compute_losses(prompt_batch(1, &device)?))?;
        assert!(is_contract_violation(&err));

        let mut optimizer = AdamW::new(
            engine.trainable_vars().to_vec(),
            ParamsAdamW {
                lr: 1e-3,
                ..ParamsAdamW::default()
            },
        )?;
        let raw = prompt_batch(1, &device)?.with_clip_img(vec![Tensor::rand(0f32, 1.0, (3, 32, 32), &device)?]);
        let losses = engine.train_step(raw, &mut optimizer)?;
        assert!(losses["loss"].to_scalar::<f32>()?.is_finite());
        Ok(())
    }

    #[test]
    fn ip_adapter_inference_with_and_without_negative_prompt() -> Result<()> {
        let device = Device::Cpu;
        let engine = DiffusionEngine::from_config(ip_adapter_config(), &device)?;
        let prompt_image = ConditionImage::from(DynamicImage::new_rgb8(48, 40));

        let request = InferenceRequest::new(vec!["a photo of a dog".to_string()], 64, 64)
            .with_condition_images(vec![prompt_image.clone()])
            .with_steps(2);
        let images = engine.infer(&request)?;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].dimensions(), (64, 64));

        let images = engine.infer(&request.with_negative_prompt("blurry"))?;
        assert_eq!(images.len(), 1);
        assert_eq!(images[0].dimensions(), (64, 64));
        Ok(())
    }

    #[test]
    fn ip_adapter_overrides_reach_the_adapter() -> Result<()> {
        let mut config = ModelConfig::compact(CompactPreset::TinyXl);
        config.conditioning = Some(ConditioningConfig::IpAdapter {
            pretrained: None,
            image_encoder: None,
            num_tokens: Some(2),
            scale: Some(0.6),
        });
        let engine = DiffusionEngine::from_config(config, &Device::Cpu)?;
        match engine.conditioning() {
            Some(ConditioningNetwork::ImagePrompt { adapter, image_encoder }) => {
                assert_eq!(adapter.config().num_tokens, 2);
                assert_eq!(adapter.config().scale, 0.6);
                assert_eq!(adapter.config().image_embed_dim, image_encoder.embed_dim());
            }
            _ => anyhow::bail!("expected an IP-Adapter"),
        }
        Ok(())
    }

    #[test]
    fn gradient_checkpointing_is_rejected() -> Result<()> {
        let mut config = ModelConfig::compact(CompactPreset::Tiny);
        config.gradient_checkpointing = true;
        let err = error_of(DiffusionEngine::from_config(config, &Device::Cpu))?;
        assert!(matches!(
            err.downcast_ref::<EngineError>(),
            Some(EngineError::NotImplemented(msg)) if msg.starts_with("gradient_checkpointing")
        ));
        Ok(())
    }

    #[test]
    fn precomputed_embeddings_skip_text_encoders() -> Result<()> {
        let device = Device::Cpu;
        let mut config = ModelConfig::compact(CompactPreset::TinyXl);
        config.pre_compute_text_embeddings = true;
        let mut engine = DiffusionEngine::from_config(config, &device)?;
        assert!(engine.text_stack().is_none());

        let raw = RawBatch::new(
            images(1, 64, &device)?,
            TextInput::Embeddings {
                prompt_embeds: vec![Tensor::randn(0f32, 1.0, (77, 64), &device)?],
                pooled_prompt_embeds: vec![Tensor::randn(0f32, 1.0, 32, &device)?],
            },
        )
        .with_time_ids(vec![Tensor::new(&[[64f32, 64., 0., 0., 64., 64.]], &device)?]);
        let losses = engine.compute_losses(raw)?;
        assert_eq!(losses["loss"].dims(), &[] as &[usize]);

        let err = error_of(engine.compute_losses(prompt_batch(1, &device)?))?;
        assert!(is_contract_violation(&err));

        // Sampling loads the encoders for the duration of the call.
        let images = engine.infer(&InferenceRequest::new(vec!["a dog".to_string()], 32, 32).with_steps(2))?;
        assert_eq!(images.len(), 1);
        assert!(engine.text_stack().is_none());
        Ok(())
    }

    #[test]
    fn validation_and_test_steps_are_not_implemented() -> Result<()> {
        let device = Device::Cpu;
        let mut engine = DiffusionEngine::from_config(ModelConfig::compact(CompactPreset::Tiny), &device)?;
        let raw = RawBatch::new(images(1, 32, &device)?, TextInput::Prompts(vec!["x".to_string()]));
        let err = error_of(engine.val_step(raw.clone()))?;
        assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::NotImplemented(msg)) if msg.starts_with("`val_step`")));
        let err = error_of(engine.test_step(raw))?;
        assert!(matches!(err.downcast_ref::<EngineError>(), Some(EngineError::NotImplemented(_))));
        Ok(())
    }

    #[test]
    fn lora_training_updates_only_adapters() -> Result<()> {
        let device = Device::Cpu;
        let mut config = ModelConfig::compact(CompactPreset::Tiny);
        config.lora = Some(LoraConfig::new(4));
        config.seed = Some(3);
        let mut engine = DiffusionEngine::from_config(config, &device)?;
        let lora_vars = engine.unet().weights().lora_vars();
        assert_eq!(engine.trainable_vars().len(), lora_vars.len());

        let before: Vec<f32> = lora_vars
            .iter()
            .map(|v| v.as_tensor().abs()?.sum_all()?.to_scalar::<f32>())
            .collect::<candle_core::Result<_>>()?;
        let mut optimizer = AdamW::new(
            engine.trainable_vars().to_vec(),
            ParamsAdamW {
                lr: 1e-2,
                ..Default::default()
            },
        )?;
        let raw = RawBatch::new(images(1, 32, &device)?, TextInput::Prompts(vec!["a cat".to_string()]));
        engine.train_step(raw, &mut optimizer)?;
        let after: Vec<f32> = lora_vars
            .iter()
            .map(|v| v.as_tensor().abs()?.sum_all()?.to_scalar::<f32>())
            .collect::<candle_core::Result<_>>()?;
        assert_ne!(before, after);
        Ok(())
    }
}
