pub mod candle_image_utils;
pub mod ddpm_scheduler;
pub mod engine;
pub mod export;
pub mod loss;
pub mod memory_utils;
pub mod noise;
pub mod runner;
pub mod sampling;
pub mod training_helpers;

// Re-export key types
pub use ddpm_scheduler::{DdpmScheduler, DdpmSchedulerConfig, PredictionType};
pub use engine::{ConditionImage, DiffusionEngine, InferenceRequest, LossDict};
pub use export::{save_model, SAVE_KEYS};
pub use loss::DiffusionLoss;
pub use noise::{NoiseSource, TimestepSampling};
pub use runner::TrainingRunner;
pub use sampling::{DdimSampler, SamplingConfig};

use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::data::DatasetConfig;
use crate::error::contract_bail;
use crate::loaders::{CompactPreset, ModelSource};
use crate::models::LoraConfig;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub job: String,
    /// `cpu`, `cuda` or `cuda:<ordinal>`.
    #[serde(default)]
    pub device: Option<String>,
    pub model: ModelConfig,
    pub train: TrainConfig,
    pub dataset: DatasetConfig,
    #[serde(default)]
    pub sample: Option<SampleConfig>,
    pub save: SaveConfig,
}

/// Which conditioning network to train, and where it comes from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConditioningConfig {
    /// T2I-Adapter, loaded from `pretrained` or built from the channel overrides.
    T2iAdapter {
        #[serde(default)]
        pretrained: Option<PathBuf>,
        #[serde(default)]
        channels: Option<Vec<usize>>,
        #[serde(default)]
        downscale_factor: Option<usize>,
        #[serde(default)]
        num_res_blocks: Option<usize>,
    },
    /// ControlNet, loaded from `pretrained` or initialised from the UNet.
    Controlnet {
        #[serde(default)]
        pretrained: Option<PathBuf>,
    },
    /// IP-Adapter, loaded from `pretrained` or initialised from the UNet's cross-attention
    /// weights. The frozen image encoder comes from `image_encoder`, else from the model's
    /// `image_encoder/` directory, else a compact encoder for compact models.
    IpAdapter {
        #[serde(default)]
        pretrained: Option<PathBuf>,
        #[serde(default)]
        image_encoder: Option<PathBuf>,
        #[serde(default)]
        num_tokens: Option<usize>,
        #[serde(default)]
        scale: Option<f64>,
    },
}

fn default_prior_loss_weight() -> f64 {
    1.0
}

fn default_guidance_scale() -> f64 {
    7.5
}

/// Every facet of the training-step engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    /// Directory laid out as described in [`crate::loaders::pretrained`].
    #[serde(default)]
    pub pretrained_model_name_or_path: Option<PathBuf>,
    /// Fresh compact networks instead of a pretrained directory.
    #[serde(default)]
    pub compact: Option<CompactPreset>,
    /// Separate autoencoder directory.
    #[serde(default)]
    pub vae: Option<PathBuf>,
    /// Batches carry text embeddings instead of prompts; no text encoder is held.
    #[serde(default)]
    pub pre_compute_text_embeddings: bool,
    #[serde(default)]
    pub finetune_text_encoder: bool,
    #[serde(default)]
    pub lora: Option<LoraConfig>,
    #[serde(default)]
    pub conditioning: Option<ConditioningConfig>,
    /// Loss weight of class images when prior preservation is on.
    #[serde(default = "default_prior_loss_weight")]
    pub prior_loss_weight: f64,
    #[serde(default)]
    pub noise_offset_weight: f64,
    #[serde(default)]
    pub timestep_sampling: TimestepSampling,
    #[serde(default)]
    pub loss: DiffusionLoss,
    /// Overrides the model's own scheduler config.
    #[serde(default)]
    pub scheduler: Option<DdpmSchedulerConfig>,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    #[serde(default)]
    pub seed: Option<u64>,
    /// Accepted so configs that set it parse; the engine rejects `true` because candle's
    /// autograd cannot recompute activations during the backward pass.
    #[serde(default)]
    pub gradient_checkpointing: bool,
}

impl ModelConfig {
    /// Compact networks with every facet at its default.
    pub fn compact(preset: CompactPreset) -> Self {
        Self {
            pretrained_model_name_or_path: None,
            compact: Some(preset),
            vae: None,
            pre_compute_text_embeddings: false,
            finetune_text_encoder: false,
            lora: None,
            conditioning: None,
            prior_loss_weight: default_prior_loss_weight(),
            noise_offset_weight: 0.0,
            timestep_sampling: TimestepSampling::default(),
            loss: DiffusionLoss::default(),
            scheduler: None,
            guidance_scale: default_guidance_scale(),
            seed: None,
            gradient_checkpointing: false,
        }
    }

    pub fn source(&self) -> Result<ModelSource> {
        match (&self.pretrained_model_name_or_path, self.compact) {
            (Some(path), None) => Ok(ModelSource::Pretrained(path.clone())),
            (None, Some(preset)) => Ok(ModelSource::Compact(preset)),
            (Some(_), Some(_)) => contract_bail!("set either pretrained_model_name_or_path or compact, not both"),
            (None, None) => contract_bail!("the model needs pretrained_model_name_or_path or compact"),
        }
    }
}

fn default_gradient_accumulation() -> usize {
    1
}

fn default_lr_scheduler() -> String {
    "constant".to_string()
}

fn default_weight_decay() -> f64 {
    1e-2
}

fn default_log_every() -> usize {
    10
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainConfig {
    pub batch_size: usize,
    pub steps: usize,
    #[serde(default = "default_gradient_accumulation")]
    pub gradient_accumulation: usize,
    pub lr: f64,
    #[serde(default = "default_lr_scheduler")]
    pub lr_scheduler: String,
    #[serde(default)]
    pub lr_warmup_steps: usize,
    #[serde(default)]
    pub lr_scheduler_num_cycles: Option<usize>,
    #[serde(default)]
    pub lr_scheduler_power: Option<f64>,
    #[serde(default = "default_weight_decay")]
    pub weight_decay: f64,
    #[serde(default)]
    pub max_grad_norm: Option<f64>,
    #[serde(default = "default_log_every")]
    pub log_every: usize,
}

fn default_sample_steps() -> usize {
    50
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SampleConfig {
    pub sample_every: usize,
    #[serde(default = "default_sample_steps")]
    pub sample_steps: usize,
    pub prompts: Vec<String>,
    #[serde(default)]
    pub neg: Option<String>,
    /// One per prompt when training a conditioning network.
    #[serde(default)]
    pub condition_images: Vec<PathBuf>,
    pub width: usize,
    pub height: usize,
}

fn default_max_step_saves_to_keep() -> usize {
    3
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SaveConfig {
    pub output_dir: PathBuf,
    pub save_every: usize,
    #[serde(default = "default_max_step_saves_to_keep")]
    pub max_step_saves_to_keep: usize,
}

pub fn load_config(path: &Path) -> Result<Config> {
    let config_str = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = serde_yaml::from_str(&config_str)
        .with_context(|| format!("Failed to parse YAML config: {}", path.display()))?;

    Ok(config)
}

/// `cpu`, `cuda` or `cuda:<ordinal>`; defaults to the first GPU when one is available.
pub fn parse_device(name: Option<&str>) -> Result<Device> {
    match name {
        None => Ok(Device::cuda_if_available(0)?),
        Some("cpu") => Ok(Device::Cpu),
        Some("cuda") => Ok(Device::new_cuda(0)?),
        Some(other) => match other.strip_prefix("cuda:").map(str::parse::<usize>) {
            Some(Ok(ordinal)) => Ok(Device::new_cuda(ordinal)?),
            _ => anyhow::bail!("Unknown device: {}", other),
        },
    }
}
