//! Building sub-networks from a model directory or from a compact preset.
//!
//! A model directory holds one sub-directory per component:
//!
//! ```text
//! model/
//!   vae/            config.json  diffusion_pytorch_model.safetensors
//!   unet/           config.json  diffusion_pytorch_model.safetensors
//!   text_encoder/   config.json  model.safetensors
//!   text_encoder_2/ ...          (dual-encoder models only)
//!   tokenizer/      tokenizer.json [tokenizer_config.json]
//!   tokenizer_2/
//!   scheduler/      scheduler_config.json
//!   image_encoder/  config.json  model.safetensors  (image-prompt models only)
//!   adapter/ | controlnet/ | ip_adapter/          (conditioning checkpoints)
//! ```

use anyhow::{Context, Result};
use candle_core::Device;
use candle_nn::VarMap;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::EngineError;
use crate::models::{
    ClipImageEncoder, ClipPreset, ClipTextEncoder, ClipVisionPreset, CompactAutoencoder, CompactImageEncoder,
    CompactImageEncoderConfig, CompactTextEncoder, CompactTextEncoderConfig, CompactUNet, ControlNet, ControlNetConfig,
    HashingTokenizer, HfPromptTokenizer, ImageEncoder, IpAdapter, IpAdapterConfig, LoraConfig, PromptTokenizer,
    T2IAdapter, T2IAdapterConfig, TextEncoder, TextStack, UNetConfig, VaeConfig,
};
use crate::trainers::ddpm_scheduler::DdpmSchedulerConfig;

pub const CONFIG_NAME: &str = "config.json";
pub const WEIGHTS_NAME: &str = "diffusion_pytorch_model.safetensors";
pub const SCHEDULER_CONFIG_NAME: &str = "scheduler_config.json";
const WEIGHTS_NAMES: [&str; 2] = [WEIGHTS_NAME, "model.safetensors"];

/// Freshly initialised architectures for smoke runs and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CompactPreset {
    /// One text encoder, no resolution conditioning.
    Tiny,
    /// Two text encoders and `time_ids` conditioning, laid out like SDXL.
    TinyXl,
}

impl CompactPreset {
    pub fn vae_config(self) -> VaeConfig {
        VaeConfig::tiny()
    }

    pub fn unet_config(self) -> UNetConfig {
        match self {
            Self::Tiny => UNetConfig::tiny(),
            Self::TinyXl => UNetConfig::tiny_xl(),
        }
    }

    pub fn image_encoder_config(self) -> CompactImageEncoderConfig {
        CompactImageEncoderConfig::tiny()
    }

    pub fn text_encoder_configs(self) -> Vec<CompactTextEncoderConfig> {
        match self {
            Self::Tiny => vec![CompactTextEncoderConfig::tiny()],
            Self::TinyXl => vec![
                CompactTextEncoderConfig::tiny(),
                CompactTextEncoderConfig::tiny_with_projection(32),
            ],
        }
    }
}

/// Where the model bundle comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelSource {
    Pretrained(PathBuf),
    Compact(CompactPreset),
}

/// `config.json` of a text encoder directory: either a CLIP preset or a compact encoder.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum TextEncoderSpec {
    Clip { clip_preset: ClipPreset },
    Compact(CompactTextEncoderConfig),
}

/// `config.json` of an image encoder directory: a CLIP vision preset or a compact encoder.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum ImageEncoderSpec {
    Clip { clip_vision_preset: ClipVisionPreset },
    Compact(CompactImageEncoderConfig),
}

fn component_dir(root: &Path, name: &str) -> Result<PathBuf> {
    let dir = root.join(name);
    if !dir.is_dir() {
        return Err(EngineError::MissingComponent(format!("{} has no `{}` directory", root.display(), name)).into());
    }
    Ok(dir)
}

fn weights_file(dir: &Path) -> Result<PathBuf> {
    WEIGHTS_NAMES
        .iter()
        .map(|name| dir.join(name))
        .find(|p| p.exists())
        .ok_or_else(|| EngineError::MissingComponent(format!("no weights file in {}", dir.display())).into())
}

pub fn read_json_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T> {
    let raw = fs::read_to_string(path).with_context(|| format!("Failed to read config: {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("Failed to parse config: {}", path.display()))
}

/// Overwrite the freshly initialised variables of `weights` with the tensors stored in `dir`.
fn load_weights(weights: &VarMap, dir: &Path) -> Result<()> {
    let path = weights_file(dir)?;
    let mut weights = weights.clone();
    weights
        .load(&path)
        .with_context(|| format!("Failed to load weights: {}", path.display()))?;
    info!("Loaded weights from {}", path.display());
    Ok(())
}

/// Write `config.json` and the weights of one component into `dir`.
pub fn save_component(dir: &Path, config: &serde_json::Value, weights: &VarMap) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    fs::write(dir.join(CONFIG_NAME), serde_json::to_string_pretty(config)?)?;
    weights
        .save(dir.join(WEIGHTS_NAME))
        .with_context(|| format!("Failed to save weights to {}", dir.display()))?;
    info!("Saved {}", dir.display());
    Ok(())
}

pub fn load_vae_dir(dir: &Path, device: &Device) -> Result<CompactAutoencoder> {
    let config: VaeConfig = read_json_config(&dir.join(CONFIG_NAME))?;
    let vae = CompactAutoencoder::new(config, device)?;
    load_weights(&crate::models::Autoencoder::weights(&vae).base, dir)?;
    Ok(vae)
}

pub fn load_t2i_adapter_dir(dir: &Path, device: &Device) -> Result<T2IAdapter> {
    let config: T2IAdapterConfig = read_json_config(&dir.join(CONFIG_NAME))?;
    let adapter = T2IAdapter::new(config, device)?;
    load_weights(&adapter.weights().base, dir)?;
    Ok(adapter)
}

pub fn load_controlnet_dir(dir: &Path, device: &Device) -> Result<ControlNet> {
    let config: ControlNetConfig = read_json_config(&dir.join(CONFIG_NAME))?;
    let controlnet = ControlNet::new(config, device)?;
    load_weights(&controlnet.weights().base, dir)?;
    Ok(controlnet)
}

pub fn load_ip_adapter_dir(dir: &Path, device: &Device) -> Result<IpAdapter> {
    let config: IpAdapterConfig = read_json_config(&dir.join(CONFIG_NAME))?;
    let adapter = IpAdapter::new(config, device)?;
    load_weights(&adapter.weights().base, dir)?;
    Ok(adapter)
}

pub fn load_image_encoder_dir(dir: &Path, device: &Device) -> Result<Box<dyn ImageEncoder>> {
    match read_json_config::<ImageEncoderSpec>(&dir.join(CONFIG_NAME))? {
        ImageEncoderSpec::Clip { clip_vision_preset } => Ok(Box::new(ClipImageEncoder::load(
            &weights_file(dir)?,
            clip_vision_preset,
            device,
        )?)),
        ImageEncoderSpec::Compact(config) => {
            let encoder = CompactImageEncoder::new(config, device)?;
            if let Some(weights) = encoder.weights() {
                load_weights(&weights.base, dir)?;
            }
            Ok(Box::new(encoder))
        }
    }
}

fn load_text_encoder_dir(dir: &Path, lora: Option<LoraConfig>, device: &Device) -> Result<Box<dyn TextEncoder>> {
    match read_json_config::<TextEncoderSpec>(&dir.join(CONFIG_NAME))? {
        TextEncoderSpec::Clip { clip_preset } => {
            if lora.is_some() {
                warn!("LoRA is not supported on pretrained CLIP encoders, {} stays frozen", dir.display());
            }
            Ok(Box::new(ClipTextEncoder::load(&weights_file(dir)?, clip_preset, device)?))
        }
        TextEncoderSpec::Compact(config) => {
            let encoder = CompactTextEncoder::new(config, lora, device)?;
            if let Some(weights) = TextEncoder::weights(&encoder) {
                load_weights(&weights.base, dir)?;
            }
            Ok(Box::new(encoder))
        }
    }
}

/// `tokenizer.json` when present; compact encoders fall back to hashing their words.
fn load_tokenizer_dir(dir: &Path, encoder_dir: &Path) -> Result<Box<dyn PromptTokenizer>> {
    if dir.join("tokenizer.json").exists() {
        return Ok(Box::new(HfPromptTokenizer::from_dir(dir)?));
    }
    match read_json_config::<TextEncoderSpec>(&encoder_dir.join(CONFIG_NAME))? {
        TextEncoderSpec::Compact(config) => {
            config.validate()?;
            info!("No tokenizer.json in {}, using a hashing tokenizer", dir.display());
            Ok(Box::new(HashingTokenizer::new(
                config.vocab_size,
                config.max_position_embeddings,
            )))
        }
        TextEncoderSpec::Clip { .. } => {
            Err(EngineError::MissingComponent(format!("{} has no tokenizer.json", dir.display())).into())
        }
    }
}

impl ModelSource {
    pub fn describe(&self) -> String {
        match self {
            Self::Pretrained(path) => path.display().to_string(),
            Self::Compact(preset) => format!("compact:{:?}", preset),
        }
    }

    pub fn load_vae(&self, override_dir: Option<&Path>, device: &Device) -> Result<CompactAutoencoder> {
        match (override_dir, self) {
            (Some(dir), _) => load_vae_dir(dir, device),
            (None, Self::Pretrained(root)) => load_vae_dir(&component_dir(root, "vae")?, device),
            (None, Self::Compact(preset)) => Ok(CompactAutoencoder::new(preset.vae_config(), device)?),
        }
    }

    pub fn load_unet(&self, lora: Option<LoraConfig>, device: &Device) -> Result<CompactUNet> {
        match self {
            Self::Pretrained(root) => {
                let dir = component_dir(root, "unet")?;
                let config: UNetConfig = read_json_config(&dir.join(CONFIG_NAME))?;
                let unet = CompactUNet::new(config, lora, device)?;
                load_weights(&crate::models::Denoiser::weights(&unet).base, &dir)?;
                Ok(unet)
            }
            Self::Compact(preset) => Ok(CompactUNet::new(preset.unet_config(), lora, device)?),
        }
    }

    /// Tokenizers and text encoders; `text_encoder_2` / `tokenizer_2` are picked up when the
    /// directory has them.
    pub fn load_text_stack(&self, lora: Option<LoraConfig>, device: &Device) -> Result<TextStack> {
        let mut tokenizers: Vec<Box<dyn PromptTokenizer>> = Vec::new();
        let mut encoders: Vec<Box<dyn TextEncoder>> = Vec::new();
        match self {
            Self::Pretrained(root) => {
                for (encoder_name, tokenizer_name) in [("text_encoder", "tokenizer"), ("text_encoder_2", "tokenizer_2")] {
                    let encoder_dir = root.join(encoder_name);
                    if !encoder_dir.is_dir() {
                        if encoders.is_empty() {
                            return Err(EngineError::MissingComponent(format!(
                                "{} has no `text_encoder` directory",
                                root.display()
                            ))
                            .into());
                        }
                        break;
                    }
                    tokenizers.push(load_tokenizer_dir(&root.join(tokenizer_name), &encoder_dir)?);
                    encoders.push(load_text_encoder_dir(&encoder_dir, lora, device)?);
                }
            }
            Self::Compact(preset) => {
                for config in preset.text_encoder_configs() {
                    tokenizers.push(Box::new(HashingTokenizer::new(
                        config.vocab_size,
                        config.max_position_embeddings,
                    )));
                    encoders.push(Box::new(CompactTextEncoder::new(config, lora, device)?));
                }
            }
        }
        Ok(TextStack::new(tokenizers, encoders)?)
    }

    /// The frozen image encoder of an image-prompt model.
    pub fn load_image_encoder(&self, override_dir: Option<&Path>, device: &Device) -> Result<Box<dyn ImageEncoder>> {
        match (override_dir, self) {
            (Some(dir), _) => load_image_encoder_dir(dir, device),
            (None, Self::Pretrained(root)) => load_image_encoder_dir(&component_dir(root, "image_encoder")?, device),
            (None, Self::Compact(preset)) => Ok(Box::new(CompactImageEncoder::new(
                preset.image_encoder_config(),
                device,
            )?)),
        }
    }

    /// Scheduler settings of the model; defaults when the directory has none.
    pub fn scheduler_config(&self) -> Result<DdpmSchedulerConfig> {
        match self {
            Self::Pretrained(root) => {
                let path = root.join("scheduler").join(SCHEDULER_CONFIG_NAME);
                if path.exists() {
                    DdpmSchedulerConfig::from_file(&path)
                } else {
                    warn!("No scheduler config at {}, using DDPM defaults", path.display());
                    Ok(DdpmSchedulerConfig::default())
                }
            }
            Self::Compact(_) => Ok(DdpmSchedulerConfig::default()),
        }
    }
}
