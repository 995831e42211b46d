//! Writing trained sub-networks back to disk.
//!
//! [`save_model`] publishes named sub-networks in the model directory layout read by
//! [`crate::loaders::pretrained`]. [`save_trained`] writes only what the engine trains and
//! is what the runner calls for periodic checkpoints.

use anyhow::{Context, Result};
use log::info;
use std::fs;
use std::path::{Path, PathBuf};

use super::engine::DiffusionEngine;
use crate::error::{contract_bail, EngineError};
use crate::loaders::pretrained::{CONFIG_NAME, SCHEDULER_CONFIG_NAME};
use crate::loaders::{save_component, ModelSource};
use crate::models::{lora::save_lora_weights, ImageEncoder, LoraConfig, NetworkWeights};

/// Sub-networks [`save_model`] can publish.
pub const SAVE_KEYS: [&str; 2] = ["unet", "text_encoder"];

const TEXT_ENCODER_DIRS: [&str; 2] = ["text_encoder", "text_encoder_2"];
const LORA_TEXT_PREFIXES: [&str; 2] = ["te1", "te2"];

fn check_keys(keys: &[String]) -> Result<()> {
    let unknown: Vec<String> = keys
        .iter()
        .filter(|k| !SAVE_KEYS.contains(&k.as_str()))
        .cloned()
        .collect();
    if !unknown.is_empty() {
        return Err(EngineError::UnknownSaveKey {
            allowed: SAVE_KEYS.iter().map(|k| k.to_string()).collect(),
            got: unknown,
        }
        .into());
    }
    Ok(())
}

fn save_lora(weights: &NetworkWeights, prefix: &str, lora: Option<&LoraConfig>, out_dir: &Path) -> Result<Option<PathBuf>> {
    match (&weights.lora, lora) {
        (Some(map), Some(config)) => {
            fs::create_dir_all(out_dir)?;
            let path = out_dir.join(format!("lora_{prefix}.safetensors"));
            save_lora_weights(map, prefix, config, &path)?;
            info!("Saved LoRA weights to {}", path.display());
            Ok(Some(path))
        }
        _ => Ok(None),
    }
}

fn copy_dir_files(from: &Path, to: &Path) -> Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from).with_context(|| format!("Failed to read {}", from.display()))? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            fs::copy(entry.path(), to.join(entry.file_name()))?;
        }
    }
    Ok(())
}

fn save_unet(engine: &DiffusionEngine, out_dir: &Path) -> Result<()> {
    let unet = engine.unet();
    save_component(&out_dir.join("unet"), &unet.config_json(), &unet.weights().base)?;
    save_lora(unet.weights(), "unet", engine.config().lora.as_ref(), out_dir)?;
    Ok(())
}

fn save_text_encoders(engine: &DiffusionEngine, out_dir: &Path) -> Result<()> {
    let Some(stack) = engine.text_stack() else {
        contract_bail!("text embeddings are pre-computed, the engine holds no text encoder to save");
    };
    for (i, encoder) in stack.encoders.iter().enumerate() {
        let dir = out_dir.join(TEXT_ENCODER_DIRS[i]);
        match (encoder.weights(), engine.source()) {
            (Some(weights), _) => {
                save_component(&dir, &encoder.config_json(), &weights.base)?;
                save_lora(weights, LORA_TEXT_PREFIXES[i], engine.config().lora.as_ref(), out_dir)?;
            }
            (None, ModelSource::Pretrained(root)) => {
                copy_dir_files(&root.join(TEXT_ENCODER_DIRS[i]), &dir)?;
                info!("Copied frozen {} to {}", TEXT_ENCODER_DIRS[i], dir.display());
            }
            (None, ModelSource::Compact(_)) => {
                contract_bail!("{} has no weights to save", TEXT_ENCODER_DIRS[i]);
            }
        }
    }
    Ok(())
}

/// Save each named sub-network under `out_dir` in the model directory layout.
///
/// Allowed keys are [`SAVE_KEYS`]; anything else fails with
/// [`EngineError::UnknownSaveKey`] before a file is written.
pub fn save_model(engine: &DiffusionEngine, keys: &[String], out_dir: &Path) -> Result<()> {
    check_keys(keys)?;
    fs::create_dir_all(out_dir).with_context(|| format!("Failed to create {}", out_dir.display()))?;
    if keys.iter().any(|k| k == "unet") {
        save_unet(engine, out_dir)?;
    }
    if keys.iter().any(|k| k == "text_encoder") {
        save_text_encoders(engine, out_dir)?;
    }
    info!("Saved {:?} to {}", keys, out_dir.display());
    Ok(())
}

/// Write the parameters the engine trains into `dir`, plus the scheduler config.
///
/// Conditioning networks land in `adapter/`, `controlnet/` or `ip_adapter/` (with the
/// compact image encoder next to it in `image_encoder/`), LoRA runs in
/// `lora_*.safetensors` files, full fine-tunes in `unet/` and `text_encoder*/`.
pub fn save_trained(engine: &DiffusionEngine, dir: &Path) -> Result<()> {
    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    let scheduler_dir = dir.join("scheduler");
    fs::create_dir_all(&scheduler_dir)?;
    fs::write(
        scheduler_dir.join(SCHEDULER_CONFIG_NAME),
        serde_json::to_string_pretty(engine.scheduler().config())?,
    )?;

    if let Some(network) = engine.conditioning() {
        if let Some(encoder) = network.image_encoder() {
            match (encoder.weights(), engine.source()) {
                (Some(weights), _) => save_component(&dir.join("image_encoder"), &encoder.config_json(), &weights.base)?,
                (None, ModelSource::Pretrained(root)) if root.join("image_encoder").is_dir() => {
                    copy_dir_files(&root.join("image_encoder"), &dir.join("image_encoder"))?
                }
                (None, _) => {}
            }
        }
        return save_component(&dir.join(network.name()), &network.config_json(), &network.weights().base);
    }

    let unet = engine.unet();
    if save_lora(unet.weights(), "unet", engine.config().lora.as_ref(), dir)?.is_none() {
        save_component(&dir.join("unet"), &unet.config_json(), &unet.weights().base)?;
    }
    if engine.config().finetune_text_encoder {
        save_text_encoders(engine, dir)?;
    }
    Ok(())
}

/// Whether `dir` looks like a component directory written by [`save_model`].
pub fn is_component_dir(dir: &Path) -> bool {
    dir.join(CONFIG_NAME).is_file()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loaders::CompactPreset;
    use crate::trainers::{ConditioningConfig, ModelConfig};
    use candle_core::Device;

    #[test]
    fn unknown_keys_are_listed() -> Result<()> {
        let engine = DiffusionEngine::from_config(ModelConfig::compact(CompactPreset::Tiny), &Device::Cpu)?;
        let dir = tempfile::tempdir()?;
        let keys = vec!["unet".to_string(), "vae".to_string()];
        let err = save_model(&engine, &keys, dir.path())
            .err()
            .ok_or_else(|| anyhow::anyhow!("expected an error"))?;
        match err.downcast_ref::<EngineError>() {
            Some(EngineError::UnknownSaveKey { allowed, got }) => {
                assert_eq!(allowed, &vec!["unet".to_string(), "text_encoder".to_string()]);
                assert_eq!(got, &vec!["vae".to_string()]);
            }
            other => anyhow::bail!("unexpected error {:?}", other),
        }
        assert!(!dir.path().join("unet").exists());
        Ok(())
    }

    #[test]
    fn published_model_reloads() -> Result<()> {
        let device = Device::Cpu;
        let mut config = ModelConfig::compact(CompactPreset::TinyXl);
        config.lora = Some(LoraConfig::new(4));
        let engine = DiffusionEngine::from_config(config, &device)?;
        let dir = tempfile::tempdir()?;
        save_model(&engine, &["unet".to_string(), "text_encoder".to_string()], dir.path())?;

        assert!(is_component_dir(&dir.path().join("unet")));
        assert!(is_component_dir(&dir.path().join("text_encoder")));
        assert!(is_component_dir(&dir.path().join("text_encoder_2")));
        assert!(dir.path().join("lora_unet.safetensors").is_file());

        let source = ModelSource::Pretrained(dir.path().to_path_buf());
        assert!(source.load_text_stack(None, &device)?.is_dual());
        source.load_unet(None, &device)?;
        Ok(())
    }

    #[test]
    fn checkpoint_holds_only_the_adapter() -> Result<()> {
        let mut config = ModelConfig::compact(CompactPreset::TinyXl);
        config.conditioning = Some(ConditioningConfig::T2iAdapter {
            pretrained: None,
            channels: Some(vec![32, 64]),
            downscale_factor: Some(4),
            num_res_blocks: Some(1),
        });
        let engine = DiffusionEngine::from_config(config, &Device::Cpu)?;
        let dir = tempfile::tempdir()?;
        save_trained(&engine, dir.path())?;

        assert!(is_component_dir(&dir.path().join("adapter")));
        assert!(dir.path().join("scheduler").join(SCHEDULER_CONFIG_NAME).is_file());
        assert!(!dir.path().join("unet").exists());

        crate::loaders::pretrained::load_t2i_adapter_dir(&dir.path().join("adapter"), &Device::Cpu)?;
        Ok(())
    }

    #[test]
    fn image_prompt_checkpoint_holds_adapter_and_encoder() -> Result<()> {
        let device = Device::Cpu;
        let mut config = ModelConfig::compact(CompactPreset::TinyXl);
        config.conditioning = Some(ConditioningConfig::IpAdapter {
            pretrained: None,
            image_encoder: None,
            num_tokens: Some(2),
            scale: Some(0.5),
        });
        let engine = DiffusionEngine::from_config(config, &device)?;
        let dir = tempfile::tempdir()?;
        save_trained(&engine, dir.path())?;

        assert!(is_component_dir(&dir.path().join("ip_adapter")));
        assert!(is_component_dir(&dir.path().join("image_encoder")));
        assert!(!dir.path().join("unet").exists());

        let adapter = crate::loaders::pretrained::load_ip_adapter_dir(&dir.path().join("ip_adapter"), &device)?;
        assert_eq!(adapter.config().num_tokens, 2);
        assert_eq!(adapter.config().scale, 0.5);
        let encoder = crate::loaders::pretrained::load_image_encoder_dir(&dir.path().join("image_encoder"), &device)?;
        assert_eq!(encoder.embed_dim(), adapter.config().image_embed_dim);
        Ok(())
    }
}
