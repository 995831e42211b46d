//! Low-rank adapters on linear projections.
//!
//! `out = W x + b + scale * up(down(x))` with `down` drawn from a small normal and `up`
//! zero-initialised, so a fresh adapter leaves the base network's output unchanged. The
//! adapter tensors live in their own `VarMap` so the optimizer can be handed only them while
//! the base weights stay frozen.

use anyhow::Result as AnyResult;
use candle_core::{DType, Module, Result, Tensor};
use candle_nn::{Init, Linear, VarBuilder, VarMap};
use safetensors::{serialize, tensor::TensorView, Dtype as SafeDtype};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs;
use std::path::Path;

/// LoRA hyper-parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct LoraConfig {
    pub rank: usize,
    /// Defaults to `rank`, i.e. a scale of 1.
    #[serde(default)]
    pub alpha: Option<f32>,
}

impl LoraConfig {
    pub fn new(rank: usize) -> Self {
        Self { rank, alpha: None }
    }

    pub fn scale(&self) -> f64 {
        (self.alpha.unwrap_or(self.rank as f32) / self.rank as f32) as f64
    }
}

/// Builder handle for LoRA parameters, mirroring the module path of the base `VarBuilder`.
#[derive(Clone)]
pub struct LoraVb<'a> {
    vb: VarBuilder<'a>,
    config: LoraConfig,
}

impl<'a> LoraVb<'a> {
    pub fn new(vb: VarBuilder<'a>, config: LoraConfig) -> Self {
        Self { vb, config }
    }

    pub fn pp(&self, name: &str) -> Self {
        Self {
            vb: self.vb.pp(name),
            config: self.config,
        }
    }
}

/// Push `name` onto an optional LoRA builder.
pub fn lora_pp<'a>(lora: Option<&LoraVb<'a>>, name: &str) -> Option<LoraVb<'a>> {
    lora.map(|l| l.pp(name))
}

#[derive(Debug, Clone)]
struct LoraPair {
    down: Tensor,
    up: Tensor,
    scale: f64,
}

/// Linear layer with an optional low-rank update.
#[derive(Debug, Clone)]
pub struct LoraLinear {
    base: Linear,
    lora: Option<LoraPair>,
}

impl LoraLinear {
    pub fn new(
        in_dim: usize,
        out_dim: usize,
        bias: bool,
        vb: VarBuilder,
        lora: Option<LoraVb>,
    ) -> Result<Self> {
        let base = if bias {
            candle_nn::linear(in_dim, out_dim, vb)?
        } else {
            candle_nn::linear_no_bias(in_dim, out_dim, vb)?
        };
        let lora = match lora {
            Some(l) => {
                let rank = l.config.rank;
                let down = l.vb.get_with_hints(
                    (rank, in_dim),
                    "lora_down.weight",
                    Init::Randn { mean: 0.0, stdev: 0.02 },
                )?;
                let up = l
                    .vb
                    .get_with_hints((out_dim, rank), "lora_up.weight", Init::Const(0.0))?;
                Some(LoraPair {
                    down,
                    up,
                    scale: l.config.scale(),
                })
            }
            None => None,
        };
        Ok(Self { base, lora })
    }

    pub fn has_lora(&self) -> bool {
        self.lora.is_some()
    }
}

impl Module for LoraLinear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let out = self.base.forward(xs)?;
        match &self.lora {
            Some(lora) => {
                let delta = xs
                    .broadcast_matmul(&lora.down.t()?)?
                    .broadcast_matmul(&lora.up.t()?)?;
                out + (delta * lora.scale)?
            }
            None => Ok(out),
        }
    }
}

/// Save LoRA weights in the `lora_<prefix>_<path>.lora_{down,up}.weight` layout with
/// rank/alpha metadata, the format most SD front-ends load.
pub fn save_lora_weights(
    lora: &VarMap,
    prefix: &str,
    config: &LoraConfig,
    path: &Path,
) -> AnyResult<()> {
    let data = lora.data().lock().map_err(|e| anyhow::anyhow!("lora map poisoned: {e}"))?;

    let mut entries: Vec<(String, Vec<usize>, Vec<u8>)> = Vec::with_capacity(data.len());
    for (name, var) in data.iter() {
        let (module, suffix) = match name.rsplit_once(".lora_") {
            Some((module, rest)) => (module, format!("lora_{rest}")),
            None => (name.as_str(), String::new()),
        };
        let key = format!("lora_{}_{}.{}", prefix, module.replace('.', "_"), suffix);
        let tensor = var.as_tensor().to_dtype(DType::F32)?;
        let bytes: Vec<u8> = tensor
            .flatten_all()?
            .to_vec1::<f32>()?
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        entries.push((key, tensor.dims().to_vec(), bytes));
    }
    drop(data);

    let mut views = HashMap::new();
    for (key, shape, bytes) in &entries {
        views.insert(key.clone(), TensorView::new(SafeDtype::F32, shape.clone(), bytes)?);
    }

    let alpha = config.alpha.unwrap_or(config.rank as f32);
    let mut metadata = HashMap::new();
    metadata.insert("ss_network_rank".to_string(), config.rank.to_string());
    metadata.insert("ss_network_alpha".to_string(), alpha.to_string());
    metadata.insert("ss_network_module".to_string(), "networks.lora".to_string());
    metadata.insert("ss_network_dim".to_string(), config.rank.to_string());

    let bytes = serialize(&views, &Some(metadata))?;
    fs::write(path, bytes)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn fresh_lora_is_identity() -> AnyResult<()> {
        let device = Device::Cpu;
        let base = VarMap::new();
        let lora = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, DType::F32, &device);
        let lvb = LoraVb::new(
            VarBuilder::from_varmap(&lora, DType::F32, &device),
            LoraConfig::new(4),
        );

        let plain = LoraLinear::new(8, 6, true, vb.pp("proj"), None)?;
        let adapted = LoraLinear::new(8, 6, true, vb.pp("proj"), Some(lvb.pp("proj")))?;
        assert!(adapted.has_lora());
        assert_eq!(lora.all_vars().len(), 2);

        let xs = Tensor::ones((2, 3, 8), DType::F32, &device)?;
        let a = plain.forward(&xs)?.flatten_all()?.to_vec1::<f32>()?;
        let b = adapted.forward(&xs)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(a, b);
        Ok(())
    }

    #[test]
    fn lora_file_uses_flattened_keys() -> AnyResult<()> {
        let device = Device::Cpu;
        let base = VarMap::new();
        let lora = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, DType::F32, &device);
        let config = LoraConfig { rank: 2, alpha: Some(4.0) };
        let lvb = LoraVb::new(VarBuilder::from_varmap(&lora, DType::F32, &device), config);
        let _ = LoraLinear::new(4, 4, false, vb.pp("attn1.to_q"), Some(lvb.pp("attn1.to_q")))?;

        let dir = tempfile::tempdir()?;
        let path = dir.path().join("lora.safetensors");
        save_lora_weights(&lora, "unet", &config, &path)?;

        let bytes = fs::read(&path)?;
        let loaded = safetensors::SafeTensors::deserialize(&bytes)?;
        let mut names: Vec<_> = loaded.names().into_iter().cloned().collect();
        names.sort();
        assert_eq!(
            names,
            vec![
                "lora_unet_attn1_to_q.lora_down.weight".to_string(),
                "lora_unet_attn1_to_q.lora_up.weight".to_string(),
            ]
        );
        Ok(())
    }
}
