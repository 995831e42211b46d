//! IP-Adapter: projects a pooled image embedding into a few context tokens and gives every
//! cross-attention layer of the denoiser its own key/value projections for them.

use candle_core::{bail, DType, Device, Module, Result, Tensor};
use candle_nn::{LayerNorm, Linear, VarBuilder, VarMap};
use log::debug;
use serde::{Deserialize, Serialize};

use super::unet::{CompactUNet, UNetConfig};
use super::{Denoiser, ImagePromptKv, NetworkWeights};

fn default_num_tokens() -> usize {
    4
}

fn default_scale() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IpAdapterConfig {
    pub image_embed_dim: usize,
    pub cross_attention_dim: usize,
    #[serde(default = "default_num_tokens")]
    pub num_tokens: usize,
    /// Width of each cross-attention layer, in the denoiser's forward order.
    pub layer_channels: Vec<usize>,
    /// Weight of the image-prompt attention relative to the text attention.
    #[serde(default = "default_scale")]
    pub scale: f64,
}

impl IpAdapterConfig {
    pub fn for_unet(unet: &UNetConfig, image_embed_dim: usize) -> Self {
        Self {
            image_embed_dim,
            cross_attention_dim: unet.cross_attention_dim,
            num_tokens: default_num_tokens(),
            layer_channels: unet.cross_attention_layers().into_iter().map(|(_, c)| c).collect(),
            scale: default_scale(),
        }
    }
}

/// `[B, E]` image embeddings to `[B, T, D]` context tokens.
#[derive(Debug)]
struct ImageProjection {
    proj: Linear,
    norm: LayerNorm,
    num_tokens: usize,
    dim: usize,
}

impl ImageProjection {
    fn new(config: &IpAdapterConfig, vb: VarBuilder) -> Result<Self> {
        let dim = config.cross_attention_dim;
        Ok(Self {
            proj: candle_nn::linear(config.image_embed_dim, config.num_tokens * dim, vb.pp("proj"))?,
            norm: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm"))?,
            num_tokens: config.num_tokens,
            dim,
        })
    }
}

impl Module for ImageProjection {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let b = xs.dim(0)?;
        let tokens = self.proj.forward(xs)?.reshape((b, self.num_tokens, self.dim))?;
        self.norm.forward(&tokens)
    }
}

pub struct IpAdapter {
    image_proj: ImageProjection,
    to_k_ip: Vec<Linear>,
    to_v_ip: Vec<Linear>,
    config: IpAdapterConfig,
    weights: NetworkWeights,
}

impl IpAdapter {
    pub fn new(config: IpAdapterConfig, device: &Device) -> Result<Self> {
        if config.num_tokens == 0 || config.layer_channels.is_empty() {
            bail!(
                "ip adapter needs tokens and layers, got {} tokens for {} layers",
                config.num_tokens,
                config.layer_channels.len()
            );
        }
        let base = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, DType::F32, device);
        let image_proj = ImageProjection::new(&config, vb.pp("image_proj"))?;
        let mut to_k_ip = Vec::with_capacity(config.layer_channels.len());
        let mut to_v_ip = Vec::with_capacity(config.layer_channels.len());
        for (i, &c) in config.layer_channels.iter().enumerate() {
            let vb_l = vb.pp(format!("layers.{i}"));
            to_k_ip.push(candle_nn::linear_no_bias(config.cross_attention_dim, c, vb_l.pp("to_k_ip"))?);
            to_v_ip.push(candle_nn::linear_no_bias(config.cross_attention_dim, c, vb_l.pp("to_v_ip"))?);
        }
        Ok(Self {
            image_proj,
            to_k_ip,
            to_v_ip,
            config,
            weights: NetworkWeights::new(base, None),
        })
    }

    /// Fresh projection, with each layer's image key/value weights starting from the
    /// matching text cross-attention `to_k` / `to_v` of the UNet.
    pub fn from_unet(unet: &CompactUNet, config: IpAdapterConfig, device: &Device) -> Result<Self> {
        let layers = unet.config().cross_attention_layers();
        if config.layer_channels.len() != layers.len() {
            bail!(
                "ip adapter has {} layers but the unet has {} cross-attention layers",
                config.layer_channels.len(),
                layers.len()
            );
        }
        let adapter = Self::new(config, device)?;

        let source = unet.weights().base.data().lock().map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let target = adapter.weights.base.data().lock().map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let mut copied = 0usize;
        for (i, (path, _)) in layers.iter().enumerate() {
            for (proj, ip_proj) in [("to_k", "to_k_ip"), ("to_v", "to_v_ip")] {
                let src = source.get(&format!("{path}.transformer_blocks.0.attn2.{proj}.weight"));
                let dst = target.get(&format!("layers.{i}.{ip_proj}.weight"));
                if let (Some(src), Some(dst)) = (src, dst) {
                    if src.dims() == dst.dims() {
                        dst.set(src.as_tensor())?;
                        copied += 1;
                    }
                }
            }
        }
        debug!("Initialised IP-Adapter from UNet: copied {} of {} tensors", copied, target.len());
        drop(target);
        drop(source);
        Ok(adapter)
    }

    /// Image-prompt keys and values for every cross-attention layer.
    pub fn forward(&self, image_embeds: &Tensor) -> Result<Vec<ImagePromptKv>> {
        let tokens = self.image_proj.forward(&image_embeds.to_dtype(DType::F32)?)?;
        self.to_k_ip
            .iter()
            .zip(&self.to_v_ip)
            .map(|(to_k, to_v)| -> Result<ImagePromptKv> {
                Ok(ImagePromptKv {
                    key: to_k.forward(&tokens)?,
                    value: (to_v.forward(&tokens)? * self.config.scale)?,
                })
            })
            .collect()
    }

    pub fn set_scale(&mut self, scale: f64) {
        self.config.scale = scale;
    }

    pub fn config(&self) -> &IpAdapterConfig {
        &self.config
    }

    pub fn weights(&self) -> &NetworkWeights {
        &self.weights
    }

    pub fn config_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Residuals;

    #[test]
    fn projects_one_key_value_pair_per_layer() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let config = IpAdapterConfig::for_unet(&UNetConfig::tiny_xl(), 32);
        assert_eq!(config.layer_channels, vec![64, 64, 64, 64]);
        let adapter = IpAdapter::new(config, &device)?;

        let embeds = Tensor::randn(0f32, 1.0, (2, 32), &device)?;
        let layers = adapter.forward(&embeds)?;
        assert_eq!(layers.len(), 4);
        for kv in &layers {
            assert_eq!(kv.key.dims(), &[2, 4, 64]);
            assert_eq!(kv.value.dims(), &[2, 4, 64]);
        }
        Ok(())
    }

    #[test]
    fn from_unet_copies_text_key_value_weights() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let unet = CompactUNet::new(UNetConfig::tiny(), None, &device)?;
        let adapter = IpAdapter::from_unet(&unet, IpAdapterConfig::for_unet(unet.config(), 32), &device)?;

        let unet_vars = unet.weights().base.data().lock().map_err(|e| anyhow::anyhow!("{e}"))?;
        let ip_vars = adapter.weights().base.data().lock().map_err(|e| anyhow::anyhow!("{e}"))?;
        let src = unet_vars
            .get("mid_block.attentions.0.transformer_blocks.0.attn2.to_v.weight")
            .ok_or_else(|| anyhow::anyhow!("missing unet weight"))?;
        let dst = ip_vars
            .get("layers.1.to_v_ip.weight")
            .ok_or_else(|| anyhow::anyhow!("missing adapter weight"))?;
        let diff = (src.as_tensor() - dst.as_tensor())?.abs()?.sum_all()?.to_scalar::<f32>()?;
        assert_eq!(diff, 0.0);
        drop(ip_vars);
        drop(unet_vars);

        let mut short = IpAdapterConfig::for_unet(unet.config(), 32);
        short.layer_channels.pop();
        assert!(IpAdapter::from_unet(&unet, short, &device).is_err());
        Ok(())
    }

    #[test]
    fn zero_scale_leaves_denoiser_output_unchanged() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let unet = CompactUNet::new(UNetConfig::tiny(), None, &device)?;
        let mut config = IpAdapterConfig::for_unet(unet.config(), 32);
        config.scale = 0.0;
        let adapter = IpAdapter::new(config, &device)?;

        let sample = Tensor::randn(0f32, 1.0, (1, 4, 16, 16), &device)?;
        let t = Tensor::new(&[250i64], &device)?;
        let ctx = Tensor::randn(0f32, 1.0, (1, 77, 32), &device)?;
        let residuals = Residuals::ImagePrompt(adapter.forward(&Tensor::randn(0f32, 1.0, (1, 32), &device)?)?);

        let plain = unet.forward(&sample, &t, &ctx, None, &Residuals::None)?;
        let with_ip = unet.forward(&sample, &t, &ctx, None, &residuals)?;
        let diff = (plain - with_ip)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }
}
