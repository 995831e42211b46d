//! ControlNet: a trainable copy of the UNet encoder fed with an embedded condition image,
//! whose skip and mid outputs pass through zero-initialised convolutions.

use candle_core::{bail, DType, Device, Module, Result, Tensor};
use candle_nn::{Conv2d, Conv2dConfig, VarBuilder, VarMap};
use log::debug;
use serde::{Deserialize, Serialize};

use super::blocks::{conv3x3, zero_conv};
use super::unet::{CompactUNet, ImagePromptCursor, UNetConfig, UNetEncoder};
use super::{AddedConditions, Denoiser, NetworkWeights};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlNetConfig {
    pub unet: UNetConfig,
    #[serde(default = "default_conditioning_channels")]
    pub conditioning_channels: usize,
    /// Channel widths of the condition-image embedding; every step after the first halves
    /// the resolution.
    pub conditioning_embedding_out_channels: Vec<usize>,
}

fn default_conditioning_channels() -> usize {
    3
}

impl ControlNetConfig {
    /// Embedding sized for an autoencoder with the given spatial reduction.
    pub fn for_unet(unet: UNetConfig, spatial_scale_factor: usize) -> Self {
        let steps = spatial_scale_factor.trailing_zeros() as usize;
        let widths = [16usize, 32, 96, 256];
        let conditioning_embedding_out_channels = (0..=steps).map(|i| widths[i.min(widths.len() - 1)]).collect();
        Self {
            unet,
            conditioning_channels: 3,
            conditioning_embedding_out_channels,
        }
    }

    pub fn downscale_factor(&self) -> usize {
        1 << self.conditioning_embedding_out_channels.len().saturating_sub(1)
    }
}

fn zero_conv3x3(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    let weight = vb.get_with_hints((out_c, in_c, 3, 3), "weight", candle_nn::Init::Const(0.0))?;
    let bias = vb.get_with_hints(out_c, "bias", candle_nn::Init::Const(0.0))?;
    let cfg = Conv2dConfig {
        padding: 1,
        ..Default::default()
    };
    Ok(Conv2d::new(weight, Some(bias), cfg))
}

#[derive(Debug)]
struct ConditioningEmbedding {
    conv_in: Conv2d,
    blocks: Vec<Conv2d>,
    conv_out: Conv2d,
}

impl ConditioningEmbedding {
    fn new(config: &ControlNetConfig, vb: VarBuilder) -> Result<Self> {
        let widths = &config.conditioning_embedding_out_channels;
        if widths.is_empty() {
            bail!("conditioning_embedding_out_channels must not be empty");
        }
        let conv_in = conv3x3(config.conditioning_channels, widths[0], 1, vb.pp("conv_in"))?;
        let mut blocks = Vec::new();
        for i in 0..widths.len() - 1 {
            blocks.push(conv3x3(widths[i], widths[i], 1, vb.pp(format!("blocks.{}", 2 * i)))?);
            blocks.push(conv3x3(widths[i], widths[i + 1], 2, vb.pp(format!("blocks.{}", 2 * i + 1)))?);
        }
        let conv_out = zero_conv3x3(widths[widths.len() - 1], config.unet.block_out_channels[0], vb.pp("conv_out"))?;
        Ok(Self {
            conv_in,
            blocks,
            conv_out,
        })
    }
}

impl Module for ConditioningEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = self.conv_in.forward(xs)?.silu()?;
        for conv in &self.blocks {
            h = conv.forward(&h)?.silu()?;
        }
        self.conv_out.forward(&h)
    }
}

pub struct ControlNet {
    encoder: UNetEncoder,
    cond_embedding: ConditioningEmbedding,
    down_zero_convs: Vec<Conv2d>,
    mid_zero_conv: Conv2d,
    config: ControlNetConfig,
    weights: NetworkWeights,
}

impl ControlNet {
    /// Build with fresh weights.
    pub fn new(config: ControlNetConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let encoder = UNetEncoder::new(&config.unet, &vb, None)?;
        let cond_embedding = ConditioningEmbedding::new(&config, vb.pp("controlnet_cond_embedding"))?;
        let down_zero_convs = config
            .unet
            .skip_channels()
            .into_iter()
            .enumerate()
            .map(|(i, c)| zero_conv(c, vb.pp(format!("controlnet_down_blocks.{i}"))))
            .collect::<Result<Vec<_>>>()?;
        let top = config.unet.block_out_channels[config.unet.block_out_channels.len() - 1];
        let mid_zero_conv = zero_conv(top, vb.pp("controlnet_mid_block"))?;
        Ok(Self {
            encoder,
            cond_embedding,
            down_zero_convs,
            mid_zero_conv,
            config,
            weights: NetworkWeights::new(varmap, None),
        })
    }

    /// Fresh ControlNet whose encoder half starts from the UNet's weights.
    pub fn from_unet(unet: &CompactUNet, spatial_scale_factor: usize, device: &Device) -> Result<Self> {
        let config = ControlNetConfig::for_unet(unet.config().clone(), spatial_scale_factor);
        let controlnet = Self::new(config, device)?;

        let source = unet.weights().base.data().lock().map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let target = controlnet.weights.base.data().lock().map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        let mut copied = 0usize;
        for (name, var) in target.iter() {
            if let Some(src) = source.get(name) {
                if src.dims() == var.dims() {
                    var.set(src.as_tensor())?;
                    copied += 1;
                }
            }
        }
        debug!("Initialised ControlNet from UNet: copied {} of {} tensors", copied, target.len());
        drop(target);
        drop(source);
        Ok(controlnet)
    }

    pub fn config(&self) -> &ControlNetConfig {
        &self.config
    }

    /// Skip residuals (one per UNet skip connection) and the mid-block residual.
    pub fn forward(
        &self,
        sample: &Tensor,
        timesteps: &Tensor,
        encoder_hidden_states: &Tensor,
        added: Option<&AddedConditions>,
        condition: &Tensor,
    ) -> Result<(Vec<Tensor>, Tensor)> {
        let temb = self.encoder.embed(timesteps, added)?;
        let h = (self.encoder.conv_in(sample)? + self.cond_embedding.forward(condition)?)?;
        let mut no_image_prompt = ImagePromptCursor::none();
        let (h, skips) = self.encoder.down(h, &temb, encoder_hidden_states, None, &mut no_image_prompt)?;
        let h = self.encoder.mid(&h, &temb, encoder_hidden_states, &mut no_image_prompt)?;

        let down = skips
            .iter()
            .zip(&self.down_zero_convs)
            .map(|(s, conv)| conv.forward(s))
            .collect::<Result<Vec<_>>>()?;
        let mid = self.mid_zero_conv.forward(&h)?;
        Ok((down, mid))
    }

    pub fn weights(&self) -> &NetworkWeights {
        &self.weights
    }

    pub fn config_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}
