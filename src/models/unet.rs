//! Compact conditional UNet.
//!
//! Layout follows the diffusers `UNet2DConditionModel` naming (`conv_in`, `time_embedding`,
//! `add_embedding`, `down_blocks.{i}.resnets.{j}`, `mid_block`, `up_blocks`, `conv_out`) so a
//! ControlNet can be initialised by copying the encoder half by name.

use candle_core::{bail, DType, Device, Module, Result, Tensor};
use candle_nn::{Conv2d, GroupNorm, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::blocks::{
    conv3x3, timestep_embedding, Downsample, ResnetBlock, SpatialTransformer, TimestepEmbedding, Upsample,
};
use super::lora::{lora_pp, LoraConfig, LoraVb};
use super::{AddedConditions, Denoiser, ImagePromptKv, NetworkWeights, Residuals};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UNetConfig {
    pub in_channels: usize,
    pub out_channels: usize,
    pub block_out_channels: Vec<usize>,
    /// Whether each level carries a cross-attention transformer.
    pub attention_levels: Vec<bool>,
    pub layers_per_block: usize,
    pub cross_attention_dim: usize,
    pub num_attention_heads: usize,
    pub norm_num_groups: usize,
    /// Latent resolution used when no size is requested at inference.
    pub sample_size: usize,
    /// Width of the sinusoidal embedding of each `time_ids` entry. Enables the SDXL-style
    /// additional embedding together with `projection_class_embeddings_input_dim`.
    #[serde(default)]
    pub addition_time_embed_dim: Option<usize>,
    /// Width of the pooled text embedding fed to the additional embedding.
    #[serde(default)]
    pub pooled_projection_dim: Option<usize>,
}

impl UNetConfig {
    /// Two-level UNet conditioned on a 64-wide text context and resolution ids.
    pub fn tiny_xl() -> Self {
        Self {
            in_channels: 4,
            out_channels: 4,
            block_out_channels: vec![32, 64],
            attention_levels: vec![false, true],
            layers_per_block: 1,
            cross_attention_dim: 64,
            num_attention_heads: 4,
            norm_num_groups: 8,
            sample_size: 16,
            addition_time_embed_dim: Some(8),
            pooled_projection_dim: Some(32),
        }
    }

    /// Same backbone conditioned only on a 32-wide text context.
    pub fn tiny() -> Self {
        Self {
            cross_attention_dim: 32,
            addition_time_embed_dim: None,
            pooled_projection_dim: None,
            ..Self::tiny_xl()
        }
    }

    pub fn time_embed_dim(&self) -> usize {
        self.block_out_channels[0] * 4
    }

    pub fn uses_added_conditions(&self) -> bool {
        self.addition_time_embed_dim.is_some() && self.pooled_projection_dim.is_some()
    }

    /// Channel count of every skip connection produced by the down path, in order.
    pub fn skip_channels(&self) -> Vec<usize> {
        let mut channels = vec![self.block_out_channels[0]];
        let levels = self.block_out_channels.len();
        for (i, &c) in self.block_out_channels.iter().enumerate() {
            channels.extend(std::iter::repeat(c).take(self.layers_per_block));
            if i + 1 < levels {
                channels.push(c);
            }
        }
        channels
    }

    /// Every cross-attention transformer in forward order (down path, mid block, up path),
    /// as its weight prefix and channel count.
    pub fn cross_attention_layers(&self) -> Vec<(String, usize)> {
        let levels = self.block_out_channels.len();
        let mut layers = Vec::new();
        for (i, &c) in self.block_out_channels.iter().enumerate() {
            if self.attention_levels[i] {
                for j in 0..self.layers_per_block {
                    layers.push((format!("down_blocks.{i}.attentions.{j}"), c));
                }
            }
        }
        layers.push(("mid_block.attentions.0".to_string(), self.block_out_channels[levels - 1]));
        for (k, i) in (0..levels).rev().enumerate() {
            if self.attention_levels[i] {
                for j in 0..=self.layers_per_block {
                    layers.push((format!("up_blocks.{k}.attentions.{j}"), self.block_out_channels[i]));
                }
            }
        }
        layers
    }
}

/// Hands out one image-prompt key/value pair per cross-attention layer, in forward order.
pub(crate) struct ImagePromptCursor<'a> {
    layers: Option<&'a [ImagePromptKv]>,
    next: usize,
}

impl<'a> ImagePromptCursor<'a> {
    pub(crate) fn none() -> Self {
        Self { layers: None, next: 0 }
    }

    fn new(layers: &'a [ImagePromptKv], expected: usize) -> Result<Self> {
        if layers.len() != expected {
            bail!("expected {} image-prompt layers, got {}", expected, layers.len());
        }
        Ok(Self {
            layers: Some(layers),
            next: 0,
        })
    }

    fn take(&mut self) -> Option<&'a ImagePromptKv> {
        let kv = self.layers?.get(self.next);
        self.next += 1;
        kv
    }
}

#[derive(Debug)]
struct DownLevel {
    resnets: Vec<ResnetBlock>,
    attentions: Vec<SpatialTransformer>,
    downsample: Option<Downsample>,
}

#[derive(Debug)]
struct MidBlock {
    resnet_in: ResnetBlock,
    attention: SpatialTransformer,
    resnet_out: ResnetBlock,
}

/// Embeddings, input convolution, down path and mid block. Shared by [`CompactUNet`] and
/// the ControlNet, which copies these weights by name.
#[derive(Debug)]
pub(crate) struct UNetEncoder {
    time_embedding: TimestepEmbedding,
    add_embedding: Option<TimestepEmbedding>,
    conv_in: Conv2d,
    down: Vec<DownLevel>,
    mid: MidBlock,
    config: UNetConfig,
}

impl UNetEncoder {
    pub(crate) fn new(config: &UNetConfig, vb: &VarBuilder, lora: Option<&LoraVb>) -> Result<Self> {
        if config.block_out_channels.len() != config.attention_levels.len() {
            bail!(
                "block_out_channels ({}) and attention_levels ({}) differ in length",
                config.block_out_channels.len(),
                config.attention_levels.len()
            );
        }
        let c0 = config.block_out_channels[0];
        let temb = config.time_embed_dim();
        let groups = config.norm_num_groups;
        let heads = config.num_attention_heads;
        let ctx = config.cross_attention_dim;

        let add_embedding = match (config.addition_time_embed_dim, config.pooled_projection_dim) {
            (Some(time_dim), Some(pooled)) => Some(TimestepEmbedding::new(
                6 * time_dim + pooled,
                temb,
                vb.pp("add_embedding"),
            )?),
            _ => None,
        };

        let mut down = Vec::with_capacity(config.block_out_channels.len());
        let mut prev = c0;
        let levels = config.block_out_channels.len();
        for (i, &c) in config.block_out_channels.iter().enumerate() {
            let name = format!("down_blocks.{i}");
            let vb_b = vb.pp(&name);
            let lora_b = lora_pp(lora, &name);
            let mut resnets = Vec::new();
            let mut attentions = Vec::new();
            for j in 0..config.layers_per_block {
                resnets.push(ResnetBlock::new(prev, c, Some(temb), groups, vb_b.pp(format!("resnets.{j}")))?);
                if config.attention_levels[i] {
                    let attn = format!("attentions.{j}");
                    attentions.push(SpatialTransformer::new(
                        c,
                        ctx,
                        heads,
                        groups,
                        vb_b.pp(&attn),
                        lora_pp(lora_b.as_ref(), &attn).as_ref(),
                    )?);
                }
                prev = c;
            }
            let downsample = if i + 1 < levels {
                Some(Downsample::new(c, vb_b.pp("downsamplers.0"))?)
            } else {
                None
            };
            down.push(DownLevel {
                resnets,
                attentions,
                downsample,
            });
        }

        let vb_mid = vb.pp("mid_block");
        let lora_mid = lora_pp(lora, "mid_block");
        let mid = MidBlock {
            resnet_in: ResnetBlock::new(prev, prev, Some(temb), groups, vb_mid.pp("resnets.0"))?,
            attention: SpatialTransformer::new(
                prev,
                ctx,
                heads,
                groups,
                vb_mid.pp("attentions.0"),
                lora_pp(lora_mid.as_ref(), "attentions.0").as_ref(),
            )?,
            resnet_out: ResnetBlock::new(prev, prev, Some(temb), groups, vb_mid.pp("resnets.1"))?,
        };

        Ok(Self {
            time_embedding: TimestepEmbedding::new(c0, temb, vb.pp("time_embedding"))?,
            add_embedding,
            conv_in: conv3x3(config.in_channels, c0, 1, vb.pp("conv_in"))?,
            down,
            mid,
            config: config.clone(),
        })
    }

    /// Timestep embedding plus, for resolution-conditioned models, the embedding of
    /// `time_ids` and the pooled text embedding.
    pub(crate) fn embed(&self, timesteps: &Tensor, added: Option<&AddedConditions>) -> Result<Tensor> {
        let t_emb = timestep_embedding(timesteps, self.config.block_out_channels[0])?;
        let emb = self.time_embedding.forward(&t_emb)?;
        match (&self.add_embedding, added, self.config.addition_time_embed_dim) {
            (Some(add_embedding), Some(added), Some(time_dim)) => {
                let b = added.time_ids.dim(0)?;
                let time_embeds = timestep_embedding(&added.time_ids.flatten_all()?, time_dim)?
                    .reshape((b, 6 * time_dim))?;
                let add_in = Tensor::cat(&[&time_embeds, &added.text_embeds.to_dtype(DType::F32)?], 1)?;
                emb.broadcast_add(&add_embedding.forward(&add_in)?)
            }
            (Some(_), None, _) => bail!("this UNet needs time_ids and pooled text embeddings"),
            _ => Ok(emb),
        }
    }

    pub(crate) fn conv_in(&self, sample: &Tensor) -> Result<Tensor> {
        self.conv_in.forward(sample)
    }

    /// Run the down path from the `conv_in` output. Returns the final hidden state and every
    /// skip connection, the input included. Intra-block residuals are added at the end of
    /// each level, before its downsampler.
    pub(crate) fn down(
        &self,
        h: Tensor,
        temb: &Tensor,
        context: &Tensor,
        intrablock: Option<&[Tensor]>,
        image_prompt: &mut ImagePromptCursor<'_>,
    ) -> Result<(Tensor, Vec<Tensor>)> {
        if let Some(res) = intrablock {
            if res.len() != self.down.len() {
                bail!(
                    "expected {} intra-block residuals, got {}",
                    self.down.len(),
                    res.len()
                );
            }
        }
        let mut h = h;
        let mut skips = vec![h.clone()];
        for (i, level) in self.down.iter().enumerate() {
            for (j, resnet) in level.resnets.iter().enumerate() {
                h = resnet.forward(&h, Some(temb))?;
                if let Some(attn) = level.attentions.get(j) {
                    h = attn.forward(&h, context, image_prompt.take())?;
                }
                if j + 1 == level.resnets.len() {
                    if let Some(res) = intrablock {
                        h = (h + &res[i])?;
                    }
                }
                skips.push(h.clone());
            }
            if let Some(down) = &level.downsample {
                h = down.forward(&h)?;
                skips.push(h.clone());
            }
        }
        Ok((h, skips))
    }

    pub(crate) fn mid(
        &self,
        h: &Tensor,
        temb: &Tensor,
        context: &Tensor,
        image_prompt: &mut ImagePromptCursor<'_>,
    ) -> Result<Tensor> {
        let h = self.mid.resnet_in.forward(h, Some(temb))?;
        let h = self.mid.attention.forward(&h, context, image_prompt.take())?;
        self.mid.resnet_out.forward(&h, Some(temb))
    }
}

#[derive(Debug)]
struct UpLevel {
    resnets: Vec<ResnetBlock>,
    attentions: Vec<SpatialTransformer>,
    upsample: Option<Upsample>,
}

pub struct CompactUNet {
    encoder: UNetEncoder,
    up: Vec<UpLevel>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
    config: UNetConfig,
    weights: NetworkWeights,
}

impl CompactUNet {
    /// Build with fresh weights; LoRA adapters go on every attention projection.
    pub fn new(config: UNetConfig, lora: Option<LoraConfig>, device: &Device) -> Result<Self> {
        let base = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, DType::F32, device);
        let lora_map = lora.map(|_| VarMap::new());
        let lora_vb = match (&lora_map, lora) {
            (Some(map), Some(cfg)) => Some(LoraVb::new(VarBuilder::from_varmap(map, DType::F32, device), cfg)),
            _ => None,
        };

        let encoder = UNetEncoder::new(&config, &vb, lora_vb.as_ref())?;
        let temb = config.time_embed_dim();
        let groups = config.norm_num_groups;
        let mut skip_channels = config.skip_channels();
        let mut prev = config.block_out_channels[config.block_out_channels.len() - 1];

        let mut up = Vec::with_capacity(config.block_out_channels.len());
        for (i, &c) in config.block_out_channels.iter().enumerate().rev() {
            let name = format!("up_blocks.{}", config.block_out_channels.len() - 1 - i);
            let vb_b = vb.pp(&name);
            let lora_b = lora_pp(lora_vb.as_ref(), &name);
            let mut resnets = Vec::new();
            let mut attentions = Vec::new();
            for j in 0..=config.layers_per_block {
                let skip = match skip_channels.pop() {
                    Some(s) => s,
                    None => bail!("skip connections exhausted while building up blocks"),
                };
                resnets.push(ResnetBlock::new(prev + skip, c, Some(temb), groups, vb_b.pp(format!("resnets.{j}")))?);
                if config.attention_levels[i] {
                    let attn = format!("attentions.{j}");
                    attentions.push(SpatialTransformer::new(
                        c,
                        config.cross_attention_dim,
                        config.num_attention_heads,
                        groups,
                        vb_b.pp(&attn),
                        lora_pp(lora_b.as_ref(), &attn).as_ref(),
                    )?);
                }
                prev = c;
            }
            let upsample = if i > 0 {
                Some(Upsample::new(c, vb_b.pp("upsamplers.0"))?)
            } else {
                None
            };
            up.push(UpLevel {
                resnets,
                attentions,
                upsample,
            });
        }

        Ok(Self {
            encoder,
            up,
            norm_out: candle_nn::group_norm(groups, prev, 1e-6, vb.pp("conv_norm_out"))?,
            conv_out: conv3x3(prev, config.out_channels, 1, vb.pp("conv_out"))?,
            config,
            weights: NetworkWeights::new(base, lora_map),
        })
    }

    pub fn config(&self) -> &UNetConfig {
        &self.config
    }
}

impl Denoiser for CompactUNet {
    fn forward(
        &self,
        sample: &Tensor,
        timesteps: &Tensor,
        encoder_hidden_states: &Tensor,
        added: Option<&AddedConditions>,
        residuals: &Residuals,
    ) -> Result<Tensor> {
        let temb = self.encoder.embed(timesteps, added)?;
        let h = self.encoder.conv_in(sample)?;

        let intrablock = match residuals {
            Residuals::Intrablock(res) => Some(res.as_slice()),
            _ => None,
        };
        let mut image_prompt = match residuals {
            Residuals::ImagePrompt(layers) => {
                ImagePromptCursor::new(layers, self.config.cross_attention_layers().len())?
            }
            _ => ImagePromptCursor::none(),
        };
        let (h, mut skips) = self.encoder.down(h, &temb, encoder_hidden_states, intrablock, &mut image_prompt)?;
        let mut h = self.encoder.mid(&h, &temb, encoder_hidden_states, &mut image_prompt)?;

        if let Residuals::Skip { down, mid } = residuals {
            if down.len() != skips.len() {
                bail!("expected {} ControlNet residuals, got {}", skips.len(), down.len());
            }
            skips = skips
                .iter()
                .zip(down)
                .map(|(s, r)| s + r)
                .collect::<Result<Vec<_>>>()?;
            h = (h + mid)?;
        }

        for level in &self.up {
            for (j, resnet) in level.resnets.iter().enumerate() {
                let skip = match skips.pop() {
                    Some(s) => s,
                    None => bail!("skip connections exhausted in up path"),
                };
                h = resnet.forward(&Tensor::cat(&[&h, &skip], 1)?, Some(&temb))?;
                if let Some(attn) = level.attentions.get(j) {
                    h = attn.forward(&h, encoder_hidden_states, image_prompt.take())?;
                }
            }
            if let Some(up) = &level.upsample {
                h = up.forward(&h)?;
            }
        }

        self.conv_out.forward(&self.norm_out.forward(&h)?.silu()?)
    }

    fn in_channels(&self) -> usize {
        self.config.in_channels
    }

    fn sample_size(&self) -> usize {
        self.config.sample_size
    }

    fn uses_added_conditions(&self) -> bool {
        self.config.uses_added_conditions()
    }

    fn weights(&self) -> &NetworkWeights {
        &self.weights
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn added(b: usize, device: &Device) -> Result<AddedConditions> {
        Ok(AddedConditions {
            time_ids: Tensor::new(&[64f32, 64., 0., 0., 64., 64.], device)?
                .unsqueeze(0)?
                .repeat((b, 1))?,
            text_embeds: Tensor::zeros((b, 32), DType::F32, device)?,
        })
    }

    #[test]
    fn skip_channel_layout() {
        assert_eq!(UNetConfig::tiny_xl().skip_channels(), vec![32, 32, 32, 64]);
    }

    #[test]
    fn cross_attention_layers_follow_forward_order() {
        let layers = UNetConfig::tiny_xl().cross_attention_layers();
        let names: Vec<&str> = layers.iter().map(|(n, _)| n.as_str()).collect();
        assert_eq!(
            names,
            vec![
                "down_blocks.1.attentions.0",
                "mid_block.attentions.0",
                "up_blocks.0.attentions.0",
                "up_blocks.0.attentions.1",
            ]
        );
        assert!(layers.iter().all(|(_, c)| *c == 64));
    }

    #[test]
    fn image_prompt_layers_must_match_attention_count() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let unet = CompactUNet::new(UNetConfig::tiny(), None, &device)?;
        let sample = Tensor::randn(0f32, 1.0, (1, 4, 16, 16), &device)?;
        let t = Tensor::new(&[500i64], &device)?;
        let ctx = Tensor::randn(0f32, 1.0, (1, 77, 32), &device)?;
        let kv = |n: usize| -> Result<Vec<ImagePromptKv>> {
            let mut layers = Vec::with_capacity(n);
            for _ in 0..n {
                layers.push(ImagePromptKv {
                    key: Tensor::randn(0f32, 1.0, (1, 4, 64), &device)?,
                    value: Tensor::zeros((1, 4, 64), DType::F32, &device)?,
                });
            }
            Ok(layers)
        };

        assert!(unet.forward(&sample, &t, &ctx, None, &Residuals::ImagePrompt(kv(3)?)).is_err());

        // Zero values contribute nothing, so the output matches the text-only pass.
        let plain = unet.forward(&sample, &t, &ctx, None, &Residuals::None)?;
        let with_ip = unet.forward(&sample, &t, &ctx, None, &Residuals::ImagePrompt(kv(4)?))?;
        let diff = (plain - with_ip)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn forward_keeps_latent_shape() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let unet = CompactUNet::new(UNetConfig::tiny_xl(), None, &device)?;
        let sample = Tensor::randn(0f32, 1.0, (2, 4, 16, 16), &device)?;
        let t = Tensor::new(&[10i64, 900], &device)?;
        let ctx = Tensor::randn(0f32, 1.0, (2, 77, 64), &device)?;

        let out = unet.forward(&sample, &t, &ctx, Some(&added(2, &device)?), &Residuals::None)?;
        assert_eq!(out.dims(), &[2, 4, 16, 16]);
        Ok(())
    }

    #[test]
    fn resolution_conditioned_unet_requires_added_conditions() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let unet = CompactUNet::new(UNetConfig::tiny_xl(), None, &device)?;
        let sample = Tensor::zeros((1, 4, 16, 16), DType::F32, &device)?;
        let t = Tensor::new(&[10i64], &device)?;
        let ctx = Tensor::zeros((1, 77, 64), DType::F32, &device)?;
        assert!(unet.forward(&sample, &t, &ctx, None, &Residuals::None).is_err());
        Ok(())
    }

    #[test]
    fn zero_residuals_do_not_change_output() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let unet = CompactUNet::new(UNetConfig::tiny(), None, &device)?;
        let sample = Tensor::randn(0f32, 1.0, (1, 4, 16, 16), &device)?;
        let t = Tensor::new(&[500i64], &device)?;
        let ctx = Tensor::randn(0f32, 1.0, (1, 77, 32), &device)?;

        let plain = unet.forward(&sample, &t, &ctx, None, &Residuals::None)?;
        let res = Residuals::Intrablock(vec![
            Tensor::zeros((1, 32, 16, 16), DType::F32, &device)?,
            Tensor::zeros((1, 64, 8, 8), DType::F32, &device)?,
        ]);
        let with_res = unet.forward(&sample, &t, &ctx, None, &res)?;
        let diff = (plain - with_res)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-6);
        Ok(())
    }

    #[test]
    fn lora_unet_registers_adapter_vars() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let unet = CompactUNet::new(UNetConfig::tiny(), Some(LoraConfig::new(4)), &device)?;
        assert!(!unet.weights().lora_vars().is_empty());
        assert!(!unet.weights().base_vars().is_empty());
        Ok(())
    }
}
