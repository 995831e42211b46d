//! Compact KL autoencoder.

use candle_core::{DType, Device, Module, Result, Tensor};
use candle_nn::{Conv2d, GroupNorm, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::blocks::{conv1x1, conv3x3, Downsample, ResnetBlock, Upsample};
use super::{Autoencoder, NetworkWeights};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VaeConfig {
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    pub block_out_channels: Vec<usize>,
    pub layers_per_block: usize,
    pub latent_channels: usize,
    pub norm_num_groups: usize,
    pub scaling_factor: f64,
}

fn default_in_channels() -> usize {
    3
}

impl VaeConfig {
    /// Small autoencoder with a 4x spatial reduction, for tests and smoke runs.
    pub fn tiny() -> Self {
        Self {
            in_channels: 3,
            block_out_channels: vec![32, 32, 64],
            layers_per_block: 1,
            latent_channels: 4,
            norm_num_groups: 8,
            scaling_factor: 0.13025,
        }
    }
}

/// Diagonal Gaussian over latents produced by the encoder.
#[derive(Debug, Clone)]
pub struct LatentDist {
    pub mean: Tensor,
    pub logvar: Tensor,
}

impl LatentDist {
    pub fn new(moments: &Tensor) -> Result<Self> {
        let parts = moments.chunk(2, 1)?;
        Ok(Self {
            mean: parts[0].clone(),
            logvar: parts[1].clamp(-30f32, 20f32)?,
        })
    }

    /// Reparameterised draw `mean + std * eps`; `eps` must match the mean's shape.
    pub fn sample_with(&self, eps: &Tensor) -> Result<Tensor> {
        let std = (&self.logvar * 0.5)?.exp()?;
        self.mean.add(&std.mul(eps)?)
    }
}

#[derive(Debug)]
struct Encoder {
    conv_in: Conv2d,
    blocks: Vec<(Vec<ResnetBlock>, Option<Downsample>)>,
    mid: ResnetBlock,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Encoder {
    fn new(cfg: &VaeConfig, vb: VarBuilder) -> Result<Self> {
        let channels = &cfg.block_out_channels;
        let groups = cfg.norm_num_groups;
        let conv_in = conv3x3(cfg.in_channels, channels[0], 1, vb.pp("conv_in"))?;
        let mut blocks = Vec::with_capacity(channels.len());
        let mut prev = channels[0];
        for (i, &c) in channels.iter().enumerate() {
            let vb_b = vb.pp(format!("down_blocks.{i}"));
            let mut resnets = Vec::with_capacity(cfg.layers_per_block);
            for j in 0..cfg.layers_per_block {
                resnets.push(ResnetBlock::new(prev, c, None, groups, vb_b.pp(format!("resnets.{j}")))?);
                prev = c;
            }
            let down = if i + 1 < channels.len() {
                Some(Downsample::new(c, vb_b.pp("downsamplers.0"))?)
            } else {
                None
            };
            blocks.push((resnets, down));
        }
        Ok(Self {
            conv_in,
            blocks,
            mid: ResnetBlock::new(prev, prev, None, groups, vb.pp("mid_block"))?,
            norm_out: candle_nn::group_norm(groups, prev, 1e-6, vb.pp("conv_norm_out"))?,
            conv_out: conv3x3(prev, 2 * cfg.latent_channels, 1, vb.pp("conv_out"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = self.conv_in.forward(xs)?;
        for (resnets, down) in &self.blocks {
            for resnet in resnets {
                h = resnet.forward(&h, None)?;
            }
            if let Some(down) = down {
                h = down.forward(&h)?;
            }
        }
        let h = self.mid.forward(&h, None)?;
        self.conv_out.forward(&self.norm_out.forward(&h)?.silu()?)
    }
}

#[derive(Debug)]
struct Decoder {
    conv_in: Conv2d,
    mid: ResnetBlock,
    blocks: Vec<(Vec<ResnetBlock>, Option<Upsample>)>,
    norm_out: GroupNorm,
    conv_out: Conv2d,
}

impl Decoder {
    fn new(cfg: &VaeConfig, vb: VarBuilder) -> Result<Self> {
        let channels = &cfg.block_out_channels;
        let groups = cfg.norm_num_groups;
        let top = channels[channels.len() - 1];
        let conv_in = conv3x3(cfg.latent_channels, top, 1, vb.pp("conv_in"))?;
        let mid = ResnetBlock::new(top, top, None, groups, vb.pp("mid_block"))?;
        let mut blocks = Vec::with_capacity(channels.len());
        let mut prev = top;
        for (i, &c) in channels.iter().enumerate().rev() {
            let vb_b = vb.pp(format!("up_blocks.{i}"));
            let mut resnets = Vec::with_capacity(cfg.layers_per_block);
            for j in 0..cfg.layers_per_block {
                resnets.push(ResnetBlock::new(prev, c, None, groups, vb_b.pp(format!("resnets.{j}")))?);
                prev = c;
            }
            let up = if i > 0 {
                Some(Upsample::new(c, vb_b.pp("upsamplers.0"))?)
            } else {
                None
            };
            blocks.push((resnets, up));
        }
        Ok(Self {
            conv_in,
            mid,
            blocks,
            norm_out: candle_nn::group_norm(groups, prev, 1e-6, vb.pp("conv_norm_out"))?,
            conv_out: conv3x3(prev, cfg.in_channels, 1, vb.pp("conv_out"))?,
        })
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.conv_in.forward(xs)?;
        let mut h = self.mid.forward(&h, None)?;
        for (resnets, up) in &self.blocks {
            for resnet in resnets {
                h = resnet.forward(&h, None)?;
            }
            if let Some(up) = up {
                h = up.forward(&h)?;
            }
        }
        self.conv_out.forward(&self.norm_out.forward(&h)?.silu()?)
    }
}

pub struct CompactAutoencoder {
    encoder: Encoder,
    decoder: Decoder,
    quant_conv: Conv2d,
    post_quant_conv: Conv2d,
    config: VaeConfig,
    weights: NetworkWeights,
}

impl CompactAutoencoder {
    /// Build with freshly initialised weights.
    pub fn new(config: VaeConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let latent = config.latent_channels;
        Ok(Self {
            encoder: Encoder::new(&config, vb.pp("encoder"))?,
            decoder: Decoder::new(&config, vb.pp("decoder"))?,
            quant_conv: conv1x1(2 * latent, 2 * latent, vb.pp("quant_conv"))?,
            post_quant_conv: conv1x1(latent, latent, vb.pp("post_quant_conv"))?,
            config,
            weights: NetworkWeights::new(varmap, None),
        })
    }

    pub fn config(&self) -> &VaeConfig {
        &self.config
    }
}

impl Autoencoder for CompactAutoencoder {
    fn encode(&self, pixels: &Tensor) -> Result<LatentDist> {
        let moments = self.quant_conv.forward(&self.encoder.forward(pixels)?)?;
        LatentDist::new(&moments)
    }

    fn decode(&self, latents: &Tensor) -> Result<Tensor> {
        self.decoder.forward(&self.post_quant_conv.forward(latents)?)
    }

    fn scaling_factor(&self) -> f64 {
        self.config.scaling_factor
    }

    fn spatial_scale_factor(&self) -> usize {
        1 << (self.config.block_out_channels.len() - 1)
    }

    fn latent_channels(&self) -> usize {
        self.config.latent_channels
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

    #[test]
    fn encode_decode_shapes() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let vae = CompactAutoencoder::new(VaeConfig::tiny(), &device)?;
        assert_eq!(vae.spatial_scale_factor(), 4);

        let pixels = Tensor::zeros((2, 3, 32, 32), DType::F32, &device)?;
        let dist = vae.encode(&pixels)?;
        assert_eq!(dist.mean.dims(), &[2, 4, 8, 8]);
        assert_eq!(dist.logvar.dims(), &[2, 4, 8, 8]);

        let decoded = vae.decode(&dist.mean)?;
        assert_eq!(decoded.dims(), &[2, 3, 32, 32]);
        Ok(())
    }

    #[test]
    fn zero_noise_sample_is_the_mean() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let mean = Tensor::new(&[[1f32, -2.0]], &device)?;
        let dist = LatentDist {
            mean: mean.clone(),
            logvar: Tensor::zeros((1, 2), DType::F32, &device)?,
        };
        let eps = Tensor::zeros((1, 2), DType::F32, &device)?;
        assert_eq!(dist.sample_with(&eps)?.to_vec2::<f32>()?, mean.to_vec2::<f32>()?);
        Ok(())
    }
}
