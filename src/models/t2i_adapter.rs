//! T2I-Adapter: a light convolutional network turning a condition image into one feature map
//! per denoiser level.

use candle_core::{bail, DType, Device, Module, Result, Tensor};
use candle_nn::{Conv2d, VarBuilder, VarMap};
use serde::{Deserialize, Serialize};

use super::blocks::{conv1x1, conv3x3};
use super::NetworkWeights;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct T2IAdapterConfig {
    #[serde(default = "default_in_channels")]
    pub in_channels: usize,
    pub channels: Vec<usize>,
    pub num_res_blocks: usize,
    pub downscale_factor: usize,
    #[serde(default = "default_adapter_type")]
    pub adapter_type: String,
}

fn default_in_channels() -> usize {
    3
}

fn default_adapter_type() -> String {
    "full_adapter_xl".to_string()
}

impl Default for T2IAdapterConfig {
    fn default() -> Self {
        Self {
            in_channels: 3,
            channels: vec![320, 640, 1280, 1280],
            num_res_blocks: 2,
            downscale_factor: 16,
            adapter_type: default_adapter_type(),
        }
    }
}

impl T2IAdapterConfig {
    /// Ratio between the condition image and the smallest feature map.
    pub fn total_downscale_factor(&self) -> usize {
        self.downscale_factor << self.channels.len().saturating_sub(1)
    }
}

/// `[B, C, H, W] -> [B, C * r * r, H / r, W / r]`.
pub fn pixel_unshuffle(xs: &Tensor, r: usize) -> Result<Tensor> {
    let (b, c, h, w) = xs.dims4()?;
    if h % r != 0 || w % r != 0 {
        bail!("pixel_unshuffle: {h}x{w} is not divisible by {r}");
    }
    xs.reshape(vec![b, c, h / r, r, w / r, r])?
        .permute(vec![0, 1, 3, 5, 2, 4])?
        .reshape((b, c * r * r, h / r, w / r))
}

#[derive(Debug)]
struct AdapterResnet {
    block1: Conv2d,
    block2: Conv2d,
}

impl Module for AdapterResnet {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let h = self.block2.forward(&self.block1.forward(xs)?.relu()?)?;
        h + xs
    }
}

#[derive(Debug)]
struct AdapterBlock {
    downsample: bool,
    in_conv: Option<Conv2d>,
    resnets: Vec<AdapterResnet>,
}

impl AdapterBlock {
    fn new(in_c: usize, out_c: usize, num_res_blocks: usize, downsample: bool, vb: VarBuilder) -> Result<Self> {
        let in_conv = if in_c != out_c {
            Some(conv1x1(in_c, out_c, vb.pp("in_conv"))?)
        } else {
            None
        };
        let resnets = (0..num_res_blocks)
            .map(|i| -> Result<AdapterResnet> {
                let vb_r = vb.pp(format!("resnets.{i}"));
                Ok(AdapterResnet {
                    block1: conv3x3(out_c, out_c, 1, vb_r.pp("block1"))?,
                    block2: conv1x1(out_c, out_c, vb_r.pp("block2"))?,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            downsample,
            in_conv,
            resnets,
        })
    }
}

impl Module for AdapterBlock {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let mut h = if self.downsample {
            xs.avg_pool2d(2)?
        } else {
            xs.clone()
        };
        if let Some(conv) = &self.in_conv {
            h = conv.forward(&h)?;
        }
        for resnet in &self.resnets {
            h = resnet.forward(&h)?;
        }
        Ok(h)
    }
}

pub struct T2IAdapter {
    conv_in: Conv2d,
    body: Vec<AdapterBlock>,
    config: T2IAdapterConfig,
    weights: NetworkWeights,
}

impl T2IAdapter {
    pub fn new(config: T2IAdapterConfig, device: &Device) -> Result<Self> {
        if config.channels.is_empty() {
            bail!("adapter needs at least one channel level");
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device).pp("adapter");
        let r = config.downscale_factor;
        let conv_in = conv3x3(config.in_channels * r * r, config.channels[0], 1, vb.pp("conv_in"))?;
        let mut body = Vec::with_capacity(config.channels.len());
        let mut prev = config.channels[0];
        for (i, &c) in config.channels.iter().enumerate() {
            body.push(AdapterBlock::new(
                prev,
                c,
                config.num_res_blocks,
                i > 0,
                vb.pp(format!("body.{i}")),
            )?);
            prev = c;
        }
        Ok(Self {
            conv_in,
            body,
            config,
            weights: NetworkWeights::new(varmap, None),
        })
    }

    pub fn config(&self) -> &T2IAdapterConfig {
        &self.config
    }

    pub fn downscale_factor(&self) -> usize {
        self.config.downscale_factor
    }

    pub fn total_downscale_factor(&self) -> usize {
        self.config.total_downscale_factor()
    }

    /// Condition image in `[0, 1]` to one feature map per level.
    pub fn forward(&self, condition: &Tensor) -> Result<Vec<Tensor>> {
        let mut h = self
            .conv_in
            .forward(&pixel_unshuffle(condition, self.config.downscale_factor)?)?;
        let mut features = Vec::with_capacity(self.body.len());
        for block in &self.body {
            h = block.forward(&h)?;
            features.push(h.clone());
        }
        Ok(features)
    }

    pub fn weights(&self) -> &NetworkWeights {
        &self.weights
    }

    pub fn config_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}
