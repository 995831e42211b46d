//! Frozen image encoders for image prompts: a compact convolutional encoder for fresh
//! models and a wrapper over the candle-transformers CLIP vision tower for pretrained weights.

use candle_core::{bail, DType, Device, Module, Result, Tensor, D};
use candle_nn::{Conv2d, Linear, VarBuilder, VarMap};
use candle_transformers::models::clip::vision_model::{ClipVisionConfig, ClipVisionTransformer};
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::blocks::conv3x3;
use super::{ImageEncoder, NetworkWeights};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactImageEncoderConfig {
    pub image_size: usize,
    /// One stride-2 convolution per entry.
    pub channels: Vec<usize>,
    pub embed_dim: usize,
}

impl CompactImageEncoderConfig {
    pub fn tiny() -> Self {
        Self {
            image_size: 32,
            channels: vec![16, 32],
            embed_dim: 32,
        }
    }
}

/// Strided convolutions, global average pooling and a linear projection.
pub struct CompactImageEncoder {
    convs: Vec<Conv2d>,
    visual_projection: Linear,
    config: CompactImageEncoderConfig,
    weights: NetworkWeights,
}

impl CompactImageEncoder {
    pub fn new(config: CompactImageEncoderConfig, device: &Device) -> Result<Self> {
        if config.channels.is_empty() {
            bail!("image encoder needs at least one convolution");
        }
        let base = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, DType::F32, device);
        let vb_m = vb.pp("vision_model");
        let mut convs = Vec::with_capacity(config.channels.len());
        let mut prev = 3;
        for (i, &c) in config.channels.iter().enumerate() {
            convs.push(conv3x3(prev, c, 2, vb_m.pp(format!("convs.{i}")))?);
            prev = c;
        }
        let visual_projection = candle_nn::linear_no_bias(prev, config.embed_dim, vb.pp("visual_projection"))?;
        Ok(Self {
            convs,
            visual_projection,
            config,
            weights: NetworkWeights::new(base, None),
        })
    }
}

impl ImageEncoder for CompactImageEncoder {
    fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        let mut h = ((pixels * 2.0)? - 1.0)?;
        for conv in &self.convs {
            h = conv.forward(&h)?.silu()?;
        }
        let pooled = h.mean(D::Minus1)?.mean(D::Minus1)?;
        self.visual_projection.forward(&pooled)
    }

    fn image_size(&self) -> usize {
        self.config.image_size
    }

    fn embed_dim(&self) -> usize {
        self.config.embed_dim
    }

    fn weights(&self) -> Option<&NetworkWeights> {
        Some(&self.weights)
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}

/// Known CLIP vision-tower shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipVisionPreset {
    /// CLIP ViT-B/32 at 224 px.
    VitBasePatch32,
    /// CLIP ViT-L/14 at 336 px.
    VitLargePatch14_336,
}

impl ClipVisionPreset {
    fn config(self) -> ClipVisionConfig {
        match self {
            Self::VitBasePatch32 => ClipVisionConfig::vit_base_patch32(),
            Self::VitLargePatch14_336 => ClipVisionConfig::clip_vit_large_patch14_336(),
        }
    }

    fn image_size(self) -> usize {
        match self {
            Self::VitBasePatch32 => 224,
            Self::VitLargePatch14_336 => 336,
        }
    }

    fn hidden_size(self) -> usize {
        match self {
            Self::VitBasePatch32 => 768,
            Self::VitLargePatch14_336 => 1024,
        }
    }
}

const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];
const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Pretrained CLIP vision tower with its optional `visual_projection`. Always frozen.
pub struct ClipImageEncoder {
    model: ClipVisionTransformer,
    visual_projection: Option<Linear>,
    embed_dim: usize,
    preset: ClipVisionPreset,
}

impl ClipImageEncoder {
    pub fn load(weights: &Path, preset: ClipVisionPreset, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(weights, device)?;
        let (visual_projection, embed_dim) = match tensors.get("visual_projection.weight") {
            Some(w) => (Some(Linear::new(w.to_dtype(DType::F32)?, None)), w.dim(0)?),
            None => (None, preset.hidden_size()),
        };
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let model = ClipVisionTransformer::new(vb.pp("vision_model"), &preset.config())?;
        Ok(Self {
            model,
            visual_projection,
            embed_dim,
            preset,
        })
    }
}

/// `[B, 3, H, W]` in `[0, 1]` to CLIP's per-channel normalisation.
fn clip_normalize(pixels: &Tensor) -> Result<Tensor> {
    let device = pixels.device();
    let mean = Tensor::new(&CLIP_MEAN, device)?.reshape((1, 3, 1, 1))?;
    let std = Tensor::new(&CLIP_STD, device)?.reshape((1, 3, 1, 1))?;
    pixels.to_dtype(DType::F32)?.broadcast_sub(&mean)?.broadcast_div(&std)
}

impl ImageEncoder for ClipImageEncoder {
    fn encode(&self, pixels: &Tensor) -> Result<Tensor> {
        let pooled = self.model.forward(&clip_normalize(pixels)?)?;
        match &self.visual_projection {
            Some(proj) => proj.forward(&pooled),
            None => Ok(pooled),
        }
    }

    fn image_size(&self) -> usize {
        self.preset.image_size()
    }

    fn embed_dim(&self) -> usize {
        self.embed_dim
    }

    fn weights(&self) -> Option<&NetworkWeights> {
        None
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::json!({ "clip_vision_preset": self.preset })
    }
}
