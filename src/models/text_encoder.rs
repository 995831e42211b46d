//! Text encoders: a trainable compact CLIP-style transformer and a frozen wrapper over the
//! candle-transformers CLIP text model for pretrained weights.

use candle_core::{bail, DType, Device, Module, Result, Tensor, D};
use candle_nn::{Embedding, LayerNorm, Linear, VarBuilder, VarMap};
use candle_transformers::models::stable_diffusion::clip;
use serde::{Deserialize, Serialize};
use std::path::Path;

use super::blocks::{Attention, FeedForward};
use super::lora::{lora_pp, LoraConfig, LoraVb};
use super::tokenizer::PromptTokenizer;
use super::{NetworkWeights, TextEncoder, TextEncoderOutput};

/// Pick the hidden state at the first `eos_token_id` of each row, or the last position when a
/// row has none (truncated prompts).
fn pool_at_eos(hidden: &Tensor, input_ids: &Tensor, eos_token_id: u32) -> Result<Tensor> {
    let (b, s, _) = hidden.dims3()?;
    let ids = input_ids.to_dtype(DType::U32)?.to_vec2::<u32>()?;
    let mut mask = vec![0f32; b * s];
    for (row, tokens) in ids.iter().enumerate() {
        let pos = tokens.iter().position(|&t| t == eos_token_id).unwrap_or(s - 1);
        mask[row * s + pos] = 1.0;
    }
    let mask = Tensor::from_vec(mask, (b, s, 1), hidden.device())?.to_dtype(hidden.dtype())?;
    hidden.broadcast_mul(&mask)?.sum(1)
}

fn causal_mask(seq_len: usize, device: &Device) -> Result<Tensor> {
    let mask: Vec<f32> = (0..seq_len)
        .flat_map(|i| (0..seq_len).map(move |j| if j > i { f32::NEG_INFINITY } else { 0.0 }))
        .collect();
    Tensor::from_vec(mask, (seq_len, seq_len), device)
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompactTextEncoderConfig {
    pub vocab_size: usize,
    pub hidden_size: usize,
    pub num_hidden_layers: usize,
    pub num_attention_heads: usize,
    pub max_position_embeddings: usize,
    /// When set, the pooled output is projected to this width.
    #[serde(default)]
    pub projection_dim: Option<usize>,
    pub eos_token_id: u32,
}

impl CompactTextEncoderConfig {
    pub fn tiny() -> Self {
        Self {
            vocab_size: 1000,
            hidden_size: 32,
            num_hidden_layers: 2,
            num_attention_heads: 4,
            max_position_embeddings: 77,
            projection_dim: None,
            eos_token_id: 999,
        }
    }

    /// Second encoder of a dual-encoder pair, with a projected pooled output.
    pub fn tiny_with_projection(projection_dim: usize) -> Self {
        Self {
            projection_dim: Some(projection_dim),
            ..Self::tiny()
        }
    }

    pub fn pooled_dim(&self) -> usize {
        self.projection_dim.unwrap_or(self.hidden_size)
    }

    /// The hashing tokenizer reserves the top two ids for start and end, so the vocabulary
    /// needs at least one word id besides them.
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size < 3 {
            bail!("vocab_size must be at least 3, got {}", self.vocab_size);
        }
        if self.eos_token_id as usize >= self.vocab_size {
            bail!(
                "eos_token_id {} is outside the vocabulary of {}",
                self.eos_token_id,
                self.vocab_size
            );
        }
        if self.max_position_embeddings < 2 {
            bail!(
                "max_position_embeddings must hold the start and end tokens, got {}",
                self.max_position_embeddings
            );
        }
        Ok(())
    }
}

#[derive(Debug)]
struct EncoderLayer {
    layer_norm1: LayerNorm,
    self_attn: Attention,
    layer_norm2: LayerNorm,
    mlp: FeedForward,
}

impl EncoderLayer {
    fn forward(&self, xs: &Tensor, mask: &Tensor) -> Result<Tensor> {
        let h = self.self_attn.forward(&self.layer_norm1.forward(xs)?, None, Some(mask))?;
        let xs = (xs + h)?;
        let h = self.mlp.forward(&self.layer_norm2.forward(&xs)?)?;
        xs + h
    }
}

pub struct CompactTextEncoder {
    token_embedding: Embedding,
    position_embedding: Embedding,
    layers: Vec<EncoderLayer>,
    final_layer_norm: LayerNorm,
    text_projection: Option<Linear>,
    config: CompactTextEncoderConfig,
    weights: NetworkWeights,
}

impl CompactTextEncoder {
    /// Build with fresh weights; LoRA adapters go on every self-attention projection.
    pub fn new(config: CompactTextEncoderConfig, lora: Option<LoraConfig>, device: &Device) -> Result<Self> {
        config.validate()?;
        let base = VarMap::new();
        let vb = VarBuilder::from_varmap(&base, DType::F32, device);
        let lora_map = lora.map(|_| VarMap::new());
        let lora_vb = match (&lora_map, lora) {
            (Some(map), Some(cfg)) => Some(LoraVb::new(VarBuilder::from_varmap(map, DType::F32, device), cfg)),
            _ => None,
        };

        let vb_m = vb.pp("text_model");
        let lora_m = lora_pp(lora_vb.as_ref(), "text_model");
        let emb = vb_m.pp("embeddings");
        let token_embedding =
            candle_nn::embedding(config.vocab_size, config.hidden_size, emb.pp("token_embedding"))?;
        let position_embedding = candle_nn::embedding(
            config.max_position_embeddings,
            config.hidden_size,
            emb.pp("position_embedding"),
        )?;

        let mut layers = Vec::with_capacity(config.num_hidden_layers);
        for i in 0..config.num_hidden_layers {
            let name = format!("encoder.layers.{i}");
            let vb_l = vb_m.pp(&name);
            let lora_l = lora_pp(lora_m.as_ref(), &name);
            layers.push(EncoderLayer {
                layer_norm1: candle_nn::layer_norm(config.hidden_size, 1e-5, vb_l.pp("layer_norm1"))?,
                self_attn: Attention::new(
                    config.hidden_size,
                    None,
                    config.num_attention_heads,
                    vb_l.pp("self_attn"),
                    lora_pp(lora_l.as_ref(), "self_attn").as_ref(),
                )?,
                layer_norm2: candle_nn::layer_norm(config.hidden_size, 1e-5, vb_l.pp("layer_norm2"))?,
                mlp: FeedForward::new(config.hidden_size, 4, vb_l.pp("mlp"))?,
            });
        }
        let final_layer_norm =
            candle_nn::layer_norm(config.hidden_size, 1e-5, vb_m.pp("final_layer_norm"))?;
        let text_projection = match config.projection_dim {
            Some(dim) => Some(candle_nn::linear_no_bias(config.hidden_size, dim, vb.pp("text_projection"))?),
            None => None,
        };

        Ok(Self {
            token_embedding,
            position_embedding,
            layers,
            final_layer_norm,
            text_projection,
            config,
            weights: NetworkWeights::new(base, lora_map),
        })
    }

    pub fn config(&self) -> &CompactTextEncoderConfig {
        &self.config
    }
}

impl TextEncoder for CompactTextEncoder {
    fn encode(&self, input_ids: &Tensor) -> Result<TextEncoderOutput> {
        let (_, seq_len) = input_ids.dims2()?;
        let device = input_ids.device();
        let positions = Tensor::arange(0u32, seq_len as u32, device)?;
        let mut xs = self
            .token_embedding
            .forward(input_ids)?
            .broadcast_add(&self.position_embedding.forward(&positions)?)?;

        let mask = causal_mask(seq_len, device)?;
        for layer in &self.layers {
            xs = layer.forward(&xs, &mask)?;
        }
        let hidden_states = self.final_layer_norm.forward(&xs)?;

        let pooled = pool_at_eos(&hidden_states, input_ids, self.config.eos_token_id)?;
        let pooled = match &self.text_projection {
            Some(proj) => proj.forward(&pooled)?,
            None => pooled,
        };
        Ok(TextEncoderOutput {
            hidden_states,
            pooled,
        })
    }

    fn hidden_size(&self) -> usize {
        self.config.hidden_size
    }

    fn weights(&self) -> Option<&NetworkWeights> {
        Some(&self.weights)
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::to_value(&self.config).unwrap_or_default()
    }
}

/// Known CLIP text-model shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClipPreset {
    /// CLIP ViT-L/14, SD 1.5.
    V1_5,
    /// CLIP ViT-L/14 as the first SDXL encoder.
    Sdxl,
    /// OpenCLIP ViT-bigG/14, second SDXL encoder.
    Sdxl2,
}

impl ClipPreset {
    fn config(self) -> clip::Config {
        match self {
            Self::V1_5 => clip::Config::v1_5(),
            Self::Sdxl => clip::Config::sdxl(),
            Self::Sdxl2 => clip::Config::sdxl2(),
        }
    }

    fn hidden_size(self) -> usize {
        match self {
            Self::V1_5 | Self::Sdxl => 768,
            Self::Sdxl2 => 1280,
        }
    }

    /// SDXL conditions on the penultimate layer, SD 1.5 on the final normed one.
    fn uses_penultimate_layer(self) -> bool {
        matches!(self, Self::Sdxl | Self::Sdxl2)
    }
}

/// Pretrained CLIP text model. Its weights are plain tensors, so it is always frozen.
pub struct ClipTextEncoder {
    model: clip::ClipTextTransformer,
    text_projection: Option<Linear>,
    preset: ClipPreset,
}

const CLIP_EOS_TOKEN_ID: u32 = 49407;

/// Hidden states from `penultimate` when given, else `last`; the pooled embedding is always the
/// EOS row of the normed `last` output, projected when the checkpoint ships a projection.
fn clip_outputs(
    last: &Tensor,
    penultimate: Option<Tensor>,
    input_ids: &Tensor,
    text_projection: Option<&Linear>,
) -> Result<TextEncoderOutput> {
    let pooled = pool_at_eos(last, input_ids, CLIP_EOS_TOKEN_ID)?;
    let pooled = match text_projection {
        Some(proj) => proj.forward(&pooled)?,
        None => pooled,
    };
    Ok(TextEncoderOutput {
        hidden_states: penultimate.unwrap_or_else(|| last.clone()),
        pooled,
    })
}

impl ClipTextEncoder {
    pub fn load(weights: &Path, preset: ClipPreset, device: &Device) -> Result<Self> {
        let tensors = candle_core::safetensors::load(weights, device)?;
        let text_projection = match tensors.get("text_projection.weight") {
            Some(w) => Some(Linear::new(w.to_dtype(DType::F32)?, None)),
            None => None,
        };
        let vb = VarBuilder::from_tensors(tensors, DType::F32, device);
        let model = clip::ClipTextTransformer::new(vb, &preset.config())?;
        Ok(Self {
            model,
            text_projection,
            preset,
        })
    }
}

impl TextEncoder for ClipTextEncoder {
    fn encode(&self, input_ids: &Tensor) -> Result<TextEncoderOutput> {
        if self.preset.uses_penultimate_layer() {
            let (last, penultimate) = self.model.forward_until_encoder_layer(input_ids, usize::MAX, -2)?;
            clip_outputs(&last, Some(penultimate), input_ids, self.text_projection.as_ref())
        } else {
            let last = self.model.forward(input_ids)?;
            clip_outputs(&last, None, input_ids, self.text_projection.as_ref())
        }
    }

    fn hidden_size(&self) -> usize {
        self.preset.hidden_size()
    }

    fn weights(&self) -> Option<&NetworkWeights> {
        None
    }

    fn config_json(&self) -> serde_json::Value {
        serde_json::json!({ "clip_preset": self.preset })
    }
}

/// Concatenate the hidden states of a dual-encoder pair along the feature axis and take the
/// pooled embedding from the second encoder.
pub fn combine_dual_outputs(first: TextEncoderOutput, second: TextEncoderOutput) -> Result<TextEncoderOutput> {
    Ok(TextEncoderOutput {
        hidden_states: Tensor::cat(&[first.hidden_states, second.hidden_states], D::Minus1)?,
        pooled: second.pooled,
    })
}

/// The tokenizer/encoder pairs of a model, one pair for SD 1.x style models and two for
/// SDXL style models.
pub struct TextStack {
    pub tokenizers: Vec<Box<dyn PromptTokenizer>>,
    pub encoders: Vec<Box<dyn TextEncoder>>,
}

impl TextStack {
    pub fn new(tokenizers: Vec<Box<dyn PromptTokenizer>>, encoders: Vec<Box<dyn TextEncoder>>) -> Result<Self> {
        if tokenizers.is_empty() || tokenizers.len() != encoders.len() || encoders.len() > 2 {
            bail!(
                "expected one or two tokenizer/encoder pairs, got {} tokenizers and {} encoders",
                tokenizers.len(),
                encoders.len()
            );
        }
        Ok(Self { tokenizers, encoders })
    }

    pub fn is_dual(&self) -> bool {
        self.encoders.len() == 2
    }

    /// Tokenize `prompts` with every tokenizer, encode with the matching encoder and combine.
    pub fn encode(&self, prompts: &[String], device: &Device) -> anyhow::Result<TextEncoderOutput> {
        let mut outputs = Vec::with_capacity(self.encoders.len());
        for (tokenizer, encoder) in self.tokenizers.iter().zip(&self.encoders) {
            let ids = tokenizer.tokenize(prompts, device)?;
            outputs.push(encoder.encode(&ids)?);
        }
        let mut outputs = outputs.into_iter();
        let first = match outputs.next() {
            Some(first) => first,
            None => anyhow::bail!("text stack holds no encoders"),
        };
        match outputs.next() {
            Some(second) => Ok(combine_dual_outputs(first, second)?),
            None => Ok(first),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HashingTokenizer, PromptTokenizer};

    #[test]
    fn compact_encoder_shapes() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let encoder = CompactTextEncoder::new(CompactTextEncoderConfig::tiny_with_projection(16), None, &device)?;
        let tok = HashingTokenizer::new(1000, 77);
        let ids = tok.tokenize(&["a dog".to_string(), "a cat on a mat".to_string()], &device)?;

        let out = encoder.encode(&ids)?;
        assert_eq!(out.hidden_states.dims(), &[2, 77, 32]);
        assert_eq!(out.pooled.dims(), &[2, 16]);
        Ok(())
    }

    #[test]
    fn pooling_picks_first_eos() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let hidden = Tensor::arange(0f32, 8.0, &device)?.reshape((1, 4, 2))?;
        let ids = Tensor::new(&[[5u32, 7, 9, 9]], &device)?;
        let pooled = pool_at_eos(&hidden, &ids, 9)?;
        assert_eq!(pooled.to_vec2::<f32>()?, vec![vec![4.0, 5.0]]);
        Ok(())
    }

    #[test]
    fn clip_outputs_pick_layer_and_project_pool() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let last = Tensor::arange(0f32, 8.0, &device)?.reshape((1, 4, 2))?;
        let penultimate = Tensor::full(-1f32, (1, 4, 2), &device)?;
        let ids = Tensor::new(&[[49406u32, 320, 49407, 49407]], &device)?;

        let plain = clip_outputs(&last, None, &ids, None)?;
        assert_eq!(plain.hidden_states.to_vec3::<f32>()?, last.to_vec3::<f32>()?);
        assert_eq!(plain.pooled.to_vec2::<f32>()?, vec![vec![4.0, 5.0]]);

        // Swap the two features and drop a third output row.
        let proj = Linear::new(Tensor::new(&[[0f32, 1.0], [1.0, 0.0], [0.0, 0.0]], &device)?, None);
        let xl = clip_outputs(&last, Some(penultimate), &ids, Some(&proj))?;
        assert!(xl.hidden_states.flatten_all()?.to_vec1::<f32>()?.iter().all(|&v| v == -1.0));
        assert_eq!(xl.pooled.to_vec2::<f32>()?, vec![vec![5.0, 4.0, 0.0]]);
        Ok(())
    }

    #[test]
    fn degenerate_vocabularies_are_rejected() -> anyhow::Result<()> {
        let device = Device::Cpu;
        for vocab_size in [0, 1, 2] {
            let config = CompactTextEncoderConfig {
                vocab_size,
                eos_token_id: 0,
                ..CompactTextEncoderConfig::tiny()
            };
            assert!(config.validate().is_err(), "vocab_size {vocab_size} accepted");
            assert!(CompactTextEncoder::new(config, None, &device).is_err());
        }

        let eos_outside = CompactTextEncoderConfig {
            eos_token_id: 1000,
            ..CompactTextEncoderConfig::tiny()
        };
        assert!(eos_outside.validate().is_err());

        let smallest = CompactTextEncoderConfig {
            vocab_size: 3,
            eos_token_id: 2,
            ..CompactTextEncoderConfig::tiny()
        };
        smallest.validate()?;
        let tok = HashingTokenizer::new(smallest.vocab_size, 8);
        let ids = tok.encode_ids("any words at all")?;
        assert_eq!(ids.first(), Some(&1));
        assert_eq!(ids.last(), Some(&2));
        assert!(ids[1..ids.len() - 1].iter().all(|&id| id == 0));
        Ok(())
    }

    #[test]
    fn lora_vars_are_separate() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let encoder = CompactTextEncoder::new(CompactTextEncoderConfig::tiny(), Some(LoraConfig::new(4)), &device)?;
        let weights = encoder.weights().ok_or_else(|| anyhow::anyhow!("no weights"))?;
        // Two layers, four projections each, down and up.
        assert_eq!(weights.lora_vars().len(), 16);
        Ok(())
    }

    #[test]
    fn dual_outputs_concatenate_features() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let a = TextEncoderOutput {
            hidden_states: Tensor::zeros((1, 77, 32), DType::F32, &device)?,
            pooled: Tensor::zeros((1, 32), DType::F32, &device)?,
        };
        let b = TextEncoderOutput {
            hidden_states: Tensor::ones((1, 77, 32), DType::F32, &device)?,
            pooled: Tensor::ones((1, 16), DType::F32, &device)?,
        };
        let out = combine_dual_outputs(a, b)?;
        assert_eq!(out.hidden_states.dims(), &[1, 77, 64]);
        assert_eq!(out.pooled.dims(), &[1, 16]);
        Ok(())
    }

    #[test]
    fn dual_stack_encodes_with_both_pairs() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let stack = TextStack::new(
            vec![Box::new(HashingTokenizer::new(1000, 77)), Box::new(HashingTokenizer::new(1000, 77))],
            vec![
                Box::new(CompactTextEncoder::new(CompactTextEncoderConfig::tiny(), None, &device)?),
                Box::new(CompactTextEncoder::new(
                    CompactTextEncoderConfig::tiny_with_projection(32),
                    None,
                    &device,
                )?),
            ],
        )?;
        assert!(stack.is_dual());
        let out = stack.encode(&["a photo of a dog".to_string()], &device)?;
        assert_eq!(out.hidden_states.dims(), &[1, 77, 64]);
        assert_eq!(out.pooled.dims(), &[1, 32]);
        Ok(())
    }
}
