//! Sub-network implementations and the traits the training core talks to.
//!
//! The engine never depends on a concrete architecture: it holds an [`Autoencoder`], one or
//! two [`TextEncoder`]s with their [`PromptTokenizer`]s, a [`Denoiser`] and optionally a
//! [`ConditioningNetwork`]. The compact networks in this module implement those seams with
//! candle-nn layers so they can be trained, saved and reloaded.

pub mod blocks;
pub mod lora;
pub mod vae;
pub mod text_encoder;
pub mod tokenizer;
pub mod unet;
pub mod t2i_adapter;
pub mod controlnet;
pub mod image_encoder;
pub mod ip_adapter;
pub mod sdxl_time_ids;

pub use controlnet::{ControlNet, ControlNetConfig};
pub use image_encoder::{ClipImageEncoder, ClipVisionPreset, CompactImageEncoder, CompactImageEncoderConfig};
pub use ip_adapter::{IpAdapter, IpAdapterConfig};
pub use lora::{LoraConfig, LoraLinear};
pub use sdxl_time_ids::TimeIdsConfig;
pub use t2i_adapter::{T2IAdapter, T2IAdapterConfig};
pub use text_encoder::{combine_dual_outputs, ClipPreset, ClipTextEncoder, CompactTextEncoder, CompactTextEncoderConfig, TextStack};
pub use tokenizer::{HashingTokenizer, HfPromptTokenizer, PromptTokenizer};
pub use unet::{CompactUNet, UNetConfig};
pub use vae::{CompactAutoencoder, LatentDist, VaeConfig};

use candle_core::{Result, Tensor, Var};
use candle_nn::VarMap;

/// Weights owned by one trainable sub-network: the base parameters plus optional LoRA
/// parameters registered under the same module paths.
#[derive(Clone)]
pub struct NetworkWeights {
    pub base: VarMap,
    pub lora: Option<VarMap>,
}

impl NetworkWeights {
    pub fn new(base: VarMap, lora: Option<VarMap>) -> Self {
        Self { base, lora }
    }

    pub fn base_vars(&self) -> Vec<Var> {
        self.base.all_vars()
    }

    pub fn lora_vars(&self) -> Vec<Var> {
        self.lora.as_ref().map(|m| m.all_vars()).unwrap_or_default()
    }
}

/// Pixel-space autoencoder.
pub trait Autoencoder {
    /// Encode a `[B, 3, H, W]` batch in `[-1, 1]` into the latent distribution.
    fn encode(&self, pixels: &Tensor) -> Result<LatentDist>;

    /// Decode unscaled latents back to pixels in `[-1, 1]`.
    fn decode(&self, latents: &Tensor) -> Result<Tensor>;

    /// Constant that brings latents to unit variance.
    fn scaling_factor(&self) -> f64;

    /// Spatial downsampling between pixels and latents.
    fn spatial_scale_factor(&self) -> usize;

    fn latent_channels(&self) -> usize;

    fn weights(&self) -> &NetworkWeights;

    fn config_json(&self) -> serde_json::Value;
}

/// Output of a text encoder for a tokenized batch.
#[derive(Debug, Clone)]
pub struct TextEncoderOutput {
    /// Token-level hidden states `[B, S, D]`.
    pub hidden_states: Tensor,
    /// Pooled sentence embedding `[B, P]`.
    pub pooled: Tensor,
}

pub trait TextEncoder {
    fn encode(&self, input_ids: &Tensor) -> Result<TextEncoderOutput>;

    fn hidden_size(&self) -> usize;

    /// `None` for encoders whose weights cannot receive gradients.
    fn weights(&self) -> Option<&NetworkWeights>;

    /// Architecture description written next to exported weights.
    fn config_json(&self) -> serde_json::Value;
}

/// Frozen image encoder feeding the image-prompt adapter.
pub trait ImageEncoder {
    /// Encode `[B, 3, S, S]` pixels in `[0, 1]` into `[B, E]` image embeddings, where `S` is
    /// [`ImageEncoder::image_size`].
    fn encode(&self, pixels: &Tensor) -> Result<Tensor>;

    fn image_size(&self) -> usize;

    fn embed_dim(&self) -> usize;

    /// `None` for encoders loaded from plain tensors.
    fn weights(&self) -> Option<&NetworkWeights>;

    fn config_json(&self) -> serde_json::Value;
}

/// Additional embedding inputs of resolution-conditioned denoisers.
#[derive(Debug, Clone)]
pub struct AddedConditions {
    /// Original size, crop offsets and target size, `[B, 6]`.
    pub time_ids: Tensor,
    /// Pooled text embedding, `[B, P]`.
    pub text_embeds: Tensor,
}

/// Extra feature maps injected into the denoiser by a conditioning network.
#[derive(Debug, Clone, Default)]
pub enum Residuals {
    #[default]
    None,
    /// Added to the hidden state at the end of each down level (T2I-Adapter).
    Intrablock(Vec<Tensor>),
    /// Added to each skip connection and to the mid block output (ControlNet).
    Skip { down: Vec<Tensor>, mid: Tensor },
    /// Extra keys and values for every cross-attention layer, in forward order (IP-Adapter).
    ImagePrompt(Vec<ImagePromptKv>),
}

/// Image-prompt tokens projected for one cross-attention layer, `[B, T, C]` each. The value
/// already carries the adapter scale.
#[derive(Debug, Clone)]
pub struct ImagePromptKv {
    pub key: Tensor,
    pub value: Tensor,
}

/// Noise-predicting network.
pub trait Denoiser {
    fn forward(
        &self,
        sample: &Tensor,
        timesteps: &Tensor,
        encoder_hidden_states: &Tensor,
        added: Option<&AddedConditions>,
        residuals: &Residuals,
    ) -> Result<Tensor>;

    fn in_channels(&self) -> usize;

    /// Latent resolution the network was configured for.
    fn sample_size(&self) -> usize;

    /// Whether `forward` needs [`AddedConditions`].
    fn uses_added_conditions(&self) -> bool;

    fn weights(&self) -> &NetworkWeights;

    fn config_json(&self) -> serde_json::Value;
}

/// Adapter-style network that turns a condition image into denoiser residuals.
pub enum ConditioningNetwork {
    Adapter(T2IAdapter),
    Control(ControlNet),
    /// Image prompt: a frozen image encoder followed by the trainable projection.
    ImagePrompt {
        adapter: IpAdapter,
        image_encoder: Box<dyn ImageEncoder>,
    },
}

/// Inputs a ControlNet needs besides the condition image.
pub struct ControlInputs<'a> {
    pub sample: &'a Tensor,
    pub timesteps: &'a Tensor,
    pub encoder_hidden_states: &'a Tensor,
    pub added: Option<&'a AddedConditions>,
}

/// Resize to the encoder's input size and encode without gradients.
fn encode_image_prompt(image_encoder: &dyn ImageEncoder, pixels: &Tensor) -> Result<Tensor> {
    let size = image_encoder.image_size();
    let (_, _, h, w) = pixels.dims4()?;
    let pixels = if (h, w) == (size, size) {
        pixels.clone()
    } else {
        pixels.upsample_nearest2d(size, size)?
    };
    Ok(image_encoder.encode(&pixels)?.detach())
}

impl ConditioningNetwork {
    /// `condition` is the control image for adapters and ControlNets and the image prompt,
    /// `[B, 3, H, W]` in `[0, 1]`, for IP-Adapters.
    pub fn residuals(&self, condition: &Tensor, inputs: &ControlInputs<'_>) -> Result<Residuals> {
        match self {
            Self::Adapter(adapter) => Ok(Residuals::Intrablock(adapter.forward(condition)?)),
            Self::Control(controlnet) => {
                let (down, mid) = controlnet.forward(
                    inputs.sample,
                    inputs.timesteps,
                    inputs.encoder_hidden_states,
                    inputs.added,
                    condition,
                )?;
                Ok(Residuals::Skip { down, mid })
            }
            Self::ImagePrompt { adapter, image_encoder } => {
                let embeds = encode_image_prompt(image_encoder.as_ref(), condition)?;
                Ok(Residuals::ImagePrompt(adapter.forward(&embeds)?))
            }
        }
    }

    /// Residuals for a `[uncond; cond]` guided batch built from one condition per prompt.
    /// Control images are repeated for both halves; image prompts use zero embeddings for the
    /// unconditional half.
    pub fn guided_residuals(&self, condition: &Tensor, inputs: &ControlInputs<'_>) -> Result<Residuals> {
        match self {
            Self::ImagePrompt { adapter, image_encoder } => {
                let embeds = encode_image_prompt(image_encoder.as_ref(), condition)?;
                let embeds = Tensor::cat(&[&embeds.zeros_like()?, &embeds], 0)?;
                Ok(Residuals::ImagePrompt(adapter.forward(&embeds)?))
            }
            _ => self.residuals(&Tensor::cat(&[condition, condition], 0)?, inputs),
        }
    }

    /// Whether residuals depend on the noisy sample and must be recomputed every step.
    pub fn depends_on_sample(&self) -> bool {
        matches!(self, Self::Control(_))
    }

    /// Image prompts are encoded at the encoder's resolution instead of the output size.
    pub fn condition_size(&self) -> Option<usize> {
        match self {
            Self::ImagePrompt { image_encoder, .. } => Some(image_encoder.image_size()),
            _ => None,
        }
    }

    /// The frozen image encoder of an image-prompt network.
    pub fn image_encoder(&self) -> Option<&dyn ImageEncoder> {
        match self {
            Self::ImagePrompt { image_encoder, .. } => Some(image_encoder.as_ref()),
            _ => None,
        }
    }

    pub fn weights(&self) -> &NetworkWeights {
        match self {
            Self::Adapter(adapter) => adapter.weights(),
            Self::Control(controlnet) => controlnet.weights(),
            Self::ImagePrompt { adapter, .. } => adapter.weights(),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Adapter(_) => "adapter",
            Self::Control(_) => "controlnet",
            Self::ImagePrompt { .. } => "ip_adapter",
        }
    }

    pub fn config_json(&self) -> serde_json::Value {
        match self {
            Self::Adapter(adapter) => adapter.config_json(),
            Self::Control(controlnet) => controlnet.config_json(),
            Self::ImagePrompt { adapter, .. } => adapter.config_json(),
        }
    }
}
