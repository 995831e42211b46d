//! Building blocks shared by the compact autoencoder, UNet, ControlNet and text encoder.

use candle_core::{DType, Module, Result, Tensor, D};
use candle_nn::{Conv2d, Conv2dConfig, GroupNorm, LayerNorm, Linear, VarBuilder};

use super::lora::{lora_pp, LoraLinear, LoraVb};
use super::ImagePromptKv;

pub fn conv3x3(in_c: usize, out_c: usize, stride: usize, vb: VarBuilder) -> Result<Conv2d> {
    let cfg = Conv2dConfig {
        padding: 1,
        stride,
        ..Default::default()
    };
    candle_nn::conv2d(in_c, out_c, 3, cfg, vb)
}

pub fn conv1x1(in_c: usize, out_c: usize, vb: VarBuilder) -> Result<Conv2d> {
    candle_nn::conv2d(in_c, out_c, 1, Default::default(), vb)
}

/// 1x1 convolution initialised to zero, used on every ControlNet output so a fresh
/// ControlNet leaves the UNet untouched.
pub fn zero_conv(channels: usize, vb: VarBuilder) -> Result<Conv2d> {
    let weight = vb.get_with_hints(
        (channels, channels, 1, 1),
        "weight",
        candle_nn::Init::Const(0.0),
    )?;
    let bias = vb.get_with_hints(channels, "bias", candle_nn::Init::Const(0.0))?;
    Ok(Conv2d::new(weight, Some(bias), Default::default()))
}

/// Sinusoidal embedding of a `[N]` tensor of (possibly integer) positions, cos first.
pub fn timestep_embedding(timesteps: &Tensor, dim: usize) -> Result<Tensor> {
    let half = dim / 2;
    let device = timesteps.device();
    let exponent: Vec<f32> = (0..half)
        .map(|i| (-(10000f32).ln() * i as f32 / half as f32).exp())
        .collect();
    let freqs = Tensor::from_vec(exponent, (1, half), device)?;
    let t = timesteps.to_dtype(DType::F32)?.reshape(((), 1))?;
    let args = t.broadcast_mul(&freqs)?;
    Tensor::cat(&[args.cos()?, args.sin()?], D::Minus1)
}

#[derive(Debug, Clone)]
pub struct TimestepEmbedding {
    linear_1: Linear,
    linear_2: Linear,
}

impl TimestepEmbedding {
    pub fn new(in_dim: usize, out_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            linear_1: candle_nn::linear(in_dim, out_dim, vb.pp("linear_1"))?,
            linear_2: candle_nn::linear(out_dim, out_dim, vb.pp("linear_2"))?,
        })
    }
}

impl Module for TimestepEmbedding {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.linear_2.forward(&self.linear_1.forward(xs)?.silu()?)
    }
}

#[derive(Debug, Clone)]
pub struct ResnetBlock {
    norm1: GroupNorm,
    conv1: Conv2d,
    time_emb_proj: Option<Linear>,
    norm2: GroupNorm,
    conv2: Conv2d,
    conv_shortcut: Option<Conv2d>,
}

impl ResnetBlock {
    pub fn new(
        in_c: usize,
        out_c: usize,
        temb_dim: Option<usize>,
        groups: usize,
        vb: VarBuilder,
    ) -> Result<Self> {
        let time_emb_proj = match temb_dim {
            Some(d) => Some(candle_nn::linear(d, out_c, vb.pp("time_emb_proj"))?),
            None => None,
        };
        let conv_shortcut = if in_c != out_c {
            Some(conv1x1(in_c, out_c, vb.pp("conv_shortcut"))?)
        } else {
            None
        };
        Ok(Self {
            norm1: candle_nn::group_norm(groups, in_c, 1e-6, vb.pp("norm1"))?,
            conv1: conv3x3(in_c, out_c, 1, vb.pp("conv1"))?,
            time_emb_proj,
            norm2: candle_nn::group_norm(groups, out_c, 1e-6, vb.pp("norm2"))?,
            conv2: conv3x3(out_c, out_c, 1, vb.pp("conv2"))?,
            conv_shortcut,
        })
    }

    pub fn forward(&self, xs: &Tensor, temb: Option<&Tensor>) -> Result<Tensor> {
        let mut h = self.conv1.forward(&self.norm1.forward(xs)?.silu()?)?;
        if let (Some(proj), Some(temb)) = (&self.time_emb_proj, temb) {
            let t = proj.forward(&temb.silu()?)?.unsqueeze(2)?.unsqueeze(3)?;
            h = h.broadcast_add(&t)?;
        }
        let h = self.conv2.forward(&self.norm2.forward(&h)?.silu()?)?;
        let skip = match &self.conv_shortcut {
            Some(conv) => conv.forward(xs)?,
            None => xs.clone(),
        };
        skip + h
    }
}

#[derive(Debug, Clone)]
pub struct Downsample {
    conv: Conv2d,
}

impl Downsample {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv: conv3x3(channels, channels, 2, vb.pp("conv"))?,
        })
    }
}

impl Module for Downsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.conv.forward(xs)
    }
}

#[derive(Debug, Clone)]
pub struct Upsample {
    conv: Conv2d,
}

impl Upsample {
    pub fn new(channels: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv: conv3x3(channels, channels, 1, vb.pp("conv"))?,
        })
    }
}

impl Module for Upsample {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, _, h, w) = xs.dims4()?;
        self.conv.forward(&xs.upsample_nearest2d(h * 2, w * 2)?)
    }
}

/// Multi-head attention; cross-attention when `context` is given.
#[derive(Debug, Clone)]
pub struct Attention {
    to_q: LoraLinear,
    to_k: LoraLinear,
    to_v: LoraLinear,
    to_out: LoraLinear,
    heads: usize,
}

impl Attention {
    pub fn new(
        query_dim: usize,
        context_dim: Option<usize>,
        heads: usize,
        vb: VarBuilder,
        lora: Option<&LoraVb>,
    ) -> Result<Self> {
        let context_dim = context_dim.unwrap_or(query_dim);
        Ok(Self {
            to_q: LoraLinear::new(query_dim, query_dim, false, vb.pp("to_q"), lora_pp(lora, "to_q"))?,
            to_k: LoraLinear::new(context_dim, query_dim, false, vb.pp("to_k"), lora_pp(lora, "to_k"))?,
            to_v: LoraLinear::new(context_dim, query_dim, false, vb.pp("to_v"), lora_pp(lora, "to_v"))?,
            to_out: LoraLinear::new(query_dim, query_dim, true, vb.pp("to_out"), lora_pp(lora, "to_out"))?,
            heads,
        })
    }

    fn split_heads(&self, xs: &Tensor) -> Result<Tensor> {
        let (b, s, d) = xs.dims3()?;
        xs.reshape((b, s, self.heads, d / self.heads))?
            .transpose(1, 2)?
            .contiguous()
    }

    /// Scaled dot-product attention on head-split tensors, `[B, H, S, Dh]`.
    fn attend(&self, q: &Tensor, k: &Tensor, v: &Tensor, mask: Option<&Tensor>) -> Result<Tensor> {
        let scale = 1.0 / (q.dim(D::Minus1)? as f64).sqrt();
        let mut logits = (q.matmul(&k.t()?)? * scale)?;
        if let Some(mask) = mask {
            logits = logits.broadcast_add(mask)?;
        }
        candle_nn::ops::softmax_last_dim(&logits)?.matmul(v)
    }

    fn merge_heads(xs: &Tensor) -> Result<Tensor> {
        let (b, h, s, dh) = xs.dims4()?;
        xs.transpose(1, 2)?.reshape((b, s, h * dh))
    }

    /// `mask` is added to the attention logits and must broadcast to `[B, H, S, S_ctx]`.
    pub fn forward(&self, xs: &Tensor, context: Option<&Tensor>, mask: Option<&Tensor>) -> Result<Tensor> {
        let context = context.unwrap_or(xs);
        let q = self.split_heads(&self.to_q.forward(xs)?)?;
        let k = self.split_heads(&self.to_k.forward(context)?)?;
        let v = self.split_heads(&self.to_v.forward(context)?)?;
        let out = Self::merge_heads(&self.attend(&q, &k, &v, mask)?)?;
        self.to_out.forward(&out)
    }

    /// Cross-attention over the text context plus a second attention over image-prompt
    /// tokens with the same queries; the two are summed before the output projection.
    pub fn forward_with_image_prompt(
        &self,
        xs: &Tensor,
        context: &Tensor,
        image_prompt: &ImagePromptKv,
    ) -> Result<Tensor> {
        let q = self.split_heads(&self.to_q.forward(xs)?)?;
        let k = self.split_heads(&self.to_k.forward(context)?)?;
        let v = self.split_heads(&self.to_v.forward(context)?)?;
        let text = self.attend(&q, &k, &v, None)?;

        let k_ip = self.split_heads(&image_prompt.key)?;
        let v_ip = self.split_heads(&image_prompt.value)?;
        let image = self.attend(&q, &k_ip, &v_ip, None)?;

        let out = Self::merge_heads(&(text + image)?)?;
        self.to_out.forward(&out)
    }
}

#[derive(Debug, Clone)]
pub struct FeedForward {
    proj_in: Linear,
    proj_out: Linear,
}

impl FeedForward {
    pub fn new(dim: usize, mult: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            proj_in: candle_nn::linear(dim, dim * mult, vb.pp("proj_in"))?,
            proj_out: candle_nn::linear(dim * mult, dim, vb.pp("proj_out"))?,
        })
    }
}

impl Module for FeedForward {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.proj_out.forward(&self.proj_in.forward(xs)?.gelu()?)
    }
}

/// Self-attention, cross-attention and feed-forward over flattened spatial tokens.
#[derive(Debug, Clone)]
pub struct TransformerBlock {
    norm1: LayerNorm,
    attn1: Attention,
    norm2: LayerNorm,
    attn2: Attention,
    norm3: LayerNorm,
    ff: FeedForward,
}

impl TransformerBlock {
    pub fn new(
        dim: usize,
        context_dim: usize,
        heads: usize,
        vb: VarBuilder,
        lora: Option<&LoraVb>,
    ) -> Result<Self> {
        Ok(Self {
            norm1: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm1"))?,
            attn1: Attention::new(dim, None, heads, vb.pp("attn1"), lora_pp(lora, "attn1").as_ref())?,
            norm2: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm2"))?,
            attn2: Attention::new(dim, Some(context_dim), heads, vb.pp("attn2"), lora_pp(lora, "attn2").as_ref())?,
            norm3: candle_nn::layer_norm(dim, 1e-5, vb.pp("norm3"))?,
            ff: FeedForward::new(dim, 4, vb.pp("ff"))?,
        })
    }

    pub fn forward(&self, xs: &Tensor, context: &Tensor, image_prompt: Option<&ImagePromptKv>) -> Result<Tensor> {
        let xs = (self.attn1.forward(&self.norm1.forward(xs)?, None, None)? + xs)?;
        let normed = self.norm2.forward(&xs)?;
        let cross = match image_prompt {
            Some(ip) => self.attn2.forward_with_image_prompt(&normed, context, ip)?,
            None => self.attn2.forward(&normed, Some(context), None)?,
        };
        let xs = (cross + &xs)?;
        self.ff.forward(&self.norm3.forward(&xs)?)? + xs
    }
}

/// Wraps a [`TransformerBlock`] so it can run on `[B, C, H, W]` feature maps.
#[derive(Debug, Clone)]
pub struct SpatialTransformer {
    norm: GroupNorm,
    proj_in: Linear,
    block: TransformerBlock,
    proj_out: Linear,
}

impl SpatialTransformer {
    pub fn new(
        channels: usize,
        context_dim: usize,
        heads: usize,
        groups: usize,
        vb: VarBuilder,
        lora: Option<&LoraVb>,
    ) -> Result<Self> {
        Ok(Self {
            norm: candle_nn::group_norm(groups, channels, 1e-6, vb.pp("norm"))?,
            proj_in: candle_nn::linear(channels, channels, vb.pp("proj_in"))?,
            block: TransformerBlock::new(
                channels,
                context_dim,
                heads,
                vb.pp("transformer_blocks.0"),
                lora_pp(lora, "transformer_blocks.0").as_ref(),
            )?,
            proj_out: candle_nn::linear(channels, channels, vb.pp("proj_out"))?,
        })
    }

    pub fn forward(&self, xs: &Tensor, context: &Tensor, image_prompt: Option<&ImagePromptKv>) -> Result<Tensor> {
        let (b, c, h, w) = xs.dims4()?;
        let tokens = self
            .norm
            .forward(xs)?
            .reshape((b, c, h * w))?
            .transpose(1, 2)?
            .contiguous()?;
        let tokens = self.proj_in.forward(&tokens)?;
        let tokens = self.block.forward(&tokens, context, image_prompt)?;
        let tokens = self.proj_out.forward(&tokens)?;
        let out = tokens.transpose(1, 2)?.contiguous()?.reshape((b, c, h, w))?;
        out + xs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn timestep_embedding_shape_and_origin() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let t = Tensor::new(&[0i64, 500, 999], &device)?;
        let emb = timestep_embedding(&t, 16)?;
        assert_eq!(emb.dims(), &[3, 16]);

        // t = 0 gives cos = 1 and sin = 0 for every frequency.
        let first = emb.get(0)?.to_vec1::<f32>()?;
        assert!(first[..8].iter().all(|v| (v - 1.0).abs() < 1e-6));
        assert!(first[8..].iter().all(|v| v.abs() < 1e-6));
        Ok(())
    }

    #[test]
    fn zero_image_prompt_values_leave_cross_attention_unchanged() -> anyhow::Result<()> {
        let device = Device::Cpu;
        let varmap = candle_nn::VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let attn = Attention::new(16, Some(8), 4, vb, None)?;
        let xs = Tensor::randn(0f32, 1.0, (2, 5, 16), &device)?;
        let ctx = Tensor::randn(0f32, 1.0, (2, 7, 8), &device)?;

        let plain = attn.forward(&xs, Some(&ctx), None)?;
        let silent = ImagePromptKv {
            key: Tensor::randn(0f32, 1.0, (2, 4, 16), &device)?,
            value: Tensor::zeros((2, 4, 16), DType::F32, &device)?,
        };
        let with_ip = attn.forward_with_image_prompt(&xs, &ctx, &silent)?;
        assert_eq!(with_ip.dims(), &[2, 5, 16]);
        let diff = (&plain - &with_ip)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);

        let loud = ImagePromptKv {
            key: silent.key.clone(),
            value: Tensor::ones((2, 4, 16), DType::F32, &device)?,
        };
        let moved = attn.forward_with_image_prompt(&xs, &ctx, &loud)?;
        let diff = (plain - moved)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff > 1e-4);
        Ok(())
    }
}
