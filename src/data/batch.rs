//! Raw batches as produced by a data loader, and their canonical stacked form.

use anyhow::Result;
use candle_core::Tensor;
use log::debug;

use crate::error::contract_bail;

/// Text side of a raw batch.
#[derive(Debug, Clone)]
pub enum TextInput {
    Prompts(Vec<String>),
    /// Pre-computed conditioning, one tensor per example: `[S, D]` hidden states and `[P]`
    /// pooled embeddings.
    Embeddings {
        prompt_embeds: Vec<Tensor>,
        pooled_prompt_embeds: Vec<Tensor>,
    },
}

impl TextInput {
    pub fn len(&self) -> usize {
        match self {
            Self::Prompts(p) => p.len(),
            Self::Embeddings { prompt_embeds, .. } => prompt_embeds.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Prompts(_) => "prompts",
            Self::Embeddings { .. } => "embeddings",
        }
    }

    fn concat(self, other: TextInput) -> Result<Self> {
        match (self, other) {
            (Self::Prompts(mut a), Self::Prompts(b)) => {
                a.extend(b);
                Ok(Self::Prompts(a))
            }
            (
                Self::Embeddings {
                    mut prompt_embeds,
                    mut pooled_prompt_embeds,
                },
                Self::Embeddings {
                    prompt_embeds: pe,
                    pooled_prompt_embeds: ppe,
                },
            ) => {
                prompt_embeds.extend(pe);
                pooled_prompt_embeds.extend(ppe);
                Ok(Self::Embeddings {
                    prompt_embeds,
                    pooled_prompt_embeds,
                })
            }
            (a, b) => contract_bail!(
                "class images carry {} but the batch carries {}",
                b.kind(),
                a.kind()
            ),
        }
    }
}

/// DreamBooth class-image sub-batch merged into the primary batch for prior preservation.
#[derive(Debug, Clone)]
pub struct ClassImageBatch {
    pub img: Vec<Tensor>,
    pub text: TextInput,
    pub time_ids: Option<Vec<Tensor>>,
}

/// One batch as handed over by the data loader. Per-example tensors are not yet stacked.
#[derive(Debug, Clone)]
pub struct RawBatch {
    /// `[3, H, W]` images in `[-1, 1]`.
    pub img: Vec<Tensor>,
    pub text: TextInput,
    /// `[6]` or `[1, 6]` resolution conditioning per example.
    pub time_ids: Option<Vec<Tensor>>,
    /// `[3, H, W]` condition images in `[0, 1]`.
    pub condition_img: Option<Vec<Tensor>>,
    /// `[3, S, S]` image prompts in `[0, 1]`, all of one size.
    pub clip_img: Option<Vec<Tensor>>,
    pub result_class_image: Option<ClassImageBatch>,
}

impl RawBatch {
    pub fn new(img: Vec<Tensor>, text: TextInput) -> Self {
        Self {
            img,
            text,
            time_ids: None,
            condition_img: None,
            clip_img: None,
            result_class_image: None,
        }
    }

    pub fn with_time_ids(mut self, time_ids: Vec<Tensor>) -> Self {
        self.time_ids = Some(time_ids);
        self
    }

    pub fn with_condition_img(mut self, condition_img: Vec<Tensor>) -> Self {
        self.condition_img = Some(condition_img);
        self
    }

    pub fn with_clip_img(mut self, clip_img: Vec<Tensor>) -> Self {
        self.clip_img = Some(clip_img);
        self
    }

    pub fn with_class_images(mut self, class_images: ClassImageBatch) -> Self {
        self.result_class_image = Some(class_images);
        self
    }
}

/// Stacked text side of a canonical batch.
#[derive(Debug, Clone)]
pub enum TextBatch {
    Prompts(Vec<String>),
    Embeddings {
        /// `[B, S, D]`
        prompt_embeds: Tensor,
        /// `[B, P]`
        pooled_prompt_embeds: Tensor,
    },
}

/// Canonical batch consumed by the training step.
#[derive(Debug, Clone)]
pub struct Batch {
    /// `[B, 3, H, W]`
    pub img: Tensor,
    pub text: TextBatch,
    /// `[B, 6]`
    pub time_ids: Option<Tensor>,
    /// `[B, 3, H, W]`
    pub condition_img: Option<Tensor>,
    /// `[B, 3, S, S]`
    pub clip_img: Option<Tensor>,
    /// Set when a class-image sub-batch was merged; the first half of the batch holds the
    /// instance examples and the second half the class examples.
    pub prior_preservation: bool,
}

impl Batch {
    pub fn batch_size(&self) -> Result<usize> {
        Ok(self.img.dim(0)?)
    }
}

/// Per-variant rules for turning a [`RawBatch`] into a [`Batch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchNormalizer {
    /// Text-to-image and DreamBooth: class images are merged, condition images are ignored.
    Standard,
    /// ControlNet / T2I-Adapter: condition images are required, class images are rejected.
    Conditioned,
    /// IP-Adapter: image prompts are required, class images are rejected.
    ImagePrompt,
}

fn stack_time_ids(time_ids: &[Tensor]) -> Result<Tensor> {
    let rows = time_ids
        .iter()
        .map(|t| t.reshape((1, 6)))
        .collect::<candle_core::Result<Vec<_>>>()?;
    Ok(Tensor::cat(&rows, 0)?)
}

impl BatchNormalizer {
    pub fn normalize(&self, raw: RawBatch) -> Result<Batch> {
        let RawBatch {
            mut img,
            mut text,
            mut time_ids,
            condition_img,
            clip_img,
            result_class_image,
        } = raw;

        let mut prior_preservation = false;
        if let Some(class) = result_class_image {
            if *self != Self::Standard {
                contract_bail!("result_class_image is not supported when training a conditioning network");
            }
            if class.img.len() != img.len() {
                contract_bail!(
                    "prior preservation needs as many class images as instance images, got {} and {}",
                    class.img.len(),
                    img.len()
                );
            }
            if class.text.len() != class.img.len() {
                contract_bail!(
                    "class batch has {} images but {} texts",
                    class.img.len(),
                    class.text.len()
                );
            }
            text = text.concat(class.text)?;
            img.extend(class.img);
            time_ids = match (time_ids, class.time_ids) {
                (Some(mut a), Some(b)) => {
                    a.extend(b);
                    Some(a)
                }
                (None, None) => None,
                _ => contract_bail!("time_ids must be given for both instance and class images or neither"),
            };
            prior_preservation = true;
            debug!("Merged class images, batch size is now {}", img.len());
        }

        if img.is_empty() {
            contract_bail!("batch has no images");
        }
        if text.len() != img.len() {
            contract_bail!("batch has {} images but {} texts", img.len(), text.len());
        }

        let condition_img = match (self, condition_img) {
            (Self::Conditioned, Some(cond)) => {
                if cond.len() != img.len() {
                    contract_bail!(
                        "batch has {} images but {} condition images",
                        img.len(),
                        cond.len()
                    );
                }
                Some(Tensor::stack(&cond, 0)?)
            }
            (Self::Conditioned, None) => contract_bail!("condition_img is required when training a conditioning network"),
            (Self::Standard | Self::ImagePrompt, _) => None,
        };

        let clip_img = match (self, clip_img) {
            (Self::ImagePrompt, Some(clip)) => {
                if clip.len() != img.len() {
                    contract_bail!("batch has {} images but {} clip images", img.len(), clip.len());
                }
                Some(Tensor::stack(&clip, 0)?)
            }
            (Self::ImagePrompt, None) => contract_bail!("clip_img is required when training an image-prompt adapter"),
            (Self::Standard | Self::Conditioned, _) => None,
        };

        let time_ids = match time_ids {
            Some(t) if t.len() != img.len() => {
                contract_bail!("batch has {} images but {} time_ids", img.len(), t.len())
            }
            Some(t) => Some(stack_time_ids(&t)?),
            None => None,
        };

        let text = match text {
            TextInput::Prompts(p) => TextBatch::Prompts(p),
            TextInput::Embeddings {
                prompt_embeds,
                pooled_prompt_embeds,
            } => {
                if pooled_prompt_embeds.len() != prompt_embeds.len() {
                    contract_bail!(
                        "got {} prompt embeddings but {} pooled embeddings",
                        prompt_embeds.len(),
                        pooled_prompt_embeds.len()
                    );
                }
                TextBatch::Embeddings {
                    prompt_embeds: Tensor::stack(&prompt_embeds, 0)?,
                    pooled_prompt_embeds: Tensor::stack(&pooled_prompt_embeds, 0)?,
                }
            }
        };

        Ok(Batch {
            img: Tensor::stack(&img, 0)?,
            text,
            time_ids,
            condition_img,
            clip_img,
            prior_preservation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use candle_core::{DType, Device};

    fn images(n: usize, device: &Device) -> Vec<Tensor> {
        (0..n)
            .map(|_| Tensor::zeros((3, 8, 8), DType::F32, device))
            .collect::<candle_core::Result<Vec<_>>>()
            .unwrap_or_default()
    }

    fn prompts(names: &[&str]) -> TextInput {
        TextInput::Prompts(names.iter().map(|s| s.to_string()).collect())
    }

    fn is_contract_violation(err: &anyhow::Error) -> bool {
        matches!(err.downcast_ref::<EngineError>(), Some(EngineError::ContractViolation(_)))
    }

    #[test]
    fn class_images_are_appended() -> Result<()> {
        let device = Device::Cpu;
        let raw = RawBatch::new(images(2, &device), prompts(&["a sks dog", "a sks dog"])).with_class_images(
            ClassImageBatch {
                img: images(2, &device),
                text: prompts(&["a dog", "a dog"]),
                time_ids: None,
            },
        );
        let batch = BatchNormalizer::Standard.normalize(raw)?;
        assert_eq!(batch.img.dims(), &[4, 3, 8, 8]);
        assert!(batch.prior_preservation);
        match batch.text {
            TextBatch::Prompts(p) => assert_eq!(p, vec!["a sks dog", "a sks dog", "a dog", "a dog"]),
            other => panic!("unexpected text {other:?}"),
        }
        Ok(())
    }

    #[test]
    fn plain_batch_has_no_prior_preservation() -> Result<()> {
        let device = Device::Cpu;
        let time_ids = vec![Tensor::new(&[[8f32, 8., 0., 0., 8., 8.]], &device)?];
        let raw = RawBatch::new(images(1, &device), prompts(&["a cat"])).with_time_ids(time_ids);
        let batch = BatchNormalizer::Standard.normalize(raw)?;
        assert!(!batch.prior_preservation);
        assert_eq!(batch.time_ids.map(|t| t.dims().to_vec()), Some(vec![1, 6]));
        Ok(())
    }

    #[test]
    fn class_time_ids_are_merged() -> Result<()> {
        let device = Device::Cpu;
        let ids = |n: usize| -> candle_core::Result<Vec<Tensor>> {
            (0..n).map(|_| Tensor::zeros(6, DType::F32, &device)).collect()
        };
        let raw = RawBatch::new(images(1, &device), prompts(&["x"]))
            .with_time_ids(ids(1)?)
            .with_class_images(ClassImageBatch {
                img: images(1, &device),
                text: prompts(&["y"]),
                time_ids: Some(ids(1)?),
            });
        let batch = BatchNormalizer::Standard.normalize(raw)?;
        assert_eq!(batch.time_ids.map(|t| t.dims().to_vec()), Some(vec![2, 6]));
        Ok(())
    }

    #[test]
    fn conditioned_rejects_class_images() {
        let device = Device::Cpu;
        let raw = RawBatch::new(images(1, &device), prompts(&["x"]))
            .with_condition_img(images(1, &device))
            .with_class_images(ClassImageBatch {
                img: images(1, &device),
                text: prompts(&["y"]),
                time_ids: None,
            });
        let err = BatchNormalizer::Conditioned.normalize(raw).err();
        assert!(err.as_ref().map(is_contract_violation).unwrap_or(false));
    }

    #[test]
    fn conditioned_stacks_condition_images() -> Result<()> {
        let device = Device::Cpu;
        let raw = RawBatch::new(images(2, &device), prompts(&["x", "y"])).with_condition_img(images(2, &device));
        let batch = BatchNormalizer::Conditioned.normalize(raw)?;
        assert_eq!(batch.condition_img.map(|t| t.dims().to_vec()), Some(vec![2, 3, 8, 8]));
        Ok(())
    }

    #[test]
    fn image_prompt_batches_need_clip_images() -> Result<()> {
        let device = Device::Cpu;
        let clip = |n: usize| -> candle_core::Result<Vec<Tensor>> {
            (0..n).map(|_| Tensor::zeros((3, 4, 4), DType::F32, &device)).collect()
        };

        let missing = RawBatch::new(images(1, &device), prompts(&["x"]));
        let err = BatchNormalizer::ImagePrompt.normalize(missing).err();
        assert!(err.as_ref().map(is_contract_violation).unwrap_or(false));

        let short = RawBatch::new(images(2, &device), prompts(&["x", "y"])).with_clip_img(clip(1)?);
        let err = BatchNormalizer::ImagePrompt.normalize(short).err();
        assert!(err.as_ref().map(is_contract_violation).unwrap_or(false));

        let with_class = RawBatch::new(images(1, &device), prompts(&["x"]))
            .with_clip_img(clip(1)?)
            .with_class_images(ClassImageBatch {
                img: images(1, &device),
                text: prompts(&["y"]),
                time_ids: None,
            });
        let err = BatchNormalizer::ImagePrompt.normalize(with_class).err();
        assert!(err.as_ref().map(is_contract_violation).unwrap_or(false));

        let raw = RawBatch::new(images(2, &device), prompts(&["x", "y"])).with_clip_img(clip(2)?);
        let batch = BatchNormalizer::ImagePrompt.normalize(raw.clone())?;
        assert_eq!(batch.clip_img.map(|t| t.dims().to_vec()), Some(vec![2, 3, 4, 4]));
        assert!(batch.condition_img.is_none());

        // Other variants drop image prompts.
        assert!(BatchNormalizer::Standard.normalize(raw)?.clip_img.is_none());
        Ok(())
    }

    #[test]
    fn mixed_text_kinds_are_rejected() -> Result<()> {
        let device = Device::Cpu;
        let raw = RawBatch::new(
            images(1, &device),
            TextInput::Embeddings {
                prompt_embeds: vec![Tensor::zeros((77, 64), DType::F32, &device)?],
                pooled_prompt_embeds: vec![Tensor::zeros(32, DType::F32, &device)?],
            },
        )
        .with_class_images(ClassImageBatch {
            img: images(1, &device),
            text: prompts(&["a dog"]),
            time_ids: None,
        });
        let err = BatchNormalizer::Standard.normalize(raw).err();
        assert!(err.as_ref().map(is_contract_violation).unwrap_or(false));
        Ok(())
    }

    #[test]
    fn unequal_class_batch_is_rejected() {
        let device = Device::Cpu;
        let raw = RawBatch::new(images(2, &device), prompts(&["x", "x"])).with_class_images(ClassImageBatch {
            img: images(1, &device),
            text: prompts(&["y"]),
            time_ids: None,
        });
        let err = BatchNormalizer::Standard.normalize(raw).err();
        assert!(err.as_ref().map(is_contract_violation).unwrap_or(false));
    }
}
