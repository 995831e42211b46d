//! Image folder datasets for the training runner.
//!
//! A folder holds images with optional caption files of the same stem. DreamBooth runs add a
//! class folder whose images share one class prompt; conditioning runs add a folder of
//! condition images matched by stem. Image-prompt runs take a centre crop of each training
//! image at `clip_image_size` as its image prompt.

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use image::DynamicImage;
use log::{info, warn};
use rand::rngs::StdRng;
use rand::Rng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use super::batch::{ClassImageBatch, RawBatch, TextInput};
use crate::models::TimeIdsConfig;
use crate::trainers::candle_image_utils::{open_image, rgb_to_signed_tensor, rgb_to_unit_tensor};

const IMAGE_EXTENSIONS: [&str; 5] = ["jpg", "jpeg", "png", "webp", "bmp"];

fn default_caption_ext() -> String {
    "txt".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatasetConfig {
    pub folder_path: PathBuf,
    #[serde(default = "default_caption_ext")]
    pub caption_ext: String,
    /// Square training resolution in pixels.
    pub resolution: usize,
    #[serde(default)]
    pub center_crop: bool,
    #[serde(default)]
    pub random_flip: bool,
    /// Used for images without a caption file.
    #[serde(default)]
    pub instance_prompt: Option<String>,
    #[serde(default)]
    pub class_folder: Option<PathBuf>,
    #[serde(default)]
    pub class_prompt: Option<String>,
    #[serde(default)]
    pub condition_folder: Option<PathBuf>,
    /// Side of the image prompt attached to every example, when set.
    #[serde(default)]
    pub clip_image_size: Option<usize>,
    #[serde(default)]
    pub caption_dropout_rate: f32,
}

#[derive(Debug, Clone)]
pub struct ImageRecord {
    pub image: PathBuf,
    pub caption: String,
    pub condition: Option<PathBuf>,
}

/// Crop and flip decisions for one example, drawn before decoding so batches are
/// reproducible under a seeded rng.
#[derive(Debug, Clone, Copy)]
struct Augment {
    crop_fraction: (f64, f64),
    flip: bool,
}

struct Example {
    img: Tensor,
    time_ids: Tensor,
    condition: Option<Tensor>,
    clip: Option<Tensor>,
}

const CLIP_CROP: Augment = Augment {
    crop_fraction: (0.5, 0.5),
    flip: false,
};

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| IMAGE_EXTENSIONS.contains(&e.to_lowercase().as_str()))
        .unwrap_or(false)
}

fn list_images(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut paths: Vec<PathBuf> = fs::read_dir(dir)
        .with_context(|| format!("Failed to read dataset folder: {}", dir.display()))?
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| is_image(p))
        .collect();
    paths.sort();
    Ok(paths)
}

fn find_by_stem(dir: &Path, stem: &str) -> Option<PathBuf> {
    IMAGE_EXTENSIONS
        .iter()
        .map(|ext| dir.join(format!("{stem}.{ext}")))
        .find(|p| p.exists())
}

/// Resize the short side to `resolution`, crop a square and optionally flip. Returns the
/// crop and the SDXL resolution conditioning for it.
fn transform(img: &DynamicImage, resolution: usize, augment: Augment) -> (DynamicImage, TimeIdsConfig) {
    let (w, h) = (img.width() as usize, img.height() as usize);
    let scale = resolution as f64 / w.min(h) as f64;
    let (rw, rh) = (
        ((w as f64 * scale).round() as usize).max(resolution),
        ((h as f64 * scale).round() as usize).max(resolution),
    );
    let resized = img.resize_exact(rw as u32, rh as u32, image::imageops::FilterType::Triangle);
    let top = ((rh - resolution) as f64 * augment.crop_fraction.0).round() as usize;
    let left = ((rw - resolution) as f64 * augment.crop_fraction.1).round() as usize;
    let mut cropped = resized.crop_imm(left as u32, top as u32, resolution as u32, resolution as u32);
    if augment.flip {
        cropped = cropped.fliph();
    }
    (cropped, TimeIdsConfig::with_crop(h, w, top, left, resolution, resolution))
}

pub struct FolderDataset {
    config: DatasetConfig,
    items: Vec<ImageRecord>,
    class_items: Vec<ImageRecord>,
}

impl FolderDataset {
    pub fn open(config: DatasetConfig) -> Result<Self> {
        let mut items = Vec::new();
        for image in list_images(&config.folder_path)? {
            let caption_path = image.with_extension(&config.caption_ext);
            let caption = if caption_path.exists() {
                fs::read_to_string(&caption_path)
                    .with_context(|| format!("Failed to read caption: {}", caption_path.display()))?
                    .trim()
                    .to_string()
            } else if let Some(prompt) = &config.instance_prompt {
                prompt.clone()
            } else {
                warn!("No caption for {}, training it unconditionally", image.display());
                String::new()
            };
            let condition = match &config.condition_folder {
                Some(dir) => {
                    let stem = image.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
                    match find_by_stem(dir, stem) {
                        Some(p) => Some(p),
                        None => anyhow::bail!("No condition image for {} in {}", image.display(), dir.display()),
                    }
                }
                None => None,
            };
            items.push(ImageRecord {
                image,
                caption,
                condition,
            });
        }
        if items.is_empty() {
            anyhow::bail!("No images found in {}", config.folder_path.display());
        }

        let class_items = match &config.class_folder {
            Some(dir) => {
                let prompt = config
                    .class_prompt
                    .clone()
                    .context("class_prompt is required together with class_folder")?;
                let class_items: Vec<ImageRecord> = list_images(dir)?
                    .into_iter()
                    .map(|image| ImageRecord {
                        image,
                        caption: prompt.clone(),
                        condition: None,
                    })
                    .collect();
                if class_items.is_empty() {
                    anyhow::bail!("No class images found in {}", dir.display());
                }
                class_items
            }
            None => Vec::new(),
        };

        info!(
            "Loaded dataset from {}: {} images, {} class images",
            config.folder_path.display(),
            items.len(),
            class_items.len()
        );
        Ok(Self {
            config,
            items,
            class_items,
        })
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn has_class_images(&self) -> bool {
        !self.class_items.is_empty()
    }

    fn augment(&self, rng: &mut StdRng) -> Augment {
        let crop_fraction = if self.config.center_crop {
            (0.5, 0.5)
        } else {
            (rng.gen::<f64>(), rng.gen::<f64>())
        };
        Augment {
            crop_fraction,
            flip: self.config.random_flip && rng.gen::<bool>(),
        }
    }

    fn load_examples(&self, records: &[(&ImageRecord, Augment)], device: &Device) -> Result<Vec<Example>> {
        let resolution = self.config.resolution;
        let clip_size = self.config.clip_image_size;
        records
            .par_iter()
            .map(|(record, augment)| -> Result<Example> {
                let source = open_image(&record.image)?;
                let (img, ids) = transform(&source, resolution, *augment);
                let condition = match &record.condition {
                    Some(path) => {
                        let (cond, _) = transform(&open_image(path)?, resolution, *augment);
                        Some(rgb_to_unit_tensor(&cond.to_rgb8(), &Device::Cpu)?)
                    }
                    None => None,
                };
                let clip = match clip_size {
                    Some(size) => {
                        let (clip, _) = transform(&source, size, CLIP_CROP);
                        Some(rgb_to_unit_tensor(&clip.to_rgb8(), &Device::Cpu)?)
                    }
                    None => None,
                };
                Ok(Example {
                    img: rgb_to_signed_tensor(&img.to_rgb8(), &Device::Cpu)?,
                    time_ids: ids.to_tensor(&Device::Cpu)?,
                    condition,
                    clip,
                })
            })
            .collect::<Result<Vec<_>>>()?
            .into_iter()
            .map(|ex| -> Result<Example> {
                Ok(Example {
                    img: ex.img.to_device(device)?,
                    time_ids: ex.time_ids.to_device(device)?,
                    condition: ex.condition.map(|c| c.to_device(device)).transpose()?,
                    clip: ex.clip.map(|c| c.to_device(device)).transpose()?,
                })
            })
            .collect()
    }

    /// Load the examples at `indices` into a raw batch. Class images, when configured, are
    /// drawn in the same number and attached for prior preservation.
    pub fn batch(&self, indices: &[usize], rng: &mut StdRng, device: &Device) -> Result<RawBatch> {
        let records: Vec<(&ImageRecord, Augment)> = indices
            .iter()
            .map(|&i| (&self.items[i % self.items.len()], self.augment(rng)))
            .collect();
        let prompts: Vec<String> = records
            .iter()
            .map(|(r, _)| {
                if self.config.caption_dropout_rate > 0.0 && rng.gen::<f32>() < self.config.caption_dropout_rate {
                    String::new()
                } else {
                    r.caption.clone()
                }
            })
            .collect();

        let examples = self.load_examples(&records, device)?;
        let has_condition = examples.iter().all(|e| e.condition.is_some()) && self.config.condition_folder.is_some();
        let mut img = Vec::with_capacity(examples.len());
        let mut time_ids = Vec::with_capacity(examples.len());
        let mut condition = Vec::with_capacity(examples.len());
        let mut clip = Vec::with_capacity(examples.len());
        for ex in examples {
            img.push(ex.img);
            time_ids.push(ex.time_ids);
            if let Some(c) = ex.condition {
                condition.push(c);
            }
            if let Some(c) = ex.clip {
                clip.push(c);
            }
        }

        let mut raw = RawBatch::new(img, TextInput::Prompts(prompts)).with_time_ids(time_ids);
        if has_condition {
            raw = raw.with_condition_img(condition);
        }
        if self.config.clip_image_size.is_some() {
            raw = raw.with_clip_img(clip);
        }

        if self.has_class_images() {
            let class_records: Vec<(&ImageRecord, Augment)> = (0..indices.len())
                .map(|_| {
                    let i = rng.gen_range(0..self.class_items.len());
                    (&self.class_items[i], self.augment(rng))
                })
                .collect();
            let class_examples = self.load_examples(&class_records, device)?;
            let text = class_records.iter().map(|(r, _)| r.caption.clone()).collect();
            let (img, time_ids): (Vec<_>, Vec<_>) = class_examples.into_iter().map(|e| (e.img, e.time_ids)).unzip();
            raw = raw.with_class_images(ClassImageBatch {
                img,
                text: TextInput::Prompts(text),
                time_ids: Some(time_ids),
            });
        }
        Ok(raw)
    }
}
