use anyhow::{Context, Result};
use candle_core::{Device, Tensor};

/// Resolution conditioning for SDXL-style denoisers.
/// Contains 6 values: original_height, original_width, crop_top, crop_left, target_height, target_width
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TimeIdsConfig {
    /// Original image height before any processing
    pub original_height: f32,
    /// Original image width before any processing
    pub original_width: f32,
    /// Top coordinate of the crop box
    pub crop_top: f32,
    /// Left coordinate of the crop box
    pub crop_left: f32,
    pub target_height: f32,
    pub target_width: f32,
}

impl TimeIdsConfig {
    /// Target size with no cropping, as used at inference time.
    pub fn new(target_height: usize, target_width: usize) -> Self {
        Self::with_crop(target_height, target_width, 0, 0, target_height, target_width)
    }

    /// Crop box placed in the centre of the resized image.
    pub fn with_center_crop(
        original_height: usize,
        original_width: usize,
        target_height: usize,
        target_width: usize,
    ) -> Self {
        let crop_top = original_height.saturating_sub(target_height) / 2;
        let crop_left = original_width.saturating_sub(target_width) / 2;
        Self::with_crop(
            original_height,
            original_width,
            crop_top,
            crop_left,
            target_height,
            target_width,
        )
    }

    pub fn with_crop(
        original_height: usize,
        original_width: usize,
        crop_top: usize,
        crop_left: usize,
        target_height: usize,
        target_width: usize,
    ) -> Self {
        Self {
            original_height: original_height as f32,
            original_width: original_width as f32,
            crop_top: crop_top as f32,
            crop_left: crop_left as f32,
            target_height: target_height as f32,
            target_width: target_width as f32,
        }
    }

    pub fn to_vec(&self) -> Vec<f32> {
        vec![
            self.original_height,
            self.original_width,
            self.crop_top,
            self.crop_left,
            self.target_height,
            self.target_width,
        ]
    }

    /// `[6]` tensor.
    pub fn to_tensor(&self, device: &Device) -> Result<Tensor> {
        Tensor::from_vec(self.to_vec(), (6,), device).context("Failed to create time_ids tensor")
    }

    /// Validate that the crop box lies within the original image.
    pub fn validate(&self) -> Result<()> {
        if self.crop_top < 0.0 || self.crop_left < 0.0 {
            anyhow::bail!("Crop coordinates must be non-negative");
        }
        if self.crop_top + self.target_height > self.original_height {
            anyhow::bail!(
                "Crop top ({}) + target height ({}) exceeds original height ({})",
                self.crop_top,
                self.target_height,
                self.original_height
            );
        }
        if self.crop_left + self.target_width > self.original_width {
            anyhow::bail!(
                "Crop left ({}) + target width ({}) exceeds original width ({})",
                self.crop_left,
                self.target_width,
                self.original_width
            );
        }
        Ok(())
    }

    /// Stack one config per example into a `[B, 6]` tensor.
    pub fn batch_tensor(configs: &[TimeIdsConfig], device: &Device) -> Result<Tensor> {
        if configs.is_empty() {
            anyhow::bail!("Cannot build time_ids for an empty batch");
        }
        let values: Vec<f32> = configs.iter().flat_map(|c| c.to_vec()).collect();
        Tensor::from_vec(values, (configs.len(), 6), device)
            .context("Failed to create batched time_ids tensor")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn center_crop_offsets() {
        let cfg = TimeIdsConfig::with_center_crop(1200, 1024, 1024, 1024);
        assert_eq!(cfg.crop_top, 88.0);
        assert_eq!(cfg.crop_left, 0.0);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn crop_outside_image_is_rejected() {
        let cfg = TimeIdsConfig::with_crop(512, 512, 100, 0, 512, 512);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn batch_tensor_layout() -> Result<()> {
        let device = Device::Cpu;
        let ids = TimeIdsConfig::batch_tensor(
            &[TimeIdsConfig::new(64, 64), TimeIdsConfig::with_crop(80, 64, 8, 0, 64, 64)],
            &device,
        )?;
        assert_eq!(ids.dims(), &[2, 6]);
        assert_eq!(ids.get(1)?.to_vec1::<f32>()?, vec![80.0, 64.0, 8.0, 0.0, 64.0, 64.0]);
        Ok(())
    }
}
