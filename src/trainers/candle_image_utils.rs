//! Conversions between candle tensors and `image` buffers.

use anyhow::{Context, Result};
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage, RgbImage};
use std::path::Path;

/// Save a `[3, H, W]` tensor in `[-1, 1]` as an image; the format follows the extension
/// and defaults to PNG.
pub fn save_image<P: AsRef<Path>>(tensor: &Tensor, path: P) -> Result<()> {
    let img = tensor_to_rgb(tensor)?;
    let path = path.as_ref();
    let format = match path.extension().and_then(|s| s.to_str()) {
        Some("jpg") | Some("jpeg") => image::ImageFormat::Jpeg,
        _ => image::ImageFormat::Png,
    };
    img.save_with_format(path, format)
        .with_context(|| format!("Failed to save image: {}", path.display()))?;
    Ok(())
}

/// `[3, H, W]` in `[-1, 1]` to an RGB buffer.
pub fn tensor_to_rgb(tensor: &Tensor) -> Result<RgbImage> {
    let tensor = ((tensor.to_dtype(DType::F32)?.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?
        .round()?
        .to_dtype(DType::U8)?;
    let (channel, height, width) = tensor.dims3().context("Expected 3D tensor [C, H, W]")?;
    if channel != 3 {
        anyhow::bail!("Expected 3 channels (RGB), got {}", channel);
    }
    let data = tensor.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    RgbImage::from_raw(width as u32, height as u32, data).context("Failed to create image buffer")
}

/// `[B, 3, H, W]` in `[-1, 1]` to one RGB buffer per example.
pub fn batch_to_rgb(images: &Tensor) -> Result<Vec<RgbImage>> {
    let b = images.dim(0)?;
    (0..b).map(|i| tensor_to_rgb(&images.get(i)?)).collect()
}

/// RGB buffer to a `[3, H, W]` f32 tensor in `[0, 1]`.
pub fn rgb_to_unit_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    let (w, h) = img.dimensions();
    let data = Tensor::from_vec(img.as_raw().clone(), (h as usize, w as usize, 3), device)?;
    Ok((data.permute((2, 0, 1))?.to_dtype(DType::F32)? / 255.0)?)
}

/// RGB buffer to a `[3, H, W]` f32 tensor in `[-1, 1]`.
pub fn rgb_to_signed_tensor(img: &RgbImage, device: &Device) -> Result<Tensor> {
    Ok(((rgb_to_unit_tensor(img, device)? * 2.0)? - 1.0)?)
}

/// Convert to RGB and resize to exactly `height` x `width`.
pub fn resize_rgb(img: &DynamicImage, height: usize, width: usize) -> RgbImage {
    img.resize_exact(width as u32, height as u32, FilterType::Triangle).to_rgb8()
}

pub fn open_image(path: &Path) -> Result<DynamicImage> {
    image::open(path).with_context(|| format!("Failed to open image: {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgb_tensor_round_trip_keeps_pixels() -> Result<()> {
        let device = Device::Cpu;
        let mut img = RgbImage::new(4, 2);
        img.put_pixel(3, 1, image::Rgb([255, 0, 128]));

        let unit = rgb_to_unit_tensor(&img, &device)?;
        assert_eq!(unit.dims(), &[3, 2, 4]);
        let signed = rgb_to_signed_tensor(&img, &device)?;
        let back = tensor_to_rgb(&signed)?;
        assert_eq!(back.dimensions(), (4, 2));
        assert_eq!(back.get_pixel(3, 1).0[0], 255);
        assert_eq!(back.get_pixel(3, 1).0[1], 0);
        assert_eq!(back.get_pixel(0, 0).0, [0, 0, 0]);
        Ok(())
    }

    #[test]
    fn save_image_writes_png() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("sample.png");
        let tensor = Tensor::zeros((3, 8, 8), DType::F32, &Device::Cpu)?;
        save_image(&tensor, &path)?;
        let loaded = image::open(&path)?.to_rgb8();
        assert_eq!(loaded.dimensions(), (8, 8));
        assert_eq!(loaded.get_pixel(0, 0).0, [128, 128, 128]);
        Ok(())
    }
}
