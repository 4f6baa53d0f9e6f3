use std::path::Path;

use anyhow::{Context, Result};
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::{DType, Device, Tensor};
use image::{imageops::FilterType, DynamicImage, ImageFormat};
use tracing::warn;

use crate::DeviceMap;

pub fn select_best_device(device_map: DeviceMap) -> Result<Device> {
    match device_map {
        DeviceMap::ForceCpu => Ok(Device::Cpu),
        DeviceMap::Ordinal(ordinal) if cuda_is_available() => Ok(Device::new_cuda(ordinal)?),
        DeviceMap::Ordinal(ordinal) if metal_is_available() => Ok(Device::new_metal(ordinal)?),
        DeviceMap::Ordinal(_) => {
            #[cfg(all(target_os = "macos", target_arch = "aarch64"))]
            {
                warn!("running on CPU, to run on GPU (metal) build with `--features metal`");
            }
            #[cfg(not(all(target_os = "macos", target_arch = "aarch64")))]
            {
                warn!("running on CPU, to run on GPU build with `--features cuda`");
            }
            Ok(Device::Cpu)
        }
    }
}

/// Writes `image` to `path` as JPEG whatever the extension, replacing any existing file.
pub fn save_image(image: &DynamicImage, path: &Path) -> Result<()> {
    image
        .to_rgb8()
        .save_with_format(path, ImageFormat::Jpeg)
        .with_context(|| format!("failed to encode {}", path.display()))
}

/// Converts a u8 tensor with shape (3, height, width) into an RGB image.
pub(crate) fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        anyhow::bail!("tensor_to_image expects an image with 3 channels, got {channels}");
    }
    let img = img.permute((1, 2, 0))?.flatten_all()?;
    let pixels = img.to_vec1::<u8>()?;
    let buffer = image::ImageBuffer::from_raw(width as u32, height as u32, pixels)
        .ok_or_else(|| candle_core::Error::msg("error converting tensor to image buffer"))?;
    Ok(DynamicImage::ImageRgb8(buffer))
}

pub(crate) fn open_image(path: &Path) -> Result<DynamicImage> {
    image::ImageReader::open(path)
        .with_context(|| format!("failed to open {}", path.display()))?
        .with_guessed_format()?
        .decode()
        .with_context(|| format!("failed to decode {}", path.display()))
}

/// Dimensions an initial image is resized to: the requested ones, or the image's own rounded
/// down to a multiple of 32.
pub(crate) fn target_dims(
    image: &DynamicImage,
    width: Option<usize>,
    height: Option<usize>,
) -> (usize, usize) {
    let round = |v: usize| (v - v % 32).max(32);
    (
        round(width.unwrap_or(image.width() as usize)),
        round(height.unwrap_or(image.height() as usize)),
    )
}

/// An RGB image as a (1, 3, height, width) f32 tensor scaled to [-1, 1]. The image is stretched
/// to the target size, the same way [`mask_to_tensor`] stretches masks.
pub(crate) fn image_to_tensor(
    image: &DynamicImage,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    let image = image
        .resize_exact(width as u32, height as u32, FilterType::CatmullRom)
        .to_rgb8()
        .into_raw();
    let tensor = Tensor::from_vec(image, (height, width, 3), device)?
        .permute((2, 0, 1))?
        .to_dtype(DType::F32)?
        .affine(2. / 255., -1.)?
        .unsqueeze(0)?;
    Ok(tensor)
}

/// A mask as a (1, 1, height, width) f32 tensor of 0 (keep) and 1 (repaint).
pub(crate) fn mask_to_tensor(
    mask: &DynamicImage,
    width: usize,
    height: usize,
    device: &Device,
) -> Result<Tensor> {
    let mask = mask
        .resize_exact(width as u32, height as u32, FilterType::Nearest)
        .to_luma8()
        .into_raw();
    let tensor = Tensor::from_vec(mask, (1, 1, height, width), device)?
        .to_dtype(DType::F32)?
        .affine(1. / 255., 0.)?
        .ge(0.5)?
        .to_dtype(DType::F32)?;
    Ok(tensor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::IndexOp;
    use image::{Rgb, RgbImage};

    #[test]
    fn target_dims_round_down_to_32() {
        let image = DynamicImage::new_rgb8(530, 300);
        assert_eq!(target_dims(&image, None, None), (512, 288));
        assert_eq!(target_dims(&image, Some(768), Some(20)), (768, 32));
    }

    #[test]
    fn image_tensor_round_trip() {
        let mut image = RgbImage::new(2, 1);
        image.put_pixel(0, 0, Rgb([255, 0, 0]));
        image.put_pixel(1, 0, Rgb([0, 0, 255]));
        let image = DynamicImage::ImageRgb8(image);

        let tensor = image_to_tensor(&image, 2, 1, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[1, 3, 1, 2]);
        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        let expected = [1.0f32, -1.0, -1.0, -1.0, -1.0, 1.0];
        assert!(values.iter().zip(expected).all(|(v, e)| (v - e).abs() < 1e-5));

        let pixels = ((tensor + 1.0).unwrap() * 127.5)
            .unwrap()
            .round()
            .unwrap()
            .to_dtype(DType::U8)
            .unwrap()
            .squeeze(0)
            .unwrap();
        let back = tensor_to_image(&pixels).unwrap().to_rgb8();
        assert_eq!(back.get_pixel(0, 0), &Rgb([255, 0, 0]));
        assert_eq!(back.get_pixel(1, 0), &Rgb([0, 0, 255]));
    }

    #[test]
    fn mask_is_binarised() {
        let mask = DynamicImage::ImageLuma8(image::GrayImage::from_raw(2, 1, vec![200, 40]).unwrap());
        let tensor = mask_to_tensor(&mask, 2, 1, &Device::Cpu).unwrap();
        assert_eq!(tensor.dims(), &[1, 1, 1, 2]);
        let values = tensor.flatten_all().unwrap().to_vec1::<f32>().unwrap();
        assert_eq!(values, [1.0, 0.0]);
    }

    #[test]
    fn mask_stays_on_the_image_region_when_resized() {
        // Red on the left quarter of a wide image, with the mask covering the same columns.
        let image = RgbImage::from_fn(128, 64, |x, _| {
            if x < 32 {
                Rgb([255, 0, 0])
            } else {
                Rgb([255, 255, 255])
            }
        });
        let mask = image::GrayImage::from_fn(128, 64, |x, _| {
            if x < 32 {
                image::Luma([255])
            } else {
                image::Luma([0])
            }
        });

        let image = image_to_tensor(&DynamicImage::ImageRgb8(image), 64, 64, &Device::Cpu).unwrap();
        let mask = mask_to_tensor(&DynamicImage::ImageLuma8(mask), 64, 64, &Device::Cpu).unwrap();
        let green = image.i((0, 1, 0)).unwrap().to_vec1::<f32>().unwrap();
        let repaint = mask.i((0, 0, 0)).unwrap().to_vec1::<f32>().unwrap();

        // Columns next to the edge are blurred by the resampling filter.
        for x in (0..14).chain(18..64) {
            let red = green[x] < 0.;
            assert_eq!(red, repaint[x] == 1., "column {x}");
        }
        assert!(green[..14].iter().all(|&g| g < 0.));
    }

    #[test]
    fn saved_image_is_jpeg_whatever_the_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.png");
        std::fs::write(&path, b"stale").unwrap();

        save_image(&DynamicImage::new_rgb8(8, 8), &path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        assert_eq!(&bytes[..3], &[0xFF, 0xD8, 0xFF]);
    }
}
