//! Mask format conversion.
//!
//! Stable Diffusion inpainting masks are greyscale: white is repainted, black is kept. Masks in
//! the OpenAI image edit convention carry the same information in the alpha channel instead,
//! fully transparent pixels marking the area to repaint.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use image::{DynamicImage, GrayImage, ImageFormat, Luma};

/// White where `mask` is fully transparent, black everywhere else.
pub fn alpha_to_mask(mask: &DynamicImage) -> GrayImage {
    let rgba = mask.to_rgba8();
    GrayImage::from_fn(rgba.width(), rgba.height(), |x, y| {
        if rgba.get_pixel(x, y)[3] == 0 {
            Luma([255])
        } else {
            Luma([0])
        }
    })
}

/// `dir/name.ext` becomes `dir/name_sd.ext`.
pub fn converted_mask_path(path: &Path) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}_sd.{}", ext.to_string_lossy()),
        None => format!("{stem}_sd"),
    };
    path.with_file_name(name)
}

/// Converts an alpha-channel mask file and writes the result as PNG next to it. Returns the path
/// of the converted mask.
pub fn convert_openai_mask(path: &Path) -> Result<PathBuf> {
    let mask = image::open(path).with_context(|| format!("failed to open mask {}", path.display()))?;
    let output = converted_mask_path(path);
    alpha_to_mask(&mask)
        .save_with_format(&output, ImageFormat::Png)
        .with_context(|| format!("failed to write mask {}", output.display()))?;
    Ok(output)
}
