//! Image <-> tensor conversion for inference

use candle_core::{bail, Device, Result, Tensor};
use image::{DynamicImage, ImageBuffer, Rgb, RgbImage};

pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Background, pubic symphysis, fetal head
pub const DEFAULT_PALETTE: [[u8; 3]; 3] = [[0, 0, 0], [255, 0, 0], [0, 255, 0]];

/// Resize to `size`x`size` and convert to a normalized `[1, 3, size, size]` tensor
pub fn image_to_tensor(img: &DynamicImage, size: usize, device: &Device) -> Result<Tensor> {
    // Triangle matches torchvision's bilinear Resize
    let resized = img.resize_exact(size as u32, size as u32, image::imageops::FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let plane = size * size;
    let mut data = vec![0f32; 3 * plane];
    for (x, y, pixel) in rgb.enumerate_pixels() {
        let idx = y as usize * size + x as usize;
        for c in 0..3 {
            data[c * plane + idx] = (pixel[c] as f32 / 255.0 - IMAGENET_MEAN[c]) / IMAGENET_STD[c];
        }
    }
    Tensor::from_vec(data, (1, 3, size, size), device)
}

/// Colorize a `[H, W]` u32 class map
pub fn class_map_to_image(class_map: &Tensor, palette: &[[u8; 3]]) -> Result<RgbImage> {
    let (h, w) = class_map.dims2()?;
    let classes = class_map.flatten_all()?.to_vec1::<u32>()?;

    let mut raw = Vec::with_capacity(h * w * 3);
    for &class in &classes {
        match palette.get(class as usize) {
            Some(color) => raw.extend_from_slice(color),
            None => bail!("class {class} has no palette entry ({} colors)", palette.len()),
        }
    }
    ImageBuffer::<Rgb<u8>, _>::from_raw(w as u32, h as u32, raw)
        .ok_or_else(|| candle_core::Error::Msg("mask buffer size mismatch".to_string()))
}
