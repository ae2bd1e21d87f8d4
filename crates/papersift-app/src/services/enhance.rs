//! Page image enhancement ahead of model calls: bounded downscale, small-angle
//! deskew, contrast normalization, and a mild sharpen. A failure here is a
//! per-page warning, never a document failure; callers fall back to the raw
//! render.

use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, Rgb, RgbImage};
use thiserror::Error;

/// Maximum edge after downscaling, in pixels.
pub const MAX_EDGE: u32 = 2_048;
const JPEG_QUALITY: u8 = 90;
/// Skew below this angle is not worth resampling for.
const DESKEW_MIN_ANGLE_DEG: f32 = 0.5;
const DESKEW_MAX_ANGLE_DEG: f32 = 3.0;
const DESKEW_STEP_DEG: f32 = 0.25;
/// Working width for skew estimation; estimation does not need full detail.
const DESKEW_PROBE_WIDTH: u32 = 512;
const CONTRAST_LOW_PERCENTILE: f64 = 0.02;
const CONTRAST_HIGH_PERCENTILE: f64 = 0.98;

#[derive(Debug, Error)]
pub enum EnhanceError {
    #[error("failed to decode page image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode enhanced image: {0}")]
    Encode(#[source] image::ImageError),
}

/// An encoded page image ready for a model call.
#[derive(Debug, Clone)]
pub struct EncodedImage {
    pub data: Vec<u8>,
    pub mime_type: &'static str,
    pub width: u32,
    pub height: u32,
}

impl EncodedImage {
    pub fn png(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            mime_type: "image/png",
            width,
            height,
        }
    }
}

/// Run the full enhancement pass over one rendered page.
pub fn enhance_page(png_data: &[u8]) -> Result<EncodedImage, EnhanceError> {
    let mut img = image::load_from_memory(png_data).map_err(EnhanceError::Decode)?;

    img = downscale(img, MAX_EDGE);

    let skew = estimate_skew_degrees(&img);
    if skew.abs() >= DESKEW_MIN_ANGLE_DEG {
        img = DynamicImage::ImageRgb8(rotate_bilinear(&img.to_rgb8(), -skew));
    }

    let mut rgb = img.to_rgb8();
    stretch_contrast(&mut rgb);
    let sharpened = DynamicImage::ImageRgb8(rgb).unsharpen(1.0, 4);

    let (width, height) = sharpened.dimensions();
    let mut buffer = Vec::new();
    let mut encoder = JpegEncoder::new_with_quality(&mut buffer, JPEG_QUALITY);
    encoder
        .encode_image(&sharpened)
        .map_err(EnhanceError::Encode)?;

    Ok(EncodedImage {
        data: buffer,
        mime_type: "image/jpeg",
        width,
        height,
    })
}

fn downscale(img: DynamicImage, max_edge: u32) -> DynamicImage {
    let (width, height) = img.dimensions();
    let longest = width.max(height);
    if longest <= max_edge {
        return img;
    }
    let scale = max_edge as f32 / longest as f32;
    let target_width = ((width as f32 * scale).round() as u32).max(1);
    let target_height = ((height as f32 * scale).round() as u32).max(1);
    img.resize(target_width, target_height, FilterType::CatmullRom)
}

/// Estimate the dominant text-line skew via a projection profile: the angle
/// whose sheared row histogram has the highest variance is the one where text
/// lines align with pixel rows.
fn estimate_skew_degrees(img: &DynamicImage) -> f32 {
    let probe = downscale(img.clone(), DESKEW_PROBE_WIDTH).to_luma8();
    let (width, height) = probe.dimensions();
    if width < 16 || height < 16 {
        return 0.0;
    }

    let mut sum = 0_u64;
    for pixel in probe.pixels() {
        sum += pixel.0[0] as u64;
    }
    let mean = (sum / (width as u64 * height as u64)) as u8;

    let dark: Vec<(f32, f32)> = probe
        .enumerate_pixels()
        .filter(|(_, _, pixel)| pixel.0[0] < mean)
        .map(|(x, y, _)| (x as f32, y as f32))
        .collect();
    if dark.len() < 64 {
        return 0.0;
    }

    let mut best_angle = 0.0_f32;
    let mut best_score = f64::MIN;
    let mut angle = -DESKEW_MAX_ANGLE_DEG;
    while angle <= DESKEW_MAX_ANGLE_DEG + f32::EPSILON {
        let score = projection_variance(&dark, width, height, angle);
        if score > best_score {
            best_score = score;
            best_angle = angle;
        }
        angle += DESKEW_STEP_DEG;
    }

    // Require a clear win over the unrotated profile before resampling.
    let baseline = projection_variance(&dark, width, height, 0.0);
    if best_score <= baseline * 1.02 {
        return 0.0;
    }
    best_angle
}

fn projection_variance(dark: &[(f32, f32)], width: u32, height: u32, angle_deg: f32) -> f64 {
    let radians = angle_deg.to_radians();
    let (sin, cos) = radians.sin_cos();
    let bins = height as usize;
    let mut histogram = vec![0_u32; bins * 2];
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;

    for &(x, y) in dark {
        let projected = (y - cy) * cos - (x - cx) * sin + cy;
        let bin = projected.round() as i64 + bins as i64 / 2;
        if bin >= 0 && (bin as usize) < histogram.len() {
            histogram[bin as usize] += 1;
        }
    }

    let count = histogram.len() as f64;
    let mean: f64 = histogram.iter().map(|&v| v as f64).sum::<f64>() / count;
    histogram
        .iter()
        .map(|&v| {
            let delta = v as f64 - mean;
            delta * delta
        })
        .sum::<f64>()
        / count
}

/// Rotate about the image center with bilinear sampling, filling with white.
fn rotate_bilinear(src: &RgbImage, angle_deg: f32) -> RgbImage {
    let (width, height) = src.dimensions();
    let radians = angle_deg.to_radians();
    let (sin, cos) = radians.sin_cos();
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;

    let mut out = RgbImage::from_pixel(width, height, Rgb([255, 255, 255]));
    for (x, y, pixel) in out.enumerate_pixels_mut() {
        let dx = x as f32 - cx;
        let dy = y as f32 - cy;
        let sx = dx * cos + dy * sin + cx;
        let sy = -dx * sin + dy * cos + cy;

        if sx < 0.0 || sy < 0.0 || sx >= (width - 1) as f32 || sy >= (height - 1) as f32 {
            continue;
        }
        let x0 = sx.floor() as u32;
        let y0 = sy.floor() as u32;
        let fx = sx - x0 as f32;
        let fy = sy - y0 as f32;

        let mut channels = [0_u8; 3];
        for (idx, channel) in channels.iter_mut().enumerate() {
            let p00 = src.get_pixel(x0, y0).0[idx] as f32;
            let p10 = src.get_pixel(x0 + 1, y0).0[idx] as f32;
            let p01 = src.get_pixel(x0, y0 + 1).0[idx] as f32;
            let p11 = src.get_pixel(x0 + 1, y0 + 1).0[idx] as f32;
            let top = p00 * (1.0 - fx) + p10 * fx;
            let bottom = p01 * (1.0 - fx) + p11 * fx;
            *channel = (top * (1.0 - fy) + bottom * fy).round().clamp(0.0, 255.0) as u8;
        }
        *pixel = Rgb(channels);
    }
    out
}

/// Linear contrast stretch anchored on luma percentiles, applied uniformly to
/// all channels so scanned-gray pages spread across the full range.
fn stretch_contrast(img: &mut RgbImage) {
    let mut histogram = [0_u64; 256];
    for pixel in img.pixels() {
        let luma = luma_of(pixel);
        histogram[luma as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return;
    }

    let low = percentile(&histogram, total, CONTRAST_LOW_PERCENTILE);
    let high = percentile(&histogram, total, CONTRAST_HIGH_PERCENTILE);
    if high <= low + 16 {
        // Already flat or already spread; stretching would amplify noise.
        return;
    }

    let range = (high - low) as f32;
    for pixel in img.pixels_mut() {
        for channel in pixel.0.iter_mut() {
            let stretched = (*channel as f32 - low as f32) * 255.0 / range;
            *channel = stretched.round().clamp(0.0, 255.0) as u8;
        }
    }
}

fn luma_of(pixel: &Rgb<u8>) -> u8 {
    let [r, g, b] = pixel.0;
    (0.299 * r as f32 + 0.587 * g as f32 + 0.114 * b as f32).round() as u8
}

fn percentile(histogram: &[u64; 256], total: u64, fraction: f64) -> u8 {
    let target = (total as f64 * fraction) as u64;
    let mut seen = 0_u64;
    for (value, &count) in histogram.iter().enumerate() {
        seen += count;
        if seen >= target {
            return value as u8;
        }
    }
    255
}
