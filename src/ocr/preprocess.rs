use image::{GrayImage, RgbaImage};

use super::RegionHint;
use crate::detector::DetectorClass;
use crate::geometry::{BLACK_WHITE_THRESHOLD, Rgb};

const FREE_TEXT_BLUR_SIGMA: f32 = 5.0;

/// Cleans an upscaled region crop before recognition: fades the rim into the
/// background color, converts to gray, blurs free-text regions, flips light-on-dark
/// text and binarizes with Otsu's threshold.
pub fn prepare_region(crop: &RgbaImage, hint: RegionHint) -> GrayImage {
    let masked = fade_rim(crop, hint.background);
    let mut gray = to_luma(&masked);
    if hint.class == DetectorClass::TextFree {
        gray = image::imageops::blur(&gray, FREE_TEXT_BLUR_SIGMA);
    }
    if hint.background.is_dark(BLACK_WHITE_THRESHOLD) {
        image::imageops::invert(&mut gray);
    }
    let threshold = otsu_threshold(&gray);
    binarize(&gray, threshold)
}

/// Transparent inside 80% of the radius, solid background color at the rim.
fn fade_rim(image: &RgbaImage, background: Rgb) -> RgbaImage {
    let (width, height) = image.dimensions();
    let cx = width as f32 / 2.0;
    let cy = height as f32 / 2.0;
    let radius = (1.2 * width.max(height) as f32 / 2.0).max(1.0);
    let mut output = image.clone();
    for (x, y, pixel) in output.enumerate_pixels_mut() {
        let dx = x as f32 + 0.5 - cx;
        let dy = y as f32 + 0.5 - cy;
        let t = (dx * dx + dy * dy).sqrt() / radius;
        let alpha = ((t - 0.8) / 0.2).clamp(0.0, 1.0);
        if alpha <= 0.0 {
            continue;
        }
        let [r, g, b, a] = pixel.0;
        let mix = |src: u8, dst: u8| (src as f32 * (1.0 - alpha) + dst as f32 * alpha).round() as u8;
        pixel.0 = [
            mix(r, background.r),
            mix(g, background.g),
            mix(b, background.b),
            a,
        ];
    }
    output
}

fn to_luma(image: &RgbaImage) -> GrayImage {
    let (width, height) = image.dimensions();
    let mut luma = GrayImage::new(width, height);
    for (x, y, pixel) in image.enumerate_pixels() {
        let [r, g, b, a] = pixel.0;
        let alpha = a as f32 / 255.0;
        let r = r as f32 * alpha + 255.0 * (1.0 - alpha);
        let g = g as f32 * alpha + 255.0 * (1.0 - alpha);
        let b = b as f32 * alpha + 255.0 * (1.0 - alpha);
        let value = (0.299 * r + 0.587 * g + 0.114 * b).round() as u8;
        luma.put_pixel(x, y, image::Luma([value]));
    }
    luma
}

pub(super) fn otsu_threshold(image: &GrayImage) -> u8 {
    let mut histogram = [0u64; 256];
    for pixel in image.pixels() {
        histogram[pixel[0] as usize] += 1;
    }
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 127;
    }
    let weighted_total: f64 = histogram
        .iter()
        .enumerate()
        .map(|(value, count)| value as f64 * *count as f64)
        .sum();

    let mut best = 0u8;
    let mut best_variance = -1.0f64;
    let mut background_weight = 0u64;
    let mut background_sum = 0.0f64;
    for (value, count) in histogram.iter().enumerate() {
        background_weight += count;
        if background_weight == 0 {
            continue;
        }
        let foreground_weight = total - background_weight;
        if foreground_weight == 0 {
            break;
        }
        background_sum += value as f64 * *count as f64;
        let mean_bg = background_sum / background_weight as f64;
        let mean_fg = (weighted_total - background_sum) / foreground_weight as f64;
        let diff = mean_bg - mean_fg;
        let variance = background_weight as f64 * foreground_weight as f64 * diff * diff;
        if variance > best_variance {
            best_variance = variance;
            best = value as u8;
        }
    }
    best
}

fn binarize(image: &GrayImage, threshold: u8) -> GrayImage {
    let mut output = image.clone();
    for pixel in output.pixels_mut() {
        pixel[0] = if pixel[0] > threshold { 255 } else { 0 };
    }
    output
}
