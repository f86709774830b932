use anyhow::{Context, Result};
use image::{DynamicImage, RgbaImage};
use std::io::Cursor;

use crate::error::OverlayError;

pub const PNG_MIME: &str = "image/png";

#[derive(Debug, Clone)]
pub struct DecodedImage {
    pub image: RgbaImage,
    pub mime: &'static str,
}

/// Sniffs the format from the bytes; anything `image` can read is accepted.
pub fn decode_image(bytes: &[u8]) -> Result<DecodedImage> {
    let mime = sniff_image_mime(bytes).unwrap_or(PNG_MIME);
    let image = image::load_from_memory(bytes)
        .context(OverlayError::ImageDecode)?;
    Ok(DecodedImage {
        image: image.to_rgba8(),
        mime,
    })
}

pub fn sniff_image_mime(bytes: &[u8]) -> Option<&'static str> {
    let kind = infer::get(bytes)?;
    let detected = kind.mime_type();
    detected.starts_with("image/").then_some(detected)
}

/// Encodes in the input's format when the encoder supports it, PNG otherwise.
/// Returns the bytes and the MIME type actually written.
pub fn encode_image(image: &RgbaImage, preferred_mime: &str) -> Result<(Vec<u8>, &'static str)> {
    let (format, mime) = match image_format_from_mime(preferred_mime) {
        Some(found) => found,
        None => (image::ImageFormat::Png, PNG_MIME),
    };
    let dynamic = if format == image::ImageFormat::Jpeg {
        DynamicImage::ImageRgb8(DynamicImage::ImageRgba8(image.clone()).to_rgb8())
    } else {
        DynamicImage::ImageRgba8(image.clone())
    };
    let mut bytes = Vec::new();
    dynamic
        .write_to(&mut Cursor::new(&mut bytes), format)
        .context(OverlayError::ImageEncode)?;
    Ok((bytes, mime))
}

fn image_format_from_mime(mime: &str) -> Option<(image::ImageFormat, &'static str)> {
    match mime {
        "image/png" => Some((image::ImageFormat::Png, "image/png")),
        "image/jpeg" | "image/jpg" => Some((image::ImageFormat::Jpeg, "image/jpeg")),
        "image/gif" => Some((image::ImageFormat::Gif, "image/gif")),
        "image/webp" => Some((image::ImageFormat::WebP, "image/webp")),
        "image/bmp" => Some((image::ImageFormat::Bmp, "image/bmp")),
        "image/tiff" => Some((image::ImageFormat::Tiff, "image/tiff")),
        _ => None,
    }
}
