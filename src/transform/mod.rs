//! Pure transformation engine: (bytes, content type, operation) → bytes.
//!
//! Stateless and synchronous; the controller runs it on a blocking thread
//! under the CPU deadline.

use std::io::Cursor;

use image::imageops::FilterType;
use image::{DynamicImage, ImageFormat, Rgba};

use crate::entity::Operation;

mod font;

const THUMB_WIDTH: u32 = 150;
const THUMB_HEIGHT: u32 = 150;

const WATERMARK_SCALE: u32 = 2;
const WATERMARK_RIGHT_PADDING: u32 = 10;
const WATERMARK_BOTTOM_PADDING: u32 = 20;

#[derive(Debug, thiserror::Error)]
pub enum TransformError {
    #[error("decode image: {0}")]
    Decode(image::ImageError),
    #[error("encode image: {0}")]
    Encode(image::ImageError),
}

pub fn apply(
    data: &[u8],
    content_type: &str,
    operation: &Operation,
) -> Result<Vec<u8>, TransformError> {
    let img = image::load_from_memory(data).map_err(TransformError::Decode)?;
    let out = match operation {
        Operation::Resize { width, height } => resize(&img, *width, *height),
        Operation::Thumbnail => thumbnail(&img),
        Operation::Watermark { text } => watermark(&img, text),
    };
    encode(&out, content_type)
}

/// Exact target dimensions, aspect ratio not preserved.
fn resize(img: &DynamicImage, width: u32, height: u32) -> DynamicImage {
    img.resize_exact(width, height, FilterType::Lanczos3)
}

/// Fit within the thumbnail box, preserving aspect ratio.
fn thumbnail(img: &DynamicImage) -> DynamicImage {
    img.resize(THUMB_WIDTH, THUMB_HEIGHT, FilterType::Lanczos3)
}

/// Draw `text` in white near the bottom-right corner.
fn watermark(img: &DynamicImage, text: &str) -> DynamicImage {
    let mut canvas = img.to_rgba8();
    let (width, height) = canvas.dimensions();
    let text_width = font::line_width(text) * WATERMARK_SCALE;
    let text_height = font::GLYPH_HEIGHT * WATERMARK_SCALE;
    let x = width.saturating_sub(text_width + WATERMARK_RIGHT_PADDING);
    let y = height.saturating_sub(text_height + WATERMARK_BOTTOM_PADDING);
    font::draw(
        &mut canvas,
        text,
        x,
        y,
        WATERMARK_SCALE,
        Rgba([255, 255, 255, 255]),
    );
    DynamicImage::ImageRgba8(canvas)
}

fn encode(img: &DynamicImage, content_type: &str) -> Result<Vec<u8>, TransformError> {
    let format = match content_type {
        "image/jpeg" | "image/jpg" => ImageFormat::Jpeg,
        "image/png" => ImageFormat::Png,
        "image/gif" => ImageFormat::Gif,
        _ => ImageFormat::Jpeg,
    };
    let mut buf = Cursor::new(Vec::new());
    match format {
        // The JPEG encoder rejects alpha channels.
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.to_rgb8())
            .write_to(&mut buf, format)
            .map_err(TransformError::Encode)?,
        _ => img.write_to(&mut buf, format).map_err(TransformError::Encode)?,
    }
    Ok(buf.into_inner())
}
