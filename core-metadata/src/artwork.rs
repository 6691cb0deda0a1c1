//! Cover and background image normalization
//!
//! Downloaded images are stored as JPEG. Images larger than the configured
//! bound are scaled down with their aspect ratio preserved; smaller JPEGs are
//! passed through untouched to avoid recompression.

use image::{imageops::FilterType, DynamicImage, ImageFormat};
use std::io::Cursor;
use tracing::debug;

use crate::error::{MetadataError, Result};

/// Result of [`normalize_image`]
#[derive(Debug, Clone)]
pub struct ProcessedImage {
    pub bytes: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub resized: bool,
}

/// Decode `data`, downscale it so neither side exceeds `max_px`, and encode as JPEG.
///
/// A `max_px` of zero disables resizing.
pub fn normalize_image(data: &[u8], max_px: u32) -> Result<ProcessedImage> {
    let format = image::guess_format(data)
        .map_err(|e| MetadataError::ImageError(format!("Unknown image format: {}", e)))?;
    let img = image::load_from_memory_with_format(data, format)
        .map_err(|e| MetadataError::ImageError(format!("Failed to decode image: {}", e)))?;

    let needs_resize = max_px > 0 && (img.width() > max_px || img.height() > max_px);

    if !needs_resize && format == ImageFormat::Jpeg {
        return Ok(ProcessedImage {
            bytes: data.to_vec(),
            width: img.width(),
            height: img.height(),
            resized: false,
        });
    }

    let img = if needs_resize {
        debug!(
            from_width = img.width(),
            from_height = img.height(),
            max_px,
            "Downscaling image"
        );
        img.resize(max_px, max_px, FilterType::Lanczos3)
    } else {
        img
    };

    let bytes = encode_jpeg(&img)?;
    Ok(ProcessedImage {
        bytes,
        width: img.width(),
        height: img.height(),
        resized: needs_resize,
    })
}

fn encode_jpeg(img: &DynamicImage) -> Result<Vec<u8>> {
    // JPEG has no alpha channel.
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());
    let mut buffer = Vec::new();
    rgb.write_to(&mut Cursor::new(&mut buffer), ImageFormat::Jpeg)
        .map_err(|e| MetadataError::ImageError(format!("Failed to encode image: {}", e)))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(width: u32, height: u32, format: ImageFormat) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(image::RgbImage::from_pixel(
            width,
            height,
            image::Rgb([255, 0, 0]),
        ));
        let mut buffer = Vec::new();
        img.write_to(&mut Cursor::new(&mut buffer), format).unwrap();
        buffer
    }

    #[test]
    fn test_downscale_preserves_aspect_ratio() {
        let data = encoded(2000, 1000, ImageFormat::Jpeg);
        let out = normalize_image(&data, 500).unwrap();

        assert!(out.resized);
        assert_eq!((out.width, out.height), (500, 250));

        let decoded = image::load_from_memory(&out.bytes).unwrap();
        assert_eq!((decoded.width(), decoded.height()), (500, 250));
    }

    #[test]
    fn test_small_jpeg_passes_through() {
        let data = encoded(100, 100, ImageFormat::Jpeg);
        let out = normalize_image(&data, 500).unwrap();

        assert!(!out.resized);
        assert_eq!(out.bytes, data);
    }

    #[test]
    fn test_zero_bound_disables_resize() {
        let data = encoded(3000, 3000, ImageFormat::Jpeg);
        let out = normalize_image(&data, 0).unwrap();
        assert!(!out.resized);
        assert_eq!(out.width, 3000);
    }

    #[test]
    fn test_png_is_converted_to_jpeg() {
        let data = encoded(64, 32, ImageFormat::Png);
        let out = normalize_image(&data, 0).unwrap();

        assert_eq!(image::guess_format(&out.bytes).unwrap(), ImageFormat::Jpeg);
        assert_eq!((out.width, out.height), (64, 32));
    }

    #[test]
    fn test_garbage_is_rejected() {
        let err = normalize_image(b"<html>not an image</html>", 500).unwrap_err();
        assert!(matches!(err, MetadataError::ImageError(_)));
    }
}
