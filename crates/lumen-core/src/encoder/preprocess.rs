//! Image preprocessing for the vision encoder.
//!
//! CLIP-style vision encoders expect:
//! - Input size: 224x224 pixels, aspect ratio not preserved
//! - Normalization: per channel `(pixel/255 - mean) / std` with the CLIP
//!   ImageNet constants
//! - Channel order: RGB
//! - Tensor layout: NCHW [batch, channels, height, width]

use std::path::Path;

use image::imageops::FilterType;
use image::{DynamicImage, ImageError};
use ndarray::{Array3, Array4, Axis};

use crate::error::PipelineError;

/// Number of color channels (RGB).
const CHANNELS: usize = 3;

/// CLIP per-channel normalization mean.
pub const CLIP_MEAN: [f32; 3] = [0.481_454_66, 0.457_827_5, 0.408_210_73];

/// CLIP per-channel normalization std.
pub const CLIP_STD: [f32; 3] = [0.268_629_54, 0.261_302_58, 0.275_777_11];

/// Decode an image file into RGB-capable pixel data.
pub fn load_image(path: &Path) -> Result<DynamicImage, PipelineError> {
    image::open(path).map_err(|e| map_image_error(path, e))
}

/// Decode in-memory image bytes.
pub fn load_image_from_bytes(path: &Path, bytes: &[u8]) -> Result<DynamicImage, PipelineError> {
    image::load_from_memory(bytes).map_err(|e| map_image_error(path, e))
}

fn map_image_error(path: &Path, error: ImageError) -> PipelineError {
    match error {
        ImageError::Unsupported(u) => PipelineError::UnsupportedFormat {
            path: path.to_path_buf(),
            format: u.to_string(),
        },
        ImageError::IoError(io) => PipelineError::Io(io),
        other => PipelineError::ImageDecode {
            path: path.to_path_buf(),
            message: other.to_string(),
        },
    }
}

/// Preprocess one image into a normalized CHW tensor.
///
/// Resizes to `image_size x image_size` with bilinear filtering (the CLIP
/// convention squashes rather than crops) and applies channel
/// normalization.
pub fn preprocess(image: &DynamicImage, image_size: u32) -> Array3<f32> {
    let resized = image.resize_exact(image_size, image_size, FilterType::Triangle);
    let rgb = resized.to_rgb8();

    let size = image_size as usize;
    let mut tensor = Array3::<f32>::zeros((CHANNELS, size, size));

    // Index the raw RGB buffer and the tensor slice directly instead of
    // per-pixel get_pixel() and 3D indexing.
    let raw = rgb.as_raw();
    let data = tensor.as_slice_mut().expect("contiguous tensor");
    for (i, pixel) in raw.chunks_exact(3).enumerate() {
        let y = i / size;
        let x = i % size;
        for (c, &val) in pixel.iter().enumerate() {
            // CHW layout: offset = c * size * size + y * size + x
            let idx = c * size * size + y * size + x;
            data[idx] = (val as f32 / 255.0 - CLIP_MEAN[c]) / CLIP_STD[c];
        }
    }

    tensor
}

/// Stack per-image CHW tensors into one NCHW batch tensor.
pub fn stack_batch(tensors: &[Array3<f32>]) -> Array4<f32> {
    let (c, h, w) = tensors
        .first()
        .map(|t| t.dim())
        .expect("batch must be non-empty");
    let mut out = Array4::<f32>::zeros((tensors.len(), c, h, w));
    for (i, t) in tensors.iter().enumerate() {
        out.index_axis_mut(Axis(0), i).assign(t);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::RgbImage;

    #[test]
    fn test_preprocess_shape() {
        let img = DynamicImage::ImageRgb8(RgbImage::new(640, 480));
        let tensor = preprocess(&img, 224);
        assert_eq!(tensor.shape(), &[3, 224, 224]);
    }

    #[test]
    fn test_preprocess_normalization_constants() {
        // White pixels map to (1.0 - mean) / std per channel.
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(
            10,
            10,
            image::Rgb([255, 255, 255]),
        ));
        let tensor = preprocess(&img, 224);
        for c in 0..3 {
            let expected = (1.0 - CLIP_MEAN[c]) / CLIP_STD[c];
            let actual = tensor[(c, 0, 0)];
            assert!(
                (actual - expected).abs() < 1e-4,
                "channel {c}: {actual} vs {expected}"
            );
        }

        // Black pixels map to (0 - mean) / std.
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(10, 10, image::Rgb([0, 0, 0])));
        let tensor = preprocess(&img, 224);
        for c in 0..3 {
            let expected = (0.0 - CLIP_MEAN[c]) / CLIP_STD[c];
            assert!((tensor[(c, 112, 112)] - expected).abs() < 1e-4);
        }
    }

    #[test]
    fn test_preprocess_squashes_aspect_ratio() {
        // A wide image still becomes square.
        let img = DynamicImage::ImageRgb8(RgbImage::new(1024, 128));
        let tensor = preprocess(&img, 224);
        assert_eq!(tensor.shape(), &[3, 224, 224]);
    }

    #[test]
    fn test_stack_batch_layout() {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(8, 8, image::Rgb([255, 0, 0])));
        let a = preprocess(&img, 32);
        let b = preprocess(&img, 32);
        let batch = stack_batch(&[a.clone(), b]);
        assert_eq!(batch.shape(), &[2, 3, 32, 32]);
        assert_eq!(batch[(0, 0, 0, 0)], a[(0, 0, 0)]);
        assert_eq!(batch[(1, 2, 5, 5)], a[(2, 5, 5)]);
    }

    #[test]
    fn test_load_image_missing_file() {
        let err = load_image(Path::new("/nonexistent/image.png")).unwrap_err();
        assert_eq!(err.kind_label(), "io");
    }

    #[test]
    fn test_load_image_from_bytes_garbage() {
        let err =
            load_image_from_bytes(Path::new("garbage.bin"), b"definitely not an image").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::ImageDecode { .. } | PipelineError::UnsupportedFormat { .. }
        ));
    }
}
