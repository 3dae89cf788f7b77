//! Brightness measurement for captured images

use thiserror::Error;
use zune_jpeg::JpegDecoder;

use super::frame::{PixelFormat, RawFrame};

#[derive(Debug, Error, PartialEq)]
pub enum LumaError {
    #[error("{format:?} buffer holds {len} bytes, need {expected} for {width}x{height}")]
    ShortBuffer {
        format: PixelFormat,
        len: usize,
        expected: usize,
        width: u32,
        height: u32,
    },

    #[error("image has no pixels")]
    Empty,

    #[error("jpeg decode failed: {0}")]
    Jpeg(String),
}

/// Mean luma (0-255) of an image.
pub fn mean_luma(
    data: &[u8],
    width: u32,
    height: u32,
    format: PixelFormat,
) -> Result<f64, LumaError> {
    let pixels = width as usize * height as usize;
    if pixels == 0 {
        return Err(LumaError::Empty);
    }

    let require = |expected: usize| {
        if data.len() < expected {
            Err(LumaError::ShortBuffer {
                format,
                len: data.len(),
                expected,
                width,
                height,
            })
        } else {
            Ok(())
        }
    };

    match format {
        PixelFormat::Gray8 | PixelFormat::Nv12 => {
            // NV12: Y plane first
            require(pixels)?;
            Ok(mean(&data[..pixels]))
        }
        PixelFormat::Yuyv4 => {
            // Y0 U Y1 V
            require(pixels * 2)?;
            let sum: u64 = data[..pixels * 2].iter().step_by(2).map(|&y| y as u64).sum();
            Ok(sum as f64 / pixels as f64)
        }
        PixelFormat::Rgb24 => {
            require(pixels * 3)?;
            Ok(weighted_rgb(&data[..pixels * 3], [0, 1, 2]))
        }
        PixelFormat::Bgr24 => {
            require(pixels * 3)?;
            Ok(weighted_rgb(&data[..pixels * 3], [2, 1, 0]))
        }
        PixelFormat::Mjpeg => jpeg_luma(data),
    }
}

/// Convenience wrapper for a raw capture.
pub fn frame_luma(frame: &RawFrame) -> Result<f64, LumaError> {
    mean_luma(&frame.data, frame.width, frame.height, frame.format)
}

fn mean(samples: &[u8]) -> f64 {
    let sum: u64 = samples.iter().map(|&v| v as u64).sum();
    sum as f64 / samples.len() as f64
}

/// BT.601 weights; `order` gives the R, G and B offsets inside a pixel.
fn weighted_rgb(data: &[u8], order: [usize; 3]) -> f64 {
    let pixels = data.len() / 3;
    let sum: f64 = data
        .chunks_exact(3)
        .map(|px| {
            0.299 * px[order[0]] as f64 + 0.587 * px[order[1]] as f64 + 0.114 * px[order[2]] as f64
        })
        .sum();
    sum / pixels as f64
}

fn jpeg_luma(data: &[u8]) -> Result<f64, LumaError> {
    let mut decoder = JpegDecoder::new(data);
    let pixels = decoder
        .decode()
        .map_err(|e| LumaError::Jpeg(format!("{e:?}")))?;
    let (w, h) = decoder
        .dimensions()
        .ok_or_else(|| LumaError::Jpeg("missing dimensions".into()))?;
    let count = w * h;
    if count == 0 || pixels.is_empty() {
        return Err(LumaError::Empty);
    }

    match pixels.len() / count {
        1 => Ok(mean(&pixels[..count])),
        3 => Ok(weighted_rgb(&pixels[..count * 3], [0, 1, 2])),
        // RGBA and friends: drop the extra channels
        n if n > 3 => {
            let sum: f64 = pixels
                .chunks_exact(n)
                .map(|px| 0.299 * px[0] as f64 + 0.587 * px[1] as f64 + 0.114 * px[2] as f64)
                .sum();
            Ok(sum / count as f64)
        }
        _ => Err(LumaError::Jpeg(format!(
            "unexpected {} bytes for {}x{}",
            pixels.len(),
            w,
            h
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gray_mean_is_plain_average() {
        let data = [0u8, 100, 200, 100];
        assert_eq!(mean_luma(&data, 2, 2, PixelFormat::Gray8), Ok(100.0));
    }

    #[test]
    fn nv12_ignores_chroma_plane() {
        // 2x2 Y plane of 50 followed by a saturated UV plane
        let data = [50u8, 50, 50, 50, 255, 255];
        assert_eq!(mean_luma(&data, 2, 2, PixelFormat::Nv12), Ok(50.0));
    }

    #[test]
    fn yuyv_reads_only_luma_bytes() {
        let data = [10u8, 200, 30, 200];
        assert_eq!(mean_luma(&data, 2, 1, PixelFormat::Yuyv4), Ok(20.0));
    }

    #[test]
    fn rgb_and_bgr_use_bt601_weights() {
        let red = [255u8, 0, 0];
        let rgb = mean_luma(&red, 1, 1, PixelFormat::Rgb24).unwrap();
        assert!((rgb - 0.299 * 255.0).abs() < 1e-9);

        let bgr = mean_luma(&red, 1, 1, PixelFormat::Bgr24).unwrap();
        assert!((bgr - 0.114 * 255.0).abs() < 1e-9);
    }

    #[test]
    fn short_buffer_is_reported() {
        let err = mean_luma(&[1, 2, 3], 2, 2, PixelFormat::Gray8).unwrap_err();
        assert!(matches!(err, LumaError::ShortBuffer { expected: 4, .. }));
    }

    #[test]
    fn zero_sized_image_is_rejected() {
        assert_eq!(mean_luma(&[], 0, 10, PixelFormat::Gray8), Err(LumaError::Empty));
    }

    #[test]
    fn garbage_jpeg_is_an_error() {
        let err = mean_luma(b"not a jpeg", 4, 4, PixelFormat::Mjpeg).unwrap_err();
        assert!(matches!(err, LumaError::Jpeg(_)));
    }
}
