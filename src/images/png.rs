//! PNG encoding of raw worker pixel buffers

use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};

use crate::error::{Result, WeaveError};

/// Encodes a row-major raw pixel buffer as PNG bytes.
///
/// Channel count selects the color type: 3 = RGB, 4 = RGBA. Any other
/// count, or a buffer whose length does not match
/// `width * height * channels`, is rejected.
pub fn encode_png(width: u32, height: u32, channels: u32, pixels: &[u8]) -> Result<Vec<u8>> {
    let color = match channels {
        3 => ExtendedColorType::Rgb8,
        4 => ExtendedColorType::Rgba8,
        other => {
            return Err(WeaveError::Image(format!(
                "unsupported channel count: {}",
                other
            ))
            .into());
        }
    };

    let expected = width as usize * height as usize * channels as usize;
    if pixels.len() != expected {
        return Err(WeaveError::Image(format!(
            "pixel buffer is {} bytes, expected {} for {}x{}x{}",
            pixels.len(),
            expected,
            width,
            height,
            channels
        ))
        .into());
    }

    let mut out = Vec::new();
    PngEncoder::new(&mut out)
        .write_image(pixels, width, height, color)
        .map_err(|e| WeaveError::Image(format!("PNG encoding failed: {}", e)))?;
    Ok(out)
}
