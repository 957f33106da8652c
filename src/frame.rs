//! Decoded frames and snapshot encoding.
//!
//! - `Frame`: RGB8 pixel buffer produced by a capture backend.
//! - `encode_jpeg`: the only path from a `Frame` to snapshot bytes.
//!
//! Frames are handed to the cache by value and shared behind an `Arc` from
//! there on; nothing in this module retains pixel data.

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

/// Bytes per pixel for the RGB8 layout every backend normalizes to.
pub const RGB_CHANNELS: usize = 3;

/// A decoded RGB8 frame.
///
/// Backends may hand back an empty buffer on a transient decoder hiccup
/// instead of failing the read; `is_empty` is how callers tell.
#[derive(Clone, Debug)]
pub struct Frame {
    data: Vec<u8>,
    pub width: u32,
    pub height: u32,
}

impl Frame {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self {
            data,
            width,
            height,
        }
    }

    /// A zero-sized frame, as some decoders return between keyframes.
    pub fn empty() -> Self {
        Self::new(Vec::new(), 0, 0)
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(RGB_CHANNELS)
    }
}

/// Encode a frame as baseline JPEG at `quality` (1..=100).
///
/// Fails on zero dimensions or when the buffer does not match `width * height * 3`.
pub fn encode_jpeg(frame: &Frame, quality: u8) -> Result<Vec<u8>> {
    if !(1..=100).contains(&quality) {
        return Err(anyhow!("jpeg quality {} is outside 1..=100", quality));
    }
    if frame.width == 0 || frame.height == 0 {
        return Err(anyhow!(
            "cannot encode {}x{} frame",
            frame.width,
            frame.height
        ));
    }
    let expected = frame
        .expected_len()
        .ok_or_else(|| anyhow!("frame dimensions overflow"))?;
    if frame.data.len() != expected {
        return Err(anyhow!(
            "frame buffer is {} bytes, expected {} for {}x{} RGB",
            frame.data.len(),
            expected,
            frame.width,
            frame.height
        ));
    }

    let mut out = Vec::with_capacity(expected / 8);
    JpegEncoder::new_with_quality(&mut out, quality)
        .encode(
            &frame.data,
            frame.width,
            frame.height,
            ExtendedColorType::Rgb8,
        )
        .context("encode frame as jpeg")?;
    Ok(out)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
pub(crate) fn gradient_frame(width: u32, height: u32) -> Frame {
    let mut data = Vec::with_capacity(width as usize * height as usize * RGB_CHANNELS);
    for y in 0..height {
        for x in 0..width {
            data.push((x * 255 / width.max(1)) as u8);
            data.push((y * 255 / height.max(1)) as u8);
            data.push(((x ^ y) & 0xff) as u8);
        }
    }
    Frame::new(data, width, height)
}
