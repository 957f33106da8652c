//! Stream ingestion backends.
//!
//! This module provides the decode backends a source can be opened with:
//! - FFmpeg (feature: rtsp-ffmpeg)
//! - GStreamer (feature: rtsp-gstreamer)
//! - Synthetic `stub://` source (always available, testing and demos)
//!
//! The ingestion layer is responsible for:
//! - Opening a stream address with a concrete backend
//! - Decoding frames and normalizing them to RGB8 `Frame`s
//! - Releasing native resources when a capture is dropped
//!
//! The ingestion layer MUST NOT:
//! - Retry or reconnect (the worker owns that)
//! - Cache frames beyond handoff to the caller

#[cfg(feature = "rtsp-ffmpeg")]
mod ffmpeg_capture;
#[cfg(feature = "rtsp-gstreamer")]
mod gstreamer_capture;
pub mod synthetic;

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::fmt;

use crate::frame::Frame;

pub use synthetic::SyntheticCapture;

/// Scheme that routes an address to the synthetic source under any backend.
pub const STUB_SCHEME: &str = "stub://";

/// Decode backend a connection is opened with.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum Backend {
    /// Let the build pick; always tried last during autodetection.
    #[default]
    Default,
    Ffmpeg,
    Gstreamer,
}

impl Backend {
    pub fn label(self) -> &'static str {
        match self {
            Backend::Default => "default",
            Backend::Ffmpeg => "ffmpeg",
            Backend::Gstreamer => "gstreamer",
        }
    }

    /// Parse a user-supplied preference. Returns `None` for unknown names.
    pub fn from_preference(prefer: &str) -> Option<Self> {
        match prefer.trim().to_ascii_lowercase().as_str() {
            "ffmpeg" => Some(Backend::Ffmpeg),
            "gstreamer" => Some(Backend::Gstreamer),
            "default" => Some(Backend::Default),
            _ => None,
        }
    }
}

impl fmt::Display for Backend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Which native backends this build can open streams with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct BuildSupport {
    pub ffmpeg: bool,
    pub gstreamer: bool,
}

impl BuildSupport {
    pub fn compiled() -> Self {
        Self {
            ffmpeg: cfg!(feature = "rtsp-ffmpeg"),
            gstreamer: cfg!(feature = "rtsp-gstreamer"),
        }
    }

    pub fn supports(&self, backend: Backend) -> bool {
        match backend {
            Backend::Default => true,
            Backend::Ffmpeg => self.ffmpeg,
            Backend::Gstreamer => self.gstreamer,
        }
    }
}

/// An open streaming connection.
///
/// `read` distinguishes three outcomes: `Err` when the backend reported a
/// failed read, `Ok(None)` when no frame was produced, and `Ok(Some(frame))`
/// which may still carry an empty buffer.
pub trait Capture: Send {
    fn read(&mut self) -> Result<Option<Frame>>;

    /// Release the underlying connection. Reads after release return `Ok(None)`.
    fn release(&mut self);
}

/// Opens stream addresses with a given backend.
///
/// `MediaDriver` is the production implementation; tests substitute scripted drivers.
pub trait CaptureDriver: Send + Sync {
    fn build_support(&self) -> BuildSupport;

    fn open(&self, address: &str, backend: Backend) -> Result<Box<dyn Capture>>;
}

/// Production driver dispatching to the compiled backends.
#[derive(Clone, Copy, Debug, Default)]
pub struct MediaDriver;

impl MediaDriver {
    pub fn new() -> Self {
        Self
    }
}

impl CaptureDriver for MediaDriver {
    fn build_support(&self) -> BuildSupport {
        BuildSupport::compiled()
    }

    fn open(&self, address: &str, backend: Backend) -> Result<Box<dyn Capture>> {
        if address.starts_with(STUB_SCHEME) {
            return Ok(Box::new(SyntheticCapture::open(address)?));
        }
        match backend {
            Backend::Ffmpeg => open_ffmpeg(address),
            Backend::Gstreamer => open_gstreamer(address),
            Backend::Default => {
                let support = BuildSupport::compiled();
                if support.ffmpeg {
                    open_ffmpeg(address)
                } else if support.gstreamer {
                    open_gstreamer(address)
                } else {
                    Err(anyhow!(
                        "no native decode backend compiled in (enable rtsp-ffmpeg or rtsp-gstreamer)"
                    ))
                }
            }
        }
    }
}

#[cfg(feature = "rtsp-ffmpeg")]
fn open_ffmpeg(address: &str) -> Result<Box<dyn Capture>> {
    Ok(Box::new(ffmpeg_capture::FfmpegCapture::open(address)?))
}

#[cfg(not(feature = "rtsp-ffmpeg"))]
fn open_ffmpeg(_address: &str) -> Result<Box<dyn Capture>> {
    Err(anyhow!("ffmpeg backend requires the rtsp-ffmpeg feature"))
}

#[cfg(feature = "rtsp-gstreamer")]
fn open_gstreamer(address: &str) -> Result<Box<dyn Capture>> {
    Ok(Box::new(gstreamer_capture::GstreamerCapture::open(address)?))
}

#[cfg(not(feature = "rtsp-gstreamer"))]
fn open_gstreamer(_address: &str) -> Result<Box<dyn Capture>> {
    Err(anyhow!("gstreamer backend requires the rtsp-gstreamer feature"))
}

/// Copy a strided RGB plane into a tightly packed buffer.
#[cfg(any(feature = "rtsp-ffmpeg", feature = "rtsp-gstreamer"))]
pub(crate) fn pack_rgb_rows(data: &[u8], width: u32, height: u32, stride: usize) -> Result<Vec<u8>> {
    use anyhow::Context;

    let row_bytes = (width as usize) * crate::frame::RGB_CHANNELS;
    if stride == row_bytes {
        let len = row_bytes * height as usize;
        return Ok(data.get(..len).context("frame buffer is truncated")?.to_vec());
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        let end = start + row_bytes;
        pixels.extend_from_slice(data.get(start..end).context("frame row is out of bounds")?);
    }
    Ok(pixels)
}

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------
