//! Synthetic `stub://` source.
//!
//! Produces a moving RGB test pattern so the full worker pipeline can run
//! without a camera or native decode libraries.

use anyhow::{anyhow, Result};

use super::{Capture, STUB_SCHEME};
use crate::frame::{Frame, RGB_CHANNELS};

const STUB_WIDTH: u32 = 320;
const STUB_HEIGHT: u32 = 240;

pub struct SyntheticCapture {
    address: String,
    frame_count: u64,
    /// Simulated scene state, advanced every 50 frames.
    scene_state: u8,
    released: bool,
}

impl SyntheticCapture {
    pub fn open(address: &str) -> Result<Self> {
        if !address.starts_with(STUB_SCHEME) {
            return Err(anyhow!("synthetic capture requires a stub:// address"));
        }
        log::info!("SyntheticCapture: connected to {}", address);
        Ok(Self {
            address: address.to_string(),
            frame_count: 0,
            scene_state: 0,
            released: false,
        })
    }

    pub fn frames_captured(&self) -> u64 {
        self.frame_count
    }

    fn generate_pixels(&mut self) -> Vec<u8> {
        let pixel_count = (STUB_WIDTH * STUB_HEIGHT) as usize * RGB_CHANNELS;

        if self.frame_count % 50 == 0 {
            self.scene_state = self.scene_state.wrapping_add(1);
        }

        let mut pixels = vec![0u8; pixel_count];
        for (i, pixel) in pixels.iter_mut().enumerate() {
            *pixel = ((i as u64 + self.frame_count + self.scene_state as u64) % 256) as u8;
        }
        pixels
    }
}

impl Capture for SyntheticCapture {
    fn read(&mut self) -> Result<Option<Frame>> {
        if self.released {
            return Ok(None);
        }
        self.frame_count += 1;
        let pixels = self.generate_pixels();
        Ok(Some(Frame::new(pixels, STUB_WIDTH, STUB_HEIGHT)))
    }

    fn release(&mut self) {
        if !self.released {
            log::debug!(
                "SyntheticCapture: released {} after {} frames",
                self.address,
                self.frame_count
            );
        }
        self.released = true;
    }
}
