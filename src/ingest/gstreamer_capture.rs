//! GStreamer-backed stream capture.
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! appsink` for RTSP addresses,
//! `uridecodebin ! videoconvert ! appsink` for everything else. The appsink
//! keeps a single buffer and drops older ones so reads always see the newest
//! decoded frame.

use anyhow::{Context, Result};
use gstreamer::prelude::*;
use std::time::Duration;

use super::{pack_rgb_rows, Capture};
use crate::frame::Frame;

/// Upper bound on a single appsink pull.
const PULL_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) struct GstreamerCapture {
    address: String,
    pipeline: Option<gstreamer::Pipeline>,
    appsink: gstreamer_app::AppSink,
    frame_count: u64,
}

impl GstreamerCapture {
    pub(crate) fn open(address: &str) -> Result<Self> {
        gstreamer::init().context("initialize gstreamer")?;

        let source = if address.starts_with("rtsp://") {
            format!("rtspsrc location={} latency=0 ! decodebin", address)
        } else {
            format!("uridecodebin uri={}", address)
        };
        let pipeline_description = format!(
            "{} ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            source
        );
        let pipeline = gstreamer::parse::launch(&pipeline_description)
            .context("build gstreamer pipeline")?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| anyhow::anyhow!("gstreamer pipeline is not a Pipeline"))?;

        let appsink = pipeline
            .by_name("appsink")
            .context("appsink element missing from pipeline")?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| anyhow::anyhow!("appsink element has unexpected type"))?;
        appsink.set_max_buffers(1);
        appsink.set_drop(true);
        appsink.set_sync(false);

        pipeline
            .set_state(gstreamer::State::Playing)
            .with_context(|| format!("failed to start gstreamer pipeline for '{}'", address))?;

        log::info!("GstreamerCapture: connected to {}", address);
        Ok(Self {
            address: address.to_string(),
            pipeline: Some(pipeline),
            appsink,
            frame_count: 0,
        })
    }

    fn poll_bus(&self, pipeline: &gstreamer::Pipeline) -> Result<()> {
        let Some(bus) = pipeline.bus() else {
            return Ok(());
        };
        while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
            use gstreamer::MessageView;
            match message.view() {
                MessageView::Error(err) => {
                    anyhow::bail!(
                        "gstreamer error from {:?}: {}",
                        err.src().map(|s| s.path_string()),
                        err.error()
                    );
                }
                MessageView::Eos(..) => anyhow::bail!("gstreamer reached EOS"),
                _ => {}
            }
        }
        Ok(())
    }
}

impl Capture for GstreamerCapture {
    fn read(&mut self) -> Result<Option<Frame>> {
        let Some(pipeline) = self.pipeline.as_ref() else {
            return Ok(None);
        };
        self.poll_bus(pipeline)?;

        let timeout = gstreamer::ClockTime::from_mseconds(PULL_TIMEOUT.as_millis() as u64);
        let Some(sample) = self.appsink.try_pull_sample(timeout) else {
            return Ok(None);
        };

        let buffer = sample.buffer().context("gstreamer sample missing buffer")?;
        let caps = sample.caps().context("gstreamer sample missing caps")?;
        let info = gstreamer_video::VideoInfo::from_caps(caps)
            .context("parse gstreamer caps as video info")?;
        let width = info.width();
        let height = info.height();
        let stride = info.stride()[0] as usize;

        let map = buffer.map_readable().context("map gstreamer buffer")?;
        let pixels = pack_rgb_rows(map.as_slice(), width, height, stride)?;
        self.frame_count += 1;
        Ok(Some(Frame::new(pixels, width, height)))
    }

    fn release(&mut self) {
        if let Some(pipeline) = self.pipeline.take() {
            if let Err(err) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("GstreamerCapture: failed to stop {}: {}", self.address, err);
            }
            log::debug!(
                "GstreamerCapture: released {} after {} frames",
                self.address,
                self.frame_count
            );
        }
    }
}

impl Drop for GstreamerCapture {
    fn drop(&mut self) {
        self.release();
    }
}
