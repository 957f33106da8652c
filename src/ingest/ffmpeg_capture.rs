//! FFmpeg-backed stream capture.
//!
//! Demuxes the best video stream of the address, decodes it in-process and
//! scales every frame to RGB24. Decoder diagnostics are written by libav to
//! stderr, which is where the decoder warning monitor listens.

use anyhow::{Context, Result};
use ffmpeg_next as ffmpeg;

use super::{pack_rgb_rows, Capture};
use crate::frame::Frame;

pub(crate) struct FfmpegCapture {
    address: String,
    input: Option<ffmpeg::format::context::Input>,
    stream_index: usize,
    decoder: ffmpeg::codec::decoder::Video,
    scaler: ffmpeg::software::scaling::Context,
    frame_count: u64,
}

// The demuxer and decoder are owned by exactly one worker thread at a time.
unsafe impl Send for FfmpegCapture {}

impl FfmpegCapture {
    pub(crate) fn open(address: &str) -> Result<Self> {
        ffmpeg::init().context("initialize ffmpeg")?;

        let mut options = ffmpeg::Dictionary::new();
        if address.starts_with("rtsp://") {
            options.set("rtsp_transport", "tcp");
        }
        let input = ffmpeg::format::input_with_dictionary(&address, options)
            .with_context(|| format!("failed to open '{}' with ffmpeg", address))?;
        let input_stream = input
            .streams()
            .best(ffmpeg::media::Type::Video)
            .ok_or_else(|| anyhow::anyhow!("stream has no video track"))?;
        let stream_index = input_stream.index();
        let context = ffmpeg::codec::context::Context::from_parameters(input_stream.parameters())
            .context("load video decoder parameters")?;
        let decoder = context
            .decoder()
            .video()
            .context("open ffmpeg video decoder")?;

        let scaler = ffmpeg::software::scaling::context::Context::get(
            decoder.format(),
            decoder.width(),
            decoder.height(),
            ffmpeg::util::format::pixel::Pixel::RGB24,
            decoder.width(),
            decoder.height(),
            ffmpeg::software::scaling::flag::Flags::BILINEAR,
        )
        .context("create ffmpeg scaler")?;

        log::info!("FfmpegCapture: connected to {}", address);
        Ok(Self {
            address: address.to_string(),
            input: Some(input),
            stream_index,
            decoder,
            scaler,
            frame_count: 0,
        })
    }
}

impl Capture for FfmpegCapture {
    fn read(&mut self) -> Result<Option<Frame>> {
        let Some(input) = self.input.as_mut() else {
            return Ok(None);
        };

        let mut decoded = ffmpeg::frame::Video::empty();
        let mut rgb_frame = ffmpeg::frame::Video::empty();

        for (stream, packet) in input.packets() {
            if stream.index() != self.stream_index {
                continue;
            }

            self.decoder
                .send_packet(&packet)
                .context("send packet to ffmpeg decoder")?;

            if self.decoder.receive_frame(&mut decoded).is_ok() {
                self.scaler
                    .run(&decoded, &mut rgb_frame)
                    .context("scale frame to RGB")?;
                let width = rgb_frame.width();
                let height = rgb_frame.height();
                let pixels =
                    pack_rgb_rows(rgb_frame.data(0), width, height, rgb_frame.stride(0))?;
                self.frame_count += 1;
                return Ok(Some(Frame::new(pixels, width, height)));
            }
        }

        // Demuxer ran dry: end of stream or a dropped connection.
        Ok(None)
    }

    fn release(&mut self) {
        if self.input.take().is_some() {
            log::debug!(
                "FfmpegCapture: released {} after {} frames",
                self.address,
                self.frame_count
            );
        }
    }
}
