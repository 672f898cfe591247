//! RTSP source backed by GStreamer.
//!
//! Pipeline: `rtspsrc ! decodebin ! videoconvert ! appsink` negotiated to
//! RGB. The pipeline is rebuilt on every `connect` so a reconnect starts
//! from a clean transport.

use gstreamer::prelude::*;

use super::SourceConfig;
use crate::error::{ConnectError, ReadError};
use crate::frame::Frame;

pub(super) struct GstreamerSource {
    config: SourceConfig,
    pipeline: Option<(gstreamer::Pipeline, gstreamer_app::AppSink)>,
}

impl GstreamerSource {
    pub(super) fn new(config: SourceConfig) -> Self {
        Self {
            config,
            pipeline: None,
        }
    }

    pub(super) fn connect(&mut self) -> Result<(), ConnectError> {
        let url = self.config.url.clone();
        gstreamer::init().map_err(|e| ConnectError::new(&url, format!("gstreamer init: {}", e)))?;

        let description = format!(
            "rtspsrc location={} latency=0 ! decodebin ! videoconvert ! video/x-raw,format=RGB ! \
             appsink name=appsink sync=false max-buffers=1 drop=true",
            url
        );
        let pipeline = gstreamer::parse::launch(&description)
            .map_err(|e| ConnectError::new(&url, format!("build pipeline: {}", e)))?
            .downcast::<gstreamer::Pipeline>()
            .map_err(|_| ConnectError::new(&url, "pipeline is not a Pipeline"))?;
        let appsink = pipeline
            .by_name("appsink")
            .ok_or_else(|| ConnectError::new(&url, "appsink element missing"))?
            .downcast::<gstreamer_app::AppSink>()
            .map_err(|_| ConnectError::new(&url, "appsink element has unexpected type"))?;

        let caps = gstreamer::Caps::builder("video/x-raw")
            .field("format", "RGB")
            .build();
        appsink.set_caps(Some(&caps));

        if let Err(e) = pipeline.set_state(gstreamer::State::Playing) {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(ConnectError::new(&url, format!("start pipeline: {}", e)));
        }
        // rtspsrc goes Playing asynchronously; wait for the outcome so an
        // unreachable camera fails here and not on the first read.
        let timeout = gstreamer::ClockTime::from_mseconds(self.config.connect_timeout.as_millis() as u64);
        let (result, _, _) = pipeline.state(timeout);
        if let Err(e) = result {
            let _ = pipeline.set_state(gstreamer::State::Null);
            return Err(ConnectError::new(&url, format!("stream did not start: {}", e)));
        }

        self.pipeline = Some((pipeline, appsink));
        log::info!("StreamSource: connected to {} (gstreamer)", url);
        Ok(())
    }

    pub(super) fn next_frame(&mut self) -> Result<Frame, ReadError> {
        let (pipeline, appsink) = self.pipeline.as_ref().ok_or(ReadError::NotStreaming)?;
        check_bus(pipeline)?;

        let timeout = self.config.read_timeout;
        let sample = appsink
            .try_pull_sample(gstreamer::ClockTime::from_mseconds(timeout.as_millis() as u64))
            .ok_or_else(|| {
                if appsink.is_eos() {
                    ReadError::EndOfStream
                } else {
                    ReadError::Stalled(timeout)
                }
            })?;
        sample_to_frame(&sample)
    }

    pub(super) fn release(&mut self) {
        if let Some((pipeline, _)) = self.pipeline.take() {
            if let Err(e) = pipeline.set_state(gstreamer::State::Null) {
                log::warn!("StreamSource: failed to stop pipeline: {}", e);
            }
        }
    }
}

fn check_bus(pipeline: &gstreamer::Pipeline) -> Result<(), ReadError> {
    let Some(bus) = pipeline.bus() else {
        return Ok(());
    };
    while let Some(message) = bus.timed_pop(gstreamer::ClockTime::ZERO) {
        use gstreamer::MessageView;
        match message.view() {
            MessageView::Error(err) => {
                return Err(ReadError::Transport(format!(
                    "gstreamer error from {:?}: {}",
                    err.src().map(|s| s.path_string()),
                    err.error()
                )));
            }
            MessageView::Eos(..) => return Err(ReadError::EndOfStream),
            _ => {}
        }
    }
    Ok(())
}

fn sample_to_frame(sample: &gstreamer::Sample) -> Result<Frame, ReadError> {
    let decode = |reason: &str| ReadError::Decode(reason.to_string());
    let buffer = sample.buffer().ok_or_else(|| decode("sample missing buffer"))?;
    let caps = sample.caps().ok_or_else(|| decode("sample missing caps"))?;
    let info = gstreamer_video::VideoInfo::from_caps(caps)
        .map_err(|e| ReadError::Decode(format!("parse caps: {}", e)))?;

    let width = info.width();
    let height = info.height();
    let row_bytes = width as usize * 3;
    let stride = info.stride()[0] as usize;

    let map = buffer
        .map_readable()
        .map_err(|_| decode("buffer not readable"))?;
    let data = map.as_slice();

    if stride == row_bytes {
        return Ok(Frame::rgb(data.to_vec(), width, height));
    }

    let mut pixels = Vec::with_capacity(row_bytes * height as usize);
    for row in 0..height as usize {
        let start = row * stride;
        pixels.extend_from_slice(
            data.get(start..start + row_bytes)
                .ok_or_else(|| decode("buffer row out of bounds"))?,
        );
    }
    Ok(Frame::rgb(pixels, width, height))
}
