//! Stream acquisition.
//!
//! `StreamSource` picks a backend from the URL scheme:
//! - `stub://` synthetic test pattern (tests, dry runs)
//! - `http(s)://` MJPEG or single-JPEG endpoints (ESP32-CAM style)
//! - `rtsp://` GStreamer pipeline (feature: rtsp-gstreamer)
//!
//! Every backend follows the same state machine:
//! `Disconnected -> Connecting -> Streaming -> Failed -> Connecting ...`,
//! with `Closed` reachable from anywhere and terminal.

mod mjpeg;
#[cfg(feature = "rtsp-gstreamer")]
mod rtsp;
mod synthetic;

use std::time::Duration;

use crate::error::{ConnectError, ReadError};
use crate::frame::Frame;

use mjpeg::MjpegSource;
#[cfg(feature = "rtsp-gstreamer")]
use rtsp::GstreamerSource;
use synthetic::SyntheticSource;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Streaming,
    Failed,
    Closed,
}

/// A connection-resilient frame producer.
///
/// `close` must release the transport handle even after `next_frame` failed,
/// and must be safe to call more than once.
pub trait FrameSource {
    fn open(&mut self) -> Result<(), ConnectError>;
    fn next_frame(&mut self) -> Result<Frame, ReadError>;
    fn close(&mut self);
    fn state(&self) -> ConnectionState;
    fn url(&self) -> &str;
}

#[derive(Clone, Debug)]
pub struct SourceConfig {
    /// Stream URL (e.g. "rtsp://localhost:8554/webcam_stream").
    pub url: String,
    /// Longest wait for a single frame before the read counts as failed.
    pub read_timeout: Duration,
    /// Connect timeout for network backends.
    pub connect_timeout: Duration,
    /// Synthetic frame size.
    pub width: u32,
    pub height: u32,
    /// Synthetic pacing; 0 produces frames as fast as they are read.
    pub target_fps: u32,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            url: "rtsp://localhost:8554/webcam_stream".to_string(),
            read_timeout: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(5),
            width: 640,
            height: 480,
            target_fps: 0,
        }
    }
}

#[derive(Clone, Debug, Default)]
struct SourceStats {
    frames_captured: u64,
    opens: u64,
    read_failures: u64,
    corrupt_frames: u64,
}

pub struct StreamSource {
    url: String,
    backend: Backend,
    state: ConnectionState,
    stats: SourceStats,
}

enum Backend {
    Synthetic(SyntheticSource),
    Mjpeg(MjpegSource),
    #[cfg(feature = "rtsp-gstreamer")]
    Gstreamer(GstreamerSource),
}

impl StreamSource {
    /// Selects a backend for `config.url`. Unsupported schemes are reported
    /// as `ConnectError` since the stream can never be opened.
    pub fn new(config: SourceConfig) -> Result<Self, ConnectError> {
        let url = config.url.clone();
        let scheme = url
            .split_once("://")
            .map(|(scheme, _)| scheme.to_ascii_lowercase())
            .ok_or_else(|| ConnectError::new(&url, "missing url scheme"))?;
        let backend = match scheme.as_str() {
            "stub" => Backend::Synthetic(SyntheticSource::new(config)?),
            "http" | "https" => Backend::Mjpeg(MjpegSource::new(config)),
            "rtsp" | "rtsps" => {
                #[cfg(feature = "rtsp-gstreamer")]
                {
                    Backend::Gstreamer(GstreamerSource::new(config))
                }
                #[cfg(not(feature = "rtsp-gstreamer"))]
                {
                    return Err(ConnectError::new(
                        &url,
                        "RTSP requires the rtsp-gstreamer feature",
                    ));
                }
            }
            other => {
                return Err(ConnectError::new(
                    &url,
                    format!("unsupported scheme '{}'", other),
                ))
            }
        };
        Ok(Self {
            url,
            backend,
            state: ConnectionState::Disconnected,
            stats: SourceStats::default(),
        })
    }

    fn release_backend(&mut self) {
        match &mut self.backend {
            Backend::Synthetic(source) => source.release(),
            Backend::Mjpeg(source) => source.release(),
            #[cfg(feature = "rtsp-gstreamer")]
            Backend::Gstreamer(source) => source.release(),
        }
    }
}

impl FrameSource for StreamSource {
    fn open(&mut self) -> Result<(), ConnectError> {
        if self.state == ConnectionState::Closed {
            return Err(ConnectError::new(&self.url, "source was closed"));
        }
        // Reopen after a failure: drop whatever the previous attempt held.
        self.release_backend();
        self.state = ConnectionState::Connecting;
        let result = match &mut self.backend {
            Backend::Synthetic(source) => source.connect(),
            Backend::Mjpeg(source) => source.connect(),
            #[cfg(feature = "rtsp-gstreamer")]
            Backend::Gstreamer(source) => source.connect(),
        };
        self.stats.opens += 1;
        match result {
            Ok(()) => {
                self.state = ConnectionState::Streaming;
                log::info!("StreamSource: streaming from {}", self.url);
                Ok(())
            }
            Err(err) => {
                self.release_backend();
                self.state = ConnectionState::Failed;
                Err(err)
            }
        }
    }

    fn next_frame(&mut self) -> Result<Frame, ReadError> {
        if self.state != ConnectionState::Streaming {
            return Err(ReadError::NotStreaming);
        }
        let result = match &mut self.backend {
            Backend::Synthetic(source) => source.next_frame(),
            Backend::Mjpeg(source) => source.next_frame(),
            #[cfg(feature = "rtsp-gstreamer")]
            Backend::Gstreamer(source) => source.next_frame(),
        };
        match result {
            Ok(frame) => {
                self.stats.frames_captured += 1;
                Ok(frame.with_sequence(self.stats.frames_captured))
            }
            // A corrupt image inside a healthy stream: keep streaming.
            Err(err) if err.is_frame_local() => {
                self.stats.corrupt_frames += 1;
                Err(err)
            }
            Err(err) => {
                self.stats.read_failures += 1;
                self.state = ConnectionState::Failed;
                Err(err)
            }
        }
    }

    fn close(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }
        self.release_backend();
        self.state = ConnectionState::Closed;
        log::info!(
            "StreamSource: closed {} after {} frames ({} open(s), {} read failure(s), {} corrupt frame(s))",
            self.url,
            self.stats.frames_captured,
            self.stats.opens,
            self.stats.read_failures,
            self.stats.corrupt_frames
        );
    }

    fn state(&self) -> ConnectionState {
        self.state
    }

    fn url(&self) -> &str {
        &self.url
    }
}

impl Drop for StreamSource {
    fn drop(&mut self) {
        self.close();
    }
}
