//! Synthetic source (`stub://`) for tests and dry runs.
//!
//! Query parameters:
//! - `frames=N`: total frames over the source's lifetime, after which reads
//!   fail with end-of-stream (reopening does not refill the budget)
//! - `fail_open=1`: every `open()` fails as if the host were unreachable

use std::time::{Duration, Instant};

use url::Url;

use super::SourceConfig;
use crate::error::{ConnectError, ReadError};
use crate::frame::Frame;

pub(super) struct SyntheticSource {
    config: SourceConfig,
    frame_budget: Option<u64>,
    fail_open: bool,
    frames_emitted: u64,
    connected: bool,
    last_frame_at: Option<Instant>,
}

impl SyntheticSource {
    pub(super) fn new(config: SourceConfig) -> Result<Self, ConnectError> {
        let url = Url::parse(&config.url).map_err(|e| ConnectError::new(&config.url, e.to_string()))?;
        let mut frame_budget = None;
        let mut fail_open = false;
        for (key, value) in url.query_pairs() {
            match key.as_ref() {
                "frames" => {
                    let n = value.parse::<u64>().map_err(|_| {
                        ConnectError::new(&config.url, format!("invalid frames={}", value))
                    })?;
                    frame_budget = Some(n);
                }
                "fail_open" => fail_open = value != "0",
                _ => {}
            }
        }
        Ok(Self {
            config,
            frame_budget,
            fail_open,
            frames_emitted: 0,
            connected: false,
            last_frame_at: None,
        })
    }

    pub(super) fn connect(&mut self) -> Result<(), ConnectError> {
        if self.fail_open {
            return Err(ConnectError::new(&self.config.url, "host unreachable (synthetic)"));
        }
        self.connected = true;
        log::info!("StreamSource: connected to {} (synthetic)", self.config.url);
        Ok(())
    }

    pub(super) fn next_frame(&mut self) -> Result<Frame, ReadError> {
        if !self.connected {
            return Err(ReadError::NotStreaming);
        }
        if let Some(budget) = self.frame_budget {
            if self.frames_emitted >= budget {
                self.connected = false;
                return Err(ReadError::EndOfStream);
            }
        }
        self.pace();
        self.frames_emitted += 1;
        self.last_frame_at = Some(Instant::now());
        Ok(Frame::rgb(
            self.generate_pixels(),
            self.config.width,
            self.config.height,
        ))
    }

    pub(super) fn release(&mut self) {
        self.connected = false;
    }

    fn pace(&self) {
        if self.config.target_fps == 0 {
            return;
        }
        let interval = Duration::from_millis((1000 / self.config.target_fps).max(1) as u64);
        if let Some(last) = self.last_frame_at {
            let elapsed = last.elapsed();
            if elapsed < interval {
                std::thread::sleep(interval - elapsed);
            }
        }
    }

    /// Diagonal gradient that drifts one pixel per frame.
    fn generate_pixels(&self) -> Vec<u8> {
        let width = self.config.width as usize;
        let height = self.config.height as usize;
        let shift = self.frames_emitted as usize;
        let mut pixels = Vec::with_capacity(width * height * 3);
        for y in 0..height {
            for x in 0..width {
                let v = ((x + y + shift) % 256) as u8;
                pixels.extend_from_slice(&[v, v.wrapping_mul(3), 255 - v]);
            }
        }
        pixels
    }
}
