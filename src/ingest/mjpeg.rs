//! HTTP camera source.
//!
//! Handles the two shapes ESP32-CAM style firmware serves over HTTP:
//! a `multipart/x-mixed-replace` MJPEG stream, or a snapshot endpoint that
//! returns one JPEG per request.

use std::io::Read;

use image::GenericImageView;

use super::SourceConfig;
use crate::error::{ConnectError, ReadError};
use crate::frame::Frame;

const MAX_JPEG_BYTES: usize = 5 * 1024 * 1024;
const READ_CHUNK: usize = 8192;

pub(super) struct MjpegSource {
    config: SourceConfig,
    agent: ureq::Agent,
    stream: Option<HttpStream>,
}

enum HttpStream {
    Mjpeg(MjpegStream),
    Snapshot,
}

impl MjpegSource {
    pub(super) fn new(config: SourceConfig) -> Self {
        let agent = ureq::AgentBuilder::new()
            .timeout_connect(config.connect_timeout)
            .timeout_read(config.read_timeout)
            .build();
        Self {
            config,
            agent,
            stream: None,
        }
    }

    pub(super) fn connect(&mut self) -> Result<(), ConnectError> {
        let response = self
            .agent
            .get(&self.config.url)
            .call()
            .map_err(|e| ConnectError::new(&self.config.url, e.to_string()))?;
        let content_type = response.header("Content-Type").unwrap_or("").to_lowercase();
        if content_type.contains("multipart") {
            self.stream = Some(HttpStream::Mjpeg(MjpegStream::new(response.into_reader())));
            log::info!("StreamSource: connected to {} (mjpeg)", self.config.url);
        } else {
            self.stream = Some(HttpStream::Snapshot);
            log::info!("StreamSource: connected to {} (snapshot)", self.config.url);
        }
        Ok(())
    }

    pub(super) fn next_frame(&mut self) -> Result<Frame, ReadError> {
        let stream = self.stream.as_mut().ok_or(ReadError::NotStreaming)?;
        let jpeg = match stream {
            HttpStream::Mjpeg(stream) => stream.read_next_jpeg()?,
            HttpStream::Snapshot => fetch_snapshot(&self.agent, &self.config.url)?,
        };
        decode_jpeg(&jpeg)
    }

    pub(super) fn release(&mut self) {
        // Dropping the reader closes the HTTP connection.
        self.stream = None;
    }
}

struct MjpegStream {
    reader: Box<dyn Read + Send>,
    buffer: Vec<u8>,
}

impl MjpegStream {
    fn new(reader: Box<dyn Read + Send>) -> Self {
        Self {
            reader,
            buffer: Vec::with_capacity(64 * 1024),
        }
    }

    fn read_next_jpeg(&mut self) -> Result<Vec<u8>, ReadError> {
        let mut chunk = vec![0u8; READ_CHUNK];
        loop {
            if let Some((start, end)) = find_jpeg_bounds(&self.buffer) {
                let jpeg = self.buffer[start..end].to_vec();
                self.buffer.drain(..end);
                return Ok(jpeg);
            }

            let read = self
                .reader
                .read(&mut chunk)
                .map_err(|e| ReadError::Transport(e.to_string()))?;
            if read == 0 {
                return Err(ReadError::EndOfStream);
            }
            self.buffer.extend_from_slice(&chunk[..read]);

            if self.buffer.len() > MAX_JPEG_BYTES * 2 {
                // No complete image in 10 MB: keep the tail so a split
                // start-of-image marker is not lost.
                let keep = 2.min(self.buffer.len());
                let drain_len = self.buffer.len() - keep;
                self.buffer.drain(..drain_len);
            }
        }
    }
}

fn fetch_snapshot(agent: &ureq::Agent, url: &str) -> Result<Vec<u8>, ReadError> {
    let response = agent
        .get(url)
        .call()
        .map_err(|e| ReadError::Transport(e.to_string()))?;
    let mut bytes = Vec::new();
    response
        .into_reader()
        .take(MAX_JPEG_BYTES as u64)
        .read_to_end(&mut bytes)
        .map_err(|e| ReadError::Transport(e.to_string()))?;
    if bytes.is_empty() {
        return Err(ReadError::Decode("empty jpeg snapshot".to_string()));
    }
    Ok(bytes)
}

fn decode_jpeg(bytes: &[u8]) -> Result<Frame, ReadError> {
    let image = image::load_from_memory(bytes).map_err(|e| ReadError::Decode(e.to_string()))?;
    let (width, height) = image.dimensions();
    Ok(Frame::rgb(image.into_rgb8().into_raw(), width, height))
}

/// Start/end offsets of the first complete JPEG (SOI .. EOI) in `buffer`.
fn find_jpeg_bounds(buffer: &[u8]) -> Option<(usize, usize)> {
    let start = buffer.windows(2).position(|w| w == [0xFF, 0xD8])?;
    let end = buffer[start + 2..]
        .windows(2)
        .position(|w| w == [0xFF, 0xD9])?;
    Some((start, start + 2 + end + 2))
}
