//! Decoded frames.
//!
//! A `Frame` is produced by an ingest backend and lives for one loop
//! iteration. It is intentionally not `Clone`: sinks that need the pixels
//! beyond `consume` (the relay worker) encode them first and keep the bytes.

use std::time::SystemTime;

use crate::error::InvalidFrameError;

/// One decoded image from the stream. Pixels are interleaved, row-major.
///
/// Channel layouts: 1 = grayscale, 3 = RGB, 4 = RGBA.
pub struct Frame {
    data: Vec<u8>,
    width: u32,
    height: u32,
    channels: u8,
    captured_at: SystemTime,
    sequence: u64,
}

impl Frame {
    /// Wrap a decoded buffer. No validation happens here; see [`Frame::validate`].
    pub fn new(data: Vec<u8>, width: u32, height: u32, channels: u8) -> Self {
        Self {
            data,
            width,
            height,
            channels,
            captured_at: SystemTime::now(),
            sequence: 0,
        }
    }

    pub fn rgb(data: Vec<u8>, width: u32, height: u32) -> Self {
        Self::new(data, width, height, 3)
    }

    pub(crate) fn with_sequence(mut self, sequence: u64) -> Self {
        self.sequence = sequence;
        self
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn channels(&self) -> u8 {
        self.channels
    }

    pub fn pixels(&self) -> &[u8] {
        &self.data
    }

    pub fn captured_at(&self) -> SystemTime {
        self.captured_at
    }

    /// Position of this frame in its source's output, starting at 1.
    pub fn sequence(&self) -> u64 {
        self.sequence
    }

    /// Checks dimensions, channel layout and buffer length.
    pub fn validate(&self) -> Result<(), InvalidFrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(InvalidFrameError::new(format!(
                "zero-sized frame {}x{}",
                self.width, self.height
            )));
        }
        if self.data.is_empty() {
            return Err(InvalidFrameError::new("empty pixel buffer"));
        }
        if !matches!(self.channels, 1 | 3 | 4) {
            return Err(InvalidFrameError::new(format!(
                "unsupported channel count {}",
                self.channels
            )));
        }
        let expected = (self.width as usize)
            .checked_mul(self.height as usize)
            .and_then(|v| v.checked_mul(self.channels as usize))
            .ok_or_else(|| InvalidFrameError::new("frame dimensions overflow"))?;
        if self.data.len() != expected {
            return Err(InvalidFrameError::new(format!(
                "expected {} bytes for {}x{}x{}, received {}",
                expected,
                self.width,
                self.height,
                self.channels,
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Interleaved RGB copy of the pixels, used by encoders and the preview.
    pub fn to_rgb(&self) -> Result<Vec<u8>, InvalidFrameError> {
        self.validate()?;
        Ok(match self.channels {
            3 => self.data.clone(),
            1 => self.data.iter().flat_map(|&v| [v, v, v]).collect(),
            _ => self
                .data
                .chunks_exact(4)
                .flat_map(|px| [px[0], px[1], px[2]])
                .collect(),
        })
    }
}

impl std::fmt::Debug for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Frame")
            .field("width", &self.width)
            .field("height", &self.height)
            .field("channels", &self.channels)
            .field("sequence", &self.sequence)
            .field("bytes", &self.data.len())
            .finish()
    }
}
