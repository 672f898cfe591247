//! Frame consumers.
//!
//! Every sink owns its failure policy: errors returned from `consume` are
//! logged by the controller and never stop the loop. Sinks are driven in
//! [`SinkKind`] order and released in reverse.

pub mod disk;
pub mod display;
pub mod relay;

use std::fmt;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde::{Deserialize, Serialize};

use crate::classify::InferenceResult;
use crate::error::SinkError;
use crate::frame::Frame;

pub use disk::{normalize_label, DiskWriter, DiskWriterConfig, TriggerMode};
pub use display::{Display, DisplayConfig};
pub use relay::{NetworkRelay, RelayConfig};

/// Sink variant. The derived order is the dispatch order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SinkKind {
    Display,
    Disk,
    Relay,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum SinkOutcome {
    Delivered,
    /// The sink decided not to act on this frame (rate limit, no trigger).
    Skipped(String),
}

pub trait FrameSink {
    fn name(&self) -> &'static str;

    fn kind(&self) -> SinkKind;

    /// Opens windows, directories or connections. Called once before the
    /// first frame.
    fn acquire(&mut self) -> Result<(), SinkError>;

    fn consume(
        &mut self,
        frame: &Frame,
        result: Option<&InferenceResult>,
    ) -> Result<SinkOutcome, SinkError>;

    /// Called exactly once by the controller, also after failures.
    fn release(&mut self);
}

/// One-shot capture request shared between the display (which raises it on
/// the `s` key) and a key-triggered [`DiskWriter`].
#[derive(Clone, Debug, Default)]
pub struct CaptureTrigger(Arc<AtomicBool>);

impl CaptureTrigger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    /// Returns whether a capture was requested and clears the request.
    pub fn take(&self) -> bool {
        self.0.swap(false, Ordering::SeqCst)
    }
}

/// Still-image encoding used by the disk writer and the relay.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageFormat {
    Png,
    Jpeg,
}

impl ImageFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ImageFormat::Png => "png",
            ImageFormat::Jpeg => "jpg",
        }
    }
}

impl fmt::Display for ImageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

impl FromStr for ImageFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "png" => Ok(ImageFormat::Png),
            "jpg" | "jpeg" => Ok(ImageFormat::Jpeg),
            other => Err(format!("unknown image format '{}' (expected png or jpeg)", other)),
        }
    }
}

/// Encodes the frame. Grayscale stays single-channel; RGBA loses its alpha
/// for JPEG.
pub(crate) fn encode_frame(frame: &Frame, format: ImageFormat, quality: u8) -> Result<Vec<u8>, String> {
    frame.validate().map_err(|e| e.to_string())?;
    let mut out = Vec::new();
    let (width, height) = (frame.width(), frame.height());
    match (format, frame.channels()) {
        (ImageFormat::Png, channels) => {
            let color = match channels {
                1 => ExtendedColorType::L8,
                4 => ExtendedColorType::Rgba8,
                _ => ExtendedColorType::Rgb8,
            };
            PngEncoder::new(&mut out)
                .write_image(frame.pixels(), width, height, color)
                .map_err(|e| e.to_string())?;
        }
        (ImageFormat::Jpeg, 1) => {
            JpegEncoder::new_with_quality(&mut out, quality)
                .encode(frame.pixels(), width, height, ExtendedColorType::L8)
                .map_err(|e| e.to_string())?;
        }
        (ImageFormat::Jpeg, _) => {
            let rgb = frame.to_rgb().map_err(|e| e.to_string())?;
            JpegEncoder::new_with_quality(&mut out, quality)
                .encode(&rgb, width, height, ExtendedColorType::Rgb8)
                .map_err(|e| e.to_string())?;
        }
    }
    Ok(out)
}
