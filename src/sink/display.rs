//! Live preview window.
//!
//! Keys: `s` raises the capture trigger, `q` or `Esc` (or closing the
//! window) asks the controller to stop.

use image::imageops::{self, FilterType};
use image::RgbImage;

use super::{CaptureTrigger, FrameSink, SinkKind, SinkOutcome};
use crate::classify::InferenceResult;
use crate::error::SinkError;
use crate::frame::Frame;
use crate::lifecycle::{ShutdownToken, StopReason};

pub const DEFAULT_PREVIEW_WIDTH: usize = 640;
pub const DEFAULT_PREVIEW_HEIGHT: usize = 480;

const BAR_HEIGHT: usize = 12;
const BAR_COLOR: u32 = 0x0000_C853;
const BAR_TRACK: u32 = 0x0030_3030;

#[derive(Clone, Debug)]
pub struct DisplayConfig {
    pub width: usize,
    pub height: usize,
    pub title: String,
    /// Window refresh cap; 0 leaves the loop unthrottled.
    pub target_fps: usize,
}

impl Default for DisplayConfig {
    fn default() -> Self {
        Self {
            width: DEFAULT_PREVIEW_WIDTH,
            height: DEFAULT_PREVIEW_HEIGHT,
            title: "framepipe".to_string(),
            target_fps: 0,
        }
    }
}

/// Keys the sink reacts to, as seen during one window update.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct KeyState {
    capture: bool,
    quit: bool,
}

pub struct Display {
    config: DisplayConfig,
    shutdown: ShutdownToken,
    trigger: Option<CaptureTrigger>,
    surface: Option<surface::Surface>,
}

impl Display {
    pub fn new(config: DisplayConfig, shutdown: ShutdownToken) -> Self {
        Self {
            config,
            shutdown,
            trigger: None,
            surface: None,
        }
    }

    /// Lets the `s` key request a save from a key-triggered disk writer.
    pub fn with_capture_trigger(mut self, trigger: CaptureTrigger) -> Self {
        self.trigger = Some(trigger);
        self
    }

    fn handle_keys(&self, keys: KeyState) {
        if keys.capture {
            if let Some(trigger) = &self.trigger {
                trigger.raise();
                log::info!("Display: capture requested");
            }
        }
        if keys.quit {
            log::info!("Display: quit requested");
            self.shutdown.request(StopReason::QuitRequested);
        }
    }
}

impl FrameSink for Display {
    fn name(&self) -> &'static str {
        "display"
    }

    fn kind(&self) -> SinkKind {
        SinkKind::Display
    }

    fn acquire(&mut self) -> Result<(), SinkError> {
        self.surface = Some(surface::Surface::open(&self.config)?);
        Ok(())
    }

    fn consume(
        &mut self,
        frame: &Frame,
        result: Option<&InferenceResult>,
    ) -> Result<SinkOutcome, SinkError> {
        let buffer = compose_preview(frame, result, self.config.width, self.config.height)?;
        let title = window_title(&self.config.title, result);
        let surface = self
            .surface
            .as_mut()
            .ok_or_else(|| SinkError::Display("window is not open".to_string()))?;
        let keys = surface.present(&buffer, &title)?;
        self.handle_keys(keys);
        Ok(SinkOutcome::Delivered)
    }

    fn release(&mut self) {
        if self.surface.take().is_some() {
            log::info!("Display: window closed");
        }
    }
}

/// `base - label (xx.x%)`, or just `base` without a result.
pub fn window_title(base: &str, result: Option<&InferenceResult>) -> String {
    match result {
        Some(result) => format!("{} - {}", base, result),
        None => base.to_string(),
    }
}

/// Scales the frame to the preview size, draws the confidence bar along the
/// bottom edge and packs the pixels as `0x00RRGGBB`.
pub fn compose_preview(
    frame: &Frame,
    result: Option<&InferenceResult>,
    width: usize,
    height: usize,
) -> Result<Vec<u32>, SinkError> {
    let rgb = frame
        .to_rgb()
        .map_err(|e| SinkError::Display(e.to_string()))?;
    let image = RgbImage::from_raw(frame.width(), frame.height(), rgb)
        .ok_or_else(|| SinkError::Display("frame buffer does not match its size".to_string()))?;
    let image = if image.width() as usize == width && image.height() as usize == height {
        image
    } else {
        imageops::resize(&image, width as u32, height as u32, FilterType::Triangle)
    };

    let mut argb = rgb_to_argb(image.as_raw(), width, height);
    if let Some(result) = result {
        draw_confidence_bar(&mut argb, width, height, result.confidence);
    }
    Ok(argb)
}

fn rgb_to_argb(buf: &[u8], width: usize, height: usize) -> Vec<u32> {
    buf.chunks_exact(3)
        .take(width * height)
        .map(|px| ((px[0] as u32) << 16) | ((px[1] as u32) << 8) | px[2] as u32)
        .collect()
}

fn draw_confidence_bar(buf: &mut [u32], width: usize, height: usize, confidence: f32) {
    let bar_height = BAR_HEIGHT.min(height);
    let filled = (confidence.clamp(0.0, 1.0) * width as f32).round() as usize;
    for y in height - bar_height..height {
        let row = &mut buf[y * width..(y + 1) * width];
        for (x, px) in row.iter_mut().enumerate() {
            *px = if x < filled { BAR_COLOR } else { BAR_TRACK };
        }
    }
}

#[cfg(feature = "display-minifb")]
mod surface {
    use minifb::{Key, KeyRepeat, Window, WindowOptions};

    use super::{DisplayConfig, KeyState};
    use crate::error::SinkError;

    pub(super) struct Surface {
        window: Window,
        width: usize,
        height: usize,
    }

    impl Surface {
        pub(super) fn open(config: &DisplayConfig) -> Result<Self, SinkError> {
            let mut window = Window::new(
                &config.title,
                config.width,
                config.height,
                WindowOptions::default(),
            )
            .map_err(|e| SinkError::Display(format!("failed to open window: {}", e)))?;
            window.set_target_fps(config.target_fps);
            log::info!(
                "Display: window opened at {}x{} (s = save, q/Esc = quit)",
                config.width,
                config.height
            );
            Ok(Self {
                window,
                width: config.width,
                height: config.height,
            })
        }

        pub(super) fn present(&mut self, buffer: &[u32], title: &str) -> Result<KeyState, SinkError> {
            self.window.set_title(title);
            self.window
                .update_with_buffer(buffer, self.width, self.height)
                .map_err(|e| SinkError::Display(e.to_string()))?;
            Ok(KeyState {
                capture: self.window.is_key_pressed(Key::S, KeyRepeat::No),
                quit: !self.window.is_open()
                    || self.window.is_key_down(Key::Escape)
                    || self.window.is_key_pressed(Key::Q, KeyRepeat::No),
            })
        }
    }
}

#[cfg(not(feature = "display-minifb"))]
mod surface {
    use super::{DisplayConfig, KeyState};
    use crate::error::SinkError;

    pub(super) struct Surface;

    impl Surface {
        pub(super) fn open(_config: &DisplayConfig) -> Result<Self, SinkError> {
            Err(SinkError::Display(
                "framepipe was built without the display-minifb feature".to_string(),
            ))
        }

        pub(super) fn present(&mut self, _buffer: &[u32], _title: &str) -> Result<KeyState, SinkError> {
            Ok(KeyState::default())
        }
    }
}
