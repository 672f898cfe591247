//! Frame preprocessing shared by the live pipeline and dataset preparation.
//!
//! Steps, in order:
//! 1. bilinear resize to the profile size (skipped when sizes already match)
//! 2. channel reduction (fixed-point BT.601 luma for grayscale)
//! 3. `u8 / 255` mapped into the profile's normalization range
//! 4. leading batch dimension of 1
//!
//! Both `prepare_dataset` and the inference path call [`apply`]; there is no
//! second implementation of these steps anywhere in the crate.

use anyhow::{anyhow, Result};
use image::imageops::{self, FilterType};
use image::{ImageBuffer, Luma, Pixel, Rgb, Rgba};

use crate::error::InvalidFrameError;
use crate::frame::Frame;

pub const DEFAULT_PROFILE_WIDTH: u32 = 96;
pub const DEFAULT_PROFILE_HEIGHT: u32 = 96;

const LUMA_R: u32 = 4899;
const LUMA_G: u32 = 9617;
const LUMA_B: u32 = 1868;
const LUMA_SHIFT: u32 = 14;

/// Agreed preprocessing configuration. Immutable once built.
#[derive(Clone, Debug, PartialEq)]
pub struct PreprocessingProfile {
    width: u32,
    height: u32,
    channels: u8,
    range: (f32, f32),
}

impl PreprocessingProfile {
    pub fn new(width: u32, height: u32, channels: u8, range: (f32, f32)) -> Result<Self> {
        if width == 0 || height == 0 {
            return Err(anyhow!("profile size must be non-zero, got {}x{}", width, height));
        }
        if !matches!(channels, 1 | 3) {
            return Err(anyhow!("profile channels must be 1 or 3, got {}", channels));
        }
        let (lo, hi) = range;
        if !lo.is_finite() || !hi.is_finite() || lo >= hi {
            return Err(anyhow!("normalization range [{}, {}] is empty", lo, hi));
        }
        Ok(Self {
            width,
            height,
            channels,
            range,
        })
    }

    pub fn grayscale(width: u32, height: u32) -> Result<Self> {
        Self::new(width, height, 1, (0.0, 1.0))
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

    pub fn range(&self) -> (f32, f32) {
        self.range
    }

    /// `(1, height, width, channels)`
    pub fn tensor_shape(&self) -> [usize; 4] {
        [
            1,
            self.height as usize,
            self.width as usize,
            self.channels as usize,
        ]
    }
}

impl Default for PreprocessingProfile {
    fn default() -> Self {
        Self {
            width: DEFAULT_PROFILE_WIDTH,
            height: DEFAULT_PROFILE_HEIGHT,
            channels: 1,
            range: (0.0, 1.0),
        }
    }
}

/// NHWC `f32` tensor.
#[derive(Clone, Debug, PartialEq)]
pub struct Tensor {
    shape: [usize; 4],
    data: Vec<f32>,
}

impl Tensor {
    pub fn shape(&self) -> [usize; 4] {
        self.shape
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_data(self) -> Vec<f32> {
        self.data
    }

    /// All-zero tensor, used for backend warm-up.
    pub fn zeros(shape: [usize; 4]) -> Self {
        Self {
            shape,
            data: vec![0.0; shape.iter().product()],
        }
    }

    #[cfg(test)]
    pub(crate) fn from_parts(shape: [usize; 4], data: Vec<f32>) -> Self {
        Self { shape, data }
    }

    /// Maps the values back to `u8` image range. Used for previews of the
    /// model input and for reproducibility checks.
    pub fn to_frame(&self, range: (f32, f32)) -> Frame {
        let (lo, hi) = range;
        let pixels = self
            .data
            .iter()
            .map(|&v| (((v - lo) / (hi - lo)) * 255.0).round().clamp(0.0, 255.0) as u8)
            .collect();
        Frame::new(
            pixels,
            self.shape[2] as u32,
            self.shape[1] as u32,
            self.shape[3] as u8,
        )
    }
}

/// Turns a decoded frame into the model input for `profile`.
pub fn apply(frame: &Frame, profile: &PreprocessingProfile) -> Result<Tensor, InvalidFrameError> {
    frame.validate()?;

    let resized = resize(frame, profile.width, profile.height)?;
    let reduced = reduce_channels(&resized, frame.channels(), profile.channels);
    let (lo, hi) = profile.range;
    let data = reduced
        .into_iter()
        .map(|v| {
            let unit = v as f32 / 255.0;
            lo + unit * (hi - lo)
        })
        .collect();

    Ok(Tensor {
        shape: profile.tensor_shape(),
        data,
    })
}

fn resize(frame: &Frame, width: u32, height: u32) -> Result<Vec<u8>, InvalidFrameError> {
    if frame.width() == width && frame.height() == height {
        return Ok(frame.pixels().to_vec());
    }
    match frame.channels() {
        1 => resize_buffer::<Luma<u8>>(frame, width, height),
        3 => resize_buffer::<Rgb<u8>>(frame, width, height),
        4 => resize_buffer::<Rgba<u8>>(frame, width, height),
        other => Err(InvalidFrameError::new(format!(
            "unsupported channel count {}",
            other
        ))),
    }
}

fn resize_buffer<P>(frame: &Frame, width: u32, height: u32) -> Result<Vec<u8>, InvalidFrameError>
where
    P: Pixel<Subpixel = u8> + 'static,
{
    let view = ImageBuffer::<P, &[u8]>::from_raw(frame.width(), frame.height(), frame.pixels())
        .ok_or_else(|| InvalidFrameError::new("pixel buffer does not match frame size"))?;
    Ok(imageops::resize(&view, width, height, FilterType::Triangle).into_raw())
}

fn reduce_channels(pixels: &[u8], from: u8, to: u8) -> Vec<u8> {
    match (from, to) {
        (1, 1) | (3, 3) => pixels.to_vec(),
        (1, 3) => pixels.iter().flat_map(|&v| [v, v, v]).collect(),
        (4, 3) => pixels
            .chunks_exact(4)
            .flat_map(|px| [px[0], px[1], px[2]])
            .collect(),
        (3, 1) => pixels.chunks_exact(3).map(luma).collect(),
        (4, 1) => pixels.chunks_exact(4).map(luma).collect(),
        // Profiles only allow 1 or 3 channels and frames are validated.
        _ => pixels.to_vec(),
    }
}

fn luma(px: &[u8]) -> u8 {
    let weighted = px[0] as u32 * LUMA_R
        + px[1] as u32 * LUMA_G
        + px[2] as u32 * LUMA_B
        + (1 << (LUMA_SHIFT - 1));
    (weighted >> LUMA_SHIFT) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    fn gradient_frame(width: u32, height: u32) -> Frame {
        let mut pixels = Vec::with_capacity((width * height * 3) as usize);
        for y in 0..height {
            for x in 0..width {
                pixels.extend_from_slice(&[
                    (x * 255 / width.max(1)) as u8,
                    (y * 255 / height.max(1)) as u8,
                    ((x + y) % 256) as u8,
                ]);
            }
        }
        Frame::rgb(pixels, width, height)
    }

    #[test]
    fn output_shape_matches_profile_for_any_input_size() {
        let profile = PreprocessingProfile::default();
        for (w, h) in [(640, 480), (160, 120), (96, 96), (33, 200), (1, 1)] {
            let tensor = apply(&gradient_frame(w, h), &profile).unwrap();
            assert_eq!(tensor.shape(), [1, 96, 96, 1]);
            assert_eq!(tensor.data().len(), 96 * 96);
        }
    }

    #[test]
    fn color_profile_keeps_three_channels() {
        let profile = PreprocessingProfile::new(32, 24, 3, (0.0, 1.0)).unwrap();
        let tensor = apply(&gradient_frame(64, 48), &profile).unwrap();
        assert_eq!(tensor.shape(), [1, 24, 32, 3]);
    }

    #[test]
    fn luma_uses_fixed_point_weights() {
        assert_eq!(luma(&[255, 255, 255]), 255);
        assert_eq!(luma(&[0, 0, 0]), 0);
        assert_eq!(luma(&[255, 0, 0]), 76);
        assert_eq!(luma(&[0, 255, 0]), 150);
        assert_eq!(luma(&[0, 0, 255]), 29);
    }

    #[test]
    fn normalization_divides_by_max_value() {
        let profile = PreprocessingProfile::grayscale(2, 1).unwrap();
        let frame = Frame::new(vec![0, 255], 2, 1, 1);
        let tensor = apply(&frame, &profile).unwrap();
        assert_eq!(tensor.data(), &[0.0, 1.0]);

        let signed = PreprocessingProfile::new(2, 1, 1, (-1.0, 1.0)).unwrap();
        let tensor = apply(&frame, &signed).unwrap();
        assert_eq!(tensor.data(), &[-1.0, 1.0]);
    }

    #[test]
    fn reapplying_to_rescaled_output_is_exact() {
        let profile = PreprocessingProfile::default();
        let first = apply(&gradient_frame(640, 480), &profile).unwrap();
        let rescaled = first.to_frame(profile.range());
        let second = apply(&rescaled, &profile).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn identical_input_gives_bit_identical_output() {
        let profile = PreprocessingProfile::default();
        let a = apply(&gradient_frame(320, 240), &profile).unwrap();
        let b = apply(&gradient_frame(320, 240), &profile).unwrap();
        let bits_a: Vec<u32> = a.data().iter().map(|v| v.to_bits()).collect();
        let bits_b: Vec<u32> = b.data().iter().map(|v| v.to_bits()).collect();
        assert_eq!(bits_a, bits_b);
    }

    #[test]
    fn malformed_frames_are_rejected() {
        let profile = PreprocessingProfile::default();
        assert!(apply(&Frame::rgb(Vec::new(), 0, 0), &profile).is_err());
        assert!(apply(&Frame::rgb(vec![1, 2, 3], 2, 2), &profile).is_err());
        assert!(apply(&Frame::new(vec![0; 8], 2, 2, 2), &profile).is_err());
    }

    #[test]
    fn profile_rejects_bad_values() {
        assert!(PreprocessingProfile::new(0, 96, 1, (0.0, 1.0)).is_err());
        assert!(PreprocessingProfile::new(96, 96, 2, (0.0, 1.0)).is_err());
        assert!(PreprocessingProfile::new(96, 96, 1, (1.0, 1.0)).is_err());
    }
}
