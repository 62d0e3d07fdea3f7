//! Processing engine.
//!
//! Turns one `RawFrame` into one composited RGB image. Stages run in a fixed
//! order: validate, debayer, stretch, color balance, resize, overlays.
//!
//! The engine holds configuration only. `process` never mutates its inputs
//! and gives byte-identical output for identical inputs.

pub mod balance;
pub mod debayer;
pub mod font;
pub mod overlay;
pub mod stretch;

use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::frame::{FrameError, ProcessedImage, RawFrame};

pub use balance::BalanceMode;
pub use overlay::{Anchor, ImageOverlayConfig, OverlayConfig, OverlaySpec, TextOverlayConfig};
pub use stretch::{StretchMode, StretchSettings};

/// Floating point RGB working buffer, one `[r, g, b]` triple per pixel,
/// nominally in `0.0..=1.0`.
#[derive(Clone, Debug, PartialEq)]
pub struct LinearImage {
    width: u32,
    height: u32,
    data: Vec<[f32; 3]>,
}

impl LinearImage {
    pub(crate) fn from_parts(width: u32, height: u32, data: Vec<[f32; 3]>) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize);
        Self {
            width,
            height,
            data,
        }
    }

    pub fn width(&self) -> u32 {
        self.width
    }

    pub fn height(&self) -> u32 {
        self.height
    }

    pub fn pixels(&self) -> &[[f32; 3]] {
        &self.data
    }

    pub(crate) fn pixels_mut(&mut self) -> &mut [[f32; 3]] {
        &mut self.data
    }

    /// Rounds to 8-bit RGB. Non-finite values become black.
    pub fn quantize(&self) -> RgbImage {
        let mut out = Vec::with_capacity(self.data.len() * 3);
        for pixel in &self.data {
            for value in pixel {
                out.push(to_u8(*value));
            }
        }
        // length always matches width * height * 3
        RgbImage::from_raw(self.width, self.height, out)
            .unwrap_or_else(|| RgbImage::new(self.width, self.height))
    }
}

fn to_u8(value: f32) -> u8 {
    if !value.is_finite() {
        return 0;
    }
    (value.clamp(0.0, 1.0) * 255.0).round() as u8
}

/// Rec. 601 luma of a normalised pixel.
pub fn luminance(pixel: &[f32; 3]) -> f32 {
    0.299 * pixel[0] + 0.587 * pixel[1] + 0.114 * pixel[2]
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct ProcessSettings {
    #[serde(default)]
    pub stretch: StretchSettings,
    #[serde(default)]
    pub balance: BalanceMode,
    /// Output scale, 1..=100. `None` or 100 keeps the native size.
    #[serde(default)]
    pub resize_percent: Option<u32>,
}

impl ProcessSettings {
    /// Settings that reproduce the input unchanged (sample / max).
    pub fn passthrough() -> Self {
        Self {
            stretch: StretchSettings::identity(),
            balance: BalanceMode::None,
            resize_percent: None,
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct ProcessingEngine {
    settings: ProcessSettings,
}

impl ProcessingEngine {
    pub fn new(settings: ProcessSettings) -> Self {
        Self { settings }
    }

    pub fn settings(&self) -> &ProcessSettings {
        &self.settings
    }

    /// Runs every stage on `raw`.
    ///
    /// A buffer that does not match its declared geometry is a
    /// `FrameError::Malformed`; overlays that cannot be drawn are listed in
    /// `ProcessedImage::skipped_overlays` instead of failing the frame.
    pub fn process(&self, raw: &RawFrame, overlays: &OverlaySpec) -> Result<ProcessedImage, FrameError> {
        raw.validate()?;

        let mut linear = debayer::debayer(raw);
        stretch::apply(&mut linear, &self.settings.stretch);
        balance::apply(&mut linear, &self.settings.balance);
        let mut pixels = linear.quantize();

        if let Some(percent) = self.settings.resize_percent.filter(|p| *p < 100) {
            pixels = resize(&pixels, percent);
        }

        let skipped_overlays = overlays.render(&mut pixels, raw);
        Ok(ProcessedImage {
            pixels,
            source: raw.identity.clone(),
            captured_at: raw.captured_at(),
            camera: raw.meta.camera.clone(),
            skipped_overlays,
        })
    }
}

fn resize(pixels: &RgbImage, percent: u32) -> RgbImage {
    let percent = percent.clamp(1, 100);
    let width = (pixels.width() * percent / 100).max(1);
    let height = (pixels.height() * percent / 100).max(1);
    image::imageops::resize(pixels, width, height, FilterType::Triangle)
}
