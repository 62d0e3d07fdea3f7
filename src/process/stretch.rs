//! Tone stretch.
//!
//! Black and white points come from percentiles of the luminance histogram.
//! The span between them is clamped to `MIN_DYNAMIC_RANGE` so flat frames
//! (all dark, or saturated) never divide by zero.

use serde::{Deserialize, Serialize};

use crate::process::{luminance, LinearImage};

pub const HISTOGRAM_BINS: usize = 4096;
pub const MIN_DYNAMIC_RANGE: f32 = 1e-3;

const DEFAULT_BLACK_PCT: f32 = 0.5;
const DEFAULT_WHITE_PCT: f32 = 99.5;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StretchMode {
    /// Values pass through as sample / max.
    None,
    #[default]
    Linear,
    Asinh {
        strength: f32,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StretchSettings {
    #[serde(default)]
    pub mode: StretchMode,
    #[serde(default = "default_black_pct")]
    pub black_pct: f32,
    #[serde(default = "default_white_pct")]
    pub white_pct: f32,
    /// Multiplier applied after the tone curve.
    #[serde(default = "default_brightness")]
    pub brightness: f32,
}

fn default_black_pct() -> f32 {
    DEFAULT_BLACK_PCT
}

fn default_white_pct() -> f32 {
    DEFAULT_WHITE_PCT
}

fn default_brightness() -> f32 {
    1.0
}

impl Default for StretchSettings {
    fn default() -> Self {
        Self {
            mode: StretchMode::Linear,
            black_pct: DEFAULT_BLACK_PCT,
            white_pct: DEFAULT_WHITE_PCT,
            brightness: 1.0,
        }
    }
}

impl StretchSettings {
    pub fn identity() -> Self {
        Self {
            mode: StretchMode::None,
            ..Self::default()
        }
    }
}

/// Black and white points of `image` at the given percentiles.
pub fn black_white_points(image: &LinearImage, black_pct: f32, white_pct: f32) -> (f32, f32) {
    let histogram = luminance_histogram(image);
    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return (0.0, 1.0);
    }
    let black = percentile(&histogram, total, black_pct);
    let white = percentile(&histogram, total, white_pct);
    (black, white.max(black))
}

pub fn apply(image: &mut LinearImage, settings: &StretchSettings) {
    let curve: Box<dyn Fn(f32) -> f32> = match settings.mode {
        StretchMode::None => Box::new(|v| v),
        StretchMode::Linear => {
            let (black, white) = black_white_points(image, settings.black_pct, settings.white_pct);
            let span = (white - black).max(MIN_DYNAMIC_RANGE);
            Box::new(move |v| ((v - black) / span).clamp(0.0, 1.0))
        }
        StretchMode::Asinh { strength } => {
            let (black, white) = black_white_points(image, settings.black_pct, settings.white_pct);
            let span = (white - black).max(MIN_DYNAMIC_RANGE);
            if strength > 0.0 {
                let norm = strength.asinh();
                Box::new(move |v| {
                    let t = ((v - black) / span).clamp(0.0, 1.0);
                    (strength * t).asinh() / norm
                })
            } else {
                Box::new(move |v| ((v - black) / span).clamp(0.0, 1.0))
            }
        }
    };

    let brightness = settings.brightness;
    for pixel in image.pixels_mut() {
        for value in pixel.iter_mut() {
            let mapped = curve(*value) * brightness;
            *value = if mapped.is_finite() { mapped } else { 0.0 };
        }
    }
}

fn luminance_histogram(image: &LinearImage) -> Vec<u64> {
    let mut histogram = vec![0u64; HISTOGRAM_BINS];
    for pixel in image.pixels() {
        let lum = luminance(pixel);
        if !lum.is_finite() {
            continue;
        }
        let bin = (lum.clamp(0.0, 1.0) * (HISTOGRAM_BINS - 1) as f32).round() as usize;
        histogram[bin] += 1;
    }
    histogram
}

fn percentile(histogram: &[u64], total: u64, pct: f32) -> f32 {
    let pct = pct.clamp(0.0, 100.0) as f64;
    let target = ((pct / 100.0) * total as f64).ceil().max(1.0) as u64;
    let mut seen = 0u64;
    for (bin, count) in histogram.iter().enumerate() {
        seen += count;
        if seen >= target {
            return bin as f32 / (HISTOGRAM_BINS - 1) as f32;
        }
    }
    1.0
}
