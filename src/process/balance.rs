//! Color balance.
//!
//! Gains are ratios against green: green is never scaled. Gray world
//! measures channel means over mid-tone pixels (luminance between two
//! percentiles) and falls back to the whole frame when that window holds
//! fewer than `MIN_GRAY_WORLD_PIXELS`.

use serde::{Deserialize, Serialize};

use crate::frame::{BLUE, GREEN, RED};
use crate::process::{luminance, LinearImage};

pub const MIN_GRAY_WORLD_PIXELS: usize = 100;
const MEAN_EPSILON: f64 = 1e-6;

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum BalanceMode {
    #[default]
    None,
    Manual {
        red_gain: f32,
        blue_gain: f32,
    },
    GrayWorld {
        #[serde(default = "default_low_pct")]
        low_pct: f32,
        #[serde(default = "default_high_pct")]
        high_pct: f32,
    },
}

fn default_low_pct() -> f32 {
    5.0
}

fn default_high_pct() -> f32 {
    95.0
}

/// Red and blue gains `mode` would apply to `image`.
pub fn gains(image: &LinearImage, mode: &BalanceMode) -> (f32, f32) {
    match *mode {
        BalanceMode::None => (1.0, 1.0),
        BalanceMode::Manual {
            red_gain,
            blue_gain,
        } => (red_gain, blue_gain),
        BalanceMode::GrayWorld { low_pct, high_pct } => gray_world_gains(image, low_pct, high_pct),
    }
}

pub fn apply(image: &mut LinearImage, mode: &BalanceMode) {
    if *mode == BalanceMode::None {
        return;
    }
    let (red_gain, blue_gain) = gains(image, mode);
    log::debug!("color balance: red gain {:.4}, blue gain {:.4}", red_gain, blue_gain);
    for pixel in image.pixels_mut() {
        pixel[RED] = (pixel[RED] * red_gain).clamp(0.0, 1.0);
        pixel[BLUE] = (pixel[BLUE] * blue_gain).clamp(0.0, 1.0);
    }
}

fn gray_world_gains(image: &LinearImage, low_pct: f32, high_pct: f32) -> (f32, f32) {
    let pixels = image.pixels();
    if pixels.is_empty() {
        return (1.0, 1.0);
    }
    let mut lums: Vec<f32> = pixels.iter().map(luminance).collect();
    lums.sort_by(|a, b| a.total_cmp(b));
    let low = percentile_sorted(&lums, low_pct);
    let high = percentile_sorted(&lums, high_pct);

    let window = pixels.iter().filter(|p| {
        let lum = luminance(p);
        lum >= low && lum <= high
    });
    let mut means = channel_means(window);
    if means.1 < MIN_GRAY_WORLD_PIXELS {
        means = channel_means(pixels.iter());
    }
    let [r, g, b] = means.0;
    (
        (g / (r + MEAN_EPSILON)) as f32,
        (g / (b + MEAN_EPSILON)) as f32,
    )
}

fn channel_means<'a>(pixels: impl Iterator<Item = &'a [f32; 3]>) -> ([f64; 3], usize) {
    let mut sum = [0.0f64; 3];
    let mut count = 0usize;
    for pixel in pixels {
        sum[RED] += pixel[RED] as f64;
        sum[GREEN] += pixel[GREEN] as f64;
        sum[BLUE] += pixel[BLUE] as f64;
        count += 1;
    }
    if count == 0 {
        return ([0.0; 3], 0);
    }
    let n = count as f64;
    ([sum[RED] / n, sum[GREEN] / n, sum[BLUE] / n], count)
}

/// Linear-interpolated percentile over already sorted values.
fn percentile_sorted(sorted: &[f32], pct: f32) -> f32 {
    let last = sorted.len() - 1;
    let rank = (pct.clamp(0.0, 100.0) / 100.0) * last as f32;
    let lo = rank.floor() as usize;
    let hi = rank.ceil() as usize;
    let frac = rank - lo as f32;
    sorted[lo] + (sorted[hi.min(last)] - sorted[lo]) * frac
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tinted(width: u32, height: u32, rgb: [f32; 3]) -> LinearImage {
        let n = (width * height) as usize;
        let data = (0..n)
            .map(|i| {
                let shade = 0.5 + 0.5 * (i as f32 / n as f32);
                [rgb[0] * shade, rgb[1] * shade, rgb[2] * shade]
            })
            .collect();
        LinearImage::from_parts(width, height, data)
    }

    #[test]
    fn manual_gains_scale_red_and_blue_only() {
        let mut img = LinearImage::from_parts(1, 1, vec![[0.4, 0.5, 0.2]]);
        apply(
            &mut img,
            &BalanceMode::Manual {
                red_gain: 0.5,
                blue_gain: 2.0,
            },
        );
        assert_eq!(img.pixels()[0], [0.2, 0.5, 0.4]);
    }

    #[test]
    fn gains_clamp_to_display_range() {
        let mut img = LinearImage::from_parts(1, 1, vec![[0.9, 0.5, 0.9]]);
        apply(
            &mut img,
            &BalanceMode::Manual {
                red_gain: 3.0,
                blue_gain: 3.0,
            },
        );
        assert_eq!(img.pixels()[0], [1.0, 0.5, 1.0]);
    }

    #[test]
    fn gray_world_neutralises_cast() {
        let mut img = tinted(20, 20, [0.6, 0.3, 0.15]);
        apply(&mut img, &BalanceMode::GrayWorld {
            low_pct: 5.0,
            high_pct: 95.0,
        });
        let (r, g, b) = img
            .pixels()
            .iter()
            .fold((0.0, 0.0, 0.0), |acc, p| (acc.0 + p[0], acc.1 + p[1], acc.2 + p[2]));
        assert!((r - g).abs() / g < 0.01, "r={} g={}", r, g);
        assert!((b - g).abs() / g < 0.01, "b={} g={}", b, g);
    }

    #[test]
    fn gray_world_small_frames_use_every_pixel() {
        // 3x3 = 9 pixels, below the mid-tone minimum
        let img = tinted(3, 3, [0.2, 0.4, 0.8]);
        let (red, blue) = gains(&img, &BalanceMode::GrayWorld {
            low_pct: 40.0,
            high_pct: 60.0,
        });
        assert!((red - 2.0).abs() < 1e-3);
        assert!((blue - 0.5).abs() < 1e-3);
    }

    #[test]
    fn black_frame_does_not_blow_up() {
        let img = LinearImage::from_parts(2, 2, vec![[0.0; 3]; 4]);
        let (red, blue) = gains(&img, &BalanceMode::GrayWorld {
            low_pct: 5.0,
            high_pct: 95.0,
        });
        assert!(red.is_finite() && blue.is_finite());
    }
}
