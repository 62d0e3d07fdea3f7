//! Mosaic reconstruction.
//!
//! Bilinear-style demosaic: a pixel keeps its own sample for the channel the
//! sensor recorded there, and every other channel is the mean of same-channel
//! samples in its 3x3 neighbourhood (clipped at the frame edges).

use crate::frame::{BayerPattern, RawFrame, SampleLayout};
use crate::process::LinearImage;

/// Converts a validated raw frame to normalised RGB.
pub fn debayer(raw: &RawFrame) -> LinearImage {
    let width = raw.width as usize;
    let height = raw.height as usize;
    match raw.layout {
        SampleLayout::Mono => {
            let data = (0..width * height)
                .map(|i| {
                    let v = raw.sample(i);
                    [v, v, v]
                })
                .collect();
            LinearImage::from_parts(raw.width, raw.height, data)
        }
        SampleLayout::Rgb => {
            let data = (0..width * height)
                .map(|i| [raw.sample(i * 3), raw.sample(i * 3 + 1), raw.sample(i * 3 + 2)])
                .collect();
            LinearImage::from_parts(raw.width, raw.height, data)
        }
        SampleLayout::Bayer(pattern) => demosaic(raw, pattern, width, height),
    }
}

fn demosaic(raw: &RawFrame, pattern: BayerPattern, width: usize, height: usize) -> LinearImage {
    let mut data = Vec::with_capacity(width * height);
    for y in 0..height {
        let y0 = y.saturating_sub(1);
        let y1 = (y + 1).min(height - 1);
        for x in 0..width {
            let x0 = x.saturating_sub(1);
            let x1 = (x + 1).min(width - 1);
            let own = pattern.channel_at(x, y);
            let own_value = raw.sample(y * width + x);

            let mut sum = [0.0f32; 3];
            let mut count = [0u32; 3];
            for ny in y0..=y1 {
                for nx in x0..=x1 {
                    let channel = pattern.channel_at(nx, ny);
                    sum[channel] += raw.sample(ny * width + nx);
                    count[channel] += 1;
                }
            }

            let mut pixel = [0.0f32; 3];
            for (channel, value) in pixel.iter_mut().enumerate() {
                *value = if channel == own || count[channel] == 0 {
                    own_value
                } else {
                    sum[channel] / count[channel] as f32
                };
            }
            data.push(pixel);
        }
    }
    LinearImage::from_parts(raw.width, raw.height, data)
}
