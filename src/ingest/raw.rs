//! Raw file decoding.
//!
//! Raw frames arrive as lossless images (PNG or TIFF). Single-channel images
//! are treated as a Bayer mosaic when a pattern is declared, otherwise as
//! monochrome; RGB images skip debayering. Capture metadata comes from an
//! optional `<stem>.json` sidecar next to the raw file.

use chrono::{DateTime, Utc};
use image::{DynamicImage, ImageReader};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use crate::frame::{
    BayerPattern, BitDepth, CaptureMeta, FrameError, FrameIdentity, RawFrame, SampleLayout,
};

/// Values used when a raw file carries no sidecar metadata.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct RawDefaults {
    pub camera: String,
    pub bayer: Option<BayerPattern>,
}

#[derive(Debug, Deserialize, Default)]
struct Sidecar {
    camera: Option<String>,
    exposure_ms: Option<f64>,
    gain: Option<f64>,
    temperature_c: Option<f64>,
    captured_at: Option<String>,
    bayer_pattern: Option<String>,
}

/// Path of the metadata sidecar for `raw_path`.
pub fn sidecar_path(raw_path: &Path) -> PathBuf {
    raw_path.with_extension("json")
}

/// Decodes the raw file named by `identity`.
pub fn load_raw_frame(identity: &FrameIdentity, defaults: &RawDefaults) -> Result<RawFrame, FrameError> {
    let sidecar = read_sidecar(&sidecar_path(&identity.path))?;

    let bayer = match sidecar.bayer_pattern.as_deref() {
        Some(tag) => BayerPattern::parse(tag)?,
        None => defaults.bayer,
    };
    let captured_at = match sidecar.captured_at.as_deref() {
        Some(text) => Some(parse_timestamp(text)?),
        None => None,
    };
    let meta = CaptureMeta {
        camera: sidecar
            .camera
            .unwrap_or_else(|| defaults.camera.clone()),
        exposure_ms: sidecar.exposure_ms,
        gain: sidecar.gain,
        temperature_c: sidecar.temperature_c,
        captured_at,
    };

    let decoded = ImageReader::open(&identity.path)?
        .with_guessed_format()?
        .decode()
        .map_err(|e| {
            FrameError::Malformed(format!("decode {}: {}", identity.path.display(), e))
        })?;

    let width = decoded.width();
    let height = decoded.height();
    let mono_layout = match bayer {
        Some(pattern) => SampleLayout::Bayer(pattern),
        None => SampleLayout::Mono,
    };
    let (data, depth, layout) = match decoded {
        DynamicImage::ImageLuma8(buf) => (buf.into_raw(), BitDepth::Eight, mono_layout),
        DynamicImage::ImageLuma16(buf) => (le_bytes(buf.as_raw()), BitDepth::Sixteen, mono_layout),
        DynamicImage::ImageRgb8(buf) => (buf.into_raw(), BitDepth::Eight, SampleLayout::Rgb),
        DynamicImage::ImageRgb16(buf) => (le_bytes(buf.as_raw()), BitDepth::Sixteen, SampleLayout::Rgb),
        other => {
            return Err(FrameError::Unsupported(format!(
                "{}: color type {:?} is not a raw camera format",
                identity.path.display(),
                other.color()
            )))
        }
    };

    Ok(RawFrame::new(
        identity.clone(),
        data,
        width,
        height,
        depth,
        layout,
        meta,
    ))
}

fn read_sidecar(path: &Path) -> Result<Sidecar, FrameError> {
    match std::fs::read_to_string(path) {
        Ok(text) => serde_json::from_str(&text).map_err(|e| {
            FrameError::Malformed(format!("invalid sidecar {}: {}", path.display(), e))
        }),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(Sidecar::default()),
        Err(err) => Err(err.into()),
    }
}

fn parse_timestamp(text: &str) -> Result<SystemTime, FrameError> {
    let parsed = DateTime::parse_from_rfc3339(text.trim())
        .map_err(|e| FrameError::Malformed(format!("invalid captured_at '{}': {}", text, e)))?;
    Ok(SystemTime::from(parsed.with_timezone(&Utc)))
}

fn le_bytes(samples: &[u16]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for sample in samples {
        out.extend_from_slice(&sample.to_le_bytes());
    }
    out
}
