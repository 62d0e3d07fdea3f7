//! Frame types shared by every stage of the pipeline.
//!
//! - `RawFrame`: camera output as deposited on disk. Read-only to the core.
//! - `ProcessedImage`: engine output, not yet stamped with a generation.
//! - `ProcessedFrame`: immutable, generation-stamped output handed to sinks.
//! - `Latest<T>`: single "most recent" slot, replaced wholesale and never mutated.
//!
//! Sinks only ever hold `Arc<ProcessedFrame>`; nothing downstream of the
//! dispatcher can mutate pixels.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::SystemTime;

use image::RgbImage;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

// ----------------------------------------------------------------------------
// Identity
// ----------------------------------------------------------------------------

/// Stable identity of a raw file: path + size + modification time.
///
/// Two notifications with equal identities describe the same file content.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FrameIdentity {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

impl FrameIdentity {
    pub fn new(path: impl Into<PathBuf>, size: u64, modified: SystemTime) -> Self {
        Self {
            path: path.into(),
            size,
            modified,
        }
    }

    /// Builds an identity from the file's current metadata.
    pub fn from_path(path: &Path) -> std::io::Result<Self> {
        let meta = std::fs::metadata(path)?;
        Ok(Self::new(path, meta.len(), meta.modified()?))
    }

    /// File name without extension, used by filename and overlay tokens.
    pub fn file_stem(&self) -> String {
        self.path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }

    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

// ----------------------------------------------------------------------------
// Sample layout
// ----------------------------------------------------------------------------

/// Color filter mosaic, named by the 2x2 tile read row-major from the top-left.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum BayerPattern {
    Rggb,
    Bggr,
    Grbg,
    Gbrg,
}

/// Channel index for red.
pub const RED: usize = 0;
/// Channel index for green.
pub const GREEN: usize = 1;
/// Channel index for blue.
pub const BLUE: usize = 2;

impl BayerPattern {
    /// Parses a pattern tag. `none`/`mono`/empty mean "no mosaic".
    pub fn parse(tag: &str) -> Result<Option<Self>, FrameError> {
        match tag.trim().to_ascii_uppercase().as_str() {
            "" | "NONE" | "MONO" => Ok(None),
            "RGGB" => Ok(Some(Self::Rggb)),
            "BGGR" => Ok(Some(Self::Bggr)),
            "GRBG" => Ok(Some(Self::Grbg)),
            "GBRG" => Ok(Some(Self::Gbrg)),
            other => Err(FrameError::Unsupported(format!(
                "unknown bayer pattern '{}'",
                other
            ))),
        }
    }

    /// Which color channel the sensor sampled at `(x, y)`.
    pub fn channel_at(self, x: usize, y: usize) -> usize {
        let tile = match self {
            Self::Rggb => [RED, GREEN, GREEN, BLUE],
            Self::Bggr => [BLUE, GREEN, GREEN, RED],
            Self::Grbg => [GREEN, RED, BLUE, GREEN],
            Self::Gbrg => [GREEN, BLUE, RED, GREEN],
        };
        tile[(y % 2) * 2 + (x % 2)]
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rggb => "RGGB",
            Self::Bggr => "BGGR",
            Self::Grbg => "GRBG",
            Self::Gbrg => "GBRG",
        }
    }
}

/// How samples in a raw buffer map to pixels.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SampleLayout {
    /// One sample per pixel, no color filter.
    Mono,
    /// One sample per pixel behind a color filter mosaic.
    Bayer(BayerPattern),
    /// Three interleaved samples per pixel (already full color).
    Rgb,
}

impl SampleLayout {
    pub fn channels(self) -> usize {
        match self {
            Self::Mono | Self::Bayer(_) => 1,
            Self::Rgb => 3,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BitDepth {
    Eight,
    /// Little-endian 16-bit samples.
    Sixteen,
}

impl BitDepth {
    pub fn bytes_per_sample(self) -> usize {
        match self {
            Self::Eight => 1,
            Self::Sixteen => 2,
        }
    }

    pub fn max_value(self) -> f32 {
        match self {
            Self::Eight => u8::MAX as f32,
            Self::Sixteen => u16::MAX as f32,
        }
    }

    pub fn bits(self) -> u8 {
        match self {
            Self::Eight => 8,
            Self::Sixteen => 16,
        }
    }
}

// ----------------------------------------------------------------------------
// Errors
// ----------------------------------------------------------------------------

/// Per-frame failure. Always recoverable: the frame is dropped and the
/// pipeline moves on to the next one.
#[derive(Debug)]
pub enum FrameError {
    /// Buffer does not match its declared geometry, or cannot be decoded.
    Malformed(String),
    /// Valid input the engine does not handle (color type, pattern tag).
    Unsupported(String),
    Io(std::io::Error),
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Malformed(msg) => write!(f, "malformed frame: {}", msg),
            Self::Unsupported(msg) => write!(f, "unsupported frame: {}", msg),
            Self::Io(err) => write!(f, "frame i/o error: {}", err),
        }
    }
}

impl std::error::Error for FrameError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for FrameError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

// ----------------------------------------------------------------------------
// RawFrame
// ----------------------------------------------------------------------------

/// Capture metadata supplied by the camera collaborator.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CaptureMeta {
    pub camera: String,
    pub exposure_ms: Option<f64>,
    pub gain: Option<f64>,
    pub temperature_c: Option<f64>,
    /// Falls back to the file modification time when absent.
    pub captured_at: Option<SystemTime>,
}

/// A raw frame as produced by the camera. The core never mutates it.
#[derive(Clone, Debug)]
pub struct RawFrame {
    pub identity: FrameIdentity,
    data: Arc<[u8]>,
    pub width: u32,
    pub height: u32,
    pub depth: BitDepth,
    pub layout: SampleLayout,
    pub meta: CaptureMeta,
}

impl RawFrame {
    pub fn new(
        identity: FrameIdentity,
        data: impl Into<Arc<[u8]>>,
        width: u32,
        height: u32,
        depth: BitDepth,
        layout: SampleLayout,
        meta: CaptureMeta,
    ) -> Self {
        Self {
            identity,
            data: data.into(),
            width,
            height,
            depth,
            layout,
            meta,
        }
    }

    /// Builds a 16-bit frame from native samples (stored little-endian).
    pub fn from_u16_samples(
        identity: FrameIdentity,
        samples: &[u16],
        width: u32,
        height: u32,
        layout: SampleLayout,
        meta: CaptureMeta,
    ) -> Self {
        let mut data = Vec::with_capacity(samples.len() * 2);
        for sample in samples {
            data.extend_from_slice(&sample.to_le_bytes());
        }
        Self::new(
            identity,
            data,
            width,
            height,
            BitDepth::Sixteen,
            layout,
            meta,
        )
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    /// Byte length implied by width x height x channels x depth.
    pub fn expected_len(&self) -> Option<usize> {
        (self.width as usize)
            .checked_mul(self.height as usize)?
            .checked_mul(self.layout.channels())?
            .checked_mul(self.depth.bytes_per_sample())
    }

    /// Checks the buffer against its declared geometry.
    pub fn validate(&self) -> Result<(), FrameError> {
        if self.width == 0 || self.height == 0 {
            return Err(FrameError::Malformed(format!(
                "empty geometry {}x{}",
                self.width, self.height
            )));
        }
        let expected = self.expected_len().ok_or_else(|| {
            FrameError::Malformed(format!(
                "frame dimensions overflow: {}x{}",
                self.width, self.height
            ))
        })?;
        if self.data.len() != expected {
            return Err(FrameError::Malformed(format!(
                "buffer length mismatch: expected {} bytes for {}x{}x{} at {} bits, got {}",
                expected,
                self.width,
                self.height,
                self.layout.channels(),
                self.depth.bits(),
                self.data.len()
            )));
        }
        Ok(())
    }

    /// Sample `index` scaled to `0.0..=1.0`. Caller must have validated.
    pub(crate) fn sample(&self, index: usize) -> f32 {
        match self.depth {
            BitDepth::Eight => self.data[index] as f32 / u8::MAX as f32,
            BitDepth::Sixteen => {
                let offset = index * 2;
                let value = u16::from_le_bytes([self.data[offset], self.data[offset + 1]]);
                value as f32 / u16::MAX as f32
            }
        }
    }

    pub fn captured_at(&self) -> SystemTime {
        self.meta.captured_at.unwrap_or(self.identity.modified)
    }
}

// ----------------------------------------------------------------------------
// Processed output
// ----------------------------------------------------------------------------

/// An overlay the engine could not draw on a particular frame.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SkippedOverlay {
    pub name: String,
    pub reason: String,
}

/// Engine output before the dispatcher assigns a generation.
#[derive(Clone, Debug)]
pub struct ProcessedImage {
    pub pixels: RgbImage,
    pub source: FrameIdentity,
    pub captured_at: SystemTime,
    pub camera: String,
    pub skipped_overlays: Vec<SkippedOverlay>,
}

/// Fully composited output frame. Immutable once built.
#[derive(Debug)]
pub struct ProcessedFrame {
    pixels: RgbImage,
    pub generation: u64,
    pub produced_at: SystemTime,
    pub captured_at: SystemTime,
    pub camera: String,
    pub source: FrameIdentity,
}

impl ProcessedFrame {
    pub fn new(image: ProcessedImage, generation: u64, produced_at: SystemTime) -> Self {
        Self {
            pixels: image.pixels,
            generation,
            produced_at,
            captured_at: image.captured_at,
            camera: image.camera,
            source: image.source,
        }
    }

    /// Builds a frame directly from RGB pixels; used by collaborators that
    /// bypass the engine (and by tests).
    pub fn from_rgb(pixels: RgbImage, generation: u64, source: FrameIdentity) -> Self {
        let captured_at = source.modified;
        Self {
            pixels,
            generation,
            produced_at: SystemTime::now(),
            captured_at,
            camera: String::new(),
            source,
        }
    }

    pub fn pixels(&self) -> &RgbImage {
        &self.pixels
    }

    /// Tightly packed RGB24 bytes, row-major.
    pub fn rgb_bytes(&self) -> &[u8] {
        self.pixels.as_raw()
    }

    pub fn width(&self) -> u32 {
        self.pixels.width()
    }

    pub fn height(&self) -> u32 {
        self.pixels.height()
    }

    pub fn geometry(&self) -> (u32, u32) {
        self.pixels.dimensions()
    }

    /// SHA-256 of the RGB payload, hex encoded.
    pub fn checksum_hex(&self) -> String {
        hex::encode(Sha256::digest(self.pixels.as_raw()))
    }
}

// ----------------------------------------------------------------------------
// Latest slot
// ----------------------------------------------------------------------------

/// Anything ordered by generation.
pub trait Generational {
    fn generation(&self) -> u64;
}

impl Generational for ProcessedFrame {
    fn generation(&self) -> u64 {
        self.generation
    }
}

/// Shared "most recent value" slot.
///
/// Writers swap in a new `Arc` only when its generation is higher than the
/// current one; readers clone the `Arc` and never observe a partial update.
/// The lock is held only for the pointer swap or clone.
pub struct Latest<T> {
    slot: Arc<RwLock<Option<Arc<T>>>>,
}

impl<T> Clone for Latest<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> Default for Latest<T> {
    fn default() -> Self {
        Self {
            slot: Arc::new(RwLock::new(None)),
        }
    }
}

impl<T: Generational> Latest<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Publishes `value` if it is newer than what the slot holds.
    /// Returns `false` (and leaves the slot alone) for stale generations.
    pub fn publish(&self, value: Arc<T>) -> bool {
        let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(current) = slot.as_ref() {
            if current.generation() >= value.generation() {
                return false;
            }
        }
        *slot = Some(value);
        true
    }

    pub fn load(&self) -> Option<Arc<T>> {
        self.slot
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn generation(&self) -> Option<u64> {
        self.load().map(|value| value.generation())
    }
}

pub type LatestFrame = Latest<ProcessedFrame>;

// ----------------------------------------------------------------------------
// Tests
// ----------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> FrameIdentity {
        FrameIdentity::new("/tmp/raw/frame_0001.png", 16, SystemTime::UNIX_EPOCH)
    }

    fn frame(generation: u64) -> Arc<ProcessedFrame> {
        Arc::new(ProcessedFrame::from_rgb(
            RgbImage::new(2, 2),
            generation,
            identity(),
        ))
    }

    #[test]
    fn bayer_tiles_follow_pattern_name() {
        let p = BayerPattern::Rggb;
        assert_eq!(p.channel_at(0, 0), RED);
        assert_eq!(p.channel_at(1, 0), GREEN);
        assert_eq!(p.channel_at(0, 1), GREEN);
        assert_eq!(p.channel_at(1, 1), BLUE);
        assert_eq!(p.channel_at(2, 2), RED);

        let p = BayerPattern::Gbrg;
        assert_eq!(p.channel_at(1, 0), BLUE);
        assert_eq!(p.channel_at(0, 1), RED);
    }

    #[test]
    fn bayer_parse_accepts_none_and_rejects_garbage() {
        assert_eq!(BayerPattern::parse("none").unwrap(), None);
        assert_eq!(
            BayerPattern::parse("grbg").unwrap(),
            Some(BayerPattern::Grbg)
        );
        assert!(BayerPattern::parse("RGBW").is_err());
    }

    #[test]
    fn validate_rejects_size_mismatch() {
        let raw = RawFrame::new(
            identity(),
            vec![0u8; 7],
            2,
            2,
            BitDepth::Sixteen,
            SampleLayout::Mono,
            CaptureMeta::default(),
        );
        let err = raw.validate().unwrap_err();
        assert!(matches!(err, FrameError::Malformed(_)));
        assert!(err.to_string().contains("expected 8 bytes"));
    }

    #[test]
    fn sixteen_bit_samples_are_little_endian() {
        let raw = RawFrame::from_u16_samples(
            identity(),
            &[0, 65535, 32768, 1],
            2,
            2,
            SampleLayout::Mono,
            CaptureMeta::default(),
        );
        raw.validate().unwrap();
        assert_eq!(raw.sample(0), 0.0);
        assert_eq!(raw.sample(1), 1.0);
        assert_eq!(raw.bytes()[4..6], [0x00, 0x80]);
    }

    #[test]
    fn latest_never_rolls_back() {
        let latest = LatestFrame::new();
        assert!(latest.publish(frame(5)));
        assert!(!latest.publish(frame(4)));
        assert!(!latest.publish(frame(5)));
        assert_eq!(latest.generation(), Some(5));
        assert!(latest.publish(frame(6)));
        assert_eq!(latest.generation(), Some(6));
    }

    #[test]
    fn readers_keep_their_snapshot_after_swap() {
        let latest = LatestFrame::new();
        latest.publish(frame(1));
        let held = latest.load().unwrap();
        latest.publish(frame(2));
        assert_eq!(held.generation, 1);
        assert_eq!(latest.load().unwrap().generation, 2);
    }
}
