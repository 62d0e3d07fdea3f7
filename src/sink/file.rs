//! File sink: archives processed frames under a templated filename.
//!
//! Writes go to `.<name>.partial` in the destination directory, are synced,
//! and then renamed into place, so a reader never sees a truncated image.

use chrono::{DateTime, Local};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::PngEncoder;
use image::{ExtendedColorType, ImageEncoder};
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::frame::ProcessedFrame;
use crate::sink::{
    DeliveryOutcome, GenerationGate, Sink, SinkError, SinkKind, SinkState, SinkStats, SinkStatus,
    StateCell,
};

pub const PARTIAL_SUFFIX: &str = ".partial";
const DEFAULT_PATTERN: &str = "{session}/{timestamp}_{generation}";
const DEFAULT_JPEG_QUALITY: u8 = 90;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum OutputFormat {
    #[default]
    Png,
    #[serde(alias = "jpeg")]
    Jpg {
        #[serde(default = "default_quality")]
        quality: u8,
    },
}

fn default_quality() -> u8 {
    DEFAULT_JPEG_QUALITY
}

impl OutputFormat {
    pub fn extension(self) -> &'static str {
        match self {
            Self::Png => "png",
            Self::Jpg { .. } => "jpg",
        }
    }

    fn from_extension(ext: &str, configured: OutputFormat) -> Option<Self> {
        match ext.to_ascii_lowercase().as_str() {
            "png" => Some(Self::Png),
            "jpg" | "jpeg" => Some(match configured {
                Self::Jpg { quality } => Self::Jpg { quality },
                Self::Png => Self::Jpg {
                    quality: DEFAULT_JPEG_QUALITY,
                },
            }),
            _ => None,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FileSinkConfig {
    pub output_dir: PathBuf,
    /// Tokens: `{generation} {timestamp} {date} {time} {camera} {filename}
    /// {session}`. May contain `/` for sub-directories.
    #[serde(default = "default_pattern")]
    pub pattern: String,
    #[serde(default)]
    pub format: OutputFormat,
}

fn default_pattern() -> String {
    DEFAULT_PATTERN.to_string()
}

impl FileSinkConfig {
    pub fn new(output_dir: impl Into<PathBuf>, pattern: impl Into<String>) -> Self {
        Self {
            output_dir: output_dir.into(),
            pattern: pattern.into(),
            format: OutputFormat::Png,
        }
    }

    pub fn validate(&self) -> Result<(), SinkError> {
        if self.output_dir.as_os_str().is_empty() {
            return Err(SinkError::Config("file sink output_dir is empty".to_string()));
        }
        let pattern = self.pattern.trim();
        if pattern.is_empty() {
            return Err(SinkError::Config("file sink pattern is empty".to_string()));
        }
        let path = Path::new(pattern);
        for component in path.components() {
            match component {
                Component::Normal(_) | Component::CurDir => {}
                Component::ParentDir => {
                    return Err(SinkError::Config(format!(
                        "file sink pattern '{}' must not contain '..'",
                        pattern
                    )))
                }
                Component::RootDir | Component::Prefix(_) => {
                    return Err(SinkError::Config(format!(
                        "file sink pattern '{}' must be relative",
                        pattern
                    )))
                }
            }
        }
        if let OutputFormat::Jpg { quality } = self.format {
            if !(1..=100).contains(&quality) {
                return Err(SinkError::Config(format!(
                    "jpeg quality {} outside 1..=100",
                    quality
                )));
            }
        }
        Ok(())
    }

    /// Destination path and format for `frame`.
    pub fn target_for(&self, frame: &ProcessedFrame) -> (PathBuf, OutputFormat) {
        let name = expand_pattern(&self.pattern, frame);
        let relative = PathBuf::from(&name);
        let explicit = relative
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| OutputFormat::from_extension(ext, self.format));
        match explicit {
            Some(format) => (self.output_dir.join(relative), format),
            None => (
                self.output_dir
                    .join(format!("{}.{}", name, self.format.extension())),
                self.format,
            ),
        }
    }
}

/// Expands filename tokens. Capture time drives the date-based tokens.
pub fn expand_pattern(pattern: &str, frame: &ProcessedFrame) -> String {
    let captured: DateTime<Local> = DateTime::from(frame.captured_at);
    pattern
        .replace("{generation}", &frame.generation.to_string())
        .replace("{timestamp}", &captured.format("%Y%m%dT%H%M%S").to_string())
        .replace("{date}", &captured.format("%Y-%m-%d").to_string())
        .replace("{time}", &captured.format("%H%M%S").to_string())
        .replace("{session}", &captured.format("%Y%m%d").to_string())
        .replace("{camera}", &sanitize(&frame.camera))
        .replace("{filename}", &sanitize(&frame.source.file_stem()))
}

fn sanitize(value: &str) -> String {
    let cleaned: String = value
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() || cleaned.chars().all(|c| c == '.') {
        "unnamed".to_string()
    } else {
        cleaned
    }
}

/// Temp path used while `target` is being written.
pub fn partial_path(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!(".{}{}", name, PARTIAL_SUFFIX))
}

pub fn is_partial(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| n.starts_with('.') && n.ends_with(PARTIAL_SUFFIX))
}

pub fn encode_image(frame: &ProcessedFrame, format: OutputFormat) -> Result<Vec<u8>, SinkError> {
    let mut out = Vec::new();
    let (width, height) = frame.geometry();
    let result = match format {
        OutputFormat::Png => PngEncoder::new(&mut out).write_image(
            frame.rgb_bytes(),
            width,
            height,
            ExtendedColorType::Rgb8,
        ),
        OutputFormat::Jpg { quality } => JpegEncoder::new_with_quality(&mut out, quality)
            .write_image(frame.rgb_bytes(), width, height, ExtendedColorType::Rgb8),
    };
    result.map_err(|e| SinkError::Encoder(format!("{} encode: {}", format.extension(), e)))?;
    Ok(out)
}

/// Writes `data` to a hidden `.partial` sibling, syncs it, then renames it
/// over `path`.
pub fn write_atomic(path: &Path, data: &[u8]) -> std::io::Result<()> {
    let tmp_path = partial_path(path);
    let written = (|| {
        let mut file = File::create(&tmp_path)?;
        file.write_all(data)?;
        file.sync_all()?;
        fs::rename(&tmp_path, path)
    })();
    if written.is_err() {
        let _ = fs::remove_file(&tmp_path);
    }
    written
}

pub struct FileSink {
    config: FileSinkConfig,
    state: StateCell,
    gate: GenerationGate,
    stats: SinkStats,
    last_path: std::sync::Mutex<Option<PathBuf>>,
}

impl FileSink {
    pub fn new(config: FileSinkConfig) -> Self {
        Self {
            config,
            state: StateCell::new(),
            gate: GenerationGate::default(),
            stats: SinkStats::default(),
            last_path: std::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &FileSinkConfig {
        &self.config
    }

    fn write_frame(&self, frame: &ProcessedFrame) -> Result<PathBuf, SinkError> {
        let (target, format) = self.config.target_for(frame);
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = encode_image(frame, format)?;
        write_atomic(&target, &bytes)?;
        Ok(target)
    }
}

impl Sink for FileSink {
    fn kind(&self) -> SinkKind {
        SinkKind::File
    }

    fn start(&self) -> Result<(), SinkError> {
        self.config.validate()?;
        if let Err(state) = self
            .state
            .transition(SinkKind::File, SinkState::Stopped, SinkState::Starting)
        {
            return Err(SinkError::State(format!("file sink is {:?}", state)));
        }
        if let Err(err) = fs::create_dir_all(&self.config.output_dir) {
            self.state.set(SinkKind::File, SinkState::Stopped);
            self.stats.set_error(err.to_string());
            return Err(SinkError::Io(err));
        }
        self.stats.clear_error();
        self.state.set(SinkKind::File, SinkState::Ready);
        log::info!(
            "file sink: writing to {} with pattern '{}'",
            self.config.output_dir.display(),
            self.config.pattern
        );
        Ok(())
    }

    fn stop(&self) {
        self.state.set(SinkKind::File, SinkState::Stopped);
    }

    fn deliver(&self, frame: &Arc<ProcessedFrame>) -> DeliveryOutcome {
        let outcome = if self.state.get() != SinkState::Ready {
            DeliveryOutcome::Skipped("file sink not started".to_string())
        } else if !self.gate.admit(frame.generation) {
            DeliveryOutcome::Skipped(format!("generation {} is stale", frame.generation))
        } else {
            match self.write_frame(frame) {
                Ok(path) => {
                    log::debug!(
                        "file sink: generation {} -> {}",
                        frame.generation,
                        path.display()
                    );
                    *self
                        .last_path
                        .lock()
                        .unwrap_or_else(std::sync::PoisonError::into_inner) = Some(path);
                    DeliveryOutcome::Delivered
                }
                Err(err) => DeliveryOutcome::Failed(err.to_string()),
            }
        };
        self.stats.record(SinkKind::File, frame.generation, &outcome);
        outcome
    }

    fn status(&self) -> SinkStatus {
        let last_path = self
            .last_path
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .as_ref()
            .map(|p| p.display().to_string());
        self.stats.snapshot(
            SinkKind::File,
            self.state.get(),
            serde_json::json!({
                "output_dir": self.config.output_dir.display().to_string(),
                "pattern": self.config.pattern,
                "last_path": last_path,
            }),
        )
    }

    /// The archive file exists by the time `dispatch` returns.
    fn confirms_delivery(&self) -> bool {
        true
    }
}
