use anyhow::{anyhow, Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::dispatch::DispatchConfig;
use crate::frame::BayerPattern;
use crate::ingest::raw::RawDefaults;
use crate::ingest::watcher::WatchConfig;
use crate::process::{BalanceMode, OverlayConfig, ProcessSettings, StretchSettings};
use crate::retention::{RetentionPolicy, RetentionStrategy, RetentionTarget};
use crate::sink::{FileSinkConfig, OutputFormat, RtspSinkConfig, SinkConfig, SinkKind, WebSinkConfig};

const DEFAULT_QUIET_INTERVAL_MS: u64 = 500;
const DEFAULT_CAMERA_NAME: &str = "allsky";
const DEFAULT_OUTPUT_PATTERN: &str = "{session}/{timestamp}_{generation}";
const DEFAULT_RETENTION_MAX_BYTES: u64 = 50 * 1024 * 1024 * 1024;
const DEFAULT_RETENTION_MIN_FILES: usize = 10;
const DEFAULT_RETENTION_INTERVAL_SECS: u64 = 300;

#[derive(Debug, Deserialize, Default)]
struct SkyframeConfigFile {
    watch: Option<WatchConfigFile>,
    process: Option<ProcessConfigFile>,
    sinks: Option<SinksConfigFile>,
    retention: Option<RetentionConfigFile>,
    dispatch: Option<DispatchConfig>,
}

#[derive(Debug, Deserialize, Default)]
struct WatchConfigFile {
    dir: Option<PathBuf>,
    extensions: Option<Vec<String>>,
    recursive: Option<bool>,
    quiet_interval_ms: Option<u64>,
    process_existing: Option<bool>,
    camera_name: Option<String>,
    bayer_pattern: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
struct ProcessConfigFile {
    stretch: Option<StretchSettings>,
    balance: Option<BalanceMode>,
    resize_percent: Option<u32>,
    overlays: Option<Vec<OverlayConfig>>,
}

#[derive(Debug, Deserialize, Default)]
struct SinksConfigFile {
    file: Option<FileSinkConfigFile>,
    web: Option<WebSinkConfigFile>,
    rtsp: Option<RtspSinkConfigFile>,
}

#[derive(Debug, Deserialize, Default)]
struct FileSinkConfigFile {
    enabled: Option<bool>,
    output_dir: Option<PathBuf>,
    pattern: Option<String>,
    format: Option<OutputFormat>,
}

#[derive(Debug, Deserialize, Default)]
struct WebSinkConfigFile {
    enabled: Option<bool>,
    addr: Option<String>,
    image_path: Option<String>,
    shutdown_timeout_ms: Option<u64>,
    refresh_secs: Option<u32>,
    max_connections: Option<usize>,
}

#[derive(Debug, Deserialize, Default)]
struct RtspSinkConfigFile {
    enabled: Option<bool>,
    host: Option<String>,
    port: Option<u16>,
    stream_name: Option<String>,
    fps: Option<f64>,
    encoder: Option<String>,
    encoder_args: Option<Vec<String>>,
    grace_period_ms: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct RetentionConfigFile {
    enabled: Option<bool>,
    raw_dir: Option<PathBuf>,
    processed_dir: Option<PathBuf>,
    max_bytes: Option<u64>,
    min_raw_files: Option<usize>,
    min_processed_files: Option<usize>,
    max_age_hours: Option<u64>,
    strategy: Option<RetentionStrategy>,
    interval_secs: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct SkyframeConfig {
    pub watch: WatchConfig,
    pub raw_defaults: RawDefaults,
    pub process: ProcessSettings,
    pub overlays: Vec<OverlayConfig>,
    pub file: Option<FileSinkConfig>,
    pub web: Option<WebSinkConfig>,
    pub rtsp: Option<RtspSinkConfig>,
    pub retention: Option<RetentionSettings>,
    pub dispatch: DispatchConfig,
}

/// Retention section before storage locations are resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct RetentionSettings {
    /// Defaults to the watch directory.
    pub raw_dir: Option<PathBuf>,
    /// Defaults to the file sink's output directory.
    pub processed_dir: Option<PathBuf>,
    pub max_bytes: u64,
    pub min_raw_files: usize,
    pub min_processed_files: usize,
    pub max_age: Option<Duration>,
    pub strategy: RetentionStrategy,
    pub interval: Duration,
}

impl Default for RetentionSettings {
    fn default() -> Self {
        Self {
            raw_dir: None,
            processed_dir: None,
            max_bytes: DEFAULT_RETENTION_MAX_BYTES,
            min_raw_files: DEFAULT_RETENTION_MIN_FILES,
            min_processed_files: DEFAULT_RETENTION_MIN_FILES,
            max_age: None,
            strategy: RetentionStrategy::OldestFiles,
            interval: Duration::from_secs(DEFAULT_RETENTION_INTERVAL_SECS),
        }
    }
}

impl SkyframeConfig {
    /// Reads the JSON file named by `SKYFRAME_CONFIG` (if set), applies
    /// `SKYFRAME_*` overrides and validates the result.
    pub fn load() -> Result<Self> {
        let config_path = std::env::var("SKYFRAME_CONFIG").ok().map(PathBuf::from);
        Self::load_from(config_path.as_deref())
    }

    /// Like `load`, with the config file path given explicitly.
    pub fn load_from(path: Option<&Path>) -> Result<Self> {
        let file_cfg = match path {
            Some(path) => Some(read_config_file(path)?),
            None => None,
        };
        let mut cfg = Self::from_file(file_cfg.unwrap_or_default())?;
        cfg.apply_env()?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Parses a JSON document without consulting the environment.
    pub fn from_json(text: &str) -> Result<Self> {
        let file: SkyframeConfigFile =
            serde_json::from_str(text).map_err(|e| anyhow!("invalid config: {}", e))?;
        let cfg = Self::from_file(file)?;
        cfg.validate()?;
        Ok(cfg)
    }

    fn from_file(file: SkyframeConfigFile) -> Result<Self> {
        let watch_file = file.watch.unwrap_or_default();
        let defaults = WatchConfig::default();
        let watch = WatchConfig {
            dir: watch_file.dir.unwrap_or_default(),
            extensions: watch_file
                .extensions
                .map(|exts| {
                    exts.iter()
                        .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                        .collect()
                })
                .unwrap_or(defaults.extensions),
            recursive: watch_file.recursive.unwrap_or(defaults.recursive),
            quiet_interval: Duration::from_millis(
                watch_file
                    .quiet_interval_ms
                    .unwrap_or(DEFAULT_QUIET_INTERVAL_MS),
            ),
            process_existing: watch_file.process_existing.unwrap_or(false),
        };
        let bayer = match watch_file.bayer_pattern.as_deref() {
            Some(tag) => BayerPattern::parse(tag).map_err(|e| anyhow!("watch.bayer_pattern: {}", e))?,
            None => None,
        };
        let raw_defaults = RawDefaults {
            camera: watch_file
                .camera_name
                .unwrap_or_else(|| DEFAULT_CAMERA_NAME.to_string()),
            bayer,
        };

        let process_file = file.process.unwrap_or_default();
        let process = ProcessSettings {
            stretch: process_file.stretch.unwrap_or_default(),
            balance: process_file.balance.unwrap_or_default(),
            resize_percent: process_file.resize_percent,
        };
        let overlays = process_file.overlays.unwrap_or_default();

        let sinks = file.sinks.unwrap_or_default();
        let file_sink = sinks
            .file
            .filter(|f| f.enabled != Some(false))
            .map(|f| FileSinkConfig {
                output_dir: f.output_dir.unwrap_or_default(),
                pattern: f
                    .pattern
                    .unwrap_or_else(|| DEFAULT_OUTPUT_PATTERN.to_string()),
                format: f.format.unwrap_or_default(),
            });
        let web = sinks.web.filter(|w| w.enabled != Some(false)).map(|w| {
            let defaults = WebSinkConfig::default();
            WebSinkConfig {
                addr: w.addr.unwrap_or(defaults.addr),
                image_path: w.image_path.unwrap_or(defaults.image_path),
                shutdown_timeout_ms: w
                    .shutdown_timeout_ms
                    .unwrap_or(defaults.shutdown_timeout_ms),
                refresh_secs: w.refresh_secs.unwrap_or(defaults.refresh_secs),
                max_connections: w.max_connections.unwrap_or(defaults.max_connections),
            }
        });
        let rtsp = sinks.rtsp.filter(|r| r.enabled != Some(false)).map(|r| {
            let defaults = RtspSinkConfig::default();
            RtspSinkConfig {
                host: r.host.unwrap_or(defaults.host),
                port: r.port.unwrap_or(defaults.port),
                stream_name: r.stream_name.unwrap_or(defaults.stream_name),
                fps: r.fps.unwrap_or(defaults.fps),
                encoder: r.encoder.unwrap_or(defaults.encoder),
                encoder_args: r.encoder_args,
                grace_period_ms: r.grace_period_ms.unwrap_or(defaults.grace_period_ms),
            }
        });

        let retention = file
            .retention
            .filter(|r| r.enabled != Some(false))
            .map(|r| {
                let defaults = RetentionSettings::default();
                RetentionSettings {
                    raw_dir: r.raw_dir,
                    processed_dir: r.processed_dir,
                    max_bytes: r.max_bytes.unwrap_or(defaults.max_bytes),
                    min_raw_files: r.min_raw_files.unwrap_or(defaults.min_raw_files),
                    min_processed_files: r
                        .min_processed_files
                        .unwrap_or(defaults.min_processed_files),
                    max_age: r.max_age_hours.map(|h| Duration::from_secs(h * 3600)),
                    strategy: r.strategy.unwrap_or_default(),
                    interval: r
                        .interval_secs
                        .map(Duration::from_secs)
                        .unwrap_or(defaults.interval),
                }
            });

        Ok(Self {
            watch,
            raw_defaults,
            process,
            overlays,
            file: file_sink,
            web,
            rtsp,
            retention,
            dispatch: file.dispatch.unwrap_or_default(),
        })
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Ok(dir) = std::env::var("SKYFRAME_WATCH_DIR") {
            if !dir.trim().is_empty() {
                self.watch.dir = PathBuf::from(dir);
            }
        }
        if let Ok(dir) = std::env::var("SKYFRAME_OUTPUT_DIR") {
            if !dir.trim().is_empty() {
                match self.file.as_mut() {
                    Some(file) => file.output_dir = PathBuf::from(dir),
                    None => {
                        self.file = Some(FileSinkConfig::new(dir, DEFAULT_OUTPUT_PATTERN));
                    }
                }
            }
        }
        if let Ok(addr) = std::env::var("SKYFRAME_WEB_ADDR") {
            if !addr.trim().is_empty() {
                match self.web.as_mut() {
                    Some(web) => web.addr = addr,
                    None => self.web = Some(WebSinkConfig::with_addr(addr)),
                }
            }
        }
        if let Ok(encoder) = std::env::var("SKYFRAME_RTSP_ENCODER") {
            if !encoder.trim().is_empty() {
                if let Some(rtsp) = self.rtsp.as_mut() {
                    rtsp.encoder = encoder;
                }
            }
        }
        if let Ok(max_bytes) = std::env::var("SKYFRAME_RETENTION_MAX_BYTES") {
            let max_bytes: u64 = max_bytes.trim().parse().map_err(|_| {
                anyhow!("SKYFRAME_RETENTION_MAX_BYTES must be an integer number of bytes")
            })?;
            self.retention.get_or_insert_with(RetentionSettings::default).max_bytes = max_bytes;
        }
        if let Ok(camera) = std::env::var("SKYFRAME_CAMERA") {
            if !camera.trim().is_empty() {
                self.raw_defaults.camera = camera;
            }
        }
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        if self.watch.dir.as_os_str().is_empty() {
            return Err(anyhow!("watch.dir must be set"));
        }
        if self.watch.quiet_interval.is_zero() {
            return Err(anyhow!("watch.quiet_interval_ms must be greater than zero"));
        }
        if self.watch.extensions.is_empty() {
            return Err(anyhow!("watch.extensions must not be empty"));
        }
        if let Some(percent) = self.process.resize_percent {
            if !(1..=100).contains(&percent) {
                return Err(anyhow!("process.resize_percent {} outside 1..=100", percent));
            }
        }
        if let Some(file) = &self.file {
            file.validate().context("sinks.file")?;
        }
        if let Some(web) = &self.web {
            web.validate().context("sinks.web")?;
        }
        if let Some(rtsp) = &self.rtsp {
            rtsp.validate().context("sinks.rtsp")?;
        }
        if self.dispatch.delivery_timeout_ms == 0 {
            return Err(anyhow!("dispatch.delivery_timeout_ms must be greater than zero"));
        }
        if self.dispatch.stream_queue == 0 {
            return Err(anyhow!("dispatch.stream_queue must be greater than zero"));
        }
        if self.retention.is_some() {
            if let Some(policy) = self.retention_policy() {
                policy.validate()?;
            }
        }
        Ok(())
    }

    /// Enabled sinks, in a stable order.
    pub fn sinks(&self) -> Vec<SinkConfig> {
        let mut sinks = Vec::new();
        if let Some(file) = &self.file {
            sinks.push(SinkConfig::File(file.clone()));
        }
        if let Some(web) = &self.web {
            sinks.push(SinkConfig::Web(web.clone()));
        }
        if let Some(rtsp) = &self.rtsp {
            sinks.push(SinkConfig::Rtsp(rtsp.clone()));
        }
        sinks
    }

    pub fn sink_enabled(&self, kind: SinkKind) -> bool {
        match kind {
            SinkKind::File => self.file.is_some(),
            SinkKind::Web => self.web.is_some(),
            SinkKind::Rtsp => self.rtsp.is_some(),
        }
    }

    /// Retention policy with storage locations resolved, if retention is on.
    ///
    /// Raw storage falls back to the watch directory and processed storage to
    /// the file sink's output directory.
    pub fn retention_policy(&self) -> Option<RetentionPolicy> {
        let settings = self.retention.as_ref()?;
        let mut policy = RetentionPolicy::new(settings.max_bytes);
        policy.max_age = settings.max_age;
        policy.strategy = settings.strategy;
        policy.interval = settings.interval;

        let raw_dir = settings
            .raw_dir
            .clone()
            .unwrap_or_else(|| self.watch.dir.clone());
        if !raw_dir.as_os_str().is_empty() {
            policy = policy
                .with_target(RetentionTarget::raw(raw_dir).with_min_files(settings.min_raw_files));
        }
        let processed_dir = settings
            .processed_dir
            .clone()
            .or_else(|| self.file.as_ref().map(|f| f.output_dir.clone()));
        if let Some(dir) = processed_dir {
            policy = policy.with_target(
                RetentionTarget::processed(dir).with_min_files(settings.min_processed_files),
            );
        }
        Some(policy)
    }
}

fn read_config_file(path: &Path) -> Result<SkyframeConfigFile> {
    let raw = std::fs::read_to_string(path)
        .map_err(|e| anyhow!("failed to read config {}: {}", path.display(), e))?;
    serde_json::from_str(&raw).map_err(|e| anyhow!("invalid config {}: {}", path.display(), e))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::StretchMode;

    #[test]
    fn minimal_config_uses_defaults() -> Result<()> {
        let cfg = SkyframeConfig::from_json(r#"{"watch":{"dir":"/data/raw"}}"#)?;
        assert_eq!(cfg.watch.dir, PathBuf::from("/data/raw"));
        assert_eq!(cfg.watch.quiet_interval, Duration::from_millis(500));
        assert_eq!(cfg.raw_defaults.camera, "allsky");
        assert!(cfg.sinks().is_empty());
        assert!(cfg.retention_policy().is_none());
        assert_eq!(cfg.process.stretch.mode, StretchMode::Linear);
        Ok(())
    }

    #[test]
    fn sections_enable_sinks_unless_disabled() -> Result<()> {
        let cfg = SkyframeConfig::from_json(
            r#"{
                "watch": {"dir": "/raw", "bayer_pattern": "GRBG", "extensions": [".PNG"]},
                "sinks": {
                    "file": {"output_dir": "/out", "format": {"type": "jpg", "quality": 80}},
                    "web": {"addr": "127.0.0.1:8081"},
                    "rtsp": {"enabled": false, "fps": 30}
                }
            }"#,
        )?;
        assert_eq!(cfg.raw_defaults.bayer, Some(BayerPattern::Grbg));
        assert_eq!(cfg.watch.extensions, vec!["png"]);
        let kinds: Vec<_> = cfg.sinks().iter().map(SinkConfig::kind).collect();
        assert_eq!(kinds, vec![SinkKind::File, SinkKind::Web]);
        assert!(!cfg.sink_enabled(SinkKind::Rtsp));
        assert_eq!(
            cfg.file.as_ref().map(|f| f.format),
            Some(OutputFormat::Jpg { quality: 80 })
        );
        Ok(())
    }

    #[test]
    fn retention_resolves_storage_locations() -> Result<()> {
        let cfg = SkyframeConfig::from_json(
            r#"{
                "watch": {"dir": "/raw"},
                "sinks": {"file": {"output_dir": "/out"}},
                "retention": {"max_bytes": 1000, "min_raw_files": 3, "strategy": "oldest_sessions"}
            }"#,
        )?;
        let policy = cfg.retention_policy().expect("retention enabled");
        assert_eq!(policy.max_bytes, 1000);
        assert_eq!(policy.strategy, RetentionStrategy::OldestSessions);
        assert_eq!(policy.targets.len(), 2);
        assert_eq!(policy.targets[0], RetentionTarget::raw("/raw").with_min_files(3));
        assert_eq!(policy.targets[1], RetentionTarget::processed("/out"));
        Ok(())
    }

    #[test]
    fn validation_rejects_bad_values() {
        let cases = [
            r#"{}"#,
            r#"{"watch":{"dir":"/raw","quiet_interval_ms":0}}"#,
            r#"{"watch":{"dir":"/raw"},"process":{"resize_percent":0}}"#,
            r#"{"watch":{"dir":"/raw"},"sinks":{"rtsp":{"fps":0}}}"#,
            r#"{"watch":{"dir":"/raw"},"sinks":{"rtsp":{"fps":120}}}"#,
            r#"{"watch":{"dir":"/raw"},"sinks":{"rtsp":{"port":0}}}"#,
            r#"{"watch":{"dir":"/raw"},"sinks":{"web":{"image_path":"latest.png"}}}"#,
            r#"{"watch":{"dir":"/raw"},"sinks":{"web":{"image_path":"/status"}}}"#,
            r#"{"watch":{"dir":"/raw"},"sinks":{"file":{"output_dir":"/o","format":{"type":"jpg","quality":0}}}}"#,
            r#"{"watch":{"dir":"/raw"},"retention":{"max_bytes":0}}"#,
            r#"{"watch":{"dir":"/raw","bayer_pattern":"XYZW"}}"#,
        ];
        for case in cases {
            assert!(SkyframeConfig::from_json(case).is_err(), "accepted {}", case);
        }
    }
}
