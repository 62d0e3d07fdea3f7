use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;

use tempfile::NamedTempFile;

use skyframe::config::SkyframeConfig;
use skyframe::{RetentionStrategy, SinkKind};

static ENV_LOCK: Mutex<()> = Mutex::new(());

fn clear_env() {
    for key in [
        "SKYFRAME_CONFIG",
        "SKYFRAME_WATCH_DIR",
        "SKYFRAME_OUTPUT_DIR",
        "SKYFRAME_WEB_ADDR",
        "SKYFRAME_RTSP_ENCODER",
        "SKYFRAME_RETENTION_MAX_BYTES",
        "SKYFRAME_CAMERA",
    ] {
        std::env::remove_var(key);
    }
}

#[test]
fn loads_config_from_file_and_env_overrides() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    let mut file = NamedTempFile::new().expect("temp config");
    let json = r#"{
        "watch": {
            "dir": "/data/raw",
            "quiet_interval_ms": 750,
            "camera_name": "ZWO ASI224",
            "bayer_pattern": "RGGB"
        },
        "process": {
            "stretch": {"mode": {"type": "asinh", "strength": 12.0}},
            "balance": {"type": "gray_world"},
            "resize_percent": 50,
            "overlays": [
                {"type": "text", "text": "{CAMERA} {DATETIME}", "anchor": "bottom-left"}
            ]
        },
        "sinks": {
            "file": {"output_dir": "/data/out", "pattern": "{session}/{generation}"},
            "web": {"addr": "0.0.0.0:9000"},
            "rtsp": {"port": 8555, "stream_name": "sky", "fps": 2}
        },
        "retention": {"max_bytes": 1000000, "max_age_hours": 48},
        "dispatch": {"delivery_timeout_ms": 400}
    }"#;
    std::io::Write::write_all(&mut file, json.as_bytes()).expect("write config");

    std::env::set_var("SKYFRAME_CONFIG", file.path());
    std::env::set_var("SKYFRAME_WEB_ADDR", "127.0.0.1:8088");
    std::env::set_var("SKYFRAME_RTSP_ENCODER", "/usr/local/bin/ffmpeg");
    std::env::set_var("SKYFRAME_RETENTION_MAX_BYTES", "5000");
    std::env::set_var("SKYFRAME_CAMERA", "roof-cam");

    let cfg = SkyframeConfig::load().expect("load config");

    assert_eq!(cfg.watch.dir, PathBuf::from("/data/raw"));
    assert_eq!(cfg.watch.quiet_interval, Duration::from_millis(750));
    assert_eq!(cfg.raw_defaults.camera, "roof-cam");
    assert_eq!(cfg.process.resize_percent, Some(50));
    assert_eq!(cfg.overlays.len(), 1);
    assert_eq!(cfg.web.as_ref().unwrap().addr, "127.0.0.1:8088");
    let rtsp = cfg.rtsp.as_ref().unwrap();
    assert_eq!(rtsp.encoder, "/usr/local/bin/ffmpeg");
    assert_eq!(rtsp.url(), "rtsp://127.0.0.1:8555/sky");
    assert_eq!(cfg.dispatch.delivery_timeout_ms, 400);

    let kinds: Vec<_> = cfg.sinks().iter().map(|s| s.kind()).collect();
    assert_eq!(kinds, vec![SinkKind::File, SinkKind::Web, SinkKind::Rtsp]);

    let policy = cfg.retention_policy().unwrap();
    assert_eq!(policy.max_bytes, 5000);
    assert_eq!(policy.max_age, Some(Duration::from_secs(48 * 3600)));
    assert_eq!(policy.strategy, RetentionStrategy::OldestFiles);
    assert_eq!(policy.targets.len(), 2);

    clear_env();
}

#[test]
fn env_alone_is_enough_for_a_minimal_setup() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SKYFRAME_WATCH_DIR", "/srv/raw");
    std::env::set_var("SKYFRAME_OUTPUT_DIR", "/srv/out");
    let cfg = SkyframeConfig::load().expect("load config");
    assert_eq!(cfg.watch.dir, PathBuf::from("/srv/raw"));
    assert!(cfg.sink_enabled(SinkKind::File));
    assert!(!cfg.sink_enabled(SinkKind::Web));
    assert!(cfg.retention_policy().is_none());

    clear_env();
}

#[test]
fn rejects_missing_watch_dir_and_bad_numbers() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    assert!(SkyframeConfig::load().is_err());

    std::env::set_var("SKYFRAME_WATCH_DIR", "/srv/raw");
    std::env::set_var("SKYFRAME_RETENTION_MAX_BYTES", "lots");
    assert!(SkyframeConfig::load().is_err());

    std::env::set_var("SKYFRAME_RETENTION_MAX_BYTES", "0");
    assert!(SkyframeConfig::load().is_err());

    clear_env();
}

#[test]
fn unreadable_config_file_is_an_error() {
    let _guard = ENV_LOCK.lock().unwrap();
    clear_env();

    std::env::set_var("SKYFRAME_CONFIG", "/nonexistent/skyframe.json");
    let err = SkyframeConfig::load().unwrap_err();
    assert!(err.to_string().contains("failed to read config"));

    clear_env();
}
