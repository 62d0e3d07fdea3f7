use std::io::{Read, Write};
use std::net::TcpStream;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use image::RgbImage;

use skyframe::process::{BalanceMode, StretchSettings};
use skyframe::sink::{FileSink, RtspSink};
use skyframe::{
    BayerPattern, CaptureMeta, DispatchConfig, FileSinkConfig, FrameIdentity, OutputDispatcher,
    OverlaySpec, ProcessSettings, ProcessedImage, ProcessingEngine, RawFrame, RtspSinkConfig,
    SampleLayout, Sink, SinkConfig, SinkError, SinkKind, SinkState, WebSinkConfig,
};

fn image(width: u32, height: u32) -> ProcessedImage {
    ProcessedImage {
        pixels: RgbImage::from_pixel(width, height, image::Rgb([10, 20, 30])),
        source: FrameIdentity::new("/raw/frame.png", 16, SystemTime::UNIX_EPOCH),
        captured_at: SystemTime::UNIX_EPOCH,
        camera: "allsky".to_string(),
        skipped_overlays: Vec::new(),
    }
}

fn http_get(addr: &str, path: &str) -> (u16, Vec<u8>) {
    let mut stream = TcpStream::connect(addr).expect("connect");
    write!(
        stream,
        "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
        path
    )
    .expect("write request");
    let mut raw = Vec::new();
    stream.read_to_end(&mut raw).expect("read response");
    let split = raw
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .expect("header terminator");
    let head = String::from_utf8_lossy(&raw[..split]).into_owned();
    let status = head
        .split_whitespace()
        .nth(1)
        .and_then(|code| code.parse().ok())
        .expect("status code");
    (status, raw[split + 4..].to_vec())
}

/// Polls `/status` until the web sink's lane has applied `generation`.
fn wait_for_status(addr: &str, generation: u64) -> serde_json::Value {
    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        let (status, body) = http_get(addr, "/status");
        assert_eq!(status, 200);
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        if json["last_frame"]["generation"] == generation {
            return json;
        }
        assert!(Instant::now() < deadline, "status stuck at {}", json);
        std::thread::sleep(Duration::from_millis(10));
    }
}

#[test]
fn scenario_a_bayer_frame_with_identity_stretch_and_manual_balance() {
    // RGGB 2x2: R=65535, G=30000, G=30000, B=26214
    let samples = [65535u16, 30000, 30000, 26214];
    let raw = RawFrame::from_u16_samples(
        FrameIdentity::new("/raw/a.png", 8, SystemTime::UNIX_EPOCH),
        &samples,
        2,
        2,
        SampleLayout::Bayer(BayerPattern::Rggb),
        CaptureMeta::default(),
    );
    let engine = ProcessingEngine::new(ProcessSettings {
        stretch: StretchSettings::identity(),
        balance: BalanceMode::Manual {
            red_gain: 0.8,
            blue_gain: 1.5,
        },
        resize_percent: None,
    });

    let first = engine.process(&raw, &OverlaySpec::empty()).unwrap();
    let second = engine.process(&raw, &OverlaySpec::empty()).unwrap();
    assert_eq!(first.pixels.as_raw(), second.pixels.as_raw());

    // 1.0 * 0.8, 30000/65535, 26214/65535 * 1.5, scaled to 8 bits
    for pixel in first.pixels.pixels() {
        assert_eq!(pixel.0, [204, 117, 153]);
    }
}

#[test]
fn scenario_b_web_sink_reports_latest_generation() {
    let addr = "127.0.0.1:8081";
    let dispatcher = OutputDispatcher::with_next_generation(DispatchConfig::default(), 7);
    dispatcher
        .install(&SinkConfig::Web(WebSinkConfig::with_addr(addr)))
        .unwrap();

    let (frame, _) = dispatcher.dispatch(image(4, 3));
    assert_eq!(frame.generation, 7);
    let json = wait_for_status(addr, 7);
    assert_eq!(json["last_frame"]["width"], 4);
    assert_eq!(json["last_frame"]["height"], 3);

    let (frame, _) = dispatcher.dispatch(image(4, 3));
    assert_eq!(frame.generation, 8);
    wait_for_status(addr, 8);

    let (status, png) = http_get(addr, "/latest.png");
    assert_eq!(status, 200);
    assert!(png.starts_with(b"\x89PNG"));

    dispatcher.shutdown();
}

#[test]
fn scenario_c_file_sink_writes_pattern_before_dispatch_returns() {
    let out = tempfile::tempdir().unwrap();
    let dispatcher = OutputDispatcher::with_next_generation(DispatchConfig::default(), 3);
    let sink = Arc::new(FileSink::new(FileSinkConfig::new(
        out.path(),
        "frame_{generation}.png",
    )));
    dispatcher.install_sink(sink.clone()).unwrap();

    let (frame, results) = dispatcher.dispatch(image(5, 5));
    assert_eq!(frame.generation, 3);
    assert!(results.iter().all(|r| r.outcome.is_delivered()));

    let written = out.path().join("frame_3.png");
    let meta = std::fs::metadata(&written).unwrap();
    assert!(meta.len() > 0);
    let decoded = image::open(&written).unwrap().to_rgb8();
    assert_eq!(decoded.dimensions(), (5, 5));
    assert_eq!(decoded.get_pixel(0, 0).0, [10, 20, 30]);

    let status = sink.status();
    assert_eq!(status.last_generation, Some(3));
    dispatcher.shutdown();
}

#[test]
fn scenario_d_missing_encoder_is_a_config_error() {
    let sink = RtspSink::new(RtspSinkConfig {
        encoder: "/definitely/not/installed/ffmpeg".to_string(),
        ..RtspSinkConfig::default()
    });
    let err = sink.start().unwrap_err();
    assert!(matches!(err, SinkError::Config(_)), "got {:?}", err);
    assert_eq!(sink.status().state, SinkState::Stopped);
    assert_ne!(sink.status().state, SinkState::Streaming);

    // through the dispatcher the failure stays local to the sink
    let dispatcher = OutputDispatcher::new(DispatchConfig::default());
    let result = dispatcher.install(&SinkConfig::Rtsp(RtspSinkConfig {
        encoder: "/definitely/not/installed/ffmpeg".to_string(),
        ..RtspSinkConfig::default()
    }));
    assert!(matches!(result, Err(SinkError::Config(_))));
    let status = dispatcher.status(SinkKind::Rtsp).unwrap();
    assert_eq!(status.state, SinkState::Stopped);
    assert!(status.last_error.is_some());
}
