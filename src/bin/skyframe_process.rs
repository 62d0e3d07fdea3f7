//! skyframe_process - process one raw frame and write the result
//!
//! Runs the same engine as the daemon on a single file, for previewing
//! stretch, balance and overlay settings.

use anyhow::{anyhow, Context, Result};
use clap::Parser;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use skyframe::process::ProcessSettings;
use skyframe::sink::file::{encode_image, write_atomic, OutputFormat};
use skyframe::{
    load_raw_frame, BayerPattern, FrameIdentity, OverlaySpec, ProcessedFrame, ProcessingEngine,
    RawDefaults, SkyframeConfig,
};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// Raw frame (PNG or TIFF).
    input: PathBuf,
    /// Output image; `.png` or `.jpg`. Defaults to `<input stem>.processed.png`.
    #[arg(long)]
    output: Option<PathBuf>,
    /// Take processing settings and overlays from this config file.
    #[arg(long, env = "SKYFRAME_CONFIG")]
    config: Option<PathBuf>,
    /// Bayer pattern when the raw file has no sidecar (RGGB, BGGR, GRBG, GBRG).
    #[arg(long)]
    bayer: Option<String>,
    #[arg(long, default_value = "allsky")]
    camera: String,
    #[arg(long, default_value_t = 90)]
    jpeg_quality: u8,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let (settings, overlays, mut defaults) = match args.config.as_deref() {
        Some(path) => {
            let cfg = SkyframeConfig::load_from(Some(path))?;
            (cfg.process, cfg.overlays, cfg.raw_defaults)
        }
        None => (ProcessSettings::default(), Vec::new(), RawDefaults::default()),
    };
    if args.config.is_none() {
        defaults.camera = args.camera.clone();
    }
    if let Some(tag) = args.bayer.as_deref() {
        defaults.bayer = BayerPattern::parse(tag)?;
    }

    let identity = FrameIdentity::from_path(&args.input)
        .with_context(|| format!("cannot stat {}", args.input.display()))?;
    let raw = load_raw_frame(&identity, &defaults)?;
    log::info!(
        "loaded {} ({}x{}, {:?}, {}-bit)",
        args.input.display(),
        raw.width,
        raw.height,
        raw.layout,
        raw.depth.bits()
    );

    let engine = ProcessingEngine::new(settings);
    let image = engine.process(&raw, &OverlaySpec::prepare(&overlays))?;
    for skipped in &image.skipped_overlays {
        log::warn!("overlay '{}' skipped: {}", skipped.name, skipped.reason);
    }
    let frame = ProcessedFrame::new(image, 1, SystemTime::now());

    let output = args
        .output
        .clone()
        .unwrap_or_else(|| default_output(&args.input));
    let format = match output.extension().and_then(|e| e.to_str()) {
        Some(ext) if ext.eq_ignore_ascii_case("png") => OutputFormat::Png,
        Some(ext) if ext.eq_ignore_ascii_case("jpg") || ext.eq_ignore_ascii_case("jpeg") => {
            OutputFormat::Jpg {
                quality: args.jpeg_quality,
            }
        }
        _ => return Err(anyhow!("output must end in .png, .jpg or .jpeg")),
    };
    let bytes = encode_image(&frame, format)?;
    write_atomic(&output, &bytes)
        .with_context(|| format!("cannot write {}", output.display()))?;

    log::info!(
        "wrote {} ({}x{}, sha256 {})",
        output.display(),
        frame.width(),
        frame.height(),
        frame.checksum_hex()
    );
    Ok(())
}

fn default_output(input: &Path) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "frame".to_string());
    input.with_file_name(format!("{}.processed.png", stem))
}
