//! skyframed - all-sky frame pipeline daemon
//!
//! This daemon:
//! 1. Loads configuration (JSON file + SKYFRAME_* environment)
//! 2. Watches the raw frame directory
//! 3. Processes each stable frame and dispatches it to the enabled sinks
//! 4. Enforces the retention budget in the background
//! 5. Logs pipeline status periodically until Ctrl-C

use anyhow::{anyhow, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::{Duration, Instant};

use skyframe::{Pipeline, PipelineEvent, PipelineHandle, SkyframeConfig};

#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Args {
    /// JSON configuration file.
    #[arg(long, env = "SKYFRAME_CONFIG")]
    config: Option<PathBuf>,
    /// Seconds between status log lines (0 disables them).
    #[arg(long, default_value_t = 60)]
    status_interval: u64,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let config = SkyframeConfig::load_from(args.config.as_deref())?;
    let pipeline = Pipeline::start(&config)?;
    log::info!(
        "skyframed running (v{}), watching {}",
        env!("CARGO_PKG_VERSION"),
        config.watch.dir.display()
    );

    let (tx, rx) = mpsc::channel();
    ctrlc::set_handler(move || {
        let _ = tx.send(());
    })
    .map_err(|e| anyhow!("error setting Ctrl-C handler: {}", e))?;

    let status_interval = Duration::from_secs(args.status_interval);
    let mut last_status = Instant::now();
    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            Err(RecvTimeoutError::Timeout) => {}
        }
        if drain_events(&pipeline) {
            log::error!("raw frame source lost; stopping");
            break;
        }
        if !status_interval.is_zero() && last_status.elapsed() >= status_interval {
            log_status(&pipeline);
            last_status = Instant::now();
        }
    }

    log::info!("shutdown requested, stopping pipeline...");
    pipeline.stop()?;
    Ok(())
}

/// Logs pending events; returns true once the source is lost.
fn drain_events(pipeline: &PipelineHandle) -> bool {
    let mut source_lost = false;
    while let Ok(event) = pipeline.events().try_recv() {
        match event {
            PipelineEvent::FrameDispatched {
                generation,
                results,
            } => {
                let delivered = results.iter().filter(|r| r.outcome.is_delivered()).count();
                log::info!(
                    "generation {} dispatched ({}/{} sinks delivered)",
                    generation,
                    delivered,
                    results.len()
                );
            }
            PipelineEvent::FrameDropped { path, reason } => {
                log::warn!("frame dropped: {}: {}", path.display(), reason);
            }
            PipelineEvent::OverlaySkipped {
                generation,
                name,
                reason,
            } => {
                log::debug!("overlay '{}' skipped ({:?}): {}", name, generation, reason);
            }
            PipelineEvent::SinkFailed { kind, reason } => {
                log::warn!("{} sink failed: {}", kind, reason);
            }
            PipelineEvent::RetentionSwept { report } => {
                log::info!(
                    "retention sweep: {} files deleted, {} bytes stored (budget {})",
                    report.files_deleted(),
                    report.bytes_after,
                    report.max_bytes
                );
            }
            PipelineEvent::SourceLost { reason } => {
                log::error!("source lost: {}", reason);
                source_lost = true;
            }
        }
    }
    source_lost
}

fn log_status(pipeline: &PipelineHandle) {
    let status = pipeline.status();
    log::info!(
        "status: processed={} dropped={} last_generation={:?}",
        status.frames_processed,
        status.frames_dropped,
        status.last_generation
    );
    for sink in status.sinks {
        match sink.last_error {
            Some(err) => log::info!(
                "  {} sink: {:?} delivered={} failed={} last_error={}",
                sink.kind,
                sink.state,
                sink.delivered,
                sink.failed,
                err
            ),
            None => log::info!(
                "  {} sink: {:?} delivered={} failed={}",
                sink.kind,
                sink.state,
                sink.delivered,
                sink.failed
            ),
        }
    }
}
