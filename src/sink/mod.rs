//! Output sinks.
//!
//! Every sink implements the same capability set (`start`, `stop`,
//! `deliver`, `status`) so the dispatcher never branches on the concrete
//! kind. Sinks are shared as `Arc<dyn Sink>` and use interior mutability;
//! all methods take `&self`.
//!
//! Per-sink guarantees:
//! - A sink never applies a generation lower than one it already applied
//!   (`GenerationGate`)
//! - A failing sink reports through its status and never panics the caller
//! - Reconfiguration is always stop, then build a new instance, then start

pub mod file;
pub mod rtsp;
pub mod web;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::frame::{LatestFrame, ProcessedFrame};

pub use file::{FileSink, FileSinkConfig, OutputFormat};
pub use rtsp::{RtspSink, RtspSinkConfig};
pub use web::{WebSink, WebSinkConfig};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkKind {
    File,
    Web,
    Rtsp,
}

impl SinkKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Web => "web",
            Self::Rtsp => "rtsp",
        }
    }
}

impl fmt::Display for SinkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SinkState {
    Stopped,
    Starting,
    /// File sink accepting writes.
    Ready,
    /// Web sink listening.
    Serving,
    /// RTSP sink with a live encoder (or waiting for its first frame).
    Streaming,
    /// RTSP sink replacing its encoder after a geometry change.
    Restarting,
    Stopping,
}

impl SinkState {
    pub fn is_running(self) -> bool {
        !matches!(self, Self::Stopped)
    }
}

#[derive(Debug)]
pub enum SinkError {
    /// Invalid parameters or a missing dependency such as the encoder binary.
    Config(String),
    /// Listener could not bind its address.
    Bind(String),
    Io(std::io::Error),
    /// Encoder subprocess failure.
    Encoder(String),
    /// Operation not valid in the sink's current state.
    State(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Config(msg) => write!(f, "configuration error: {}", msg),
            Self::Bind(msg) => write!(f, "bind error: {}", msg),
            Self::Io(err) => write!(f, "i/o error: {}", err),
            Self::Encoder(msg) => write!(f, "encoder error: {}", msg),
            Self::State(msg) => write!(f, "invalid state: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<std::io::Error> for SinkError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err)
    }
}

/// Result of handing one frame to one sink.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "reason", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    /// Sink not ready, or the frame was superseded.
    Skipped(String),
    Failed(String),
    /// Handed to the sink's lane; the outcome follows as a late receipt.
    InFlight,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, Self::Delivered)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct DispatchResult {
    pub kind: SinkKind,
    pub generation: u64,
    pub outcome: DeliveryOutcome,
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct SinkStatus {
    pub kind: SinkKind,
    pub state: SinkState,
    pub last_generation: Option<u64>,
    pub delivered: u64,
    pub skipped: u64,
    pub failed: u64,
    pub last_error: Option<String>,
    /// Kind-specific fields (address, geometry, restart counts).
    pub detail: serde_json::Value,
}

impl SinkStatus {
    pub fn is_running(&self) -> bool {
        self.state.is_running()
    }
}

pub trait Sink: Send + Sync {
    fn kind(&self) -> SinkKind;

    fn start(&self) -> Result<(), SinkError>;

    /// Stops the sink and releases its resources. Idempotent.
    fn stop(&self);

    fn deliver(&self, frame: &Arc<ProcessedFrame>) -> DeliveryOutcome;

    fn status(&self) -> SinkStatus;

    /// Streaming sinks get every frame in order instead of only the latest.
    fn wants_every_frame(&self) -> bool {
        false
    }
    /// Sinks whose delivery must be finished when `dispatch` returns. Other
    /// sinks are handed the frame and report their outcome later.
    fn confirms_delivery(&self) -> bool {
        false
    }
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum SinkConfig {
    File(FileSinkConfig),
    Web(WebSinkConfig),
    Rtsp(RtspSinkConfig),
}

impl SinkConfig {
    pub fn kind(&self) -> SinkKind {
        match self {
            Self::File(_) => SinkKind::File,
            Self::Web(_) => SinkKind::Web,
            Self::Rtsp(_) => SinkKind::Rtsp,
        }
    }

    /// Builds a stopped sink. `latest` is the dispatcher's shared slot.
    pub fn build(&self, latest: &LatestFrame) -> Arc<dyn Sink> {
        match self {
            Self::File(cfg) => Arc::new(FileSink::new(cfg.clone())),
            Self::Web(cfg) => Arc::new(WebSink::new(cfg.clone(), latest.clone())),
            Self::Rtsp(cfg) => Arc::new(RtspSink::new(cfg.clone())),
        }
    }
}

/// Monotonic generation filter. Generations start at 1.
#[derive(Debug, Default)]
pub struct GenerationGate {
    last: AtomicU64,
}

impl GenerationGate {
    /// Accepts `generation` only if it is higher than every accepted one.
    pub fn admit(&self, generation: u64) -> bool {
        self.last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| {
                (generation > last).then_some(generation)
            })
            .is_ok()
    }

    pub fn last(&self) -> Option<u64> {
        match self.last.load(Ordering::SeqCst) {
            0 => None,
            n => Some(n),
        }
    }
}

/// Counters and last error shared by every sink implementation.
#[derive(Debug, Default)]
pub(crate) struct SinkStats {
    delivered: AtomicU64,
    skipped: AtomicU64,
    failed: AtomicU64,
    last_generation: AtomicU64,
    last_error: Mutex<Option<String>>,
}

impl SinkStats {
    pub(crate) fn record(&self, kind: SinkKind, generation: u64, outcome: &DeliveryOutcome) {
        match outcome {
            DeliveryOutcome::Delivered => {
                self.delivered.fetch_add(1, Ordering::SeqCst);
                self.last_generation.fetch_max(generation, Ordering::SeqCst);
            }
            DeliveryOutcome::Skipped(reason) => {
                self.skipped.fetch_add(1, Ordering::SeqCst);
                log::debug!("{} sink: skipped generation {}: {}", kind, generation, reason);
            }
            DeliveryOutcome::Failed(reason) => {
                self.failed.fetch_add(1, Ordering::SeqCst);
                log::warn!("{} sink: generation {} failed: {}", kind, generation, reason);
                self.set_error(reason.clone());
            }
            DeliveryOutcome::InFlight => {}
        }
    }

    pub(crate) fn set_error(&self, error: impl Into<String>) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = Some(error.into());
    }

    pub(crate) fn clear_error(&self) {
        *self.last_error.lock().unwrap_or_else(PoisonError::into_inner) = None;
    }

    pub(crate) fn snapshot(&self, kind: SinkKind, state: SinkState, detail: serde_json::Value) -> SinkStatus {
        SinkStatus {
            kind,
            state,
            last_generation: match self.last_generation.load(Ordering::SeqCst) {
                0 => None,
                n => Some(n),
            },
            delivered: self.delivered.load(Ordering::SeqCst),
            skipped: self.skipped.load(Ordering::SeqCst),
            failed: self.failed.load(Ordering::SeqCst),
            last_error: self
                .last_error
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            detail,
        }
    }
}

/// Shared state cell with poison recovery.
#[derive(Debug)]
pub(crate) struct StateCell(Mutex<SinkState>);

impl StateCell {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(SinkState::Stopped))
    }

    pub(crate) fn get(&self) -> SinkState {
        *self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn set(&self, kind: SinkKind, next: SinkState) {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != next {
            log::debug!("{} sink: {:?} -> {:?}", kind, *state, next);
            *state = next;
        }
    }

    /// Moves from `from` to `to`; returns the actual state on mismatch.
    pub(crate) fn transition(&self, kind: SinkKind, from: SinkState, to: SinkState) -> Result<(), SinkState> {
        let mut state = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if *state != from {
            return Err(*state);
        }
        log::debug!("{} sink: {:?} -> {:?}", kind, from, to);
        *state = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_rejects_rollback_and_repeats() {
        let gate = GenerationGate::default();
        assert_eq!(gate.last(), None);
        assert!(gate.admit(3));
        assert!(!gate.admit(2));
        assert!(!gate.admit(3));
        assert!(gate.admit(9));
        assert_eq!(gate.last(), Some(9));
    }

    #[test]
    fn gate_converges_to_highest_under_contention() {
        let gate = Arc::new(GenerationGate::default());
        let handles: Vec<_> = (0..4u64)
            .map(|t| {
                let gate = Arc::clone(&gate);
                std::thread::spawn(move || {
                    (1..=200u64)
                        .filter(|g| g % 4 == t)
                        .filter(|g| gate.admit(*g))
                        .count()
                })
            })
            .collect();
        let admitted: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert!(admitted >= 1);
        assert_eq!(gate.last(), Some(200));
        assert!(!gate.admit(200));
    }

    #[test]
    fn sink_config_is_tagged_by_kind() -> anyhow::Result<()> {
        let cfg: SinkConfig = serde_json::from_str(
            r#"{"kind":"web","addr":"127.0.0.1:9000","image_path":"/latest.png"}"#,
        )?;
        assert_eq!(cfg.kind(), SinkKind::Web);
        Ok(())
    }

    #[test]
    fn stats_track_outcomes() {
        let stats = SinkStats::default();
        stats.record(SinkKind::File, 4, &DeliveryOutcome::Delivered);
        stats.record(SinkKind::File, 5, &DeliveryOutcome::Failed("disk full".into()));
        stats.record(SinkKind::File, 6, &DeliveryOutcome::Skipped("stale".into()));
        let status = stats.snapshot(SinkKind::File, SinkState::Ready, serde_json::Value::Null);
        assert_eq!(status.delivered, 1);
        assert_eq!(status.failed, 1);
        assert_eq!(status.skipped, 1);
        assert_eq!(status.last_generation, Some(4));
        assert_eq!(status.last_error.as_deref(), Some("disk full"));
    }
}
