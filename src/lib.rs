//! Skyframe: all-sky camera frame pipeline.
//!
//! Watches the directory a camera writes raw frames into, turns each stable
//! frame into a display image, and fans it out to live consumers.
//!
//! # Architecture
//!
//! ```text
//! FrameWatcher -> ProcessingEngine -> OutputDispatcher -> { FileSink, WebSink, RtspSink }
//!                                                  RetentionManager (independent)
//! ```
//!
//! The pipeline holds these properties by construction:
//!
//! 1. **Exactly-once notices**: a raw file is announced once per distinct
//!    (path, size, mtime), after it stayed unchanged for a quiet interval.
//! 2. **Pure processing**: `ProcessingEngine::process` has no hidden state;
//!    identical inputs give byte-identical output.
//! 3. **Monotonic generations**: the dispatcher numbers frames without gaps
//!    and no sink ever applies a generation lower than one it applied.
//! 4. **Isolation**: each sink runs behind its own bounded mailbox; a slow or
//!    failing sink never delays the others or the processor.
//! 5. **Safe retention**: partial files and unconsumed raw frames are never
//!    deleted.
//!
//! # Module Structure
//!
//! - `frame`: frame types and the atomically swapped `LatestFrame` slot
//! - `ingest`: directory watcher and raw file decoding
//! - `process`: debayer, stretch, color balance, overlays
//! - `sink`: file, web and RTSP outputs behind the `Sink` trait
//! - `dispatch`: generation numbering and per-sink delivery lanes
//! - `retention`: disk budget enforcement
//! - `pipeline`: wiring, supervision and events
//! - `config`: JSON file plus `SKYFRAME_*` environment configuration

pub mod config;
pub mod dispatch;
pub mod frame;
pub mod ingest;
pub mod mailbox;
pub mod pipeline;
pub mod process;
pub mod retention;
pub mod sink;

pub use config::SkyframeConfig;
pub use dispatch::{DispatchConfig, OutputDispatcher};
pub use frame::{
    BayerPattern, BitDepth, CaptureMeta, FrameError, FrameIdentity, LatestFrame, ProcessedFrame,
    ProcessedImage, RawFrame, SampleLayout, SkippedOverlay,
};
pub use ingest::{load_raw_frame, FrameWatcher, RawDefaults, WatchConfig, WatchEvent};
pub use pipeline::{Pipeline, PipelineEvent, PipelineHandle, PipelineStatus};
pub use process::{OverlayConfig, OverlaySpec, ProcessSettings, ProcessingEngine};
pub use retention::{
    ConsumedWatermark, RetentionManager, RetentionPolicy, RetentionReport, RetentionRunner,
    RetentionStrategy, RetentionTarget,
};
pub use sink::{
    DeliveryOutcome, DispatchResult, FileSinkConfig, RtspSinkConfig, Sink, SinkConfig, SinkError,
    SinkKind, SinkState, SinkStatus, WebSinkConfig,
};
