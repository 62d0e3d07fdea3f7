//! Frame ingestion.
//!
//! The camera collaborator deposits one lossless raw file per frame into a
//! watched directory. This module is responsible for:
//! - Noticing new or rewritten files without trusting raw OS event counts
//! - Waiting until a file is stable (quiet interval) before announcing it
//! - Announcing each distinct file content exactly once, in stability order
//! - Decoding a stable file (plus optional JSON sidecar) into a `RawFrame`
//!
//! The ingestion layer MUST NOT:
//! - Modify or delete raw files (only retention deletes)
//! - Retry forever silently when the watched directory disappears

pub mod raw;
pub mod watcher;

pub use raw::{load_raw_frame, RawDefaults};
pub use watcher::{Debouncer, FrameNotice, FrameWatcher, WatchConfig, WatchControl, WatchEvent, WatchHandle};
