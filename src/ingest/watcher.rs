//! Frame source watcher.
//!
//! Polls a directory and turns filesystem churn into an ordered sequence of
//! `WatchEvent::FrameReady` notifications. A file is announced only after its
//! size and modification time stayed unchanged for one quiet interval, and a
//! given (path, size, mtime) identity is announced at most once, across
//! restarts of the same `FrameWatcher`.
//!
//! If the watched directory becomes unreadable the watcher emits a single
//! `WatchEvent::SourceLost` and stops.

use anyhow::{anyhow, Result};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::frame::FrameIdentity;

/// Upper bound on how long the poll loop sleeps before checking for shutdown.
const SHUTDOWN_SLICE: Duration = Duration::from_millis(25);

#[derive(Clone, Debug, PartialEq)]
pub struct WatchConfig {
    pub dir: PathBuf,
    /// Lowercase extensions (without the dot) that count as raw frames.
    pub extensions: Vec<String>,
    pub recursive: bool,
    pub quiet_interval: Duration,
    /// Announce files already present when the watcher first starts.
    pub process_existing: bool,
}

impl Default for WatchConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::new(),
            extensions: vec!["png".to_string(), "tif".to_string(), "tiff".to_string()],
            recursive: true,
            quiet_interval: Duration::from_millis(500),
            process_existing: false,
        }
    }
}

impl WatchConfig {
    /// Hidden files (including in-progress temp files) never match.
    pub fn matches(&self, path: &Path) -> bool {
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            return false;
        };
        if name.starts_with('.') {
            return false;
        }
        match path.extension().and_then(|e| e.to_str()) {
            Some(ext) => {
                let ext = ext.to_ascii_lowercase();
                self.extensions.iter().any(|allowed| *allowed == ext)
            }
            None => false,
        }
    }

    fn poll_interval(&self) -> Duration {
        (self.quiet_interval / 2).max(Duration::from_millis(10))
    }
}

/// A raw file that has been stable for one quiet interval.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FrameNotice {
    pub identity: FrameIdentity,
    /// Position in the watcher's output sequence, starting at 1.
    pub sequence: u64,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WatchEvent {
    FrameReady(FrameNotice),
    SourceLost { dir: PathBuf, reason: String },
}

// ----------------------------------------------------------------------------
// Debouncer
// ----------------------------------------------------------------------------

#[derive(Debug)]
struct Observation {
    size: u64,
    modified: SystemTime,
    unchanged_since: Instant,
}

/// Debounce buffer keyed by file path.
///
/// Every poll reports what it saw through `observe`; any change to size or
/// mtime restarts that file's quiet timer. `take_stable` hands out files whose
/// timer has run for the full quiet interval, oldest-stable first.
#[derive(Debug)]
pub struct Debouncer {
    quiet_interval: Duration,
    pending: HashMap<PathBuf, Observation>,
    emitted: HashMap<PathBuf, (u64, SystemTime)>,
}

impl Debouncer {
    pub fn new(quiet_interval: Duration) -> Self {
        Self {
            quiet_interval,
            pending: HashMap::new(),
            emitted: HashMap::new(),
        }
    }

    pub fn observe(&mut self, path: PathBuf, size: u64, modified: SystemTime, now: Instant) {
        if self.emitted.get(&path) == Some(&(size, modified)) {
            self.pending.remove(&path);
            return;
        }
        match self.pending.get_mut(&path) {
            Some(obs) if obs.size == size && obs.modified == modified => {}
            Some(obs) => {
                obs.size = size;
                obs.modified = modified;
                obs.unchanged_since = now;
            }
            None => {
                self.pending.insert(
                    path,
                    Observation {
                        size,
                        modified,
                        unchanged_since: now,
                    },
                );
            }
        }
    }

    /// Records `identity` as already announced without emitting it.
    pub fn mark_emitted(&mut self, identity: &FrameIdentity) {
        self.pending.remove(&identity.path);
        self.emitted
            .insert(identity.path.clone(), (identity.size, identity.modified));
    }

    /// Drops state for files that disappeared, so a re-created file with the
    /// same name is announced again.
    pub fn retain_present(&mut self, present: &HashSet<PathBuf>) {
        self.pending.retain(|path, _| present.contains(path));
        self.emitted.retain(|path, _| present.contains(path));
    }

    pub fn take_stable(&mut self, now: Instant) -> Vec<FrameIdentity> {
        let quiet = self.quiet_interval;
        let mut ready: Vec<(Instant, FrameIdentity)> = self
            .pending
            .iter()
            .filter(|(_, obs)| now.saturating_duration_since(obs.unchanged_since) >= quiet)
            .map(|(path, obs)| {
                (
                    obs.unchanged_since,
                    FrameIdentity::new(path.clone(), obs.size, obs.modified),
                )
            })
            .collect();
        ready.sort_by(|(a_since, a), (b_since, b)| {
            a_since
                .cmp(b_since)
                .then(a.modified.cmp(&b.modified))
                .then(a.path.cmp(&b.path))
        });
        for (_, identity) in &ready {
            self.mark_emitted(identity);
        }
        ready.into_iter().map(|(_, identity)| identity).collect()
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

// ----------------------------------------------------------------------------
// Watcher
// ----------------------------------------------------------------------------

struct WatchState {
    debouncer: Debouncer,
    baselined: bool,
}

/// Restartable directory watcher.
pub struct FrameWatcher {
    config: WatchConfig,
    state: Arc<Mutex<WatchState>>,
    sequence: Arc<AtomicU64>,
}

impl FrameWatcher {
    pub fn new(config: WatchConfig) -> Self {
        let debouncer = Debouncer::new(config.quiet_interval);
        Self {
            config,
            state: Arc::new(Mutex::new(WatchState {
                debouncer,
                baselined: false,
            })),
            sequence: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn config(&self) -> &WatchConfig {
        &self.config
    }

    /// Starts polling. Fails immediately when the directory is unreadable.
    pub fn start(&self) -> Result<WatchHandle> {
        let initial = scan(&self.config)
            .map_err(|e| anyhow!("cannot watch {}: {}", self.config.dir.display(), e))?;

        {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            if !state.baselined {
                if !self.config.process_existing {
                    for identity in &initial {
                        state.debouncer.mark_emitted(identity);
                    }
                }
                state.baselined = true;
            }
        }

        let (tx, rx) = mpsc::channel();
        let shutdown = Arc::new(AtomicBool::new(false));
        let worker = WatchWorker {
            config: self.config.clone(),
            state: Arc::clone(&self.state),
            sequence: Arc::clone(&self.sequence),
            shutdown: Arc::clone(&shutdown),
            tx,
        };
        let join = std::thread::Builder::new()
            .name("frame-watcher".to_string())
            .spawn(move || worker.run())?;

        log::info!(
            "frame watcher: watching {} (quiet interval {:?}, recursive={})",
            self.config.dir.display(),
            self.config.quiet_interval,
            self.config.recursive
        );
        Ok(WatchHandle {
            events: rx,
            control: WatchControl {
                shutdown,
                join: Some(join),
            },
        })
    }
}

/// Running watcher: an event stream plus its stop control.
///
/// Iterating the handle blocks for the next event and ends once the watcher
/// has stopped and every queued event was consumed.
pub struct WatchHandle {
    events: Receiver<WatchEvent>,
    control: WatchControl,
}

impl WatchHandle {
    pub fn recv_timeout(&self, timeout: Duration) -> Option<WatchEvent> {
        match self.events.recv_timeout(timeout) {
            Ok(event) => Some(event),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Separates the event stream from the stop control so they can live on
    /// different threads.
    pub fn split(self) -> (WatchControl, Receiver<WatchEvent>) {
        (self.control, self.events)
    }

    pub fn stop(self) -> Result<()> {
        self.control.stop()
    }
}

impl Iterator for WatchHandle {
    type Item = WatchEvent;

    fn next(&mut self) -> Option<WatchEvent> {
        self.events.recv().ok()
    }
}

/// Stops the polling thread. Dropping it also stops the thread.
pub struct WatchControl {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl WatchControl {
    pub fn stop(mut self) -> Result<()> {
        self.halt()
    }

    pub fn is_running(&self) -> bool {
        self.join.as_ref().is_some_and(|join| !join.is_finished())
    }

    fn halt(&mut self) -> Result<()> {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = self.join.take() {
            join.join()
                .map_err(|_| anyhow!("frame watcher thread panicked"))?;
        }
        Ok(())
    }
}

impl Drop for WatchControl {
    fn drop(&mut self) {
        if let Err(err) = self.halt() {
            log::error!("frame watcher: {}", err);
        }
    }
}

struct WatchWorker {
    config: WatchConfig,
    state: Arc<Mutex<WatchState>>,
    sequence: Arc<AtomicU64>,
    shutdown: Arc<AtomicBool>,
    tx: Sender<WatchEvent>,
}

impl WatchWorker {
    fn run(self) {
        let poll = self.config.poll_interval();
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            match scan(&self.config) {
                Ok(found) => {
                    if !self.publish(found) {
                        break;
                    }
                }
                Err(err) => {
                    let reason = err.to_string();
                    log::error!(
                        "frame watcher: source lost at {}: {}",
                        self.config.dir.display(),
                        reason
                    );
                    let _ = self.tx.send(WatchEvent::SourceLost {
                        dir: self.config.dir.clone(),
                        reason,
                    });
                    break;
                }
            }
            sleep_unless(&self.shutdown, poll);
        }
        log::debug!("frame watcher: stopped");
    }

    /// Returns `false` once nobody is listening anymore.
    fn publish(&self, found: Vec<FrameIdentity>) -> bool {
        let now = Instant::now();
        let ready = {
            let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            let present: HashSet<PathBuf> = found.iter().map(|id| id.path.clone()).collect();
            state.debouncer.retain_present(&present);
            for identity in found {
                state
                    .debouncer
                    .observe(identity.path, identity.size, identity.modified, now);
            }
            state.debouncer.take_stable(now)
        };
        for identity in ready {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            let sequence = self.sequence.fetch_add(1, Ordering::SeqCst) + 1;
            log::debug!(
                "frame watcher: #{} stable {} ({} bytes)",
                sequence,
                identity.path.display(),
                identity.size
            );
            if self
                .tx
                .send(WatchEvent::FrameReady(FrameNotice { identity, sequence }))
                .is_err()
            {
                return false;
            }
        }
        true
    }
}

fn sleep_unless(flag: &AtomicBool, total: Duration) {
    let deadline = Instant::now() + total;
    while !flag.load(Ordering::SeqCst) {
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        std::thread::sleep((deadline - now).min(SHUTDOWN_SLICE));
    }
}

/// Lists matching files. Only a failure to read the root is fatal.
fn scan(config: &WatchConfig) -> std::io::Result<Vec<FrameIdentity>> {
    let mut found = Vec::new();
    let mut stack = vec![config.dir.clone()];
    let mut is_root = true;
    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(err) if is_root => return Err(err),
            Err(err) => {
                log::warn!("frame watcher: skipping {}: {}", dir.display(), err);
                continue;
            }
        };
        is_root = false;
        for entry in entries {
            let Ok(entry) = entry else { continue };
            let path = entry.path();
            let Ok(meta) = entry.metadata() else { continue };
            if meta.is_dir() {
                if config.recursive {
                    stack.push(path);
                }
                continue;
            }
            if !meta.is_file() || !config.matches(&path) {
                continue;
            }
            let Ok(modified) = meta.modified() else { continue };
            found.push(FrameIdentity::new(path, meta.len(), modified));
        }
    }
    Ok(found)
}
