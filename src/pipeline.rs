//! Pipeline wiring and supervision.
//!
//! ```text
//! watcher thread --WatchEvent--> processor thread --Mailbox(n)--> dispatch thread --> sink lanes
//!                                       |                                |
//!                                 ConsumedWatermark               PipelineEvent
//!                                       |
//!                               retention thread
//! ```
//!
//! The processor never waits on the dispatcher: it posts into a short
//! mailbox (`dispatch.stream_queue` deep) and, when that is full, the oldest
//! image not yet dispatched is superseded (and counted as dropped). The
//! dispatcher itself only waits on confirming sinks, so a slow web client or
//! encoder never backs up into this hand-off. Stop order is watcher, processor (finishing its
//! current frame), dispatcher (dispatching what it holds), sinks, retention.

use anyhow::{anyhow, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::config::SkyframeConfig;
use crate::dispatch::OutputDispatcher;
use crate::frame::{FrameIdentity, LatestFrame, ProcessedImage};
use crate::ingest::raw::{load_raw_frame, RawDefaults};
use crate::ingest::watcher::{FrameWatcher, WatchControl, WatchEvent};
use crate::mailbox::{Mailbox, Take};
use crate::process::{OverlaySpec, ProcessingEngine};
use crate::retention::{arrival_time, ConsumedWatermark, RetentionManager, RetentionReport, RetentionRunner};
use crate::sink::{DeliveryOutcome, DispatchResult, SinkConfig, SinkError, SinkKind, SinkStatus};

const EVENT_QUEUE: usize = 256;
const RECV_POLL: Duration = Duration::from_millis(100);

#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    FrameDispatched {
        generation: u64,
        results: Vec<DispatchResult>,
    },
    FrameDropped {
        path: PathBuf,
        reason: String,
    },
    OverlaySkipped {
        generation: Option<u64>,
        name: String,
        reason: String,
    },
    SinkFailed {
        kind: SinkKind,
        reason: String,
    },
    RetentionSwept {
        report: RetentionReport,
    },
    SourceLost {
        reason: String,
    },
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct PipelineStatus {
    pub frames_processed: u64,
    /// Frame errors plus processed frames superseded before dispatch.
    pub frames_dropped: u64,
    pub last_generation: Option<u64>,
    pub source_lost: bool,
    pub sinks: Vec<SinkStatus>,
}

#[derive(Debug, Default)]
struct Counters {
    processed: AtomicU64,
    dropped: AtomicU64,
    source_lost: AtomicBool,
}

/// Bounded event fan-in. Events are dropped (and logged) when nobody reads.
#[derive(Clone)]
struct EventSink {
    tx: SyncSender<PipelineEvent>,
}

impl EventSink {
    fn emit(&self, event: PipelineEvent) {
        match self.tx.try_send(event) {
            Ok(()) | Err(TrySendError::Disconnected(_)) => {}
            Err(TrySendError::Full(event)) => {
                log::debug!("pipeline: event queue full, dropping {:?}", event);
            }
        }
    }
}

pub struct Pipeline;

impl Pipeline {
    /// Installs the configured sinks, then starts retention, the dispatcher,
    /// the processor and the watcher. Sink start failures are reported as
    /// events and leave the pipeline running; a watch directory that cannot
    /// be read fails the start.
    pub fn start(config: &SkyframeConfig) -> Result<PipelineHandle> {
        let (tx, events) = mpsc::sync_channel(EVENT_QUEUE);
        let event_sink = EventSink { tx };
        let counters = Arc::new(Counters::default());

        let dispatcher = Arc::new(OutputDispatcher::new(config.dispatch.clone()));
        for sink in config.sinks() {
            if let Err(err) = dispatcher.install(&sink) {
                event_sink.emit(PipelineEvent::SinkFailed {
                    kind: sink.kind(),
                    reason: err.to_string(),
                });
            }
        }

        let watermark = ConsumedWatermark::new();
        let retention = match config.retention_policy() {
            Some(policy) => {
                let events = event_sink.clone();
                let manager = RetentionManager::new(policy, watermark.clone());
                Some(RetentionRunner::start(manager, move |report| {
                    events.emit(PipelineEvent::RetentionSwept { report });
                })?)
            }
            None => None,
        };

        let mailbox: Mailbox<ProcessedImage> = Mailbox::new(config.dispatch.stream_queue);
        let dispatch_join = {
            let dispatcher = Arc::clone(&dispatcher);
            let mailbox = mailbox.clone();
            let events = event_sink.clone();
            std::thread::Builder::new()
                .name("dispatch".to_string())
                .spawn(move || run_dispatch(dispatcher, mailbox, events))?
        };

        let watch = FrameWatcher::new(config.watch.clone()).start();
        let watch = match watch {
            Ok(watch) => watch,
            Err(err) => {
                mailbox.close();
                let _ = dispatch_join.join();
                dispatcher.shutdown();
                if let Some(retention) = retention {
                    let _ = retention.stop();
                }
                return Err(err);
            }
        };
        let (watch_control, notices) = watch.split();

        let processor_stop = Arc::new(AtomicBool::new(false));
        let processor = Processor {
            engine: ProcessingEngine::new(config.process.clone()),
            overlays: OverlaySpec::prepare(&config.overlays),
            defaults: config.raw_defaults.clone(),
            watermark,
            mailbox: mailbox.clone(),
            counters: Arc::clone(&counters),
            events: event_sink.clone(),
            stop: Arc::clone(&processor_stop),
        };
        let processor_join = std::thread::Builder::new()
            .name("processor".to_string())
            .spawn(move || processor.run(notices))?;

        log::info!(
            "pipeline: watching {} with {} sink(s)",
            config.watch.dir.display(),
            dispatcher.kinds().len()
        );
        Ok(PipelineHandle {
            dispatcher,
            counters,
            events,
            event_sink,
            mailbox,
            watch: Some(watch_control),
            processor_stop,
            processor: Some(processor_join),
            dispatch: Some(dispatch_join),
            retention,
        })
    }
}

struct Processor {
    engine: ProcessingEngine,
    overlays: OverlaySpec,
    defaults: RawDefaults,
    watermark: ConsumedWatermark,
    mailbox: Mailbox<ProcessedImage>,
    counters: Arc<Counters>,
    events: EventSink,
    stop: Arc<AtomicBool>,
}

impl Processor {
    fn run(self, notices: Receiver<WatchEvent>) {
        while !self.stop.load(Ordering::SeqCst) {
            match notices.recv_timeout(RECV_POLL) {
                Ok(WatchEvent::FrameReady(notice)) => self.handle(notice.identity),
                Ok(WatchEvent::SourceLost { dir, reason }) => {
                    let reason = format!("{}: {}", dir.display(), reason);
                    log::error!("pipeline: source lost: {}", reason);
                    self.counters.source_lost.store(true, Ordering::SeqCst);
                    self.events.emit(PipelineEvent::SourceLost { reason });
                    break;
                }
                Err(RecvTimeoutError::Timeout) => {}
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        log::debug!("pipeline: processor stopped");
    }

    fn handle(&self, identity: FrameIdentity) {
        let path = identity.path.clone();
        // the raw file is consumed from here on, processed or not
        let arrived = std::fs::metadata(&path)
            .map(|meta| arrival_time(&meta))
            .unwrap_or(identity.modified);
        self.watermark.advance(arrived);

        let processed = load_raw_frame(&identity, &self.defaults)
            .and_then(|raw| self.engine.process(&raw, &self.overlays));
        match processed {
            Ok(image) => {
                self.counters.processed.fetch_add(1, Ordering::SeqCst);
                log::debug!("pipeline: processed {}", path.display());
                if let Some(superseded) = self.mailbox.post(image, Duration::ZERO) {
                    self.drop_frame(
                        superseded.source.path,
                        "superseded before dispatch".to_string(),
                    );
                }
            }
            Err(err) => {
                log::warn!("pipeline: dropping {}: {}", path.display(), err);
                self.drop_frame(path, err.to_string());
            }
        }
    }

    fn drop_frame(&self, path: PathBuf, reason: String) {
        self.counters.dropped.fetch_add(1, Ordering::SeqCst);
        self.events.emit(PipelineEvent::FrameDropped { path, reason });
    }
}

fn run_dispatch(dispatcher: Arc<OutputDispatcher>, mailbox: Mailbox<ProcessedImage>, events: EventSink) {
    let mut running: BTreeMap<SinkKind, bool> = BTreeMap::new();
    loop {
        let image = match mailbox.take(RECV_POLL) {
            Take::Item(image) => image,
            Take::Empty => {
                report_failures(&dispatcher.late_receipts(), &events);
                report_stopped_sinks(&dispatcher, &mut running, &events);
                continue;
            }
            Take::Closed => break,
        };
        let skipped = image.skipped_overlays.clone();
        let (frame, results) = dispatcher.dispatch(image);

        for overlay in skipped {
            events.emit(PipelineEvent::OverlaySkipped {
                generation: Some(frame.generation),
                name: overlay.name,
                reason: overlay.reason,
            });
        }
        report_failures(&results, &events);
        report_failures(&dispatcher.late_receipts(), &events);
        report_stopped_sinks(&dispatcher, &mut running, &events);
        events.emit(PipelineEvent::FrameDispatched {
            generation: frame.generation,
            results,
        });
    }
    log::debug!("pipeline: dispatch stopped");
}

fn report_failures(results: &[DispatchResult], events: &EventSink) {
    for result in results {
        if let DeliveryOutcome::Failed(reason) = &result.outcome {
            log::warn!("{} sink: generation {} failed: {}", result.kind, result.generation, reason);
            events.emit(PipelineEvent::SinkFailed {
                kind: result.kind,
                reason: reason.clone(),
            });
        }
    }
}

/// Reports sinks that stopped on their own since the last check, such as an
/// RTSP sink whose encoder exited.
fn report_stopped_sinks(
    dispatcher: &OutputDispatcher,
    running: &mut BTreeMap<SinkKind, bool>,
    events: &EventSink,
) {
    for status in dispatcher.statuses() {
        let was_running = running.insert(status.kind, status.is_running());
        if was_running == Some(true) && !status.is_running() {
            let reason = status
                .last_error
                .clone()
                .unwrap_or_else(|| "sink stopped".to_string());
            log::warn!("{} sink: stopped: {}", status.kind, reason);
            events.emit(PipelineEvent::SinkFailed {
                kind: status.kind,
                reason,
            });
        }
    }
}

pub struct PipelineHandle {
    dispatcher: Arc<OutputDispatcher>,
    counters: Arc<Counters>,
    events: Receiver<PipelineEvent>,
    event_sink: EventSink,
    mailbox: Mailbox<ProcessedImage>,
    watch: Option<WatchControl>,
    processor_stop: Arc<AtomicBool>,
    processor: Option<JoinHandle<()>>,
    dispatch: Option<JoinHandle<()>>,
    retention: Option<RetentionRunner>,
}

impl PipelineHandle {
    pub fn status(&self) -> PipelineStatus {
        PipelineStatus {
            frames_processed: self.counters.processed.load(Ordering::SeqCst),
            frames_dropped: self.counters.dropped.load(Ordering::SeqCst),
            last_generation: self.dispatcher.latest().generation(),
            source_lost: self.counters.source_lost.load(Ordering::SeqCst),
            sinks: self.dispatcher.statuses(),
        }
    }

    /// Frame, sink, retention and source events. Bounded: events are dropped
    /// when the queue is not drained.
    pub fn events(&self) -> &Receiver<PipelineEvent> {
        &self.events
    }

    pub fn latest(&self) -> LatestFrame {
        self.dispatcher.latest()
    }

    /// Replaces (or adds) the sink of `config.kind()`: the running instance
    /// is stopped, a new one is built and started.
    pub fn reconfigure_sink(&self, config: SinkConfig) -> Result<(), SinkError> {
        let kind = config.kind();
        log::info!("{} sink: reconfiguring", kind);
        let result = self.dispatcher.install(&config);
        if let Err(err) = &result {
            self.event_sink.emit(PipelineEvent::SinkFailed {
                kind,
                reason: err.to_string(),
            });
        }
        result
    }

    pub fn disable_sink(&self, kind: SinkKind) -> bool {
        self.dispatcher.remove(kind)
    }

    pub fn stop(mut self) -> Result<()> {
        self.halt()
    }

    fn halt(&mut self) -> Result<()> {
        let mut failures = Vec::new();
        if let Some(watch) = self.watch.take() {
            if let Err(err) = watch.stop() {
                failures.push(err.to_string());
            }
        }
        self.processor_stop.store(true, Ordering::SeqCst);
        if let Some(join) = self.processor.take() {
            if join.join().is_err() {
                failures.push("processor thread panicked".to_string());
            }
        }
        self.mailbox.close();
        if let Some(join) = self.dispatch.take() {
            if join.join().is_err() {
                failures.push("dispatch thread panicked".to_string());
            }
        }
        self.dispatcher.shutdown();
        if let Some(retention) = self.retention.take() {
            if let Err(err) = retention.stop() {
                failures.push(err.to_string());
            }
        }
        if failures.is_empty() {
            log::info!("pipeline: stopped");
            Ok(())
        } else {
            Err(anyhow!("pipeline stop: {}", failures.join("; ")))
        }
    }
}

impl Drop for PipelineHandle {
    fn drop(&mut self) {
        if self.processor.is_some() || self.dispatch.is_some() {
            if let Err(err) = self.halt() {
                log::error!("{:#}", err);
            }
        }
    }
}
