//! Output dispatcher.
//!
//! Stamps each processed image with the next generation, publishes it as the
//! shared latest frame and hands it to every installed sink. Each sink runs
//! in its own lane thread behind a bounded mailbox, so a slow sink only ever
//! delays itself:
//!
//! - latest-style sinks (file, web) get a single-slot mailbox; an undelivered
//!   frame is superseded by the next one
//! - streaming sinks (`Sink::wants_every_frame`) get a short queue; the
//!   dispatcher waits a bounded time for room and reports when it had to
//!   displace a frame
//!
//! `dispatch` only waits for sinks that confirm delivery (the file sink),
//! and for those at most `delivery_timeout`. Every other lane is answered
//! `InFlight` at once and reports its outcome later through
//! `OutputDispatcher::late_receipts`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender, TryRecvError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::frame::{LatestFrame, ProcessedFrame, ProcessedImage};
use crate::mailbox::{Mailbox, Take};
use crate::sink::{DeliveryOutcome, DispatchResult, Sink, SinkConfig, SinkError, SinkKind, SinkStatus};

const DEFAULT_DELIVERY_TIMEOUT_MS: u64 = 1000;
const DEFAULT_STREAM_QUEUE: usize = 4;
const LANE_POLL: Duration = Duration::from_millis(100);
const RECEIPT_QUEUE: usize = 256;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Upper bound on how long `dispatch` waits for confirming sinks, and
    /// on how long a full streaming queue may hold up a hand-off.
    #[serde(default = "default_delivery_timeout_ms")]
    pub delivery_timeout_ms: u64,
    /// Queue depth for streaming sinks.
    #[serde(default = "default_stream_queue")]
    pub stream_queue: usize,
}

fn default_delivery_timeout_ms() -> u64 {
    DEFAULT_DELIVERY_TIMEOUT_MS
}

fn default_stream_queue() -> usize {
    DEFAULT_STREAM_QUEUE
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            delivery_timeout_ms: DEFAULT_DELIVERY_TIMEOUT_MS,
            stream_queue: DEFAULT_STREAM_QUEUE,
        }
    }
}

impl DispatchConfig {
    pub fn delivery_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery_timeout_ms)
    }
}

struct Delivery {
    frame: Arc<ProcessedFrame>,
    receipt: SyncSender<DispatchResult>,
}

impl Delivery {
    fn answer(self, kind: SinkKind, outcome: DeliveryOutcome) {
        let result = DispatchResult {
            kind,
            generation: self.frame.generation,
            outcome,
        };
        if let Err(mpsc::TrySendError::Full(result)) = self.receipt.try_send(result) {
            log::debug!("{} sink: receipt queue full, dropping {:?}", kind, result.outcome);
        }
    }
}

struct SinkLane {
    sink: Arc<dyn Sink>,
    mailbox: Mailbox<Delivery>,
    streaming: bool,
    confirms: bool,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

impl SinkLane {
    fn spawn(sink: Arc<dyn Sink>, stream_queue: usize) -> Result<Self, SinkError> {
        let streaming = sink.wants_every_frame();
        let confirms = sink.confirms_delivery();
        let mailbox = if streaming {
            Mailbox::new(stream_queue)
        } else {
            Mailbox::latest()
        };
        let shutdown = Arc::new(AtomicBool::new(false));

        let lane_sink = Arc::clone(&sink);
        let lane_mailbox = mailbox.clone();
        let lane_shutdown = Arc::clone(&shutdown);
        let join = std::thread::Builder::new()
            .name(format!("sink-{}", sink.kind()))
            .spawn(move || run_lane(lane_sink, lane_mailbox, lane_shutdown))?;

        Ok(Self {
            sink,
            mailbox,
            streaming,
            confirms,
            shutdown,
            join: Some(join),
        })
    }

    fn submit(&self, delivery: Delivery, wait: Duration) {
        let kind = self.sink.kind();
        let generation = delivery.frame.generation;
        let wait = if self.streaming { wait } else { Duration::ZERO };
        if let Some(displaced) = self.mailbox.post(delivery, wait) {
            if displaced.frame.generation == generation {
                displaced.answer(kind, DeliveryOutcome::Skipped("sink removed".to_string()));
                return;
            }
            let reason = format!("superseded by generation {}", generation);
            if self.streaming {
                log::warn!(
                    "{} sink: delivery delayed, dropped generation {} ({})",
                    kind,
                    displaced.frame.generation,
                    reason
                );
            } else {
                log::debug!("{} sink: generation {} {}", kind, displaced.frame.generation, reason);
            }
            displaced.answer(kind, DeliveryOutcome::Skipped(reason));
        }
    }

    fn stop(mut self) {
        let kind = self.sink.kind();
        self.shutdown.store(true, Ordering::SeqCst);
        self.mailbox.close();
        if let Some(join) = self.join.take() {
            if join.join().is_err() {
                log::error!("{} sink: lane thread panicked", kind);
            }
        }
        for pending in self.mailbox.drain() {
            pending.answer(kind, DeliveryOutcome::Skipped("sink removed".to_string()));
        }
        self.sink.stop();
    }
}

fn run_lane(sink: Arc<dyn Sink>, mailbox: Mailbox<Delivery>, shutdown: Arc<AtomicBool>) {
    let kind = sink.kind();
    loop {
        match mailbox.take(LANE_POLL) {
            Take::Item(delivery) => {
                if shutdown.load(Ordering::SeqCst) {
                    delivery.answer(kind, DeliveryOutcome::Skipped("sink removed".to_string()));
                    continue;
                }
                let outcome = sink.deliver(&delivery.frame);
                delivery.answer(kind, outcome);
            }
            Take::Empty => {}
            Take::Closed => break,
        }
    }
    log::debug!("{} sink: lane stopped", kind);
}

pub struct OutputDispatcher {
    config: DispatchConfig,
    latest: LatestFrame,
    next_generation: AtomicU64,
    lanes: Mutex<BTreeMap<SinkKind, SinkLane>>,
    receipts_tx: SyncSender<DispatchResult>,
    receipts: Mutex<Receiver<DispatchResult>>,
}

impl OutputDispatcher {
    pub fn new(config: DispatchConfig) -> Self {
        Self::with_next_generation(config, 1)
    }

    /// Starts numbering at `first` (must be at least 1).
    pub fn with_next_generation(config: DispatchConfig, first: u64) -> Self {
        let (receipts_tx, receipts) = mpsc::sync_channel(RECEIPT_QUEUE);
        Self {
            config,
            latest: LatestFrame::new(),
            next_generation: AtomicU64::new(first.max(1)),
            lanes: Mutex::new(BTreeMap::new()),
            receipts_tx,
            receipts: Mutex::new(receipts),
        }
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    /// Shared slot holding the most recently dispatched frame.
    pub fn latest(&self) -> LatestFrame {
        self.latest.clone()
    }

    /// Builds and starts the sink described by `config`, replacing any
    /// running instance of the same kind.
    ///
    /// The new sink stays installed even when `start` fails, so its status
    /// keeps reporting the failure; deliveries to it are skipped.
    pub fn install(&self, config: &SinkConfig) -> Result<(), SinkError> {
        self.remove(config.kind());
        let sink = config.build(&self.latest);
        self.install_sink(sink)
    }

    /// Installs an already built sink, stopping any instance of the same kind.
    pub fn install_sink(&self, sink: Arc<dyn Sink>) -> Result<(), SinkError> {
        let kind = sink.kind();
        self.remove(kind);

        let started = sink.start();
        match &started {
            Ok(()) => log::info!("{} sink: started", kind),
            Err(err) => log::error!("{} sink: failed to start: {}", kind, err),
        }
        let lane = match SinkLane::spawn(Arc::clone(&sink), self.config.stream_queue) {
            Ok(lane) => lane,
            Err(err) => {
                sink.stop();
                return Err(err);
            }
        };
        let replaced = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(kind, lane);
        if let Some(lane) = replaced {
            lane.stop();
        }
        started
    }

    /// Stops and removes the sink of `kind`. Returns whether one was installed.
    pub fn remove(&self, kind: SinkKind) -> bool {
        let lane = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&kind);
        match lane {
            Some(lane) => {
                lane.stop();
                log::info!("{} sink: removed", kind);
                true
            }
            None => false,
        }
    }

    pub fn kinds(&self) -> Vec<SinkKind> {
        self.lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .copied()
            .collect()
    }

    pub fn statuses(&self) -> Vec<SinkStatus> {
        let sinks: Vec<Arc<dyn Sink>> = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(|lane| Arc::clone(&lane.sink))
            .collect();
        sinks.iter().map(|sink| sink.status()).collect()
    }

    pub fn status(&self, kind: SinkKind) -> Option<SinkStatus> {
        let sink = self
            .lanes
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&kind)
            .map(|lane| Arc::clone(&lane.sink));
        sink.map(|sink| sink.status())
    }

    /// Outcomes reported by lanes after `dispatch` returned, oldest first.
    /// Bounded: receipts nobody collects are dropped.
    pub fn late_receipts(&self) -> Vec<DispatchResult> {
        let receipts = self.receipts.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = Vec::new();
        loop {
            match receipts.try_recv() {
                Ok(result) => out.push(result),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }
        out
    }

    /// Assigns the next generation to `image` and hands it to every sink.
    /// Returns once confirming sinks answered (or `delivery_timeout`
    /// passed); other sinks are reported `InFlight`.
    pub fn dispatch(&self, image: ProcessedImage) -> (Arc<ProcessedFrame>, Vec<DispatchResult>) {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        let frame = Arc::new(ProcessedFrame::new(image, generation, SystemTime::now()));
        let results = self.deliver(Arc::clone(&frame));
        (frame, results)
    }

    fn deliver(&self, frame: Arc<ProcessedFrame>) -> Vec<DispatchResult> {
        if !self.latest.publish(Arc::clone(&frame)) {
            log::warn!(
                "dispatcher: generation {} is not newer than the latest frame",
                frame.generation
            );
        }

        let timeout = self.config.delivery_timeout();
        let mut kinds = Vec::new();
        let mut pending = 0;
        let rx = {
            let lanes = self.lanes.lock().unwrap_or_else(PoisonError::into_inner);
            let (tx, rx) = mpsc::sync_channel(lanes.len().max(1));
            for (kind, lane) in lanes.iter() {
                let receipt = if lane.confirms {
                    pending += 1;
                    tx.clone()
                } else {
                    self.receipts_tx.clone()
                };
                lane.submit(
                    Delivery {
                        frame: Arc::clone(&frame),
                        receipt,
                    },
                    timeout,
                );
                kinds.push(*kind);
            }
            rx
        };

        let deadline = Instant::now() + timeout;
        let mut results: BTreeMap<SinkKind, DispatchResult> = BTreeMap::new();
        while results.len() < pending {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            match rx.recv_timeout(deadline - now) {
                Ok(result) => {
                    results.insert(result.kind, result);
                }
                Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => break,
            }
        }

        kinds
            .into_iter()
            .map(|kind| {
                results.remove(&kind).unwrap_or(DispatchResult {
                    kind,
                    generation: frame.generation,
                    outcome: DeliveryOutcome::InFlight,
                })
            })
            .collect()
    }

    /// Stops every sink. Frames still queued are discarded.
    pub fn shutdown(&self) {
        let lanes = std::mem::take(&mut *self.lanes.lock().unwrap_or_else(PoisonError::into_inner));
        for (kind, lane) in lanes {
            lane.stop();
            log::info!("{} sink: stopped", kind);
        }
    }
}

impl Drop for OutputDispatcher {
    fn drop(&mut self) {
        self.shutdown();
    }
}
