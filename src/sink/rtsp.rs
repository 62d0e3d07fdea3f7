//! RTSP sink: bridges processed frames into an external encoder process.
//!
//! State machine:
//!
//! ```text
//! Stopped -> Starting -> Streaming -> Restarting -> Streaming
//!    ^          |            |            |
//!    +----------+------------+------------+   (stop, encoder exit, spawn failure)
//! ```
//!
//! `deliver` only swaps the sink's current frame. A pacer thread ticks at the
//! configured fps and hands the current frame to the encoder, repeating it
//! when nothing new arrived and skipping frames that were superseded between
//! ticks. The encoder is spawned on the first frame, because its geometry is
//! only known then; a frame with different geometry tears the encoder down
//! and starts a new one, discarding anything queued for the old one.
//!
//! Each encoder owns a writer thread fed through a 2-slot queue, so a stalled
//! pipe never blocks the pacer, and a stderr drain logging at debug level.

use serde::{Deserialize, Serialize};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TrySendError};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::frame::{Latest, ProcessedFrame};
use crate::sink::{
    DeliveryOutcome, GenerationGate, Sink, SinkError, SinkKind, SinkState, SinkStats, SinkStatus,
    StateCell,
};

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8554;
const DEFAULT_STREAM: &str = "allsky";
const DEFAULT_FPS: f64 = 5.0;
const DEFAULT_ENCODER: &str = "ffmpeg";
const DEFAULT_GRACE_MS: u64 = 3000;
const MAX_FPS: f64 = 60.0;
const WRITER_QUEUE: usize = 2;
const GOP_SIZE: u32 = 30;

const BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const BACKOFF_MAX: Duration = Duration::from_secs(60);
const PACER_SLICE: Duration = Duration::from_millis(25);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RtspSinkConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_stream")]
    pub stream_name: String,
    #[serde(default = "default_fps")]
    pub fps: f64,
    /// Encoder program: a path, or a bare name looked up on `PATH`.
    #[serde(default = "default_encoder")]
    pub encoder: String,
    /// Replaces the built-in ffmpeg arguments. Placeholders: `{width}`,
    /// `{height}`, `{fps}`, `{url}`.
    #[serde(default)]
    pub encoder_args: Option<Vec<String>>,
    #[serde(default = "default_grace_ms")]
    pub grace_period_ms: u64,
}

fn default_host() -> String {
    DEFAULT_HOST.to_string()
}

fn default_port() -> u16 {
    DEFAULT_PORT
}

fn default_stream() -> String {
    DEFAULT_STREAM.to_string()
}

fn default_fps() -> f64 {
    DEFAULT_FPS
}

fn default_encoder() -> String {
    DEFAULT_ENCODER.to_string()
}

fn default_grace_ms() -> u64 {
    DEFAULT_GRACE_MS
}

impl Default for RtspSinkConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: DEFAULT_PORT,
            stream_name: default_stream(),
            fps: DEFAULT_FPS,
            encoder: default_encoder(),
            encoder_args: None,
            grace_period_ms: DEFAULT_GRACE_MS,
        }
    }
}

impl RtspSinkConfig {
    pub fn url(&self) -> String {
        format!("rtsp://{}:{}/{}", self.host, self.port, self.stream_name)
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn validate(&self) -> Result<(), SinkError> {
        if !(self.fps > 0.0 && self.fps <= MAX_FPS) {
            return Err(SinkError::Config(format!(
                "rtsp fps {} outside (0, {}]",
                self.fps, MAX_FPS
            )));
        }
        if self.port == 0 {
            return Err(SinkError::Config("rtsp port must be non-zero".to_string()));
        }
        if self.host.trim().is_empty() {
            return Err(SinkError::Config("rtsp host is empty".to_string()));
        }
        if self.stream_name.trim().is_empty() {
            return Err(SinkError::Config("rtsp stream_name is empty".to_string()));
        }
        if self.encoder.trim().is_empty() {
            return Err(SinkError::Config("rtsp encoder is empty".to_string()));
        }
        Ok(())
    }

    fn frame_interval(&self) -> Duration {
        Duration::from_secs_f64(1.0 / self.fps)
    }
}

/// Resolves the encoder program: an explicit path must exist, a bare name
/// must be found on `PATH`.
pub fn locate_encoder(encoder: &str) -> Option<PathBuf> {
    let candidate = Path::new(encoder);
    if candidate.components().count() > 1 || candidate.is_absolute() {
        return candidate.is_file().then(|| candidate.to_path_buf());
    }
    let paths = std::env::var_os("PATH")?;
    std::env::split_paths(&paths)
        .map(|dir| dir.join(encoder))
        .find(|path| path.is_file())
}

/// Builds the encoder invocation for frames of `geometry`.
pub fn build_encoder_command(config: &RtspSinkConfig, program: &Path, geometry: (u32, u32)) -> Command {
    let (width, height) = geometry;
    let fps = format!("{}", config.fps);
    let url = config.url();

    let mut cmd = Command::new(program);
    match &config.encoder_args {
        Some(args) => {
            for arg in args {
                cmd.arg(
                    arg.replace("{width}", &width.to_string())
                        .replace("{height}", &height.to_string())
                        .replace("{fps}", &fps)
                        .replace("{url}", &url),
                );
            }
        }
        None => {
            cmd.arg("-hide_banner").arg("-loglevel").arg("warning");

            // raw frames on stdin
            cmd.arg("-f").arg("rawvideo");
            cmd.arg("-pixel_format").arg("rgb24");
            cmd.arg("-video_size").arg(format!("{}x{}", width, height));
            cmd.arg("-framerate").arg(&fps);
            cmd.arg("-i").arg("pipe:0");

            cmd.arg("-c:v").arg("libx264");
            cmd.arg("-preset").arg("ultrafast");
            cmd.arg("-tune").arg("zerolatency");
            cmd.arg("-pix_fmt").arg("yuv420p");
            cmd.arg("-g").arg(GOP_SIZE.to_string());

            cmd.arg("-f").arg("rtsp");
            cmd.arg(&url);
        }
    }
    cmd.stdin(Stdio::piped())
        .stdout(Stdio::null())
        .stderr(Stdio::piped());
    cmd
}

#[derive(Debug)]
struct Backoff {
    delay: Duration,
    not_before: Option<Instant>,
    /// Failure that opened the current window.
    reason: Option<String>,
}

impl Default for Backoff {
    fn default() -> Self {
        Self {
            delay: BACKOFF_INITIAL,
            not_before: None,
            reason: None,
        }
    }
}

impl Backoff {
    fn remaining(&self, now: Instant) -> Option<Duration> {
        self.not_before
            .filter(|at| *at > now)
            .map(|at| at - now)
    }

    fn fail(&mut self, now: Instant, reason: &str) -> Duration {
        let wait = self.delay;
        self.not_before = Some(now + wait);
        self.reason = Some(reason.to_string());
        self.delay = (self.delay * 2).min(BACKOFF_MAX);
        wait
    }

    fn reset(&mut self) {
        *self = Self::default();
    }
}

#[derive(Debug, Default)]
struct RtspCounters {
    restarts: AtomicU64,
    frames_written: AtomicU64,
    frames_discarded: AtomicU64,
    geometry: Mutex<Option<(u32, u32)>>,
    encoder_pid: Mutex<Option<u32>>,
}

impl RtspCounters {
    fn set_encoder(&self, geometry: Option<(u32, u32)>, pid: Option<u32>) {
        *self.geometry.lock().unwrap_or_else(PoisonError::into_inner) = geometry;
        *self.encoder_pid.lock().unwrap_or_else(PoisonError::into_inner) = pid;
    }
}

struct RtspShared {
    config: RtspSinkConfig,
    state: StateCell,
    stats: SinkStats,
    counters: RtspCounters,
    backoff: Mutex<Backoff>,
    current: Latest<ProcessedFrame>,
}

impl RtspShared {
    fn fail(&self, reason: String) {
        let wait = self
            .backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .fail(Instant::now(), &reason);
        log::error!("rtsp sink: {} (next start allowed in {:?})", reason, wait);
        self.stats.set_error(reason);
    }
}

struct PacerHandle {
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

pub struct RtspSink {
    shared: Arc<RtspShared>,
    gate: GenerationGate,
    pacer: Mutex<Option<PacerHandle>>,
}

impl RtspSink {
    pub fn new(config: RtspSinkConfig) -> Self {
        Self {
            shared: Arc::new(RtspShared {
                config,
                state: StateCell::new(),
                stats: SinkStats::default(),
                counters: RtspCounters::default(),
                backoff: Mutex::new(Backoff::default()),
                current: Latest::new(),
            }),
            gate: GenerationGate::default(),
            pacer: Mutex::new(None),
        }
    }

    pub fn state(&self) -> SinkState {
        self.shared.state.get()
    }

    /// Geometry of the running encoder.
    pub fn geometry(&self) -> Option<(u32, u32)> {
        *self
            .shared
            .counters
            .geometry
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub fn restarts(&self) -> u64 {
        self.shared.counters.restarts.load(Ordering::SeqCst)
    }

    pub fn frames_written(&self) -> u64 {
        self.shared.counters.frames_written.load(Ordering::SeqCst)
    }

    fn reap_finished_pacer(&self) {
        let mut pacer = self.pacer.lock().unwrap_or_else(PoisonError::into_inner);
        let finished = pacer
            .as_ref()
            .and_then(|p| p.join.as_ref())
            .is_some_and(|join| join.is_finished());
        if finished {
            if let Some(mut handle) = pacer.take() {
                if let Some(join) = handle.join.take() {
                    let _ = join.join();
                }
            }
        }
    }
}

impl Sink for RtspSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Rtsp
    }

    fn start(&self) -> Result<(), SinkError> {
        let shared = &self.shared;
        shared.config.validate()?;
        self.reap_finished_pacer();

        let now = Instant::now();
        {
            let backoff = shared.backoff.lock().unwrap_or_else(PoisonError::into_inner);
            if let Some(wait) = backoff.remaining(now) {
                let reason = backoff.reason.as_deref().unwrap_or("previous start failed");
                return Err(SinkError::Config(format!(
                    "{}; retry allowed in {:.1}s",
                    reason,
                    wait.as_secs_f64()
                )));
            }
        }

        let program = match locate_encoder(&shared.config.encoder) {
            Some(program) => program,
            None => {
                let reason = format!("encoder '{}' not found", shared.config.encoder);
                shared.fail(reason.clone());
                shared.state.set(SinkKind::Rtsp, SinkState::Stopped);
                return Err(SinkError::Config(reason));
            }
        };

        if let Err(state) =
            shared
                .state
                .transition(SinkKind::Rtsp, SinkState::Stopped, SinkState::Starting)
        {
            return Err(SinkError::State(format!("rtsp sink is {:?}", state)));
        }
        shared.stats.clear_error();

        let shutdown = Arc::new(AtomicBool::new(false));
        let pacer = Pacer {
            shared: Arc::clone(shared),
            program,
            shutdown: Arc::clone(&shutdown),
        };
        let join = match std::thread::Builder::new()
            .name("rtsp-pacer".to_string())
            .spawn(move || pacer.run())
        {
            Ok(join) => join,
            Err(err) => {
                shared.state.set(SinkKind::Rtsp, SinkState::Stopped);
                return Err(SinkError::Io(err));
            }
        };
        *self.pacer.lock().unwrap_or_else(PoisonError::into_inner) = Some(PacerHandle {
            shutdown,
            join: Some(join),
        });
        log::info!(
            "rtsp sink: publishing {} at {} fps",
            shared.config.url(),
            shared.config.fps
        );
        Ok(())
    }

    fn stop(&self) {
        let handle = self.pacer.lock().unwrap_or_else(PoisonError::into_inner).take();
        if let Some(mut handle) = handle {
            if self.shared.state.get().is_running() {
                self.shared.state.set(SinkKind::Rtsp, SinkState::Stopping);
            }
            handle.shutdown.store(true, Ordering::SeqCst);
            if let Some(join) = handle.join.take() {
                if join.join().is_err() {
                    log::error!("rtsp sink: pacer thread panicked");
                }
            }
        }
        self.shared.state.set(SinkKind::Rtsp, SinkState::Stopped);
    }

    fn deliver(&self, frame: &Arc<ProcessedFrame>) -> DeliveryOutcome {
        let outcome = if !self.shared.state.get().is_running() {
            DeliveryOutcome::Skipped("rtsp sink not streaming".to_string())
        } else if !self.gate.admit(frame.generation) {
            DeliveryOutcome::Skipped(format!("generation {} is stale", frame.generation))
        } else {
            self.shared.current.publish(Arc::clone(frame));
            DeliveryOutcome::Delivered
        };
        self.shared
            .stats
            .record(SinkKind::Rtsp, frame.generation, &outcome);
        outcome
    }

    fn status(&self) -> SinkStatus {
        let counters = &self.shared.counters;
        let pid = *counters
            .encoder_pid
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        self.shared.stats.snapshot(
            SinkKind::Rtsp,
            self.shared.state.get(),
            serde_json::json!({
                "url": self.shared.config.url(),
                "fps": self.shared.config.fps,
                "geometry": self.geometry().map(|(w, h)| [w, h]),
                "restarts": counters.restarts.load(Ordering::SeqCst),
                "frames_written": counters.frames_written.load(Ordering::SeqCst),
                "frames_discarded": counters.frames_discarded.load(Ordering::SeqCst),
                "encoder_pid": pid,
            }),
        )
    }

    fn wants_every_frame(&self) -> bool {
        true
    }
}

impl Drop for RtspSink {
    fn drop(&mut self) {
        self.stop();
    }
}

// ----------------------------------------------------------------------------
// Pacer
// ----------------------------------------------------------------------------

struct Pacer {
    shared: Arc<RtspShared>,
    program: PathBuf,
    shutdown: Arc<AtomicBool>,
}

impl Pacer {
    fn run(self) {
        let interval = self.shared.config.frame_interval();
        let grace = self.shared.config.grace_period();
        let mut encoder: Option<Encoder> = None;
        let mut next_tick = Instant::now();

        while self.wait_until(next_tick) {
            next_tick += interval;
            let now = Instant::now();
            if next_tick < now {
                next_tick = now + interval;
            }

            let Some(frame) = self.shared.current.load() else {
                continue;
            };
            let geometry = frame.geometry();

            if let Some(running) = encoder.as_mut() {
                if let Some(exit) = running.exited() {
                    let reason = format!("encoder exited unexpectedly ({})", exit);
                    self.shared.fail(reason);
                    encoder = None;
                    self.shared.counters.set_encoder(None, None);
                    break;
                }
            }

            if encoder.as_ref().is_some_and(|e| e.geometry != geometry) {
                if let Some(old) = encoder.take() {
                    self.shared
                        .state
                        .set(SinkKind::Rtsp, SinkState::Restarting);
                    self.shared.counters.restarts.fetch_add(1, Ordering::SeqCst);
                    log::info!(
                        "rtsp sink: geometry {}x{} -> {}x{}, restarting encoder",
                        old.geometry.0,
                        old.geometry.1,
                        geometry.0,
                        geometry.1
                    );
                    old.terminate(grace, &self.shared.counters);
                    self.shared.counters.set_encoder(None, None);
                }
            }

            if encoder.is_none() {
                match Encoder::spawn(&self.shared.config, &self.program, geometry, &self.shared) {
                    Ok(spawned) => {
                        self.shared
                            .counters
                            .set_encoder(Some(geometry), Some(spawned.child.id()));
                        self.shared.backoff.lock().unwrap_or_else(PoisonError::into_inner).reset();
                        self.shared.state.set(SinkKind::Rtsp, SinkState::Streaming);
                        encoder = Some(spawned);
                    }
                    Err(err) => {
                        self.shared.fail(err.to_string());
                        break;
                    }
                }
            }

            if let Some(running) = encoder.as_ref() {
                if !running.offer(&frame, &self.shared.counters) {
                    // writer gone: the pipe broke, find out why on the next tick
                    log::warn!("rtsp sink: encoder pipe closed");
                }
            }
        }

        if let Some(running) = encoder.take() {
            running.terminate(grace, &self.shared.counters);
        }
        self.shared.counters.set_encoder(None, None);
        self.shared.state.set(SinkKind::Rtsp, SinkState::Stopped);
        log::debug!("rtsp sink: pacer stopped");
    }

    /// Sleeps until `deadline`; returns `false` once shutdown was requested.
    fn wait_until(&self, deadline: Instant) -> bool {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            std::thread::sleep((deadline - now).min(PACER_SLICE));
        }
    }
}

// ----------------------------------------------------------------------------
// Encoder process
// ----------------------------------------------------------------------------

struct Encoder {
    child: Child,
    geometry: (u32, u32),
    tx: Option<SyncSender<Arc<ProcessedFrame>>>,
    closing: Arc<AtomicBool>,
    writer: Option<JoinHandle<u64>>,
    stderr: Option<JoinHandle<()>>,
    reaped: bool,
}

impl Encoder {
    fn spawn(
        config: &RtspSinkConfig,
        program: &Path,
        geometry: (u32, u32),
        shared: &Arc<RtspShared>,
    ) -> Result<Self, SinkError> {
        let mut cmd = build_encoder_command(config, program, geometry);
        let mut child = cmd
            .spawn()
            .map_err(|e| SinkError::Encoder(format!("spawn {}: {}", program.display(), e)))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| SinkError::Encoder("encoder stdin not captured".to_string()))?;

        let stderr = child.stderr.take().and_then(|stderr| {
            std::thread::Builder::new()
                .name("rtsp-encoder-stderr".to_string())
                .spawn(move || {
                    for line in BufReader::new(stderr).lines() {
                        match line {
                            Ok(line) => log::debug!("rtsp encoder: {}", line),
                            Err(_) => break,
                        }
                    }
                })
                .ok()
        });

        let (tx, rx) = mpsc::sync_channel(WRITER_QUEUE);
        let closing = Arc::new(AtomicBool::new(false));
        let writer_closing = Arc::clone(&closing);
        let writer_shared = Arc::clone(shared);
        let writer = std::thread::Builder::new()
            .name("rtsp-encoder-writer".to_string())
            .spawn(move || write_frames(stdin, rx, writer_closing, writer_shared));
        let writer = match writer {
            Ok(join) => join,
            Err(err) => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(SinkError::Io(err));
            }
        };

        log::info!(
            "rtsp sink: encoder pid {} started for {}x{}",
            child.id(),
            geometry.0,
            geometry.1
        );
        Ok(Self {
            child,
            geometry,
            tx: Some(tx),
            closing,
            writer: Some(writer),
            stderr,
            reaped: false,
        })
    }

    /// Queues a frame for the writer. Returns `false` if the writer is gone.
    fn offer(&self, frame: &Arc<ProcessedFrame>, counters: &RtspCounters) -> bool {
        let Some(tx) = self.tx.as_ref() else {
            return false;
        };
        match tx.try_send(Arc::clone(frame)) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                counters.frames_discarded.fetch_add(1, Ordering::SeqCst);
                true
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    fn exited(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                self.reaped = true;
                Some(status)
            }
            Ok(None) => None,
            Err(err) => {
                log::warn!("rtsp sink: cannot poll encoder: {}", err);
                None
            }
        }
    }

    /// Closes stdin, asks the encoder to exit, and kills it after `grace`.
    fn terminate(mut self, grace: Duration, counters: &RtspCounters) {
        self.shutdown(grace);
        let discarded = self.join_threads();
        if discarded > 0 {
            counters
                .frames_discarded
                .fetch_add(discarded, Ordering::SeqCst);
        }
    }

    fn shutdown(&mut self, grace: Duration) {
        self.closing.store(true, Ordering::SeqCst);
        drop(self.tx.take());
        if self.reaped {
            return;
        }
        signal_terminate(&self.child);
        let deadline = Instant::now() + grace;
        loop {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    log::info!("rtsp sink: encoder pid {} exited ({})", self.child.id(), status);
                    break;
                }
                Ok(None) if Instant::now() < deadline => {
                    std::thread::sleep(Duration::from_millis(20));
                }
                Ok(None) => {
                    log::warn!(
                        "rtsp sink: encoder pid {} ignored termination for {:?}, killing",
                        self.child.id(),
                        grace
                    );
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
                Err(err) => {
                    log::warn!("rtsp sink: cannot wait for encoder: {}", err);
                    let _ = self.child.kill();
                    let _ = self.child.wait();
                    break;
                }
            }
        }
        self.reaped = true;
    }

    /// Joins helper threads and returns how many queued frames were dropped.
    fn join_threads(&mut self) -> u64 {
        let discarded = match self.writer.take() {
            Some(join) => join.join().unwrap_or(0),
            None => 0,
        };
        if let Some(join) = self.stderr.take() {
            let _ = join.join();
        }
        discarded
    }
}

impl Drop for Encoder {
    fn drop(&mut self) {
        self.shutdown(Duration::ZERO);
        self.join_threads();
    }
}

/// Writer unit: pipes frames into the encoder until the queue closes or the
/// pipe breaks. Returns the number of frames dropped because the encoder was
/// being torn down.
fn write_frames(
    mut stdin: ChildStdin,
    rx: Receiver<Arc<ProcessedFrame>>,
    closing: Arc<AtomicBool>,
    shared: Arc<RtspShared>,
) -> u64 {
    let mut discarded = 0u64;
    for frame in rx.iter() {
        if closing.load(Ordering::SeqCst) {
            discarded += 1;
            continue;
        }
        if let Err(err) = stdin.write_all(frame.rgb_bytes()).and_then(|_| stdin.flush()) {
            log::warn!("rtsp sink: encoder pipe write failed: {}", err);
            break;
        }
        shared
            .counters
            .frames_written
            .fetch_add(1, Ordering::SeqCst);
    }
    discarded
}

#[cfg(unix)]
fn signal_terminate(child: &Child) {
    // SAFETY: the pid belongs to our own child, which has not been reaped.
    let rc = unsafe { libc::kill(child.id() as libc::pid_t, libc::SIGTERM) };
    if rc != 0 {
        log::debug!(
            "rtsp sink: SIGTERM to {} failed: {}",
            child.id(),
            std::io::Error::last_os_error()
        );
    }
}

#[cfg(not(unix))]
fn signal_terminate(_child: &Child) {}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(cmd: &Command) -> Vec<String> {
        cmd.get_args()
            .map(|s| s.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn default_command_streams_rgb24_to_url() {
        let config = RtspSinkConfig {
            host: "0.0.0.0".to_string(),
            port: 8554,
            stream_name: "sky".to_string(),
            fps: 10.0,
            ..RtspSinkConfig::default()
        };
        let cmd = build_encoder_command(&config, Path::new("ffmpeg"), (1920, 1080));
        let args = args(&cmd);
        assert_eq!(cmd.get_program().to_str(), Some("ffmpeg"));
        assert!(args.windows(2).any(|w| w == ["-pixel_format", "rgb24"]));
        assert!(args.windows(2).any(|w| w == ["-video_size", "1920x1080"]));
        assert!(args.windows(2).any(|w| w == ["-framerate", "10"]));
        assert!(args.windows(2).any(|w| w == ["-tune", "zerolatency"]));
        assert!(args.windows(2).any(|w| w == ["-g", "30"]));
        assert_eq!(args.last().map(String::as_str), Some("rtsp://0.0.0.0:8554/sky"));
    }

    #[test]
    fn custom_args_substitute_placeholders() {
        let config = RtspSinkConfig {
            encoder_args: Some(vec![
                "--size={width}x{height}".to_string(),
                "--rate".to_string(),
                "{fps}".to_string(),
                "{url}".to_string(),
            ]),
            fps: 2.5,
            ..RtspSinkConfig::default()
        };
        let cmd = build_encoder_command(&config, Path::new("/opt/enc"), (64, 48));
        assert_eq!(
            args(&cmd),
            vec!["--size=64x48", "--rate", "2.5", "rtsp://127.0.0.1:8554/allsky"]
        );
    }

    #[test]
    fn validation_bounds_fps_and_port() {
        let mut config = RtspSinkConfig::default();
        assert!(config.validate().is_ok());
        config.fps = 0.0;
        assert!(config.validate().is_err());
        config.fps = 61.0;
        assert!(config.validate().is_err());
        config.fps = 5.0;
        config.port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let mut backoff = Backoff::default();
        let now = Instant::now();
        assert_eq!(backoff.remaining(now), None);
        assert_eq!(backoff.fail(now, "boom"), Duration::from_secs(1));
        assert_eq!(backoff.fail(now, "boom"), Duration::from_secs(2));
        assert_eq!(backoff.fail(now, "boom"), Duration::from_secs(4));
        for _ in 0..10 {
            backoff.fail(now, "boom");
        }
        assert_eq!(backoff.fail(now, "boom"), BACKOFF_MAX);
        assert!(backoff.remaining(now).is_some());
        backoff.reset();
        assert_eq!(backoff.remaining(now), None);
    }

    #[test]
    fn missing_encoder_is_a_config_error_with_backoff() {
        let sink = RtspSink::new(RtspSinkConfig {
            encoder: "/nonexistent/bin/ffmpeg".to_string(),
            ..RtspSinkConfig::default()
        });
        assert!(matches!(sink.start(), Err(SinkError::Config(_))));
        assert_eq!(sink.state(), SinkState::Stopped);

        // a second attempt inside the back-off window fails fast
        let err = sink.start().unwrap_err();
        assert!(err.to_string().contains("retry allowed"));
        assert!(err.to_string().contains("not found"));
        assert_eq!(sink.state(), SinkState::Stopped);
        assert!(sink.status().last_error.is_some());
    }

    #[cfg(unix)]
    fn frame(generation: u64, width: u32, height: u32) -> Arc<ProcessedFrame> {
        use crate::frame::FrameIdentity;
        Arc::new(ProcessedFrame::from_rgb(
            image::RgbImage::new(width, height),
            generation,
            FrameIdentity::new("sky.png", 0, std::time::SystemTime::UNIX_EPOCH),
        ))
    }

    #[cfg(unix)]
    fn shell_encoder(script: &str) -> RtspSinkConfig {
        RtspSinkConfig {
            encoder: "sh".to_string(),
            encoder_args: Some(vec!["-c".to_string(), script.to_string()]),
            fps: 20.0,
            grace_period_ms: 500,
            ..RtspSinkConfig::default()
        }
    }

    #[cfg(unix)]
    fn wait_for(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        false
    }

    #[cfg(unix)]
    #[test]
    fn streams_and_restarts_on_geometry_change() {
        let sink = RtspSink::new(shell_encoder("cat > /dev/null"));
        sink.start().unwrap();
        assert_eq!(sink.state(), SinkState::Starting);

        assert!(sink.deliver(&frame(1, 4, 4)).is_delivered());
        assert!(wait_for(|| sink.state() == SinkState::Streaming && sink.frames_written() > 0));
        assert_eq!(sink.geometry(), Some((4, 4)));

        assert!(sink.deliver(&frame(2, 8, 4)).is_delivered());
        assert!(wait_for(|| sink.restarts() == 1 && sink.geometry() == Some((8, 4))));
        assert_eq!(sink.state(), SinkState::Streaming);

        // stale generations never reach the encoder
        assert!(!sink.deliver(&frame(1, 4, 4)).is_delivered());

        sink.stop();
        assert_eq!(sink.state(), SinkState::Stopped);
        assert_eq!(sink.geometry(), None);
    }

    #[cfg(unix)]
    #[test]
    fn unexpected_encoder_exit_stops_the_sink() {
        let sink = RtspSink::new(shell_encoder("exit 3"));
        sink.start().unwrap();
        assert!(sink.deliver(&frame(1, 4, 4)).is_delivered());
        assert!(wait_for(|| sink.state() == SinkState::Stopped));
        let status = sink.status();
        assert!(status
            .last_error
            .as_deref()
            .is_some_and(|e| e.contains("exited unexpectedly")));
        assert!(!sink.deliver(&frame(2, 4, 4)).is_delivered());

        // restarting inside the back-off window names the exit, not a missing binary
        let err = sink.start().unwrap_err().to_string();
        assert!(err.contains("exited unexpectedly"), "{}", err);
        assert!(err.contains("retry allowed"));
        assert!(!err.contains("unavailable"));
    }

    #[test]
    fn locate_finds_programs_on_path() {
        #[cfg(unix)]
        assert!(locate_encoder("sh").is_some());
        assert!(locate_encoder("skyframe-no-such-encoder").is_none());
    }
}
