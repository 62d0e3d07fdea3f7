//! Web sink: serves the latest processed frame over HTTP from memory.
//!
//! Routes:
//! - `GET {image_path}`: latest frame as PNG, 503 before the first frame
//! - `GET /status`: JSON with uptime, frames served and last-frame metadata
//! - `GET /`: small auto-refreshing page embedding the image
//!
//! The PNG is encoded once per generation on the delivery thread and shared
//! with every request through an atomically swapped `Arc`, so a response
//! always carries one complete frame. At most `max_connections` requests are
//! handled at once; further clients get an immediate 503.

use anyhow::{anyhow, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use crate::frame::{Generational, Latest, LatestFrame, ProcessedFrame};
use crate::sink::file::{encode_image, OutputFormat};
use crate::sink::{
    DeliveryOutcome, GenerationGate, Sink, SinkError, SinkKind, SinkState, SinkStats, SinkStatus,
    StateCell,
};

const MAX_REQUEST_BYTES: usize = 8192;
const DEFAULT_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_IMAGE_PATH: &str = "/latest.png";
const DEFAULT_SHUTDOWN_TIMEOUT_MS: u64 = 2000;
const DEFAULT_REFRESH_SECS: u32 = 10;
const DEFAULT_MAX_CONNECTIONS: usize = 32;
const ACCEPT_IDLE: Duration = Duration::from_millis(50);
const ACCEPT_BACKOFF: Duration = Duration::from_millis(200);
const REFUSE_WRITE_TIMEOUT: Duration = Duration::from_millis(200);

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct WebSinkConfig {
    #[serde(default = "default_addr")]
    pub addr: String,
    #[serde(default = "default_image_path")]
    pub image_path: String,
    /// How long `stop` waits for in-flight responses.
    #[serde(default = "default_shutdown_timeout_ms")]
    pub shutdown_timeout_ms: u64,
    /// Refresh interval of the HTML page.
    #[serde(default = "default_refresh_secs")]
    pub refresh_secs: u32,
    /// Requests handled concurrently before new clients are refused.
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

fn default_addr() -> String {
    DEFAULT_ADDR.to_string()
}

fn default_image_path() -> String {
    DEFAULT_IMAGE_PATH.to_string()
}

fn default_shutdown_timeout_ms() -> u64 {
    DEFAULT_SHUTDOWN_TIMEOUT_MS
}

fn default_refresh_secs() -> u32 {
    DEFAULT_REFRESH_SECS
}

fn default_max_connections() -> usize {
    DEFAULT_MAX_CONNECTIONS
}

impl Default for WebSinkConfig {
    fn default() -> Self {
        Self {
            addr: default_addr(),
            image_path: default_image_path(),
            shutdown_timeout_ms: DEFAULT_SHUTDOWN_TIMEOUT_MS,
            refresh_secs: DEFAULT_REFRESH_SECS,
            max_connections: DEFAULT_MAX_CONNECTIONS,
        }
    }
}

impl WebSinkConfig {
    pub fn with_addr(addr: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            ..Self::default()
        }
    }

    pub fn validate(&self) -> Result<(), SinkError> {
        self.addr
            .parse::<SocketAddr>()
            .map_err(|e| SinkError::Config(format!("web sink addr '{}': {}", self.addr, e)))?;
        if !self.image_path.starts_with('/') {
            return Err(SinkError::Config(format!(
                "web sink image_path '{}' must start with '/'",
                self.image_path
            )));
        }
        if self.max_connections == 0 {
            return Err(SinkError::Config(
                "web sink max_connections must be at least 1".to_string(),
            ));
        }
        if self.image_path == "/status" || self.image_path == "/" {
            return Err(SinkError::Config(format!(
                "web sink image_path '{}' collides with a built-in route",
                self.image_path
            )));
        }
        Ok(())
    }
}

/// A frame already encoded for HTTP.
#[derive(Debug)]
struct EncodedFrame {
    png: Vec<u8>,
    generation: u64,
    width: u32,
    height: u32,
    captured_at: SystemTime,
    produced_at: SystemTime,
}

impl Generational for EncodedFrame {
    fn generation(&self) -> u64 {
        self.generation
    }
}

impl EncodedFrame {
    fn encode(frame: &ProcessedFrame) -> Result<Self, SinkError> {
        Ok(Self {
            png: encode_image(frame, OutputFormat::Png)?,
            generation: frame.generation,
            width: frame.width(),
            height: frame.height(),
            captured_at: frame.captured_at,
            produced_at: frame.produced_at,
        })
    }
}

#[derive(Serialize)]
struct LastFrameBody {
    width: u32,
    height: u32,
    generation: u64,
    timestamp: String,
    produced_at: String,
}

#[derive(Serialize)]
struct StatusBody {
    uptime_seconds: u64,
    frames_served: u64,
    last_frame: Option<LastFrameBody>,
}

/// State shared between the sink, its accept loop and request threads.
struct ServeShared {
    config: WebSinkConfig,
    encoded: Latest<EncodedFrame>,
    frames_served: AtomicU64,
    refused: AtomicU64,
    in_flight: AtomicUsize,
    started: Mutex<Option<Instant>>,
    state: StateCell,
    stats: SinkStats,
}

struct ServerHandle {
    addr: SocketAddr,
    shutdown: Arc<AtomicBool>,
    join: Option<JoinHandle<()>>,
}

pub struct WebSink {
    latest: LatestFrame,
    shared: Arc<ServeShared>,
    gate: GenerationGate,
    server: Mutex<Option<ServerHandle>>,
}

impl WebSink {
    pub fn new(config: WebSinkConfig, latest: LatestFrame) -> Self {
        Self {
            latest,
            shared: Arc::new(ServeShared {
                config,
                encoded: Latest::new(),
                frames_served: AtomicU64::new(0),
                refused: AtomicU64::new(0),
                in_flight: AtomicUsize::new(0),
                started: Mutex::new(None),
                state: StateCell::new(),
                stats: SinkStats::default(),
            }),
            gate: GenerationGate::default(),
            server: Mutex::new(None),
        }
    }

    /// Bound address while serving.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.server
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|server| server.addr)
    }

    pub fn frames_served(&self) -> u64 {
        self.shared.frames_served.load(Ordering::SeqCst)
    }

    fn publish(&self, frame: &ProcessedFrame) -> DeliveryOutcome {
        match EncodedFrame::encode(frame) {
            Ok(encoded) => {
                self.shared.encoded.publish(Arc::new(encoded));
                DeliveryOutcome::Delivered
            }
            Err(err) => DeliveryOutcome::Failed(err.to_string()),
        }
    }

    fn bind(&self) -> Result<ServerHandle, SinkError> {
        let addr: SocketAddr = self.shared.config.addr.parse().map_err(|e| {
            SinkError::Config(format!("web sink addr '{}': {}", self.shared.config.addr, e))
        })?;
        let listener = TcpListener::bind(addr)
            .map_err(|e| SinkError::Bind(format!("{}: {}", addr, e)))?;
        let addr = listener.local_addr()?;
        listener.set_nonblocking(true)?;

        let shutdown = Arc::new(AtomicBool::new(false));
        let shutdown_thread = shutdown.clone();
        let shared = Arc::clone(&self.shared);
        let join = std::thread::Builder::new()
            .name("web-sink".to_string())
            .spawn(move || {
                let result = run_server(listener, &shared, &shutdown_thread);
                server_exited(&shared, result);
            })?;
        Ok(ServerHandle {
            addr,
            shutdown,
            join: Some(join),
        })
    }
}

impl Sink for WebSink {
    fn kind(&self) -> SinkKind {
        SinkKind::Web
    }

    fn start(&self) -> Result<(), SinkError> {
        self.shared.config.validate()?;
        if let Err(state) = self
            .shared
            .state
            .transition(SinkKind::Web, SinkState::Stopped, SinkState::Starting)
        {
            return Err(SinkError::State(format!("web sink is {:?}", state)));
        }
        let server = match self.bind() {
            Ok(server) => server,
            Err(err) => {
                log::error!("web sink: {}", err);
                self.shared.stats.set_error(err.to_string());
                self.shared.state.set(SinkKind::Web, SinkState::Stopped);
                return Err(err);
            }
        };
        log::info!(
            "web sink: serving http://{}{}",
            server.addr,
            self.shared.config.image_path
        );
        *self.server.lock().unwrap_or_else(PoisonError::into_inner) = Some(server);
        *self
            .shared
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());
        self.shared.stats.clear_error();
        self.shared.state.set(SinkKind::Web, SinkState::Serving);

        // a restarted sink picks up the frame that is already current
        if let Some(frame) = self.latest.load() {
            if self.gate.admit(frame.generation) {
                let outcome = self.publish(&frame);
                self.shared.stats.record(SinkKind::Web, frame.generation, &outcome);
            }
        }
        Ok(())
    }

    fn stop(&self) {
        let server = self.server.lock().unwrap_or_else(PoisonError::into_inner).take();
        let Some(mut server) = server else {
            self.shared.state.set(SinkKind::Web, SinkState::Stopped);
            return;
        };
        self.shared.state.set(SinkKind::Web, SinkState::Stopping);
        server.shutdown.store(true, Ordering::SeqCst);
        if let Some(join) = server.join.take() {
            if join.join().is_err() {
                log::error!("web sink: accept thread panicked");
            }
        }

        let deadline =
            Instant::now() + Duration::from_millis(self.shared.config.shutdown_timeout_ms);
        while self.shared.in_flight.load(Ordering::SeqCst) > 0 {
            if Instant::now() >= deadline {
                log::warn!(
                    "web sink: {} responses still in flight at shutdown",
                    self.shared.in_flight.load(Ordering::SeqCst)
                );
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        *self
            .shared
            .started
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = None;
        self.shared.state.set(SinkKind::Web, SinkState::Stopped);
        log::info!("web sink: stopped listening on {}", server.addr);
    }

    fn deliver(&self, frame: &Arc<ProcessedFrame>) -> DeliveryOutcome {
        let outcome = if self.shared.state.get() != SinkState::Serving {
            DeliveryOutcome::Skipped("web sink not serving".to_string())
        } else if !self.gate.admit(frame.generation) {
            DeliveryOutcome::Skipped(format!("generation {} is stale", frame.generation))
        } else {
            self.publish(frame)
        };
        self.shared.stats.record(SinkKind::Web, frame.generation, &outcome);
        outcome
    }

    fn status(&self) -> SinkStatus {
        self.shared.stats.snapshot(
            SinkKind::Web,
            self.shared.state.get(),
            serde_json::json!({
                "addr": self.local_addr().map(|a| a.to_string()),
                "image_path": self.shared.config.image_path,
                "frames_served": self.frames_served(),
                "in_flight": self.shared.in_flight.load(Ordering::SeqCst),
                "refused": self.shared.refused.load(Ordering::SeqCst),
                "serving_generation": self.shared.encoded.generation(),
            }),
        )
    }
}

impl Drop for WebSink {
    fn drop(&mut self) {
        self.stop();
    }
}

fn run_server(listener: TcpListener, shared: &Arc<ServeShared>, shutdown: &AtomicBool) -> Result<()> {
    while !shutdown.load(Ordering::SeqCst) {
        let stream = match listener.accept() {
            Ok((stream, _)) => stream,
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(ACCEPT_IDLE);
                continue;
            }
            Err(err) if accept_is_transient(&err) => {
                log::warn!("web sink: accept failed, retrying: {}", err);
                std::thread::sleep(ACCEPT_BACKOFF);
                continue;
            }
            Err(err) => return Err(anyhow!("accept: {}", err)),
        };

        if shared.in_flight.load(Ordering::SeqCst) >= shared.config.max_connections {
            shared.refused.fetch_add(1, Ordering::SeqCst);
            if let Err(err) = refuse(stream) {
                log::debug!("web sink: refusing connection: {}", err);
            }
            continue;
        }

        // counted before the thread exists so stop() cannot miss it
        shared.in_flight.fetch_add(1, Ordering::SeqCst);
        let conn_shared = Arc::clone(shared);
        let spawned = std::thread::Builder::new()
            .name("web-sink-conn".to_string())
            .spawn(move || {
                let _guard = InFlightGuard(&conn_shared.in_flight);
                if let Err(err) = handle_connection(stream, &conn_shared) {
                    log::debug!("web sink: request failed: {}", err);
                }
            });
        if let Err(err) = spawned {
            shared.in_flight.fetch_sub(1, Ordering::SeqCst);
            log::warn!("web sink: cannot spawn request thread: {}", err);
        }
    }
    Ok(())
}

/// Accept errors that concern one connection or a passing shortage of
/// descriptors or memory, not the listener.
fn accept_is_transient(err: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    matches!(
        err.kind(),
        ErrorKind::ConnectionAborted
            | ErrorKind::ConnectionReset
            | ErrorKind::Interrupted
            | ErrorKind::TimedOut
    ) || out_of_resources(err)
}

#[cfg(unix)]
fn out_of_resources(err: &std::io::Error) -> bool {
    matches!(
        err.raw_os_error(),
        Some(libc::EMFILE | libc::ENFILE | libc::ENOBUFS | libc::ENOMEM)
    )
}

#[cfg(not(unix))]
fn out_of_resources(_err: &std::io::Error) -> bool {
    false
}

/// Records why the accept loop ended. A loop that died on its own leaves the
/// sink `Stopped` with the error, never `Serving`.
fn server_exited(shared: &ServeShared, result: Result<()>) {
    match result {
        Ok(()) => log::debug!("web sink: accept loop stopped"),
        Err(err) => {
            log::error!("web sink: server stopped: {}", err);
            shared.stats.set_error(err.to_string());
            shared.state.set(SinkKind::Web, SinkState::Stopped);
        }
    }
}

fn refuse(mut stream: TcpStream) -> Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_write_timeout(Some(REFUSE_WRITE_TIMEOUT))?;
    write_json_response(&mut stream, 503, r#"{"error":"too_many_connections"}"#)
}

/// Releases an in-flight slot taken by the accept loop.
struct InFlightGuard<'a>(&'a AtomicUsize);

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

fn handle_connection(mut stream: TcpStream, shared: &ServeShared) -> Result<()> {
    stream.set_nonblocking(false)?;
    let request = read_request(&mut stream)?;
    if request.method != "GET" {
        return write_json_response(&mut stream, 405, r#"{"error":"method_not_allowed"}"#);
    }

    let config = &shared.config;
    if request.path == config.image_path {
        return match shared.encoded.load() {
            Some(frame) => {
                write_response(&mut stream, 200, "image/png", &frame.png)?;
                shared.frames_served.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => write_json_response(&mut stream, 503, r#"{"error":"no_frame_yet"}"#),
        };
    }
    match request.path.as_str() {
        "/status" => {
            let body = status_body(shared);
            let payload = serde_json::to_vec(&body)?;
            write_response(&mut stream, 200, "application/json", &payload)
        }
        "/" => {
            let page = index_page(config);
            write_response(&mut stream, 200, "text/html; charset=utf-8", page.as_bytes())
        }
        _ => write_json_response(&mut stream, 404, r#"{"error":"not_found"}"#),
    }
}

fn status_body(shared: &ServeShared) -> StatusBody {
    let uptime_seconds = shared
        .started
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .map(|started| started.elapsed().as_secs())
        .unwrap_or(0);
    let last_frame = shared.encoded.load().map(|frame| LastFrameBody {
        width: frame.width,
        height: frame.height,
        generation: frame.generation,
        timestamp: rfc3339(frame.captured_at),
        produced_at: rfc3339(frame.produced_at),
    });
    StatusBody {
        uptime_seconds,
        frames_served: shared.frames_served.load(Ordering::SeqCst),
        last_frame,
    }
}

fn rfc3339(time: SystemTime) -> String {
    DateTime::<Utc>::from(time).to_rfc3339_opts(SecondsFormat::Millis, true)
}

fn index_page(config: &WebSinkConfig) -> String {
    format!(
        "<!doctype html>\n<html><head><meta charset=\"utf-8\">\
         <meta http-equiv=\"refresh\" content=\"{refresh}\">\
         <title>skyframe</title>\
         <style>body{{margin:0;background:#000}}img{{width:100%;height:auto}}</style>\
         </head><body><img src=\"{path}\" alt=\"latest frame\"></body></html>\n",
        refresh = config.refresh_secs.max(1),
        path = config.image_path
    )
}

fn read_request(stream: &mut TcpStream) -> Result<HttpRequest> {
    stream.set_read_timeout(Some(Duration::from_secs(2)))?;
    let mut buf = [0u8; 1024];
    let mut data = Vec::new();
    loop {
        let n = stream.read(&mut buf)?;
        if n == 0 {
            break;
        }
        data.extend_from_slice(&buf[..n]);
        if data.len() > MAX_REQUEST_BYTES {
            return Err(anyhow!("request too large"));
        }
        if data.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
    }
    let text = String::from_utf8_lossy(&data);
    let mut lines = text.split("\r\n");
    let request_line = lines.next().ok_or_else(|| anyhow!("empty request"))?;
    let mut parts = request_line.split_whitespace();
    let method = parts.next().ok_or_else(|| anyhow!("missing method"))?;
    let raw_path = parts.next().ok_or_else(|| anyhow!("missing path"))?;
    let path = raw_path.split('?').next().unwrap_or(raw_path).to_string();
    Ok(HttpRequest {
        method: method.to_string(),
        path,
    })
}

fn write_json_response(stream: &mut TcpStream, status: u16, body: &str) -> Result<()> {
    write_response(stream, status, "application/json", body.as_bytes())
}

fn write_response(stream: &mut TcpStream, status: u16, content_type: &str, body: &[u8]) -> Result<()> {
    let status_line = match status {
        200 => "HTTP/1.1 200 OK",
        404 => "HTTP/1.1 404 Not Found",
        405 => "HTTP/1.1 405 Method Not Allowed",
        503 => "HTTP/1.1 503 Service Unavailable",
        _ => "HTTP/1.1 500 Internal Server Error",
    };
    let header = format!(
        "{status_line}\r\nContent-Type: {content_type}\r\nContent-Length: {len}\r\nCache-Control: no-store\r\nConnection: close\r\n\r\n",
        status_line = status_line,
        content_type = content_type,
        len = body.len()
    );
    stream.write_all(header.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()?;
    Ok(())
}

#[derive(Debug)]
struct HttpRequest {
    method: String,
    path: String,
}
