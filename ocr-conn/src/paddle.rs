//! PaddleOCR-json engine processes driven over stdin/stdout JSON lines.
//!
//! Engines are spawned lazily up to `max_engines` and reused between calls.
//! An engine that times out, gets cancelled mid-call or reports an engine-class
//! error is killed instead of being returned to the pool, so a late reply can
//! never be read by the next caller.

use crate::error::RecognitionError;
use crate::preprocess;
use crate::raster::NormalizedImage;
use crate::recognizer::{BoundingBox, RecognitionRequest, Recognizer, Token, TokenSink};
use async_trait::async_trait;
use base64::Engine as _;
use crossbeam::channel::{bounded, Receiver, RecvTimeoutError};
use parking_lot::Mutex;
use serde::Deserialize;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Write};
use std::path::PathBuf;
use std::process::{Child, Command, Stdio};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CIRCUIT_MAX_CONSECUTIVE_FAILURES: u32 = 5;
const CIRCUIT_COOLDOWN_SECS: u64 = 30;
const SLOW_CALL_WARN_THRESHOLD_MS: u128 = 8_000;
const STDERR_TAIL_LINES: usize = 200;
const POLL_INTERVAL: Duration = Duration::from_millis(50);
const BANNER_DRAIN: Duration = Duration::from_millis(200);

/// PaddleOCR-json reply codes.
pub mod reply_code {
    pub const OK_WITH_TEXT: u32 = 100;
    pub const OK_NO_TEXT: u32 = 101;

    #[inline]
    pub fn is_success(code: u32) -> bool {
        matches!(code, OK_WITH_TEXT | OK_NO_TEXT)
    }

    /// Problems with the submitted image; the engine itself is healthy.
    #[inline]
    pub fn is_data_error(code: u32) -> bool {
        matches!(code, 200..=217 | 300..=301)
    }

    pub fn description(code: u32) -> &'static str {
        match code {
            100 => "text recognized",
            101 => "no text found",
            200 => "image path does not exist",
            201 => "path encoding failed",
            202 => "file could not be opened",
            203 => "image could not be decoded",
            210..=217 => "clipboard error",
            300 => "base64 parse failed",
            301 => "base64 image decode failed",
            400 => "json serialization failed",
            401 => "json parse failed",
            402 => "json key missing",
            403 => "no valid task",
            _ => "unknown error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PaddleOptions {
    pub work_dir: PathBuf,
    pub binary: Option<PathBuf>,
    pub lib_path: Option<PathBuf>,
    pub max_engines: usize,
    pub enhance_contrast: bool,
}

impl Default for PaddleOptions {
    fn default() -> Self {
        Self {
            work_dir: PathBuf::from("ocr"),
            binary: None,
            lib_path: None,
            max_engines: (num_cpus::get() / 2).max(1),
            enhance_contrast: true,
        }
    }
}

impl PaddleOptions {
    fn binary_path(&self) -> PathBuf {
        self.binary
            .clone()
            .unwrap_or_else(|| self.work_dir.join("PaddleOCR-json"))
    }

    fn lib_path(&self) -> PathBuf {
        self.lib_path.clone().unwrap_or_else(|| self.work_dir.join("lib"))
    }
}

#[derive(Deserialize, Debug)]
struct EngineReply {
    code: u32,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Deserialize, Debug)]
struct EngineBox {
    #[serde(rename = "box")]
    rect: [[f64; 2]; 4],
    score: f64,
    text: String,
}

/// Why a single engine call did not produce tokens.
#[derive(Debug, PartialEq, Eq)]
enum CallFault {
    Timeout,
    Cancelled,
    /// The engine rejected the image. It stays usable.
    Data(String),
    /// The engine is unhealthy and must be replaced.
    Engine(String),
}

impl CallFault {
    fn poisons_engine(&self) -> bool {
        !matches!(self, CallFault::Data(_))
    }

    fn into_recognition_error(self) -> RecognitionError {
        match self {
            CallFault::Timeout => RecognitionError::Timeout,
            CallFault::Cancelled => RecognitionError::Cancelled,
            CallFault::Data(detail) | CallFault::Engine(detail) => RecognitionError::Backend(detail),
        }
    }
}

fn parse_reply(line: &str) -> Result<Vec<Token>, CallFault> {
    let reply: EngineReply = serde_json::from_str(line)
        .map_err(|e| CallFault::Engine(format!("unparseable engine reply: {e}")))?;

    if reply_code::is_success(reply.code) {
        if reply.code == reply_code::OK_NO_TEXT {
            return Ok(Vec::new());
        }
        let boxes: Vec<EngineBox> = serde_json::from_value(reply.data)
            .map_err(|e| CallFault::Engine(format!("malformed engine boxes: {e}")))?;
        return Ok(boxes
            .into_iter()
            .filter_map(|b| {
                let bbox = BoundingBox::from_points(&b.rect)?;
                let confidence = if b.score.is_finite() {
                    b.score.clamp(0.0, 1.0) as f32
                } else {
                    0.0
                };
                Some(Token::new(b.text, bbox, confidence))
            })
            .collect());
    }

    let detail = format!(
        "engine code {}: {} ({})",
        reply.code,
        reply_code::description(reply.code),
        reply.data.as_str().unwrap_or("no detail")
    );
    if reply_code::is_data_error(reply.code) {
        Err(CallFault::Data(detail))
    } else {
        Err(CallFault::Engine(detail))
    }
}

struct EngineProcess {
    id: u64,
    child: Child,
    lines: Receiver<String>,
    stderr_tail: Arc<Mutex<VecDeque<String>>>,
}

impl EngineProcess {
    fn spawn(id: u64, options: &PaddleOptions) -> io::Result<Self> {
        let mut child = Command::new(options.binary_path())
            .env("LD_LIBRARY_PATH", options.lib_path())
            .current_dir(&options.work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "engine stdout not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "engine stderr not piped"))?;

        let (sender, lines) = bounded::<String>(64);
        std::thread::Builder::new()
            .name(format!("paddle-{id}-stdout"))
            .spawn(move || {
                let mut reader = BufReader::new(stdout);
                let mut line = String::new();
                while matches!(reader.read_line(&mut line), Ok(n) if n > 0) {
                    if sender.send(std::mem::take(&mut line)).is_err() {
                        break;
                    }
                }
            })?;

        let stderr_tail = Arc::new(Mutex::new(VecDeque::with_capacity(STDERR_TAIL_LINES)));
        let tail = stderr_tail.clone();
        std::thread::Builder::new()
            .name(format!("paddle-{id}-stderr"))
            .spawn(move || {
                let mut reader = BufReader::new(stderr);
                let mut line = String::new();
                while matches!(reader.read_line(&mut line), Ok(n) if n > 0) {
                    let mut buf = tail.lock();
                    if buf.len() >= STDERR_TAIL_LINES {
                        buf.pop_front();
                    }
                    buf.push_back(line.trim_end().to_string());
                    line.clear();
                }
            })?;

        // version banner and model loading chatter
        while lines.recv_timeout(BANNER_DRAIN).is_ok() {}

        Ok(Self {
            id,
            child,
            lines,
            stderr_tail,
        })
    }

    fn is_running(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(None))
    }

    fn stderr_summary(&self, lines: usize) -> String {
        let buf = self.stderr_tail.lock();
        let skip = buf.len().saturating_sub(lines);
        buf.iter().skip(skip).cloned().collect::<Vec<_>>().join(" | ")
    }

    fn call(
        &mut self,
        png: &[u8],
        deadline: Instant,
        cancel: &CancellationToken,
    ) -> Result<Vec<Token>, CallFault> {
        let payload = serde_json::json!({
            "image_base64": base64::engine::general_purpose::STANDARD.encode(png),
        });
        let stdin = self
            .child
            .stdin
            .as_mut()
            .ok_or_else(|| CallFault::Engine("engine stdin not piped".into()))?;
        writeln!(stdin, "{payload}")
            .and_then(|_| stdin.flush())
            .map_err(|e| CallFault::Engine(format!("write to engine failed: {e}")))?;

        loop {
            if cancel.is_cancelled() {
                return Err(CallFault::Cancelled);
            }
            let now = Instant::now();
            if now >= deadline {
                return Err(CallFault::Timeout);
            }
            let wait = (deadline - now).min(POLL_INTERVAL);
            match self.lines.recv_timeout(wait) {
                // skip log lines the engine prints between replies
                Ok(line) if !line.trim_start().starts_with('{') => continue,
                Ok(line) => return parse_reply(&line),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(CallFault::Engine(format!(
                        "engine exited; stderr: {}",
                        self.stderr_summary(20)
                    )))
                }
            }
        }
    }
}

impl Drop for EngineProcess {
    fn drop(&mut self) {
        self.child.kill().ok();
        self.child.wait().ok();
    }
}

#[derive(Debug, Default)]
struct CircuitState {
    consecutive_failures: u32,
    open_until: Option<Instant>,
}

struct PoolInner {
    options: PaddleOptions,
    idle: Mutex<Vec<EngineProcess>>,
    circuit: Mutex<CircuitState>,
    next_engine_id: AtomicU64,
    engines_started: AtomicU64,
    engine_failures: AtomicU64,
}

impl PoolInner {
    fn ensure_circuit_allows(&self) -> Result<(), RecognitionError> {
        let mut circuit = self.circuit.lock();
        if let Some(until) = circuit.open_until {
            let now = Instant::now();
            if until > now {
                let secs = until.saturating_duration_since(now).as_secs().max(1);
                return Err(RecognitionError::Backend(format!(
                    "engine pool circuit open; retry after {secs}s"
                )));
            }
            circuit.open_until = None;
            circuit.consecutive_failures = 0;
            info!(target: "ocr.paddle", event = "paddle.circuit_closed");
        }
        Ok(())
    }

    fn record_success(&self) {
        let mut circuit = self.circuit.lock();
        circuit.consecutive_failures = 0;
        circuit.open_until = None;
    }

    fn record_failure(&self) {
        self.engine_failures.fetch_add(1, Ordering::Relaxed);
        let mut circuit = self.circuit.lock();
        circuit.consecutive_failures = circuit.consecutive_failures.saturating_add(1);
        if circuit.consecutive_failures >= CIRCUIT_MAX_CONSECUTIVE_FAILURES {
            circuit.open_until = Some(Instant::now() + Duration::from_secs(CIRCUIT_COOLDOWN_SECS));
            circuit.consecutive_failures = 0;
            warn!(
                target: "ocr.paddle",
                event = "paddle.circuit_opened",
                cooldown_secs = CIRCUIT_COOLDOWN_SECS,
            );
        }
    }

    fn checkout(&self) -> io::Result<EngineProcess> {
        loop {
            let candidate = self.idle.lock().pop();
            match candidate {
                Some(mut engine) => {
                    if engine.is_running() {
                        return Ok(engine);
                    }
                    warn!(target: "ocr.paddle", event = "paddle.engine_exited", engine_id = engine.id);
                }
                None => break,
            }
        }
        let id = self.next_engine_id.fetch_add(1, Ordering::Relaxed);
        let engine = EngineProcess::spawn(id, &self.options)?;
        let started = self.engines_started.fetch_add(1, Ordering::Relaxed) + 1;
        info!(
            target: "ocr.paddle",
            event = "paddle.engine_started",
            engine_id = id,
            total_started = started,
        );
        Ok(engine)
    }
}

/// Holds a pool slot and, once checked out, an engine. Healthy engines go back
/// to the idle list on drop; poisoned ones are dropped and killed.
struct EngineLease {
    pool: Arc<PoolInner>,
    engine: Option<EngineProcess>,
    _permit: OwnedSemaphorePermit,
}

impl EngineLease {
    fn run(&mut self, png: &[u8], deadline: Instant, cancel: &CancellationToken) -> Result<Vec<Token>, CallFault> {
        if self.engine.is_none() {
            let engine = self
                .pool
                .checkout()
                .map_err(|e| CallFault::Engine(format!("spawn engine failed: {e}")))?;
            self.engine = Some(engine);
        }
        let Some(engine) = self.engine.as_mut() else {
            return Err(CallFault::Engine("no engine checked out".into()));
        };

        let started = Instant::now();
        let result = engine.call(png, deadline, cancel);
        let elapsed = started.elapsed();
        if elapsed.as_millis() > SLOW_CALL_WARN_THRESHOLD_MS {
            warn!(
                target: "ocr.paddle",
                event = "paddle.slow_call",
                engine_id = engine.id,
                duration_ms = elapsed.as_millis() as u64,
            );
        }

        if let Err(fault) = &result {
            if fault.poisons_engine() {
                warn!(
                    target: "ocr.paddle",
                    event = "paddle.engine_discarded",
                    engine_id = engine.id,
                    reason = ?fault,
                    stderr = %engine.stderr_summary(20),
                );
                self.engine = None;
            }
        }
        result
    }
}

impl Drop for EngineLease {
    fn drop(&mut self) {
        if let Some(engine) = self.engine.take() {
            self.pool.idle.lock().push(engine);
        }
    }
}

/// Recognizer backed by a pool of local PaddleOCR-json processes.
pub struct PaddleRecognizer {
    inner: Arc<PoolInner>,
    permits: Arc<Semaphore>,
}

impl PaddleRecognizer {
    pub fn new(options: PaddleOptions) -> Self {
        let capacity = options.max_engines.clamp(1, 128);
        Self {
            inner: Arc::new(PoolInner {
                options,
                idle: Mutex::new(Vec::with_capacity(capacity)),
                circuit: Mutex::new(CircuitState::default()),
                next_engine_id: AtomicU64::new(1),
                engines_started: AtomicU64::new(0),
                engine_failures: AtomicU64::new(0),
            }),
            permits: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn engines_started(&self) -> u64 {
        self.inner.engines_started.load(Ordering::Relaxed)
    }

    pub fn engine_failures(&self) -> u64 {
        self.inner.engine_failures.load(Ordering::Relaxed)
    }

    async fn lease(&self, request: &RecognitionRequest) -> Result<EngineLease, RecognitionError> {
        let permit = tokio::select! {
            permit = self.permits.clone().acquire_owned() => {
                permit.map_err(|e| RecognitionError::backend(format!("engine pool closed: {e}")))?
            }
            _ = tokio::time::sleep_until(request.deadline) => return Err(RecognitionError::Timeout),
            _ = request.cancel.cancelled() => return Err(RecognitionError::Cancelled),
        };
        Ok(EngineLease {
            pool: self.inner.clone(),
            engine: None,
            _permit: permit,
        })
    }
}

#[async_trait]
impl Recognizer for PaddleRecognizer {
    fn name(&self) -> &'static str {
        "paddle"
    }

    async fn warm_up(&self) -> Result<(), RecognitionError> {
        let inner = self.inner.clone();
        let engine = tokio::task::spawn_blocking(move || inner.checkout())
            .await
            .map_err(RecognitionError::backend)?
            .map_err(|e| RecognitionError::backend(format!("spawn engine failed: {e}")))?;
        self.inner.idle.lock().push(engine);
        Ok(())
    }

    async fn recognize(
        &self,
        image: Arc<NormalizedImage>,
        request: RecognitionRequest,
        sink: TokenSink,
    ) -> Result<(), RecognitionError> {
        self.inner.ensure_circuit_allows()?;
        let mut lease = self.lease(&request).await?;
        if request.language != "eng" {
            debug!(
                target: "ocr.paddle",
                event = "paddle.language_ignored",
                language = %request.language,
            );
        }

        let enhance = self.inner.options.enhance_contrast;
        let deadline = request.deadline.into_std();
        let cancel = request.cancel.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            let png = preprocess::engine_payload(&image, enhance)
                .map_err(|e| CallFault::Engine(format!("png encode failed: {e}")))?;
            lease.run(&png, deadline, &cancel)
        })
        .await
        .map_err(|e| RecognitionError::backend(format!("engine worker panicked: {e}")))?;

        match outcome {
            Ok(tokens) => {
                self.inner.record_success();
                debug!(target: "ocr.paddle", event = "paddle.recognized", tokens = tokens.len());
                sink.extend(tokens);
                Ok(())
            }
            Err(fault) => {
                if matches!(fault, CallFault::Engine(_)) {
                    self.inner.record_failure();
                }
                Err(fault.into_recognition_error())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raster::{ColorMode, SourceFormat};

    #[test]
    fn parses_recognized_boxes() {
        let line = r#"{"code":100,"data":[{"box":[[10,20],[110,22],[110,40],[10,38]],"score":0.97,"text":"Invoice"},{"box":[[5,60],[50,60],[50,80],[5,80]],"score":1.4,"text":"No. 7"}]}"#;
        let tokens = parse_reply(line).unwrap();
        assert_eq!(tokens.len(), 2);
        assert_eq!(tokens[0].text, "Invoice");
        assert_eq!(tokens[0].bbox, BoundingBox::new(10, 20, 100, 20));
        assert!((tokens[0].confidence - 0.97).abs() < 1e-6);
        assert_eq!(tokens[1].confidence, 1.0);
    }

    #[test]
    fn no_text_is_empty_success() {
        let tokens = parse_reply(r#"{"code":101,"data":"No text found in image."}"#).unwrap();
        assert!(tokens.is_empty());
    }

    #[test]
    fn data_errors_keep_engine() {
        let fault = parse_reply(r#"{"code":203,"data":"cv::imread failed"}"#).unwrap_err();
        assert!(matches!(fault, CallFault::Data(_)));
        assert!(!fault.poisons_engine());
    }

    #[test]
    fn engine_errors_poison_engine() {
        let fault = parse_reply(r#"{"code":401,"data":"bad json"}"#).unwrap_err();
        assert!(matches!(fault, CallFault::Engine(_)));
        assert!(fault.poisons_engine());
        assert!(parse_reply("{not json").unwrap_err().poisons_engine());
        assert!(CallFault::Timeout.poisons_engine());
    }

    #[test]
    fn circuit_opens_after_consecutive_failures() {
        let recognizer = PaddleRecognizer::new(PaddleOptions::default());
        for _ in 0..CIRCUIT_MAX_CONSECUTIVE_FAILURES {
            assert!(recognizer.inner.ensure_circuit_allows().is_ok());
            recognizer.inner.record_failure();
        }
        assert!(matches!(
            recognizer.inner.ensure_circuit_allows(),
            Err(RecognitionError::Backend(_))
        ));
        assert_eq!(recognizer.engine_failures(), CIRCUIT_MAX_CONSECUTIVE_FAILURES as u64);
    }

    #[tokio::test]
    async fn missing_binary_is_backend_error() {
        let dir = std::env::temp_dir().join("ocr-conn-missing-engine");
        let recognizer = PaddleRecognizer::new(PaddleOptions {
            work_dir: std::env::temp_dir(),
            binary: Some(dir.join("PaddleOCR-json")),
            max_engines: 1,
            ..PaddleOptions::default()
        });
        let image = NormalizedImage::new(vec![255; 16], 4, 4, ColorMode::Luma8, SourceFormat::Png)
            .unwrap();
        let request = RecognitionRequest::new(
            "eng",
            tokio::time::Instant::now() + Duration::from_secs(2),
        );
        let err = recognizer
            .recognize(Arc::new(image), request, TokenSink::new())
            .await
            .unwrap_err();
        assert!(matches!(err, RecognitionError::Backend(_)));
        assert_eq!(recognizer.engines_started(), 0);
    }
}
