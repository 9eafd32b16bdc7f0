//! Time-series capture of control changes to CSV.
//!
//! At most one recording runs at a time. A `record` call suspends until the
//! first of three signals: the duration timer, the byte cap, or the session
//! ending. Whichever fires first stops the recording and resolves the call
//! with a summary.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use regex::{Regex, RegexBuilder};
use serde::Serialize;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::connection::{ConnectionManager, SessionObserver};
use crate::engine::{ControlUpdate, ControlValue};
use crate::error::ToolError;

/// Hard size limit of one recording file, header included.
pub const MAX_RECORDING_BYTES: u64 = 600_000;

pub const MIN_DURATION_SECS: f64 = 1.0;
pub const MAX_DURATION_SECS: f64 = 300.0;

pub const CSV_HEADER: &str = "timestamp,elapsed_ms,component,control,value,string,position,bool,min,max\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// Duration elapsed.
    Completed,
    SizeLimit,
    Disconnected,
    StreamClosed,
    /// A newer recording took over.
    Superseded,
}

#[derive(Debug, Clone, Default)]
pub struct RecordRequest {
    pub duration_secs: f64,
    pub filename: Option<String>,
    /// Case-insensitive regex over `component.control`.
    pub filter: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingSummary {
    pub events_recorded: u64,
    pub elapsed_seconds: f64,
    pub events_per_second: f64,
    pub bytes: u64,
    pub file: String,
    pub auto_stopped: bool,
    pub reason: StopReason,
    pub data: String,
}

struct Sink {
    writer: Option<BufWriter<File>>,
    body: String,
    bytes: u64,
    events: u64,
    stopping: bool,
    auto_stopped: bool,
}

struct Active {
    id: u64,
    started: Instant,
    path: PathBuf,
    sink: Arc<StdMutex<Sink>>,
    listener: CancellationToken,
    done: oneshot::Sender<RecordingSummary>,
}

struct Inner {
    manager: ConnectionManager,
    dir: PathBuf,
    byte_cap: u64,
    active: Mutex<Option<Active>>,
    next_id: AtomicU64,
}

/// Cheap to clone; every clone drives the same singleton recording.
#[derive(Clone)]
pub struct Recorder {
    inner: Arc<Inner>,
}

impl Recorder {
    pub fn new(manager: ConnectionManager, dir: impl Into<PathBuf>) -> Self {
        Self::with_byte_cap(manager, dir, MAX_RECORDING_BYTES)
    }

    pub fn with_byte_cap(manager: ConnectionManager, dir: impl Into<PathBuf>, byte_cap: u64) -> Self {
        Self {
            inner: Arc::new(Inner {
                manager,
                dir: dir.into(),
                byte_cap,
                active: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub async fn is_recording(&self) -> bool {
        self.inner.active.lock().await.is_some()
    }

    /// Record until the duration elapses, the byte cap is hit, or the session ends.
    pub async fn record(&self, request: RecordRequest) -> Result<RecordingSummary, ToolError> {
        if !(MIN_DURATION_SECS..=MAX_DURATION_SECS).contains(&request.duration_secs) {
            return Err(ToolError::InvalidArgument(format!(
                "duration must be between {} and {} seconds",
                MIN_DURATION_SECS, MAX_DURATION_SECS
            )));
        }
        let filter = compile_filter(request.filter.as_deref())?;

        let client = self.inner.manager.ensure_connected().await?;
        self.stop(StopReason::Superseded).await;

        let path = self.inner.dir.join(sanitize_filename(request.filename.as_deref(), Utc::now()));
        let sink = open_sink(&path)?;
        let sink = Arc::new(StdMutex::new(sink));

        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);
        let started = Instant::now();
        let listener = CancellationToken::new();
        let (done_tx, mut done_rx) = oneshot::channel();

        {
            let mut active = self.inner.active.lock().await;
            if let Some(previous) = active.take() {
                // Another record call raced in between; it loses.
                self.finish(previous, StopReason::Superseded);
            }
            *active = Some(Active {
                id,
                started,
                path: path.clone(),
                sink: Arc::clone(&sink),
                listener: listener.clone(),
                done: done_tx,
            });
        }

        self.spawn_listener(id, client.subscribe(), filter, sink, started, listener);
        info!(id, path = %path.display(), duration_secs = request.duration_secs, "recording started");

        let duration = Duration::from_secs_f64(request.duration_secs);
        tokio::select! {
            summary = &mut done_rx => {
                summary.map_err(|_| ToolError::Engine("recording ended without a summary".to_string()))
            }
            _ = tokio::time::sleep(duration) => {
                self.stop_if(id, StopReason::Completed).await;
                done_rx
                    .await
                    .map_err(|_| ToolError::Engine("recording ended without a summary".to_string()))
            }
        }
    }

    /// Stop whatever recording is active.
    pub async fn stop(&self, reason: StopReason) {
        let active = self.inner.active.lock().await.take();
        if let Some(active) = active {
            self.finish(active, reason);
        }
    }

    /// Stop recording `id` if it is still the active one.
    async fn stop_if(&self, id: u64, reason: StopReason) {
        let active = {
            let mut guard = self.inner.active.lock().await;
            match guard.as_ref() {
                Some(a) if a.id == id => guard.take(),
                _ => None,
            }
        };
        if let Some(active) = active {
            self.finish(active, reason);
        }
    }

    /// Detach the listener, close the sink, and resolve the waiting call.
    fn finish(&self, active: Active, reason: StopReason) {
        active.listener.cancel();

        let elapsed = active.started.elapsed().as_secs_f64();
        let summary = match active.sink.lock() {
            Ok(mut sink) => {
                if let Some(mut writer) = sink.writer.take() {
                    if let Err(e) = writer.flush() {
                        warn!(error = %e, "failed to flush recording");
                    }
                }
                RecordingSummary {
                    events_recorded: sink.events,
                    elapsed_seconds: round2(elapsed),
                    events_per_second: if elapsed > 0.0 { round2(sink.events as f64 / elapsed) } else { 0.0 },
                    bytes: sink.bytes,
                    file: active.path.display().to_string(),
                    auto_stopped: sink.auto_stopped,
                    reason,
                    data: std::mem::take(&mut sink.body),
                }
            }
            Err(_) => RecordingSummary {
                events_recorded: 0,
                elapsed_seconds: round2(elapsed),
                events_per_second: 0.0,
                bytes: 0,
                file: active.path.display().to_string(),
                auto_stopped: false,
                reason,
                data: String::new(),
            },
        };

        info!(
            id = active.id,
            events = summary.events_recorded,
            bytes = summary.bytes,
            reason = ?reason,
            "recording stopped"
        );
        let _ = active.done.send(summary);
    }

    fn spawn_listener(
        &self,
        id: u64,
        mut updates: broadcast::Receiver<ControlUpdate>,
        filter: Option<Regex>,
        sink: Arc<StdMutex<Sink>>,
        started: Instant,
        token: CancellationToken,
    ) {
        let recorder = self.clone();
        let byte_cap = self.inner.byte_cap;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = updates.recv() => match msg {
                        Ok(update) => {
                            if filter.as_ref().is_some_and(|re| !re.is_match(&update.path())) {
                                continue;
                            }
                            let row = csv_row(&update, Utc::now(), started.elapsed());
                            if append(&sink, &row, byte_cap) == Appended::CapReached {
                                // Stop off the listener so concurrent events cannot double-stop.
                                let recorder = recorder.clone();
                                tokio::spawn(async move { recorder.stop_if(id, StopReason::SizeLimit).await });
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(id, skipped = n, "recorder lagged behind update stream");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            recorder.stop_if(id, StopReason::StreamClosed).await;
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[async_trait]
impl SessionObserver for Recorder {
    async fn session_ended(&self) {
        self.stop(StopReason::Disconnected).await;
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Appended {
    Written,
    Skipped,
    CapReached,
}

fn append(sink: &StdMutex<Sink>, row: &str, byte_cap: u64) -> Appended {
    let Ok(mut sink) = sink.lock() else {
        return Appended::Skipped;
    };
    if sink.stopping {
        return Appended::Skipped;
    }
    if sink.bytes + row.len() as u64 > byte_cap {
        sink.stopping = true;
        sink.auto_stopped = true;
        return Appended::CapReached;
    }
    if let Some(writer) = sink.writer.as_mut() {
        if let Err(e) = writer.write_all(row.as_bytes()) {
            warn!(error = %e, "failed to write recording row");
        }
    }
    sink.body.push_str(row);
    sink.bytes += row.len() as u64;
    sink.events += 1;
    Appended::Written
}

fn open_sink(path: &Path) -> Result<Sink, ToolError> {
    if let Some(dir) = path.parent() {
        std::fs::create_dir_all(dir)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    writer.write_all(CSV_HEADER.as_bytes())?;
    Ok(Sink {
        writer: Some(writer),
        body: CSV_HEADER.to_string(),
        bytes: CSV_HEADER.len() as u64,
        events: 0,
        stopping: false,
        auto_stopped: false,
    })
}

fn compile_filter(filter: Option<&str>) -> Result<Option<Regex>, ToolError> {
    filter
        .filter(|f| !f.is_empty())
        .map(|f| {
            RegexBuilder::new(f)
                .case_insensitive(true)
                .build()
                .map_err(|e| ToolError::InvalidArgument(format!("Invalid filter: {}", e)))
        })
        .transpose()
}

/// Base name only, `.csv` appended when missing.
pub fn sanitize_filename(requested: Option<&str>, now: DateTime<Utc>) -> String {
    let base = requested
        .and_then(|name| Path::new(name.trim()).file_name())
        .and_then(|name| name.to_str())
        .filter(|name| !name.is_empty() && *name != "..")
        .map(str::to_string)
        .unwrap_or_else(|| format!("recording-{}", now.format("%Y%m%dT%H%M%SZ")));

    if base.to_lowercase().ends_with(".csv") {
        base
    } else {
        format!("{}.csv", base)
    }
}

/// Quote a field only when it needs it.
fn csv_field(text: &str) -> String {
    if text.contains([',', '"', '\n', '\r']) {
        quoted(text)
    } else {
        text.to_string()
    }
}

fn quoted(text: &str) -> String {
    format!("\"{}\"", text.replace('"', "\"\""))
}

fn opt<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

fn csv_row(update: &ControlUpdate, now: DateTime<Utc>, elapsed: Duration) -> String {
    let state = &update.state;
    let value = match &state.value {
        ControlValue::Text(s) => csv_field(s),
        other => other.to_string(),
    };
    format!(
        "{},{},{},{},{},{},{},{},{},{}\n",
        now.to_rfc3339_opts(SecondsFormat::Millis, true),
        elapsed.as_millis(),
        csv_field(&update.component),
        csv_field(&update.control),
        value,
        quoted(&state.string),
        opt(state.position),
        opt(state.bool),
        opt(state.min),
        opt(state.max),
    )
}

fn round2(x: f64) -> f64 {
    (x * 100.0).round() / 100.0
}
