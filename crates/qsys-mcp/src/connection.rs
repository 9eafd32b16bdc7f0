//! Connection lifecycle for the single engine session.
//!
//! State machine:
//!
//! ```text
//!                connect / ensure_connected
//!  Disconnected ──────────────────────────────▶ Connecting ──ok──▶ Connected
//!       ▲                                           │                 │
//!       │ attempts exhausted                    err │                 │ session lost
//!       │                                           ▼                 ▼
//!       └──────────────────────────────────── Reconnecting ◀── handle_disconnect
//!                                          (backoff 1,2,4,8,16s)
//! ```
//!
//! Concurrent callers of [`ConnectionManager::ensure_connected`] share one
//! in-flight attempt. Only the automatic path retries; `ensure_connected`
//! reports the first failure to its callers.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::{BoxFuture, FutureExt, Shared};
use regex::RegexBuilder;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, RwLock as StdRwLock};
use std::time::Duration;
use tokio::sync::{broadcast, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::engine::{ConnectTarget, EngineClient, EngineConnector, EngineEvent};
use crate::error::ToolError;

/// Delay before each automatic reconnection attempt.
pub const BACKOFF_SCHEDULE: [Duration; 5] = [
    Duration::from_secs(1),
    Duration::from_secs(2),
    Duration::from_secs(4),
    Duration::from_secs(8),
    Duration::from_secs(16),
];

/// Grace period before closing a session that loaded no components.
const EMPTY_DESIGN_GRACE: Duration = Duration::from_millis(100);

#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Disconnected = 0,
    Connecting = 1,
    Connected = 2,
    Reconnecting = 3,
}

impl Phase {
    pub fn from_u8(v: u8) -> Self {
        match v {
            1 => Phase::Connecting,
            2 => Phase::Connected,
            3 => Phase::Reconnecting,
            _ => Phase::Disconnected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Disconnected => "disconnected",
            Phase::Connecting => "connecting",
            Phase::Connected => "connected",
            Phase::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Told when sessions open and end.
#[async_trait]
pub trait SessionObserver: Send + Sync {
    async fn session_started(&self, _client: Arc<dyn EngineClient>) {}

    /// Called for every ended session, whatever the cause.
    async fn session_ended(&self);
}

#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Upper bound on opening a session.
    pub handshake_timeout: Duration,
    /// Used by `ensure_connected` before any connect has succeeded.
    pub default_target: Option<ConnectTarget>,
    /// Successful connection parameters are written here.
    pub last_connection_file: Option<PathBuf>,
    /// Connect to `default_target` at startup.
    pub auto_connect: bool,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            default_target: None,
            last_connection_file: None,
            auto_connect: true,
        }
    }
}

impl ManagerConfig {
    pub fn from_config(config: &qsysconf::QsysConfig) -> Self {
        let conn = &config.connection;
        let default_target = conn.host.as_ref().map(|host| {
            ConnectTarget::new(host.clone())
                .with_port(conn.port)
                .with_secure(conn.secure)
                .with_polling_interval(Duration::from_millis(conn.polling_interval))
                .with_filter(conn.filter.clone())
        });
        Self {
            handshake_timeout: Duration::from_millis(conn.handshake_timeout_ms),
            default_target,
            last_connection_file: Some(config.paths.last_connection_file()),
            auto_connect: conn.auto_connect,
        }
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    pub fn with_default_target(mut self, target: ConnectTarget) -> Self {
        self.default_target = Some(target);
        self
    }

    pub fn with_last_connection_file(mut self, path: Option<PathBuf>) -> Self {
        self.last_connection_file = path;
        self
    }

    pub fn with_auto_connect(mut self, enabled: bool) -> Self {
        self.auto_connect = enabled;
        self
    }
}

/// Reply to a successful `connect`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectInfo {
    pub connected: bool,
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub polling_interval: u64,
    pub components_loaded: usize,
    /// Milliseconds spent opening the session.
    pub connection_time: u64,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub already_connected: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ComponentSummary {
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub control_count: usize,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusReport {
    pub connected: bool,
    pub connection_state: String,
    pub host: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub control_count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub polling_interval: Option<u64>,
    /// Milliseconds since the session opened.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub components: Option<Vec<ComponentSummary>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reconnect_attempt: Option<usize>,
}

type ConnectResult = Result<Arc<dyn EngineClient>, ToolError>;
type SharedConnect = Shared<BoxFuture<'static, ConnectResult>>;

/// What reported the loss that `handle_disconnect` reacts to.
#[derive(Debug, Clone, Copy)]
enum LossOrigin {
    /// The lifecycle watcher of session `generation`.
    Session(u64),
    /// A failed automatic attempt.
    Attempt(u64),
}

#[derive(Default)]
struct State {
    client: Option<Arc<dyn EngineClient>>,
    /// Parameters of the live or pending session.
    current: Option<ConnectTarget>,
    /// Last parameters that produced a session.
    reconnect_target: Option<ConnectTarget>,
    reconnect_attempt: usize,
    connected_at: Option<(Instant, DateTime<Utc>)>,
    generation: u64,
    attempt_seq: u64,
    in_flight: Option<(u64, SharedConnect)>,
    watcher: Option<CancellationToken>,
    backoff: Option<CancellationToken>,
}

struct Inner {
    connector: Arc<dyn EngineConnector>,
    config: ManagerConfig,
    phase: AtomicU8,
    state: Mutex<State>,
    observers: StdRwLock<Vec<Arc<dyn SessionObserver>>>,
}

/// Owns the one engine session. Cheap to clone.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(connector: Arc<dyn EngineConnector>, config: ManagerConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                config,
                phase: AtomicU8::new(Phase::Disconnected as u8),
                state: Mutex::new(State::default()),
                observers: StdRwLock::new(Vec::new()),
            }),
        }
    }

    /// Observers are told in registration order.
    pub fn add_observer(&self, observer: Arc<dyn SessionObserver>) {
        if let Ok(mut observers) = self.inner.observers.write() {
            observers.push(observer);
        }
    }

    pub fn phase(&self) -> Phase {
        Phase::from_u8(self.inner.phase.load(Ordering::SeqCst))
    }

    pub fn is_connected(&self) -> bool {
        self.phase() == Phase::Connected
    }

    pub async fn reconnect_attempt(&self) -> usize {
        self.inner.state.lock().await.reconnect_attempt
    }

    /// Increments every time a session opens.
    pub async fn generation(&self) -> u64 {
        self.inner.state.lock().await.generation
    }

    /// The live client, without connecting.
    pub async fn client(&self) -> Option<Arc<dyn EngineClient>> {
        let state = self.inner.state.lock().await;
        if self.phase() == Phase::Connected {
            state.client.clone()
        } else {
            None
        }
    }

    /// Parameters `ensure_connected` would use: the last good target, then
    /// the configured default.
    pub async fn default_target(&self) -> Option<ConnectTarget> {
        let state = self.inner.state.lock().await;
        state
            .reconnect_target
            .clone()
            .or_else(|| self.inner.config.default_target.clone())
    }

    /// Open a session to `target`, replacing any existing one.
    ///
    /// Returns immediately when already connected with identical parameters,
    /// and joins a pending attempt with identical parameters.
    pub async fn connect(&self, target: ConnectTarget) -> Result<ConnectInfo, ToolError> {
        if target.host.trim().is_empty() {
            return Err(ToolError::InvalidArgument("Host parameter is required".to_string()));
        }
        if let Some(filter) = &target.filter {
            RegexBuilder::new(filter)
                .case_insensitive(true)
                .build()
                .map_err(|e| ToolError::InvalidArgument(format!("Invalid filter: {}", e)))?;
        }

        let started = Instant::now();
        let shared = {
            let mut state = self.inner.state.lock().await;

            if self.phase() == Phase::Connected && state.current.as_ref() == Some(&target) {
                if let Some(client) = &state.client {
                    debug!(host = %target.host, "connect with identical parameters, reusing session");
                    return Ok(connect_info(&target, client.as_ref(), 0, true));
                }
            }

            let pending = state
                .in_flight
                .as_ref()
                .filter(|_| state.current.as_ref() == Some(&target))
                .map(|(_, shared)| shared.clone());
            match pending {
                Some(shared) => {
                    debug!(host = %target.host, "joining in-flight connect with identical parameters");
                    shared
                }
                None => self.restart(&mut state, target.clone()),
            }
        };

        let client = shared.await?;
        let elapsed = started.elapsed().as_millis() as u64;
        Ok(connect_info(&target, client.as_ref(), elapsed, false))
    }

    /// Drop the current session and any pending backoff, then start a fresh
    /// attempt at `target`. Caller holds the state lock.
    fn restart(&self, state: &mut State, target: ConnectTarget) -> SharedConnect {
        if let Some(token) = state.backoff.take() {
            token.cancel();
        }
        if let Some(token) = state.watcher.take() {
            token.cancel();
        }
        state.reconnect_attempt = 0;
        state.connected_at = None;
        let retiring = state.client.take();

        info!(url = %target.url(), "connecting");
        self.inner.begin_attempt(state, target, retiring).1
    }

    /// Return the live client, joining or starting a connect when there is none.
    pub async fn ensure_connected(&self) -> Result<Arc<dyn EngineClient>, ToolError> {
        let shared = {
            let mut state = self.inner.state.lock().await;
            if self.phase() == Phase::Connected {
                if let Some(client) = &state.client {
                    return Ok(Arc::clone(client));
                }
            }

            match &state.in_flight {
                Some((_, shared)) => shared.clone(),
                None => {
                    let target = state
                        .reconnect_target
                        .clone()
                        .or_else(|| self.inner.config.default_target.clone())
                        .ok_or(ToolError::MissingHost)?;
                    self.inner.begin_attempt(&mut state, target, None).1
                }
            }
        };
        shared.await
    }

    /// Connect to the configured default target in the background.
    ///
    /// Returns `None` when auto-connect is off or no host is configured.
    /// Failure is logged and otherwise ignored.
    pub fn auto_connect(&self) -> Option<JoinHandle<()>> {
        if !self.inner.config.auto_connect {
            debug!("auto-connect disabled");
            return None;
        }
        let target = self.inner.config.default_target.clone()?;
        let manager = self.clone();
        Some(tokio::spawn(async move {
            info!(host = %target.host, "auto-connecting");
            if let Err(e) = manager.connect(target).await {
                warn!(code = e.code(), error = %e, "auto-connect failed");
            }
        }))
    }

    /// Tear down the session without scheduling a reconnect.
    pub async fn disconnect(&self) -> bool {
        let retiring = {
            let mut state = self.inner.state.lock().await;
            state.attempt_seq += 1;
            state.in_flight = None;
            for token in [state.backoff.take(), state.watcher.take()].into_iter().flatten() {
                token.cancel();
            }
            state.reconnect_attempt = 0;
            state.connected_at = None;
            state.current = None;
            self.inner.set_phase(Phase::Disconnected);
            state.client.take()
        };

        let had_session = retiring.is_some();
        if let Some(client) = retiring {
            self.inner.retire(client).await;
            info!("disconnected");
        }
        had_session
    }

    pub async fn status(&self, detailed: bool) -> StatusReport {
        let state = self.inner.state.lock().await;
        let phase = self.phase();
        let target = state.current.as_ref().or(if phase == Phase::Reconnecting {
            state.reconnect_target.as_ref()
        } else {
            None
        });

        let mut report = StatusReport {
            connected: phase == Phase::Connected,
            connection_state: phase.as_str().to_string(),
            host: target.map(|t| t.host.clone()),
            port: target.map(|t| t.port),
            component_count: None,
            control_count: None,
            polling_interval: target.map(|t| t.polling_interval_ms()),
            uptime: None,
            connected_at: None,
            components: None,
            reconnect_attempt: (state.reconnect_attempt > 0).then_some(state.reconnect_attempt),
        };

        if let (Some(client), Phase::Connected) = (&state.client, phase) {
            let components = client.components();
            report.component_count = Some(components.len());
            report.control_count = Some(components.iter().map(|c| c.controls.len()).sum());
            if let Some((opened, wall)) = state.connected_at {
                report.uptime = Some(opened.elapsed().as_millis() as u64);
                report.connected_at = Some(wall);
            }
            if detailed {
                report.components = Some(
                    components
                        .into_iter()
                        .map(|c| ComponentSummary {
                            control_count: c.controls.len(),
                            name: c.name,
                            component_type: c.component_type,
                        })
                        .collect(),
                );
            }
        }
        report
    }
}

fn connect_info(
    target: &ConnectTarget,
    client: &dyn EngineClient,
    elapsed_ms: u64,
    already_connected: bool,
) -> ConnectInfo {
    ConnectInfo {
        connected: true,
        host: target.host.clone(),
        port: target.port,
        secure: target.secure,
        polling_interval: target.polling_interval_ms(),
        components_loaded: client.components().len(),
        connection_time: elapsed_ms,
        already_connected,
    }
}

impl Inner {
    fn set_phase(&self, phase: Phase) {
        let old = Phase::from_u8(self.phase.swap(phase as u8, Ordering::SeqCst));
        if old != phase {
            debug!(from = %old, to = %phase, "connection phase");
        }
    }

    /// Install a new attempt as the in-flight slot. Caller holds the state lock.
    ///
    /// The attempt runs on its own task so it completes even if every
    /// waiter goes away.
    fn begin_attempt(
        self: &Arc<Self>,
        state: &mut State,
        target: ConnectTarget,
        retiring: Option<Arc<dyn EngineClient>>,
    ) -> (u64, SharedConnect) {
        state.attempt_seq += 1;
        let id = state.attempt_seq;
        state.current = Some(target.clone());
        self.set_phase(Phase::Connecting);

        let weak = Arc::downgrade(self);
        let task = tokio::spawn(async move {
            if let (Some(old), Some(inner)) = (retiring, weak.upgrade()) {
                inner.retire(old).await;
            }
            let result = match weak.upgrade() {
                Some(inner) => inner.open(&target).await,
                None => return Err(ToolError::Engine("connection manager dropped".to_string())),
            };
            match weak.upgrade() {
                Some(inner) => inner.finish_attempt(id, target, result).await,
                None => Err(ToolError::Engine("connection manager dropped".to_string())),
            }
        });

        let shared = async move {
            task.await
                .unwrap_or_else(|e| Err(ToolError::Engine(format!("connect task failed: {}", e))))
        }
        .boxed()
        .shared();

        state.in_flight = Some((id, shared.clone()));
        (id, shared)
    }

    /// Handshake with timeout, then reject designs with nothing in them.
    async fn open(&self, target: &ConnectTarget) -> ConnectResult {
        let timeout = self.config.handshake_timeout;
        let client = match tokio::time::timeout(timeout, self.connector.connect(target)).await {
            Ok(result) => result?,
            Err(_) => {
                return Err(ToolError::Timeout {
                    host: target.host.clone(),
                    millis: timeout.as_millis() as u64,
                })
            }
        };

        if client.components().is_empty() {
            tokio::time::sleep(EMPTY_DESIGN_GRACE).await;
            let _ = client.close().await;
            return Err(match &target.filter {
                Some(filter) => ToolError::FilterNoMatch(filter.clone()),
                None => ToolError::EmptyDesign,
            });
        }
        Ok(client)
    }

    async fn finish_attempt(
        self: &Arc<Self>,
        id: u64,
        target: ConnectTarget,
        result: ConnectResult,
    ) -> ConnectResult {
        let result = result.map(|client| {
            let events = client.lifecycle();
            (client, events)
        });
        let mut state = self.state.lock().await;

        if state.attempt_seq != id {
            drop(state);
            if let Ok((client, _)) = result {
                let _ = client.close().await;
            }
            return Err(ToolError::Engine("connection attempt superseded".to_string()));
        }
        state.in_flight = None;

        match result {
            Ok((client, events)) => {
                state.generation += 1;
                state.client = Some(Arc::clone(&client));
                state.current = Some(target.clone());
                state.reconnect_target = Some(target.clone());
                state.reconnect_attempt = 0;
                state.connected_at = Some((Instant::now(), Utc::now()));
                if let Some(token) = state.backoff.take() {
                    token.cancel();
                }
                let token = CancellationToken::new();
                state.watcher = Some(token.clone());
                let generation = state.generation;
                self.set_phase(Phase::Connected);
                drop(state);

                info!(
                    host = %target.host,
                    generation,
                    components = client.components().len(),
                    "connected"
                );
                self.spawn_watcher(events, generation, token);
                self.persist(&target).await;
                for observer in self.observers() {
                    observer.session_started(Arc::clone(&client)).await;
                }
                Ok(client)
            }
            Err(err) => {
                state.client = None;
                state.current = None;
                state.connected_at = None;
                let retrying = state.backoff.as_ref().is_some_and(|t| !t.is_cancelled());
                self.set_phase(if retrying { Phase::Reconnecting } else { Phase::Disconnected });
                warn!(host = %target.host, code = err.code(), error = %err, "connect failed");
                Err(err)
            }
        }
    }

    fn spawn_watcher(self: &Arc<Self>, mut events: broadcast::Receiver<EngineEvent>, generation: u64, token: CancellationToken) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    event = events.recv() => {
                        let reason = match event {
                            Ok(EngineEvent::Disconnected) => "engine disconnected".to_string(),
                            Ok(EngineEvent::Error(message)) => message,
                            Err(broadcast::error::RecvError::Lagged(_)) => continue,
                            Err(broadcast::error::RecvError::Closed) => "lifecycle stream closed".to_string(),
                        };
                        warn!(generation, reason = %reason, "session lost");
                        if let Some(inner) = weak.upgrade() {
                            inner.handle_disconnect(LossOrigin::Session(generation)).await;
                        }
                        break;
                    }
                }
            }
        });
    }

    /// React to session loss or a failed automatic attempt.
    ///
    /// Stale signals (an older session, a superseded attempt) and repeats
    /// while already reconnecting are ignored.
    async fn handle_disconnect(self: &Arc<Self>, origin: LossOrigin) {
        let (retiring, scheduled) = {
            let mut state = self.state.lock().await;
            let phase = Phase::from_u8(self.phase.load(Ordering::SeqCst));
            let current = match origin {
                LossOrigin::Session(generation) => generation == state.generation && phase == Phase::Connected,
                LossOrigin::Attempt(id) => id == state.attempt_seq && phase != Phase::Reconnecting,
            };
            if !current {
                return;
            }

            let retiring = state.client.take();
            if let Some(token) = state.watcher.take() {
                token.cancel();
            }
            state.connected_at = None;
            state.in_flight = None;
            self.set_phase(Phase::Disconnected);

            let scheduled = if state.reconnect_attempt < BACKOFF_SCHEDULE.len() && state.reconnect_target.is_some() {
                let delay = BACKOFF_SCHEDULE[state.reconnect_attempt];
                state.reconnect_attempt += 1;
                let token = CancellationToken::new();
                state.backoff = Some(token.clone());
                self.set_phase(Phase::Reconnecting);
                Some((delay, token, state.reconnect_attempt))
            } else {
                warn!(attempts = state.reconnect_attempt, "giving up on reconnection until the next connect");
                None
            };
            (retiring, scheduled)
        };

        if let Some(client) = retiring {
            self.retire(client).await;
        }
        if let Some((delay, token, attempt)) = scheduled {
            info!(attempt, delay_secs = delay.as_secs(), "scheduling reconnect");
            self.spawn_reconnect(delay, token, attempt);
        }
    }

    fn spawn_reconnect(self: &Arc<Self>, delay: Duration, token: CancellationToken, attempt: usize) {
        let weak = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(delay) => {}
            }
            let Some(inner) = weak.upgrade() else {
                return;
            };

            let (id, shared) = {
                let mut state = inner.state.lock().await;
                if token.is_cancelled() {
                    return;
                }
                state.backoff = None;
                if let Some((id, shared)) = &state.in_flight {
                    (*id, shared.clone())
                } else if Phase::from_u8(inner.phase.load(Ordering::SeqCst)) == Phase::Reconnecting {
                    let Some(target) = state.reconnect_target.clone() else {
                        inner.set_phase(Phase::Disconnected);
                        return;
                    };
                    inner.begin_attempt(&mut state, target, None)
                } else {
                    return;
                }
            };

            debug!(attempt, "reconnect attempt");
            if let Err(e) = shared.await {
                warn!(attempt, error = %e, "reconnect attempt failed");
                inner.handle_disconnect(LossOrigin::Attempt(id)).await;
            }
        });
    }

    /// Notify observers, then close the old client. Close errors are ignored.
    async fn retire(&self, client: Arc<dyn EngineClient>) {
        self.notify_session_ended().await;
        if let Err(e) = client.close().await {
            debug!(error = %e, "ignoring close error");
        }
    }

    fn observers(&self) -> Vec<Arc<dyn SessionObserver>> {
        self.observers.read().map(|o| o.clone()).unwrap_or_default()
    }

    async fn notify_session_ended(&self) {
        for observer in self.observers() {
            observer.session_ended().await;
        }
    }

    async fn persist(&self, target: &ConnectTarget) {
        let Some(path) = self.config.last_connection_file.clone() else {
            return;
        };
        let last = qsysconf::LastConnection {
            host: target.host.clone(),
            port: target.port,
            secure: target.secure,
            polling_interval: target.polling_interval_ms(),
            filter: target.filter.clone(),
        };
        let result = tokio::task::spawn_blocking(move || qsysconf::save_last_connection(&path, &last)).await;
        match result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "could not save last connection"),
            Err(e) => warn!(error = %e, "last connection writer panicked"),
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Ok(state) = self.state.try_lock() {
            for token in [&state.watcher, &state.backoff].into_iter().flatten() {
                token.cancel();
            }
        }
    }
}
