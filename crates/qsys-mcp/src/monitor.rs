//! Per-caller control event buffers.
//!
//! Each monitor owns a ring buffer of [`MONITOR_CAPACITY`] events fed by a
//! listener on the engine update stream, filtered to the monitor's paths.
//! Reads drain the buffer, so every event is delivered at most once.
//!
//! Monitors outlive the session. When it ends, listeners detach but ids and
//! buffers stay; when a new session opens, every monitor re-resolves its
//! requested paths and re-attaches.

use async_trait::async_trait;
use serde::Serialize;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex as StdMutex};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connection::{ConnectionManager, SessionObserver};
use crate::controls;
use crate::engine::{ControlState, ControlUpdate, EngineClient};
use crate::error::ToolError;

pub const MONITOR_CAPACITY: usize = 100;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonitorEvent {
    pub path: String,
    #[serde(flatten)]
    pub state: ControlState,
    /// Unix milliseconds.
    pub time: i64,
}

impl MonitorEvent {
    fn from_update(update: ControlUpdate) -> Self {
        Self {
            path: update.path(),
            state: update.state,
            time: chrono::Utc::now().timestamp_millis(),
        }
    }
}

#[derive(Debug, Default)]
struct Buffer {
    events: VecDeque<MonitorEvent>,
    evicted: u64,
}

impl Buffer {
    fn push(&mut self, event: MonitorEvent) {
        if self.events.len() >= MONITOR_CAPACITY {
            self.events.pop_front();
            self.evicted += 1;
        }
        self.events.push_back(event);
    }

    fn drain(&mut self) -> (Vec<MonitorEvent>, u64) {
        let evicted = std::mem::take(&mut self.evicted);
        (self.events.drain(..).collect(), evicted)
    }
}

struct Session {
    /// Paths as the caller gave them, re-resolved on every new session.
    requested: Vec<String>,
    paths: Vec<String>,
    buffer: Arc<StdMutex<Buffer>>,
    listener: CancellationToken,
}

impl Session {
    fn attached(&self) -> bool {
        !self.listener.is_cancelled()
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStarted {
    pub id: String,
    pub monitoring: Vec<String>,
    /// Paths that did not resolve and are not watched.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub skipped: Vec<String>,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub replaced: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorRead {
    pub id: String,
    pub count: usize,
    pub events: Vec<MonitorEvent>,
    pub attached: bool,
    /// Events dropped from a full buffer since the previous read.
    #[serde(skip_serializing_if = "is_zero")]
    pub evicted: u64,
}

fn is_zero(n: &u64) -> bool {
    *n == 0
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MonitorStopped {
    pub id: String,
    pub stopped: bool,
    pub discarded: usize,
}

pub struct EventMonitor {
    manager: ConnectionManager,
    sessions: Mutex<HashMap<String, Session>>,
}

impl EventMonitor {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Start watching `controls` under `id`, replacing any monitor with that id.
    pub async fn start(&self, id: &str, controls: &[String]) -> Result<MonitorStarted, ToolError> {
        if id.trim().is_empty() {
            return Err(ToolError::InvalidArgument("id is required".to_string()));
        }
        if controls.is_empty() {
            return Err(ToolError::InvalidArgument("controls must not be empty".to_string()));
        }

        let client = self.manager.ensure_connected().await?;
        let (monitoring, skipped) = resolve_all(client.as_ref(), controls);

        let buffer = Arc::new(StdMutex::new(Buffer::default()));
        let listener = CancellationToken::new();
        spawn_listener(
            id.to_string(),
            client.subscribe(),
            monitoring.iter().cloned().collect(),
            Arc::clone(&buffer),
            listener.clone(),
        );

        let previous = self.sessions.lock().await.insert(
            id.to_string(),
            Session {
                requested: controls.to_vec(),
                paths: monitoring.clone(),
                buffer,
                listener,
            },
        );
        let replaced = match previous {
            Some(old) => {
                old.listener.cancel();
                true
            }
            None => false,
        };

        info!(id, paths = monitoring.len(), skipped = skipped.len(), replaced, "monitor started");
        Ok(MonitorStarted {
            id: id.to_string(),
            monitoring,
            skipped,
            replaced,
        })
    }

    /// Drain and return buffered events.
    pub async fn read(&self, id: &str) -> Result<MonitorRead, ToolError> {
        let sessions = self.sessions.lock().await;
        let session = sessions.get(id).ok_or_else(|| unknown(id, &sessions))?;
        let (events, evicted) = match session.buffer.lock() {
            Ok(mut buffer) => buffer.drain(),
            Err(_) => (Vec::new(), 0),
        };
        Ok(MonitorRead {
            id: id.to_string(),
            count: events.len(),
            events,
            attached: session.attached(),
            evicted,
        })
    }

    pub async fn stop(&self, id: &str) -> Result<MonitorStopped, ToolError> {
        let mut sessions = self.sessions.lock().await;
        let session = match sessions.remove(id) {
            Some(session) => session,
            None => return Err(unknown(id, &sessions)),
        };
        session.listener.cancel();
        let discarded = session.buffer.lock().map(|b| b.events.len()).unwrap_or(0);
        debug!(id, paths = session.paths.len(), discarded, "monitor stopped");
        Ok(MonitorStopped {
            id: id.to_string(),
            stopped: true,
            discarded,
        })
    }
}

#[async_trait]
impl SessionObserver for EventMonitor {
    async fn session_started(&self, client: Arc<dyn EngineClient>) {
        let mut sessions = self.sessions.lock().await;
        for (id, session) in sessions.iter_mut().filter(|(_, s)| !s.attached()) {
            let (monitoring, skipped) = resolve_all(client.as_ref(), &session.requested);
            session.listener = CancellationToken::new();
            spawn_listener(
                id.clone(),
                client.subscribe(),
                monitoring.iter().cloned().collect(),
                Arc::clone(&session.buffer),
                session.listener.clone(),
            );
            debug!(id = %id, paths = monitoring.len(), skipped = skipped.len(), "monitor re-attached");
            session.paths = monitoring;
        }
    }

    async fn session_ended(&self) {
        let sessions = self.sessions.lock().await;
        for session in sessions.values() {
            session.listener.cancel();
        }
        if !sessions.is_empty() {
            info!(monitors = sessions.len(), "session ended, monitors detached");
        }
    }
}

fn unknown(id: &str, sessions: &HashMap<String, Session>) -> ToolError {
    let mut known: Vec<String> = sessions.keys().cloned().collect();
    known.sort();
    ToolError::NotFound {
        what: format!("Monitor '{}'", id),
        alternatives: known,
    }
}

/// Split into canonical resolvable paths and skipped ones.
fn resolve_all(client: &dyn EngineClient, controls: &[String]) -> (Vec<String>, Vec<String>) {
    let mut monitoring = Vec::new();
    let mut skipped = Vec::new();
    for path in controls {
        match controls::resolve(client, path) {
            Ok(r) => {
                let canonical = format!("{}.{}", r.component, r.control);
                if !monitoring.contains(&canonical) {
                    monitoring.push(canonical);
                }
            }
            Err(_) => skipped.push(path.clone()),
        }
    }
    (monitoring, skipped)
}

fn spawn_listener(
    id: String,
    mut updates: broadcast::Receiver<ControlUpdate>,
    paths: HashSet<String>,
    buffer: Arc<StdMutex<Buffer>>,
    token: CancellationToken,
) {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                msg = updates.recv() => match msg {
                    Ok(update) => {
                        if !paths.contains(&update.path()) {
                            continue;
                        }
                        if let Ok(mut buffer) = buffer.lock() {
                            buffer.push(MonitorEvent::from_update(update));
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        warn!(id = %id, skipped = n, "monitor lagged behind update stream");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        debug!(id = %id, "update stream closed");
                        token.cancel();
                        break;
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::{ControlType, ControlValue, Direction};

    fn event(n: usize) -> MonitorEvent {
        MonitorEvent {
            path: "Mixer.gain".to_string(),
            state: ControlState {
                control_type: ControlType::Float,
                value: ControlValue::Number(n as f64),
                string: n.to_string(),
                position: None,
                bool: None,
                direction: Direction::ReadWrite,
                choices: None,
                min: None,
                max: None,
            },
            time: n as i64,
        }
    }

    #[test]
    fn test_buffer_evicts_oldest() {
        let mut buffer = Buffer::default();
        for n in 0..150 {
            buffer.push(event(n));
        }
        let (events, evicted) = buffer.drain();
        assert_eq!(events.len(), MONITOR_CAPACITY);
        assert_eq!(evicted, 50);
        assert_eq!(events[0].time, 50);
        assert_eq!(events[99].time, 149);
    }

    #[test]
    fn test_drain_empties() {
        let mut buffer = Buffer::default();
        buffer.push(event(1));
        assert_eq!(buffer.drain().0.len(), 1);
        let (events, evicted) = buffer.drain();
        assert!(events.is_empty());
        assert_eq!(evicted, 0);
    }

    #[test]
    fn test_event_serializes_flat() {
        let v = serde_json::to_value(event(3)).unwrap();
        assert_eq!(v["path"], "Mixer.gain");
        assert_eq!(v["value"], serde_json::json!(3.0));
        assert_eq!(v["time"], 3);
    }
}
