//! Offline design engine.
//!
//! Serves a component/control inventory loaded from a JSON design file and
//! behaves like a live engine: numeric writes clamp to the declared range,
//! locked controls ignore writes, every change is broadcast on the update
//! stream, and a session can be dropped on demand.
//!
//! ```json
//! {
//!   "components": [
//!     {
//!       "name": "Mixer",
//!       "type": "mixer",
//!       "controls": [
//!         { "name": "gain", "type": "Float", "value": -10, "min": -60, "max": 20 },
//!         { "name": "mute", "type": "Boolean", "value": false },
//!         { "name": "meter", "type": "Float", "value": -90, "direction": "Read" }
//!       ]
//!     }
//!   ]
//! }
//! ```

use async_trait::async_trait;
use regex::RegexBuilder;
use serde::Deserialize;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::debug;

use crate::engine::{
    ComponentInfo, ConnectTarget, ControlInfo, ControlState, ControlType, ControlUpdate,
    ControlValue, Direction, EngineClient, EngineConnector, EngineError, EngineEvent,
};

const UPDATE_CHANNEL_CAPACITY: usize = 1024;

/// Parsed design file.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Design {
    #[serde(default)]
    pub components: Vec<DesignComponent>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DesignComponent {
    pub name: String,
    #[serde(rename = "type", default = "DesignComponent::default_type")]
    pub component_type: String,
    #[serde(default)]
    pub controls: Vec<DesignControl>,
}

impl DesignComponent {
    fn default_type() -> String {
        "custom".to_string()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DesignControl {
    pub name: String,
    #[serde(rename = "type")]
    pub control_type: ControlType,
    #[serde(default)]
    pub value: Option<ControlValue>,
    #[serde(default = "DesignControl::default_direction")]
    pub direction: Direction,
    #[serde(default)]
    pub choices: Option<Vec<String>>,
    #[serde(default)]
    pub min: Option<f64>,
    #[serde(default)]
    pub max: Option<f64>,
    /// Writes are accepted but have no effect.
    #[serde(default)]
    pub locked: bool,
}

impl DesignControl {
    fn default_direction() -> Direction {
        Direction::ReadWrite
    }
}

impl Design {
    pub fn from_json(json: &str) -> Result<Self, EngineError> {
        serde_json::from_str(json).map_err(|e| EngineError::Design(e.to_string()))
    }

    pub fn from_path(path: &Path) -> Result<Self, EngineError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| EngineError::Design(format!("{}: {}", path.display(), e)))?;
        Self::from_json(&contents)
    }
}

struct Slot {
    name: String,
    state: ControlState,
    locked: bool,
}

struct Component {
    name: String,
    component_type: String,
    controls: Vec<Slot>,
}

/// One offline session.
pub struct OfflineEngine {
    components: RwLock<Vec<Component>>,
    updates: Mutex<Option<broadcast::Sender<ControlUpdate>>>,
    lifecycle: broadcast::Sender<EngineEvent>,
    writes: AtomicUsize,
}

impl OfflineEngine {
    /// Build a session from `design`, keeping components whose name matches `filter`.
    pub fn new(design: &Design, filter: Option<&str>) -> Result<Self, EngineError> {
        let filter = filter
            .map(|f| {
                RegexBuilder::new(f)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| EngineError::InvalidFilter(e.to_string()))
            })
            .transpose()?;

        let components = design
            .components
            .iter()
            .filter(|c| filter.as_ref().map_or(true, |re| re.is_match(&c.name)))
            .map(|c| Component {
                name: c.name.clone(),
                component_type: c.component_type.clone(),
                controls: c
                    .controls
                    .iter()
                    .map(|ctl| Slot {
                        name: ctl.name.clone(),
                        state: initial_state(ctl),
                        locked: ctl.locked,
                    })
                    .collect(),
            })
            .collect();

        let (updates, _) = broadcast::channel(UPDATE_CHANNEL_CAPACITY);
        let (lifecycle, _) = broadcast::channel(16);

        Ok(Self {
            components: RwLock::new(components),
            updates: Mutex::new(Some(updates)),
            lifecycle,
            writes: AtomicUsize::new(0),
        })
    }

    /// Number of `update` calls received.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Apply a change originating on the engine side (a fader moved at the
    /// venue, a meter ticking) and broadcast it.
    pub fn emit_change(&self, component: &str, control: &str, value: ControlValue) -> Result<ControlState, EngineError> {
        self.apply(component, control, value, true)
    }

    /// Simulate losing the session.
    pub fn drop_session(&self) {
        let _ = self.lifecycle.send(EngineEvent::Disconnected);
    }

    /// Simulate a transport error.
    pub fn fail_session(&self, message: &str) {
        let _ = self.lifecycle.send(EngineEvent::Error(message.to_string()));
    }

    fn apply(
        &self,
        component: &str,
        control: &str,
        value: ControlValue,
        force: bool,
    ) -> Result<ControlState, EngineError> {
        let unknown = || EngineError::UnknownControl {
            component: component.to_string(),
            control: control.to_string(),
        };

        let state = {
            let mut components = self.components.write().map_err(|_| EngineError::Closed)?;
            let slot = components
                .iter_mut()
                .find(|c| c.name == component)
                .and_then(|c| c.controls.iter_mut().find(|s| s.name == control))
                .ok_or_else(unknown)?;

            if slot.locked && !force {
                return Ok(slot.state.clone());
            }
            slot.state = next_state(&slot.state, value);
            slot.state.clone()
        };

        if let Ok(guard) = self.updates.lock() {
            if let Some(tx) = guard.as_ref() {
                let _ = tx.send(ControlUpdate {
                    component: component.to_string(),
                    control: control.to_string(),
                    state: state.clone(),
                });
            }
        }
        Ok(state)
    }
}

#[async_trait]
impl EngineClient for OfflineEngine {
    fn components(&self) -> Vec<ComponentInfo> {
        let Ok(components) = self.components.read() else {
            return Vec::new();
        };
        components
            .iter()
            .map(|c| ComponentInfo {
                name: c.name.clone(),
                component_type: c.component_type.clone(),
                controls: c
                    .controls
                    .iter()
                    .map(|s| ControlInfo {
                        name: s.name.clone(),
                        state: s.state.clone(),
                    })
                    .collect(),
            })
            .collect()
    }

    fn control_names(&self, component: &str) -> Option<Vec<String>> {
        let components = self.components.read().ok()?;
        components
            .iter()
            .find(|c| c.name == component)
            .map(|c| c.controls.iter().map(|s| s.name.clone()).collect())
    }

    fn control(&self, component: &str, control: &str) -> Option<ControlState> {
        let components = self.components.read().ok()?;
        components
            .iter()
            .find(|c| c.name == component)?
            .controls
            .iter()
            .find(|s| s.name == control)
            .map(|s| s.state.clone())
    }

    async fn update(
        &self,
        component: &str,
        control: &str,
        value: ControlValue,
    ) -> Result<ControlState, EngineError> {
        if self.updates.lock().map(|g| g.is_none()).unwrap_or(true) {
            return Err(EngineError::Closed);
        }
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.apply(component, control, value, false)
    }

    fn subscribe(&self) -> broadcast::Receiver<ControlUpdate> {
        match self.updates.lock().ok().and_then(|g| g.as_ref().map(|tx| tx.subscribe())) {
            Some(rx) => rx,
            // Closed session: hand out a receiver whose sender is already gone.
            None => broadcast::channel(1).1,
        }
    }

    fn lifecycle(&self) -> broadcast::Receiver<EngineEvent> {
        self.lifecycle.subscribe()
    }

    async fn close(&self) -> Result<(), EngineError> {
        if let Ok(mut guard) = self.updates.lock() {
            guard.take();
        }
        Ok(())
    }
}

fn initial_state(control: &DesignControl) -> ControlState {
    let seed = ControlState {
        control_type: control.control_type,
        value: ControlValue::Number(0.0),
        string: String::new(),
        position: None,
        bool: None,
        direction: control.direction,
        choices: control.choices.clone(),
        min: control.min,
        max: control.max,
    };
    let value = control.value.clone().unwrap_or(match control.control_type {
        ControlType::Boolean => ControlValue::Bool(false),
        ControlType::String => ControlValue::Text(String::new()),
        _ => ControlValue::Number(control.min.unwrap_or(0.0)),
    });
    next_state(&seed, value)
}

/// Coerce `value` to the control's type and recompute the derived fields.
fn next_state(current: &ControlState, value: ControlValue) -> ControlState {
    let mut state = current.clone();
    match current.control_type {
        ControlType::Boolean => {
            let b = match value {
                ControlValue::Bool(b) => b,
                ControlValue::Number(n) => n != 0.0,
                ControlValue::Text(s) => s.eq_ignore_ascii_case("true"),
            };
            state.value = ControlValue::Bool(b);
            state.bool = Some(b);
            state.position = Some(if b { 1.0 } else { 0.0 });
            state.string = b.to_string();
        }
        ControlType::Float | ControlType::Integer => {
            let Some(mut n) = numeric(&value) else {
                return state;
            };
            if current.control_type == ControlType::Integer {
                n = n.round();
            }
            if let Some(min) = current.min {
                n = n.max(min);
            }
            if let Some(max) = current.max {
                n = n.min(max);
            }
            state.value = ControlValue::Number(n);
            state.position = match (current.min, current.max) {
                (Some(min), Some(max)) if max > min => Some((n - min) / (max - min)),
                _ => None,
            };
            state.string = if current.control_type == ControlType::Integer {
                format!("{}", n as i64)
            } else {
                format!("{:.1}", n)
            };
        }
        ControlType::String => {
            let s = value.to_string();
            state.value = ControlValue::Text(s.clone());
            state.string = s;
        }
        ControlType::Trigger => {
            state.value = ControlValue::Number(0.0);
            state.string = String::new();
        }
    }
    state
}

fn numeric(value: &ControlValue) -> Option<f64> {
    match value {
        ControlValue::Number(n) => Some(*n),
        ControlValue::Bool(b) => Some(if *b { 1.0 } else { 0.0 }),
        ControlValue::Text(s) => s.trim().parse().ok(),
    }
}

/// Opens [`OfflineEngine`] sessions over a shared design.
///
/// Tests script it: queued failures, artificial handshake latency, and
/// access to the most recent session.
pub struct OfflineConnector {
    design: Design,
    latency: Mutex<Duration>,
    fail_next: AtomicUsize,
    connects: AtomicUsize,
    last: Mutex<Option<Arc<OfflineEngine>>>,
}

impl OfflineConnector {
    pub fn new(design: Design) -> Self {
        Self {
            design,
            latency: Mutex::new(Duration::ZERO),
            fail_next: AtomicUsize::new(0),
            connects: AtomicUsize::new(0),
            last: Mutex::new(None),
        }
    }

    pub fn from_path(path: &Path) -> Result<Self, EngineError> {
        Ok(Self::new(Design::from_path(path)?))
    }

    /// Delay every handshake by `latency`.
    pub fn with_latency(self, latency: Duration) -> Self {
        self.set_latency(latency);
        self
    }

    pub fn set_latency(&self, latency: Duration) {
        if let Ok(mut guard) = self.latency.lock() {
            *guard = latency;
        }
    }

    /// Refuse the next `n` connection attempts.
    pub fn fail_next(&self, n: usize) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// Total connection attempts received, including refused ones.
    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// The most recently opened session.
    pub fn last_session(&self) -> Option<Arc<OfflineEngine>> {
        self.last.lock().ok().and_then(|g| g.clone())
    }
}

#[async_trait]
impl EngineConnector for OfflineConnector {
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn EngineClient>, EngineError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        debug!(url = %target.url(), "offline connect");

        let latency = self.latency.lock().map(|g| *g).unwrap_or_default();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        let refused = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(EngineError::Connect(format!("{}: connection refused", target.host)));
        }

        let engine = Arc::new(OfflineEngine::new(&self.design, target.filter.as_deref())?);
        if let Ok(mut guard) = self.last.lock() {
            *guard = Some(Arc::clone(&engine));
        }
        Ok(engine)
    }
}
