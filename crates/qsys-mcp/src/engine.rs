//! Engine client abstraction.
//!
//! The engine owns the component/control inventory of a running design and
//! speaks its own wire protocol. Everything above this module only sees the
//! [`EngineClient`] trait: a snapshot of components, per-control reads and
//! confirmed writes, one multiplexed update stream, and a lifecycle stream
//! that reports session loss.
//!
//! A session is opened through an [`EngineConnector`], which lets the
//! connection manager be driven by the offline design engine in tests and by
//! a wire-protocol client in deployments.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::broadcast;

/// Engines reject polling faster than this.
pub const MIN_POLLING_INTERVAL: Duration = Duration::from_millis(34);

/// Path appended to every engine socket URL.
pub const ENGINE_API_PATH: &str = "/qrc-public-api/v0";

/// Errors raised by engine clients and connectors.
#[derive(Debug, Clone, Error)]
pub enum EngineError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("session closed")]
    Closed,

    #[error("unknown control {component}.{control}")]
    UnknownControl { component: String, control: String },

    #[error("invalid component filter: {0}")]
    InvalidFilter(String),

    #[error("invalid design: {0}")]
    Design(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlType {
    Boolean,
    Float,
    Integer,
    String,
    Trigger,
}

impl ControlType {
    pub fn is_numeric(&self) -> bool {
        matches!(self, ControlType::Float | ControlType::Integer)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Direction {
    #[serde(rename = "Read", alias = "Read Only")]
    Read,
    #[serde(rename = "Read/Write", alias = "ReadWrite")]
    ReadWrite,
    #[serde(rename = "Write")]
    Write,
}

impl Direction {
    pub fn is_read_only(&self) -> bool {
        matches!(self, Direction::Read)
    }
}

/// A control value as sent to or reported by the engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    Bool(bool),
    Number(f64),
    Text(String),
}

impl ControlValue {
    /// Accepts JSON scalars. Null, arrays and objects have no control meaning.
    pub fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(b) => Some(ControlValue::Bool(*b)),
            Value::Number(n) => n.as_f64().map(ControlValue::Number),
            Value::String(s) => Some(ControlValue::Text(s.clone())),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            ControlValue::Number(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            ControlValue::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

impl std::fmt::Display for ControlValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ControlValue::Bool(b) => write!(f, "{}", b),
            ControlValue::Number(n) => write!(f, "{}", n),
            ControlValue::Text(s) => write!(f, "{}", s),
        }
    }
}

/// Point-in-time state of one control. Every field is always serialized,
/// `null` where the control type has no such notion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControlState {
    #[serde(rename = "type")]
    pub control_type: ControlType,
    pub value: ControlValue,
    pub string: String,
    pub position: Option<f64>,
    pub bool: Option<bool>,
    pub direction: Direction,
    pub choices: Option<Vec<String>>,
    pub min: Option<f64>,
    pub max: Option<f64>,
}

/// A named control inside a component snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlInfo {
    pub name: String,
    pub state: ControlState,
}

/// A component and its controls, in design order.
#[derive(Debug, Clone, PartialEq)]
pub struct ComponentInfo {
    pub name: String,
    pub component_type: String,
    pub controls: Vec<ControlInfo>,
}

/// One change reported on the engine's update stream.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlUpdate {
    pub component: String,
    pub control: String,
    pub state: ControlState,
}

impl ControlUpdate {
    pub fn path(&self) -> String {
        format!("{}.{}", self.component, self.control)
    }
}

/// Session lifecycle notifications.
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    Disconnected,
    Error(String),
}

/// A live session to an engine.
#[async_trait]
pub trait EngineClient: Send + Sync {
    /// Full inventory, in design order.
    fn components(&self) -> Vec<ComponentInfo>;

    fn component_names(&self) -> Vec<String> {
        self.components().into_iter().map(|c| c.name).collect()
    }

    /// Control names of one component, `None` when the component is unknown.
    fn control_names(&self, component: &str) -> Option<Vec<String>>;

    fn control(&self, component: &str, control: &str) -> Option<ControlState>;

    /// Request a new value and wait for the engine to report the resulting state.
    async fn update(
        &self,
        component: &str,
        control: &str,
        value: ControlValue,
    ) -> Result<ControlState, EngineError>;

    /// Every control change in the session, from every component.
    fn subscribe(&self) -> broadcast::Receiver<ControlUpdate>;

    fn lifecycle(&self) -> broadcast::Receiver<EngineEvent>;

    async fn close(&self) -> Result<(), EngineError>;
}

/// Where and how to open a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectTarget {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub polling_interval: Duration,
    pub filter: Option<String>,
}

impl ConnectTarget {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: 443,
            secure: true,
            polling_interval: Duration::from_millis(350),
            filter: None,
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_secure(mut self, secure: bool) -> Self {
        self.secure = secure;
        self
    }

    /// Clamped to [`MIN_POLLING_INTERVAL`].
    pub fn with_polling_interval(mut self, interval: Duration) -> Self {
        self.polling_interval = interval.max(MIN_POLLING_INTERVAL);
        self
    }

    pub fn with_filter(mut self, filter: Option<String>) -> Self {
        self.filter = filter.filter(|f| !f.is_empty());
        self
    }

    pub fn url(&self) -> String {
        let scheme = if self.secure { "wss" } else { "ws" };
        format!("{}://{}:{}{}", scheme, self.host, self.port, ENGINE_API_PATH)
    }

    pub fn polling_interval_ms(&self) -> u64 {
        self.polling_interval.as_millis() as u64
    }
}

/// Opens engine sessions.
#[async_trait]
pub trait EngineConnector: Send + Sync {
    async fn connect(&self, target: &ConnectTarget) -> Result<Arc<dyn EngineClient>, EngineError>;
}
