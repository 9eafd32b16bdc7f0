//! Tool-facing error taxonomy.
//!
//! Every failure a tool can report maps onto one [`ToolError`] variant with
//! a stable `code()` and, where the caller can act on it, a `suggestion()`.

use serde_json::{json, Value};
use thiserror::Error;

use crate::engine::EngineError;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ToolError {
    #[error("{0}")]
    InvalidArgument(String),

    #[error("Invalid control path '{0}': expected Component.control")]
    InvalidPath(String),

    #[error("No host configured")]
    MissingHost,

    #[error("Connection to {host} timed out after {}", wait_text(.millis))]
    Timeout { host: String, millis: u64 },

    #[error("No components found in design. Check that the design is running and has components with script access enabled")]
    EmptyDesign,

    #[error("No components match filter '{0}'")]
    FilterNoMatch(String),

    #[error("{what} not found")]
    NotFound { what: String, alternatives: Vec<String> },

    #[error("Control {0} is protected")]
    Protected(String),

    #[error("Control {0} is read-only")]
    ReadOnly(String),

    #[error("{0}")]
    Validation(String),

    #[error("Control rejected - value not set as requested")]
    WriteRejected { requested: Value, actual: Value },

    #[error("Response too large ({0} bytes) and could not be written to a spill file")]
    PayloadTooLarge(usize),

    #[error("Engine error: {0}")]
    Engine(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// `10s` for whole seconds, `250ms` otherwise.
fn wait_text(millis: &u64) -> String {
    let millis = *millis;
    if millis % 1000 == 0 {
        format!("{}s", millis / 1000)
    } else {
        format!("{}ms", millis)
    }
}

impl ToolError {
    pub fn code(&self) -> &'static str {
        match self {
            ToolError::InvalidArgument(_) => "InvalidArgument",
            ToolError::InvalidPath(_) => "InvalidPath",
            ToolError::MissingHost => "MissingHost",
            ToolError::Timeout { .. } => "Timeout",
            ToolError::EmptyDesign => "EmptyDesign",
            ToolError::FilterNoMatch(_) => "FilterNoMatch",
            ToolError::NotFound { .. } => "NotFound",
            ToolError::Protected(_) => "Protected",
            ToolError::ReadOnly(_) => "ReadOnly",
            ToolError::Validation(_) => "Validation",
            ToolError::WriteRejected { .. } => "WriteRejected",
            ToolError::PayloadTooLarge(_) => "PayloadTooLarge",
            ToolError::Engine(_) => "EngineError",
            ToolError::Io(_) => "IoError",
        }
    }

    pub fn suggestion(&self) -> Option<String> {
        let text = match self {
            ToolError::MissingHost => "Pass host to qsys_connect or set the QSYS_HOST environment variable".to_string(),
            ToolError::Timeout { .. } | ToolError::Engine(_) => {
                "Check QSYS_HOST and that the engine is reachable on the configured port".to_string()
            }
            ToolError::EmptyDesign => "Enable script access on the components you want to control".to_string(),
            ToolError::FilterNoMatch(_) => "Use qsys_discover without a filter to list component names".to_string(),
            ToolError::NotFound { alternatives, .. } if !alternatives.is_empty() => {
                format!("Did you mean: {}", alternatives.join(", "))
            }
            ToolError::NotFound { .. } => "Use qsys_discover to list available names".to_string(),
            ToolError::InvalidPath(_) => "Use the form Component.control, e.g. Mixer.gain".to_string(),
            ToolError::Protected(_) => "Set force: true to write a protected control".to_string(),
            ToolError::WriteRejected { .. } => {
                "Control may be read-only, locked, or require permissions".to_string()
            }
            ToolError::PayloadTooLarge(_) => "Narrow the request with a component filter".to_string(),
            _ => return None,
        };
        Some(text)
    }

    /// `{error, code, suggestion?}`, the body of every error reply.
    pub fn to_json(&self) -> Value {
        let mut body = json!({
            "error": self.to_string(),
            "code": self.code(),
        });
        if let Some(suggestion) = self.suggestion() {
            body["suggestion"] = Value::String(suggestion);
        }
        match self {
            ToolError::NotFound { alternatives, .. } if !alternatives.is_empty() => {
                body["alternatives"] = json!(alternatives);
            }
            ToolError::WriteRejected { requested, actual } => {
                body["requested"] = requested.clone();
                body["actual"] = actual.clone();
            }
            _ => {}
        }
        body
    }
}

impl From<EngineError> for ToolError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::InvalidFilter(msg) => ToolError::InvalidArgument(format!("Invalid filter: {}", msg)),
            EngineError::UnknownControl { component, control } => ToolError::NotFound {
                what: format!("Control {}.{}", component, control),
                alternatives: Vec::new(),
            },
            other => ToolError::Engine(other.to_string()),
        }
    }
}

impl From<std::io::Error> for ToolError {
    fn from(e: std::io::Error) -> Self {
        ToolError::Io(e.to_string())
    }
}
