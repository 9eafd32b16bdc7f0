//! MCP handler: maps tool calls onto the connection, control, discovery,
//! monitor and recorder operations.
//!
//! Every failure leaves here as an error result whose text is the
//! `{error, code, suggestion}` body of a [`ToolError`]. Successful payloads
//! pass through the [`ResponseEnvelope`].

use rmcp::model::{
    CallToolRequestParam, CallToolResult, Content, JsonObject, ListToolsResult,
    PaginatedRequestParam, ServerCapabilities, ServerInfo, Tool,
};
use rmcp::service::{RequestContext, RoleServer};
use rmcp::{ErrorData as McpError, ServerHandler};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

use crate::connection::ConnectionManager;
use crate::controls::{self, SetRequest};
use crate::discovery::{DiscoverRequest, DiscoveryCache};
use crate::engine::ConnectTarget;
use crate::envelope::ResponseEnvelope;
use crate::error::ToolError;
use crate::monitor::EventMonitor;
use crate::recorder::{RecordRequest, Recorder};
use crate::tools_registry;

const INSTRUCTIONS: &str = "Control surface of a Q-SYS style audio/video engine.\n\n\
Controls are addressed as Component.control (for example Mixer.gain). Tools other than \
qsys_status connect on demand using the saved or configured host.\n\n\
- qsys_discover lists components; pass includeControls for types, ranges and values\n\
- qsys_get / qsys_set read and write values; writes are validated and confirmed\n\
- qsys_monitor buffers live changes per id; qsys_record_controls captures them to CSV\n\n\
Controls under Master., Emergency., SystemMute and *.power need force: true.";

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ConnectArgs {
    host: Option<String>,
    port: Option<u16>,
    secure: Option<bool>,
    polling_interval: Option<u64>,
    filter: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct StatusArgs {
    #[serde(default)]
    detailed: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiscoverArgs {
    component: Option<String>,
    #[serde(default)]
    include_controls: bool,
}

#[derive(Debug, Deserialize)]
struct GetArgs {
    controls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct SetArgs {
    controls: Vec<SetRequest>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
enum MonitorAction {
    Start,
    Read,
    Stop,
}

#[derive(Debug, Deserialize)]
struct MonitorArgs {
    action: MonitorAction,
    id: String,
    #[serde(default)]
    controls: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct RecordArgs {
    duration: f64,
    filename: Option<String>,
    filter: Option<String>,
}

/// The MCP server. Cheap to clone; all clones share one engine session.
#[derive(Clone)]
pub struct QsysHandler {
    manager: ConnectionManager,
    discovery: Arc<DiscoveryCache>,
    monitor: Arc<EventMonitor>,
    recorder: Recorder,
    envelope: Arc<ResponseEnvelope>,
}

impl QsysHandler {
    /// Wire the subsystems to `manager`.
    ///
    /// Session observers run in registration order: the recorder halts
    /// first, then the discovery cache is dropped, then monitors detach.
    pub fn new(
        manager: ConnectionManager,
        recordings_dir: impl Into<PathBuf>,
        envelope: Arc<ResponseEnvelope>,
    ) -> Self {
        Self::with_recorder(
            manager.clone(),
            Recorder::new(manager, recordings_dir),
            envelope,
        )
    }

    pub fn with_recorder(
        manager: ConnectionManager,
        recorder: Recorder,
        envelope: Arc<ResponseEnvelope>,
    ) -> Self {
        let discovery = Arc::new(DiscoveryCache::new(manager.clone()));
        let monitor = Arc::new(EventMonitor::new(manager.clone()));

        manager.add_observer(Arc::new(recorder.clone()));
        manager.add_observer(discovery.clone());
        manager.add_observer(monitor.clone());

        Self {
            manager,
            discovery,
            monitor,
            recorder,
            envelope,
        }
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn discovery(&self) -> &DiscoveryCache {
        &self.discovery
    }

    pub fn recorder(&self) -> &Recorder {
        &self.recorder
    }

    pub fn envelope(&self) -> &ResponseEnvelope {
        &self.envelope
    }

    /// Run one tool and return its raw JSON payload.
    #[instrument(skip(self, args), fields(tool = %name))]
    pub async fn dispatch(&self, name: &str, args: Value) -> Result<Value, ToolError> {
        debug!(args = %args, "tool call");
        match name {
            tools_registry::CONNECT => self.connect(parse_args(name, args)?).await,
            tools_registry::STATUS => {
                let args: StatusArgs = parse_args(name, args)?;
                to_value(self.manager.status(args.detailed).await)
            }
            tools_registry::DISCOVER => {
                let args: DiscoverArgs = parse_args(name, args)?;
                let request = DiscoverRequest {
                    component: args.component,
                    include_controls: args.include_controls,
                };
                to_value(self.discovery.discover(&request).await?)
            }
            tools_registry::GET => {
                let args: GetArgs = parse_args(name, args)?;
                let client = self.manager.ensure_connected().await?;
                to_value(controls::get(client.as_ref(), &args.controls)?)
            }
            tools_registry::SET => {
                let args: SetArgs = parse_args(name, args)?;
                let client = self.manager.ensure_connected().await?;
                to_value(controls::set(client.as_ref(), args.controls).await?)
            }
            tools_registry::MONITOR => {
                let args: MonitorArgs = parse_args(name, args)?;
                match args.action {
                    MonitorAction::Start => to_value(self.monitor.start(&args.id, &args.controls).await?),
                    MonitorAction::Read => to_value(self.monitor.read(&args.id).await?),
                    MonitorAction::Stop => to_value(self.monitor.stop(&args.id).await?),
                }
            }
            tools_registry::RECORD => {
                let args: RecordArgs = parse_args(name, args)?;
                let request = RecordRequest {
                    duration_secs: args.duration,
                    filename: args.filename,
                    filter: args.filter,
                };
                to_value(self.recorder.record(request).await?)
            }
            other => Err(ToolError::NotFound {
                what: format!("Tool '{}'", other),
                alternatives: tools_registry::list_tools()
                    .iter()
                    .map(|t| t.name.to_string())
                    .collect(),
            }),
        }
    }

    /// Run one tool and render the MCP result.
    pub async fn call(&self, name: &str, args: Value) -> CallToolResult {
        let outcome = match self.dispatch(name, args).await {
            Ok(value) => self.envelope.wrap(&value),
            Err(e) => Err(e),
        };
        match outcome {
            Ok(text) => CallToolResult::success(vec![Content::text(text)]),
            Err(e) => {
                warn!(tool = name, code = e.code(), error = %e, "tool failed");
                let body = serde_json::to_string_pretty(&e.to_json()).unwrap_or_else(|_| e.to_string());
                CallToolResult::error(vec![Content::text(body)])
            }
        }
    }

    async fn connect(&self, args: ConnectArgs) -> Result<Value, ToolError> {
        let base = match args.host {
            Some(host) => ConnectTarget::new(host),
            None => self.manager.default_target().await.ok_or(ToolError::MissingHost)?,
        };

        let mut target = base;
        if let Some(port) = args.port {
            target = target.with_port(port);
        }
        if let Some(secure) = args.secure {
            target = target.with_secure(secure);
        }
        if let Some(ms) = args.polling_interval {
            target = target.with_polling_interval(Duration::from_millis(ms));
        }
        if args.filter.is_some() {
            target = target.with_filter(args.filter);
        }

        to_value(self.manager.connect(target).await?)
    }
}

fn parse_args<T: DeserializeOwned>(tool: &str, args: Value) -> Result<T, ToolError> {
    let args = if args.is_null() { Value::Object(Default::default()) } else { args };
    serde_json::from_value(args)
        .map_err(|e| ToolError::InvalidArgument(format!("Invalid arguments for {}: {}", tool, e)))
}

fn to_value<T: Serialize>(value: T) -> Result<Value, ToolError> {
    serde_json::to_value(value).map_err(|e| ToolError::Io(format!("failed to encode response: {}", e)))
}

fn schema_object(schema: Value) -> Arc<JsonObject> {
    match schema {
        Value::Object(map) => Arc::new(map),
        _ => Arc::new(JsonObject::new()),
    }
}

impl ServerHandler for QsysHandler {
    fn get_info(&self) -> ServerInfo {
        ServerInfo {
            instructions: Some(INSTRUCTIONS.into()),
            capabilities: ServerCapabilities::builder().enable_tools().build(),
            ..Default::default()
        }
    }

    async fn list_tools(
        &self,
        _request: Option<PaginatedRequestParam>,
        _context: RequestContext<RoleServer>,
    ) -> Result<ListToolsResult, McpError> {
        let tools = tools_registry::list_tools()
            .into_iter()
            .map(|info| Tool::new(info.name, info.description, schema_object(info.input_schema)))
            .collect();
        Ok(ListToolsResult::with_all_items(tools))
    }

    async fn call_tool(
        &self,
        request: CallToolRequestParam,
        _context: RequestContext<RoleServer>,
    ) -> Result<CallToolResult, McpError> {
        let args = request.arguments.map(Value::Object).unwrap_or(Value::Null);
        Ok(self.call(&request.name, args).await)
    }
}
