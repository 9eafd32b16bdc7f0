//! Tool registry - the tools this server exposes, with their schemas.

use serde_json::Value;

use crate::manual_schemas;

pub const CONNECT: &str = "qsys_connect";
pub const STATUS: &str = "qsys_status";
pub const DISCOVER: &str = "qsys_discover";
pub const GET: &str = "qsys_get";
pub const SET: &str = "qsys_set";
pub const MONITOR: &str = "qsys_monitor";
pub const RECORD: &str = "qsys_record_controls";

#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: &'static str,
    pub description: &'static str,
    pub input_schema: Value,
}

pub fn list_tools() -> Vec<ToolInfo> {
    vec![
        ToolInfo {
            name: CONNECT,
            description: "Connect to the engine. Idempotent when already connected with the same parameters",
            input_schema: manual_schemas::connect_request(),
        },
        ToolInfo {
            name: STATUS,
            description: "Connection state, counts and uptime. Never connects",
            input_schema: manual_schemas::status_request(),
        },
        ToolInfo {
            name: DISCOVER,
            description: "List components, optionally filtered, with control detail",
            input_schema: manual_schemas::discover_request(),
        },
        ToolInfo {
            name: GET,
            description: "Read control values by Component.control path",
            input_schema: manual_schemas::get_request(),
        },
        ToolInfo {
            name: SET,
            description: "Write control values with validation and confirmation",
            input_schema: manual_schemas::set_request(),
        },
        ToolInfo {
            name: MONITOR,
            description: "Buffer live control changes per monitor id (start, read, stop)",
            input_schema: manual_schemas::monitor_request(),
        },
        ToolInfo {
            name: RECORD,
            description: "Record control changes to CSV for a fixed duration",
            input_schema: manual_schemas::record_request(),
        },
    ]
}

pub fn is_known(name: &str) -> bool {
    list_tools().iter().any(|t| t.name == name)
}
