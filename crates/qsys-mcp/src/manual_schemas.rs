//! Hand-written JSON schemas for the tool inputs.
//!
//! Schemas carry no `default` fields; defaults are stated in descriptions
//! and applied by the request types in `handler`. Every property node has an
//! explicit `type`.

use serde_json::{json, Value};

use crate::controls::{MAX_GET_BATCH, MAX_SET_BATCH};
use crate::recorder::{MAX_DURATION_SECS, MIN_DURATION_SECS};

pub fn connect_request() -> Value {
    json!({
        "type": "object",
        "properties": {
            "host": {
                "type": "string",
                "description": "Engine hostname or IP. Falls back to the saved or configured host"
            },
            "port": {
                "type": "integer",
                "minimum": 1,
                "maximum": 65535,
                "description": "Engine port (443 when omitted)"
            },
            "secure": {
                "type": "boolean",
                "description": "Use an encrypted socket (true when omitted)"
            },
            "pollingInterval": {
                "type": "integer",
                "minimum": 34,
                "description": "Change-group polling interval in ms (350 when omitted, floor 34)"
            },
            "filter": {
                "type": "string",
                "description": "Case-insensitive regex; only matching components are loaded"
            }
        }
    })
}

pub fn status_request() -> Value {
    json!({
        "type": "object",
        "properties": {
            "detailed": {
                "type": "boolean",
                "description": "Include the component inventory"
            }
        }
    })
}

pub fn discover_request() -> Value {
    json!({
        "type": "object",
        "properties": {
            "component": {
                "type": "string",
                "description": "Case-insensitive regex over component names"
            },
            "includeControls": {
                "type": "boolean",
                "description": "Include full control detail for each component"
            }
        }
    })
}

pub fn get_request() -> Value {
    json!({
        "type": "object",
        "properties": {
            "controls": {
                "type": "array",
                "items": { "type": "string" },
                "minItems": 1,
                "maxItems": MAX_GET_BATCH,
                "description": "Control paths in Component.control form"
            }
        },
        "required": ["controls"]
    })
}

pub fn set_request() -> Value {
    json!({
        "type": "object",
        "properties": {
            "controls": {
                "type": "array",
                "minItems": 1,
                "maxItems": MAX_SET_BATCH,
                "items": {
                    "type": "object",
                    "properties": {
                        "path": {
                            "type": "string",
                            "description": "Control path in Component.control form"
                        },
                        "value": {
                            "type": ["number", "string", "boolean"],
                            "description": "New value; must match the control type"
                        },
                        "force": {
                            "type": "boolean",
                            "description": "Allow writing protected controls"
                        }
                    },
                    "required": ["path", "value"]
                }
            }
        },
        "required": ["controls"]
    })
}

pub fn monitor_request() -> Value {
    json!({
        "type": "object",
        "properties": {
            "action": {
                "type": "string",
                "enum": ["start", "read", "stop"],
                "description": "start a monitor, read (and drain) its events, or stop it"
            },
            "id": {
                "type": "string",
                "description": "Monitor id chosen by the caller"
            },
            "controls": {
                "type": "array",
                "items": { "type": "string" },
                "description": "Control paths to watch (start only)"
            }
        },
        "required": ["action", "id"]
    })
}

pub fn record_request() -> Value {
    json!({
        "type": "object",
        "properties": {
            "duration": {
                "type": "number",
                "minimum": MIN_DURATION_SECS,
                "maximum": MAX_DURATION_SECS,
                "description": "Recording length in seconds"
            },
            "filename": {
                "type": "string",
                "description": "CSV file name; directories are stripped and .csv appended"
            },
            "filter": {
                "type": "string",
                "description": "Case-insensitive regex over Component.control paths"
            }
        },
        "required": ["duration"]
    })
}
