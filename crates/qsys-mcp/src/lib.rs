//! qsys-mcp - MCP control-plane adapter for Q-SYS style engines
//!
//! This library provides:
//! - `engine`: engine client/connector traits and the control data model
//! - `offline`: a design-file engine that behaves like a live one
//! - `connection`: single-session lifecycle with backoff reconnection
//! - `controls`: path resolution, write protection, validation, confirmation
//! - `discovery`: one-second inventory cache
//! - `monitor`: per-id ring buffers of control changes
//! - `recorder`: size-capped CSV capture
//! - `envelope`: bounded responses with spill files
//! - `handler`: the MCP tool surface
//! - `stdio`: MCP stdio transport

pub mod connection;
pub mod controls;
pub mod discovery;
pub mod engine;
pub mod envelope;
pub mod error;
pub mod handler;
pub mod manual_schemas;
pub mod monitor;
pub mod offline;
pub mod recorder;
pub mod stdio;
pub mod telemetry;
pub mod tools_registry;

pub use connection::{ConnectionManager, ManagerConfig, Phase};
pub use error::ToolError;
pub use handler::QsysHandler;
