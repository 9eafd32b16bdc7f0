//! Typed configuration sections.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Engine connection parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    /// Engine hostname or address. No default; connecting without one fails.
    #[serde(default)]
    pub host: Option<String>,

    /// Default: 443
    #[serde(default = "ConnectionConfig::default_port")]
    pub port: u16,

    /// Use `wss` instead of `ws`.
    /// Default: true
    #[serde(default = "ConnectionConfig::default_secure")]
    pub secure: bool,

    /// Connect at startup when a host is known.
    /// Default: true
    #[serde(default = "ConnectionConfig::default_auto_connect")]
    pub auto_connect: bool,

    /// Engine polling interval in milliseconds.
    /// Default: 350
    #[serde(default = "ConnectionConfig::default_polling_interval")]
    pub polling_interval: u64,

    /// Regex applied to component names when the session opens.
    #[serde(default)]
    pub filter: Option<String>,

    /// Handshake timeout in milliseconds.
    /// Default: 10000
    #[serde(default = "ConnectionConfig::default_handshake_timeout")]
    pub handshake_timeout_ms: u64,
}

impl ConnectionConfig {
    fn default_port() -> u16 {
        443
    }

    fn default_secure() -> bool {
        true
    }

    fn default_auto_connect() -> bool {
        true
    }

    fn default_polling_interval() -> u64 {
        350
    }

    fn default_handshake_timeout() -> u64 {
        10_000
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: Self::default_port(),
            secure: Self::default_secure(),
            auto_connect: Self::default_auto_connect(),
            polling_interval: Self::default_polling_interval(),
            filter: None,
            handshake_timeout_ms: Self::default_handshake_timeout(),
        }
    }
}

/// Filesystem locations for persisted state and output files.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PathsConfig {
    /// Holds `config.json` and `last-connection.json`.
    /// Default: ~/.qsys-mcp
    #[serde(default = "PathsConfig::default_config_dir")]
    pub config_dir: PathBuf,

    /// Oversized tool responses land here.
    /// Default: ~/.qsys-mcp/spill
    #[serde(default = "PathsConfig::default_spill_dir")]
    pub spill_dir: PathBuf,

    /// CSV recordings.
    /// Default: ~/.qsys-mcp/recordings
    #[serde(default = "PathsConfig::default_recordings_dir")]
    pub recordings_dir: PathBuf,
}

impl PathsConfig {
    pub(crate) fn default_config_dir() -> PathBuf {
        directories::BaseDirs::new()
            .map(|dirs| dirs.home_dir().join(".qsys-mcp"))
            .unwrap_or_else(|| PathBuf::from(".qsys-mcp"))
    }

    fn default_spill_dir() -> PathBuf {
        Self::default_config_dir().join("spill")
    }

    fn default_recordings_dir() -> PathBuf {
        Self::default_config_dir().join("recordings")
    }

    /// All paths rooted under a single directory.
    pub fn rooted_at(dir: impl Into<PathBuf>) -> Self {
        let dir = dir.into();
        Self {
            spill_dir: dir.join("spill"),
            recordings_dir: dir.join("recordings"),
            config_dir: dir,
        }
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir.join("config.json")
    }

    pub fn last_connection_file(&self) -> PathBuf {
        self.config_dir.join("last-connection.json")
    }
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            config_dir: Self::default_config_dir(),
            spill_dir: Self::default_spill_dir(),
            recordings_dir: Self::default_recordings_dir(),
        }
    }
}

/// Logging and trace export.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryConfig {
    /// Verbose logging (`QSYS_MCP_DEBUG=true`).
    #[serde(default)]
    pub debug: bool,

    /// OTLP gRPC endpoint. Export is disabled when unset.
    #[serde(default)]
    pub otlp_endpoint: Option<String>,
}
