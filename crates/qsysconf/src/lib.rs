//! Configuration loading for qsys-mcp.
//!
//! # Load order
//!
//! Layers are applied in order (later wins):
//! 1. Compiled defaults
//! 2. `~/.qsys-mcp/config.json` (or the `--config` path)
//! 3. `~/.qsys-mcp/last-connection.json`
//! 4. Environment variables (`QSYS_*`, `QSYS_MCP_DEBUG`)
//!
//! Files are camelCase JSON objects. A file that is missing or fails to
//! parse is skipped, so a half-written `last-connection.json` never blocks
//! startup.
//!
//! ```json
//! {
//!   "host": "192.168.1.50",
//!   "port": 443,
//!   "secure": true,
//!   "autoConnect": true,
//!   "pollingInterval": 350
//! }
//! ```

pub mod loader;
pub mod persist;
pub mod settings;

pub use loader::{ConfigSources, PartialConfig};
pub use persist::{load_last_connection, save_last_connection, LastConnection};
pub use settings::{ConnectionConfig, PathsConfig, TelemetryConfig};

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Configuration loading errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to write config file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse config file {path}: {message}")]
    Parse { path: PathBuf, message: String },
}

/// Complete resolved configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QsysConfig {
    #[serde(default)]
    pub connection: ConnectionConfig,

    #[serde(default)]
    pub paths: PathsConfig,

    #[serde(default)]
    pub telemetry: TelemetryConfig,
}

impl QsysConfig {
    /// Load from the default locations plus the process environment.
    pub fn load() -> Result<Self, ConfigError> {
        let (config, _sources) = Self::load_with_sources_from(None)?;
        Ok(config)
    }

    /// Load with an optional explicit config file replacing `config.json`.
    ///
    /// An explicit file that cannot be parsed is an error; discovered files
    /// are lenient.
    pub fn load_with_sources_from(config_path: Option<&Path>) -> Result<(Self, ConfigSources), ConfigError> {
        let mut config = Self::default();
        let mut sources = ConfigSources::default();

        if let Some(path) = config_path {
            if path.exists() {
                loader::load_from_file(path)?;
            }
        }

        config.load_layers(config_path, &mut sources);
        loader::apply_env_overrides(&mut config, &mut sources);
        Ok((config, sources))
    }

    /// Load layers from an explicit directory without consulting the
    /// environment.
    pub fn load_from_dir(dir: &Path) -> (Self, ConfigSources) {
        let mut config = Self {
            paths: PathsConfig::rooted_at(dir),
            ..Default::default()
        };
        let mut sources = ConfigSources::default();
        config.load_layers(None, &mut sources);
        (config, sources)
    }

    fn load_layers(&mut self, cli_path: Option<&Path>, sources: &mut ConfigSources) {
        let config_dir = self.paths.config_dir.clone();
        for path in loader::discover_config_files_with_override(&config_dir, cli_path) {
            loader::load_lenient(&path, sources).apply_to(self);
        }
    }

    /// Pretty JSON rendering for `qsys-mcp config`.
    pub fn to_json(&self) -> String {
        serde_json::to_string_pretty(self).unwrap_or_else(|_| "{}".to_string())
    }
}
