//! Config file discovery, loading, and environment variable overlay.

use crate::{ConfigError, QsysConfig};
use serde::Deserialize;
use std::env;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Information about where config values came from.
#[derive(Debug, Clone, Default)]
pub struct ConfigSources {
    /// Config files that were loaded (in order)
    pub files: Vec<PathBuf>,
    /// Files that existed but could not be parsed and were ignored
    pub ignored: Vec<PathBuf>,
    /// Environment variables that overrode config values
    pub env_overrides: Vec<String>,
}

/// One layer of configuration as written on disk.
///
/// Every field is optional so a layer only overrides what it names. Both
/// `config.json` and `last-connection.json` use this shape.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub secure: Option<bool>,
    pub auto_connect: Option<bool>,
    pub polling_interval: Option<u64>,
    pub filter: Option<String>,
    pub handshake_timeout_ms: Option<u64>,
    pub spill_dir: Option<String>,
    pub recordings_dir: Option<String>,
    pub debug: Option<bool>,
    pub otlp_endpoint: Option<String>,
}

impl PartialConfig {
    /// Overlay this layer onto `config`. Present fields win.
    pub fn apply_to(self, config: &mut QsysConfig) {
        let conn = &mut config.connection;
        if let Some(host) = self.host.filter(|h| !h.trim().is_empty()) {
            conn.host = Some(host);
        }
        if let Some(port) = self.port {
            conn.port = port;
        }
        if let Some(secure) = self.secure {
            conn.secure = secure;
        }
        if let Some(auto_connect) = self.auto_connect {
            conn.auto_connect = auto_connect;
        }
        if let Some(interval) = self.polling_interval {
            conn.polling_interval = interval;
        }
        if let Some(filter) = self.filter {
            conn.filter = Some(filter).filter(|f| !f.is_empty());
        }
        if let Some(timeout) = self.handshake_timeout_ms {
            conn.handshake_timeout_ms = timeout;
        }
        if let Some(dir) = self.spill_dir {
            config.paths.spill_dir = expand_path(&dir);
        }
        if let Some(dir) = self.recordings_dir {
            config.paths.recordings_dir = expand_path(&dir);
        }
        if let Some(debug) = self.debug {
            config.telemetry.debug = debug;
        }
        if let Some(endpoint) = self.otlp_endpoint {
            config.telemetry.otlp_endpoint = Some(endpoint);
        }
    }
}

/// Candidate layer files in load order: `config.json` (or the CLI
/// override), then `last-connection.json`. Only existing files are returned.
pub fn discover_config_files_with_override(config_dir: &Path, cli_path: Option<&Path>) -> Vec<PathBuf> {
    let mut files = Vec::new();

    let base = match cli_path {
        Some(path) => path.to_path_buf(),
        None => config_dir.join("config.json"),
    };
    if base.exists() {
        files.push(base);
    }

    let last = config_dir.join("last-connection.json");
    if last.exists() {
        files.push(last);
    }

    files
}

/// Load one layer from a JSON file.
pub fn load_from_file(path: &Path) -> Result<PartialConfig, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|e| ConfigError::FileRead {
        path: path.to_path_buf(),
        source: e,
    })?;

    parse_json(&contents, path)
}

fn parse_json(contents: &str, path: &Path) -> Result<PartialConfig, ConfigError> {
    serde_json::from_str(contents).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

/// Apply `QSYS_*` environment variable overrides from the process environment.
pub fn apply_env_overrides(config: &mut QsysConfig, sources: &mut ConfigSources) {
    apply_env_overrides_from(config, sources, |key| env::var(key).ok());
}

/// Apply overrides using an arbitrary variable lookup.
///
/// Unparseable numeric values are ignored rather than zeroing the setting.
pub fn apply_env_overrides_from<F>(config: &mut QsysConfig, sources: &mut ConfigSources, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut record = |key: &str| sources.env_overrides.push(key.to_string());

    if let Some(v) = lookup("QSYS_HOST").filter(|v| !v.trim().is_empty()) {
        config.connection.host = Some(v);
        record("QSYS_HOST");
    }
    if let Some(port) = lookup("QSYS_PORT").and_then(|v| v.trim().parse().ok()) {
        config.connection.port = port;
        record("QSYS_PORT");
    }
    if let Some(v) = lookup("QSYS_SECURE") {
        config.connection.secure = v.trim() != "false";
        record("QSYS_SECURE");
    }
    if let Some(v) = lookup("QSYS_AUTO_CONNECT") {
        config.connection.auto_connect = v == "true";
        record("QSYS_AUTO_CONNECT");
    }
    if let Some(interval) = lookup("QSYS_POLLING_INTERVAL").and_then(|v| v.trim().parse().ok()) {
        config.connection.polling_interval = interval;
        record("QSYS_POLLING_INTERVAL");
    }
    if let Some(v) = lookup("QSYS_FILTER") {
        config.connection.filter = Some(v).filter(|f| !f.is_empty());
        record("QSYS_FILTER");
    }
    if let Some(v) = lookup("QSYS_MCP_DEBUG") {
        config.telemetry.debug = v == "true";
        record("QSYS_MCP_DEBUG");
    }
    if let Some(v) = lookup("OTEL_EXPORTER_OTLP_ENDPOINT") {
        config.telemetry.otlp_endpoint = Some(v);
        record("OTEL_EXPORTER_OTLP_ENDPOINT");
    }
}

/// Read a discovered layer, treating unreadable or corrupt files as empty.
pub(crate) fn load_lenient(path: &Path, sources: &mut ConfigSources) -> PartialConfig {
    match load_from_file(path) {
        Ok(layer) => {
            sources.files.push(path.to_path_buf());
            layer
        }
        Err(e) => {
            debug!(path = %path.display(), error = %e, "ignoring unusable config file");
            sources.ignored.push(path.to_path_buf());
            PartialConfig::default()
        }
    }
}

/// Expand a leading `~/` to the home directory.
pub fn expand_path(path: &str) -> PathBuf {
    match path.strip_prefix("~/") {
        Some(stripped) => directories::BaseDirs::new()
            .map(|d| d.home_dir().join(stripped))
            .unwrap_or_else(|| PathBuf::from(path)),
        None => PathBuf::from(path),
    }
}
