//! Persistence of the last connection that succeeded.

use crate::ConfigError;
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;

/// Parameters of the most recent successful connect.
///
/// Written to `last-connection.json` and read back as a config layer on the
/// next start, so `qsys_connect` without a host reuses it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LastConnection {
    pub host: String,
    pub port: u16,
    pub secure: bool,
    pub polling_interval: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

/// Write `last` into `path` atomically (temp file in the same directory, then rename).
pub fn save_last_connection(path: &Path, last: &LastConnection) -> Result<(), ConfigError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(dir).map_err(|e| ConfigError::FileWrite {
        path: dir.to_path_buf(),
        source: e,
    })?;

    let body = serde_json::to_vec_pretty(last).map_err(|e| ConfigError::Parse {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;

    let write_err = |source: std::io::Error| ConfigError::FileWrite {
        path: path.to_path_buf(),
        source,
    };
    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(write_err)?;
    tmp.write_all(&body).map_err(write_err)?;
    tmp.flush().map_err(write_err)?;
    tmp.persist(path).map_err(|e| write_err(e.error))?;
    Ok(())
}

/// Read `path` back. Missing or corrupt files yield `None`.
pub fn load_last_connection(path: &Path) -> Option<LastConnection> {
    let contents = std::fs::read_to_string(path).ok()?;
    serde_json::from_str(&contents).ok()
}
