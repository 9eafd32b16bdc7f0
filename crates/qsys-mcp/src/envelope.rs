//! Bounded tool responses.
//!
//! Payloads whose JSON text exceeds the threshold are written to a spill
//! file and replaced by a small descriptor. Spill files expire after
//! [`SPILL_RETENTION`]; a background sweep removes them and everything left
//! is removed on exit.
//!
//! Layout:
//! ```text
//! {spill_dir}/
//! └── qsys-response-20240301T120000123Z-<uuid>.json
//! ```

use chrono::{DateTime, Utc};
use serde_json::{json, Value};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::ToolError;

pub const SPILL_THRESHOLD: usize = 1024 * 1024;
pub const SPILL_RETENTION: Duration = Duration::from_secs(15 * 60);
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const SPILL_PREFIX: &str = "qsys-response-";
const TRUNCATE_TO: usize = 20;
const PREVIEW_ITEMS: usize = 3;

pub struct ResponseEnvelope {
    dir: PathBuf,
    threshold: usize,
}

impl ResponseEnvelope {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            threshold: SPILL_THRESHOLD,
        }
    }

    pub fn with_threshold(mut self, threshold: usize) -> Self {
        self.threshold = threshold;
        self
    }

    /// Render `value` as response text, spilling when it is too large.
    pub fn wrap(&self, value: &Value) -> Result<String, ToolError> {
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| ToolError::Io(format!("failed to encode response: {}", e)))?;
        if text.len() <= self.threshold {
            return Ok(text);
        }

        match self.spill(&text) {
            Ok(path) => {
                let descriptor = spill_descriptor(&path, text.len(), value, Utc::now());
                info!(path = %path.display(), bytes = text.len(), "response spilled to file");
                Ok(descriptor.to_string())
            }
            Err(e) => {
                warn!(error = %e, bytes = text.len(), "spill failed");
                match value {
                    Value::Array(items) => Ok(json!({
                        "truncated": true,
                        "count": items.len(),
                        "data": items.iter().take(TRUNCATE_TO).collect::<Vec<_>>(),
                    })
                    .to_string()),
                    _ => Err(ToolError::PayloadTooLarge(text.len())),
                }
            }
        }
    }

    /// Write `text` atomically under a unique name.
    fn spill(&self, text: &str) -> io::Result<PathBuf> {
        fs::create_dir_all(&self.dir)?;
        let name = format!(
            "{}{}-{}.json",
            SPILL_PREFIX,
            Utc::now().format("%Y%m%dT%H%M%S%3fZ"),
            Uuid::new_v4().simple()
        );
        let path = self.dir.join(name);

        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(text.as_bytes())?;
        tmp.flush()?;
        tmp.persist(&path).map_err(|e| e.error)?;
        Ok(path)
    }

    fn spill_files(&self) -> Vec<PathBuf> {
        let Ok(entries) = fs::read_dir(&self.dir) else {
            return Vec::new();
        };
        entries
            .flatten()
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .is_some_and(|n| n.starts_with(SPILL_PREFIX) && n.ends_with(".json"))
            })
            .collect()
    }

    /// Remove spill files older than [`SPILL_RETENTION`].
    pub fn sweep(&self) -> usize {
        self.sweep_at(SystemTime::now())
    }

    fn sweep_at(&self, now: SystemTime) -> usize {
        let mut removed = 0;
        for path in self.spill_files() {
            let expired = fs::metadata(&path)
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > SPILL_RETENTION);
            if expired && fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }
        if removed > 0 {
            debug!(removed, "swept expired spill files");
        }
        removed
    }

    /// Remove every spill file regardless of age.
    pub fn cleanup_all(&self) -> usize {
        self.spill_files()
            .into_iter()
            .filter(|p| fs::remove_file(p).is_ok())
            .count()
    }

    /// Sweep every [`SWEEP_INTERVAL`] until `shutdown` fires.
    pub fn spawn_sweeper(self: Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        self.sweep();
                    }
                }
            }
        })
    }
}

fn spill_descriptor(path: &Path, size: usize, value: &Value, now: DateTime<Utc>) -> Value {
    let retention = chrono::Duration::from_std(SPILL_RETENTION)
        .unwrap_or_else(|_| chrono::Duration::minutes(15));
    let expires = now + retention;
    json!({
        "spilled": true,
        "file": path.display().to_string(),
        "size": size,
        "sizeHuman": human_size(size),
        "createdAt": now.to_rfc3339(),
        "expiresAt": expires.to_rfc3339(),
        "summary": summarize(value),
    })
}

fn summarize(value: &Value) -> Value {
    match value {
        Value::Array(items) => json!({
            "type": "array",
            "length": items.len(),
            "preview": items.iter().take(PREVIEW_ITEMS).collect::<Vec<_>>(),
        }),
        Value::Object(map) => json!({
            "type": "object",
            "keyCount": map.len(),
            "keys": map.keys().collect::<Vec<_>>(),
        }),
        _ => json!({ "type": "scalar" }),
    }
}

fn human_size(bytes: usize) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} B", bytes)
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn big_array(n: usize) -> Value {
        Value::Array((0..n).map(|i| json!({ "i": i, "pad": "x".repeat(32) })).collect())
    }

    #[test]
    fn test_small_payload_inline() {
        let dir = tempfile::tempdir().unwrap();
        let env = ResponseEnvelope::new(dir.path());
        let text = env.wrap(&json!({"ok": true})).unwrap();
        assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), json!({"ok": true}));
        assert_eq!(env.cleanup_all(), 0);
    }

    #[test]
    fn test_large_payload_spills() {
        let dir = tempfile::tempdir().unwrap();
        let env = ResponseEnvelope::new(dir.path()).with_threshold(256);
        let payload = big_array(10);

        let descriptor: Value = serde_json::from_str(&env.wrap(&payload).unwrap()).unwrap();
        assert_eq!(descriptor["spilled"], true);
        assert_eq!(descriptor["summary"]["length"], 10);
        assert_eq!(descriptor["summary"]["preview"].as_array().unwrap().len(), 3);

        let file = descriptor["file"].as_str().unwrap();
        let spilled: Value = serde_json::from_str(&fs::read_to_string(file).unwrap()).unwrap();
        assert_eq!(spilled, payload);
    }

    #[test]
    fn test_object_summary_lists_keys() {
        let summary = summarize(&json!({"a": 1, "b": 2}));
        assert_eq!(summary["keyCount"], 2);
        assert_eq!(summary["keys"], json!(["a", "b"]));
    }

    #[test]
    fn test_unwritable_dir_truncates_arrays() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        fs::write(&blocker, "").unwrap();
        let env = ResponseEnvelope::new(&blocker).with_threshold(256);

        let out: Value = serde_json::from_str(&env.wrap(&big_array(50)).unwrap()).unwrap();
        assert_eq!(out["truncated"], true);
        assert_eq!(out["count"], 50);
        assert_eq!(out["data"].as_array().unwrap().len(), 20);

        let obj = json!({ "blob": "x".repeat(1024) });
        assert!(matches!(env.wrap(&obj), Err(ToolError::PayloadTooLarge(_))));
    }

    #[test]
    fn test_sweep_removes_only_expired() {
        let dir = tempfile::tempdir().unwrap();
        let env = ResponseEnvelope::new(dir.path()).with_threshold(16);
        env.wrap(&big_array(2)).unwrap();
        fs::write(dir.path().join("keep.txt"), "x").unwrap();

        assert_eq!(env.sweep_at(SystemTime::now()), 0);
        let later = SystemTime::now() + SPILL_RETENTION + Duration::from_secs(1);
        assert_eq!(env.sweep_at(later), 1);
        assert!(dir.path().join("keep.txt").exists());
    }

    #[test]
    fn test_cleanup_all() {
        let dir = tempfile::tempdir().unwrap();
        let env = ResponseEnvelope::new(dir.path()).with_threshold(16);
        env.wrap(&big_array(2)).unwrap();
        env.wrap(&big_array(3)).unwrap();
        assert_eq!(env.cleanup_all(), 2);
        assert!(env.spill_files().is_empty());
    }

    #[test]
    fn test_human_size() {
        assert_eq!(human_size(512), "512 B");
        assert_eq!(human_size(1536), "1.5 KB");
        assert_eq!(human_size(3 * 1024 * 1024), "3.0 MB");
    }
}
