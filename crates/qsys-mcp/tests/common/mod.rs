//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use qsys_mcp::engine::ConnectTarget;
use qsys_mcp::envelope::ResponseEnvelope;
use qsys_mcp::offline::{Design, OfflineConnector, OfflineEngine};
use qsys_mcp::{ConnectionManager, ManagerConfig, QsysHandler};
use std::sync::Arc;
use std::time::Duration;

pub const DESIGN_JSON: &str = include_str!("../fixtures/design.json");

pub fn design() -> Design {
    Design::from_json(DESIGN_JSON).expect("fixture design parses")
}

pub fn target() -> ConnectTarget {
    ConnectTarget::new("core.local")
}

pub fn connector() -> Arc<OfflineConnector> {
    Arc::new(OfflineConnector::new(design()))
}

pub fn manager_with(connector: &Arc<OfflineConnector>, config: ManagerConfig) -> ConnectionManager {
    ConnectionManager::new(connector.clone(), config)
}

/// Manager whose default target is `core.local`, nothing persisted.
pub fn manager(connector: &Arc<OfflineConnector>) -> ConnectionManager {
    manager_with(connector, ManagerConfig::default().with_default_target(target()))
}

pub fn session(connector: &OfflineConnector) -> Arc<OfflineEngine> {
    connector.last_session().expect("a session was opened")
}

/// Let spawned listeners and watchers run.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

pub struct Harness {
    pub connector: Arc<OfflineConnector>,
    pub handler: QsysHandler,
    pub dir: tempfile::TempDir,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_threshold(qsys_mcp::envelope::SPILL_THRESHOLD)
    }

    pub fn with_threshold(threshold: usize) -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let connector = connector();
        let manager = manager(&connector);
        let envelope = Arc::new(ResponseEnvelope::new(dir.path().join("spill")).with_threshold(threshold));
        let handler = QsysHandler::new(manager, dir.path().join("recordings"), envelope);
        Self {
            connector,
            handler,
            dir,
        }
    }
}
