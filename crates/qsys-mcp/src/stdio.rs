//! Stdio MCP transport.
//!
//! The server will:
//! 1. Load the design and build the subsystems from the resolved config
//! 2. Auto-connect in the background when a host is configured
//! 3. Serve MCP over stdin/stdout until EOF
//! 4. Disconnect and remove spill files on the way out

use anyhow::{Context, Result};
use qsysconf::QsysConfig;
use rmcp::{transport::stdio, ServiceExt};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::connection::{ConnectionManager, ManagerConfig};
use crate::envelope::ResponseEnvelope;
use crate::handler::QsysHandler;
use crate::offline::OfflineConnector;

pub struct StdioConfig {
    pub config: QsysConfig,
    /// Design file served by the offline engine.
    pub design: PathBuf,
}

pub async fn run(config: StdioConfig) -> Result<()> {
    let connector = OfflineConnector::from_path(&config.design)
        .with_context(|| format!("Failed to load design {}", config.design.display()))?;

    let paths = &config.config.paths;
    let manager = ConnectionManager::new(Arc::new(connector), ManagerConfig::from_config(&config.config));
    let envelope = Arc::new(ResponseEnvelope::new(&paths.spill_dir));
    let handler = QsysHandler::new(manager.clone(), &paths.recordings_dir, Arc::clone(&envelope));

    let shutdown = CancellationToken::new();
    let sweeper = Arc::clone(&envelope).spawn_sweeper(shutdown.clone());

    if manager.auto_connect().is_none() {
        info!("no auto-connect; waiting for qsys_connect");
    }

    let service = handler
        .serve(stdio())
        .await
        .context("Failed to start stdio MCP service")?;

    info!(design = %config.design.display(), "Stdio MCP server running");

    let waited = service.waiting().await;

    shutdown.cancel();
    let _ = sweeper.await;
    manager.disconnect().await;
    let removed = envelope.cleanup_all();
    info!(spill_files_removed = removed, "Stdio MCP server shutdown");

    waited.context("MCP service task failed")?;
    Ok(())
}
