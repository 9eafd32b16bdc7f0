//! Short-lived inventory cache.
//!
//! A snapshot always holds every component with full control detail. The
//! caller's filter and `includeControls` flag are applied when reading, so
//! one snapshot serves every query for [`CACHE_TTL`].

use async_trait::async_trait;
use regex::RegexBuilder;
use serde::Serialize;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::connection::{ConnectionManager, SessionObserver};
use crate::engine::{ControlState, EngineClient};
use crate::error::ToolError;

pub const CACHE_TTL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DiscoveredControl {
    pub name: String,
    #[serde(flatten)]
    pub state: ControlState,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveredComponent {
    pub name: String,
    #[serde(rename = "type")]
    pub component_type: String,
    pub control_count: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub controls: Option<Vec<DiscoveredControl>>,
}

#[derive(Debug, Clone, Default)]
pub struct DiscoverRequest {
    /// Case-insensitive regex over component names.
    pub component: Option<String>,
    pub include_controls: bool,
}

struct Snapshot {
    generation: u64,
    captured: Instant,
    components: Arc<Vec<DiscoveredComponent>>,
}

impl Snapshot {
    fn is_fresh(&self, generation: u64) -> bool {
        self.generation == generation && self.captured.elapsed() < CACHE_TTL
    }
}

pub struct DiscoveryCache {
    manager: ConnectionManager,
    snapshot: Mutex<Option<Snapshot>>,
    rebuilds: AtomicUsize,
}

impl DiscoveryCache {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            snapshot: Mutex::new(None),
            rebuilds: AtomicUsize::new(0),
        }
    }

    /// Number of snapshots built from the engine.
    pub fn rebuild_count(&self) -> usize {
        self.rebuilds.load(Ordering::SeqCst)
    }

    pub async fn discover(&self, request: &DiscoverRequest) -> Result<Vec<DiscoveredComponent>, ToolError> {
        let filter = request
            .component
            .as_deref()
            .filter(|f| !f.is_empty())
            .map(|f| {
                RegexBuilder::new(f)
                    .case_insensitive(true)
                    .build()
                    .map_err(|e| ToolError::InvalidArgument(format!("Invalid component filter: {}", e)))
            })
            .transpose()?;

        let client = self.manager.ensure_connected().await?;
        let generation = self.manager.generation().await;
        let components = self.snapshot(client.as_ref(), generation).await;

        Ok(components
            .iter()
            .filter(|c| filter.as_ref().map_or(true, |re| re.is_match(&c.name)))
            .map(|c| {
                let mut c = c.clone();
                if !request.include_controls {
                    c.controls = None;
                }
                c
            })
            .collect())
    }

    async fn snapshot(&self, client: &dyn EngineClient, generation: u64) -> Arc<Vec<DiscoveredComponent>> {
        let mut guard = self.snapshot.lock().await;
        if let Some(snapshot) = guard.as_ref().filter(|s| s.is_fresh(generation)) {
            debug!("discovery cache hit");
            return Arc::clone(&snapshot.components);
        }

        let components: Arc<Vec<DiscoveredComponent>> = Arc::new(
            client
                .components()
                .into_iter()
                .map(|c| DiscoveredComponent {
                    control_count: c.controls.len(),
                    controls: Some(
                        c.controls
                            .into_iter()
                            .map(|ctl| DiscoveredControl {
                                name: ctl.name,
                                state: ctl.state,
                            })
                            .collect(),
                    ),
                    name: c.name,
                    component_type: c.component_type,
                })
                .collect(),
        );
        self.rebuilds.fetch_add(1, Ordering::SeqCst);
        debug!(components = components.len(), "discovery snapshot rebuilt");

        *guard = Some(Snapshot {
            generation,
            captured: Instant::now(),
            components: Arc::clone(&components),
        });
        components
    }

    pub async fn invalidate(&self) {
        self.snapshot.lock().await.take();
    }
}

#[async_trait]
impl SessionObserver for DiscoveryCache {
    async fn session_ended(&self) {
        self.invalidate().await;
    }
}
