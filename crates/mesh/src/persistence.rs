//! Best-effort snapshot persistence.
//!
//! Two JSON documents live in the snapshot directory: the routing table and
//! the agent state. Both are rewritten atomically (temp file, then rename) on
//! the snapshot interval and on shutdown, and loaded on startup to pre-seed
//! the registry and routing table. A lost snapshot only costs warm-up; the
//! registry rebuilds from live registrations.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use switchboard_core::{AgentId, Error};
use switchboard_events::{AgentSpec, AgentStatus};
use tokio::fs;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{MeshError, MeshResult};
use crate::registry::AgentMetrics;
use crate::routing::RouteEntry;
use crate::state::MeshState;

const ROUTING_FILE: &str = "routing-table.json";
const AGENTS_FILE: &str = "agent-state.json";

/// Snapshot configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistenceConfig {
    /// Snapshot directory; snapshots are disabled when unset.
    #[serde(default)]
    pub directory: Option<PathBuf>,
    #[serde(default = "default_snapshot_interval_ms")]
    pub snapshot_interval_ms: u64,
}

const fn default_snapshot_interval_ms() -> u64 {
    60_000
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            directory: None,
            snapshot_interval_ms: default_snapshot_interval_ms(),
        }
    }
}

impl PersistenceConfig {
    /// Interval between periodic snapshots.
    #[must_use]
    pub const fn snapshot_interval(&self) -> Duration {
        Duration::from_millis(self.snapshot_interval_ms)
    }
}

/// Routing table as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingSnapshot {
    pub saved_at: DateTime<Utc>,
    pub routes: BTreeMap<String, Vec<RouteEntry>>,
}

impl RoutingSnapshot {
    /// Capture the current routing table.
    #[must_use]
    pub fn capture(state: &MeshState) -> Self {
        Self {
            saved_at: Utc::now(),
            routes: state.routes.routes().clone(),
        }
    }
}

/// One agent as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentRecord {
    pub spec: AgentSpec,
    pub status: AgentStatus,
    pub metrics: AgentMetrics,
}

/// Registry as persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentStateSnapshot {
    pub saved_at: DateTime<Utc>,
    pub agents: BTreeMap<AgentId, AgentRecord>,
}

impl AgentStateSnapshot {
    /// Capture every registered agent.
    #[must_use]
    pub fn capture(state: &MeshState) -> Self {
        let agents = state
            .registry
            .list()
            .into_iter()
            .map(|agent| {
                (
                    agent.id.clone(),
                    AgentRecord {
                        spec: agent.to_spec(),
                        status: agent.status,
                        metrics: agent.metrics.clone(),
                    },
                )
            })
            .collect();
        Self {
            saved_at: Utc::now(),
            agents,
        }
    }
}

/// What a restore applied.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreReport {
    pub agents: usize,
    /// Agents already registered, left untouched.
    pub skipped: usize,
    pub routes: usize,
}

/// Pre-seed state from snapshots.
///
/// Agents are registered first; route weights and scores are then applied
/// only to agents that exist, so a routing snapshot can never introduce a
/// route to an unknown agent.
pub fn restore(
    state: &mut MeshState,
    agents: AgentStateSnapshot,
    routing: Option<RoutingSnapshot>,
    now: Instant,
) -> RestoreReport {
    let mut report = RestoreReport::default();

    for (agent_id, record) in agents.agents {
        if state.register(record.spec, now).is_err() {
            report.skipped += 1;
            continue;
        }
        state.registry.restore_metrics(agent_id.as_str(), record.metrics);
        if state.registry.update_status(agent_id.as_str(), record.status).is_ok() {
            report.agents += 1;
        }
    }

    for entry in routing.into_iter().flat_map(|r| r.routes.into_values()).flatten() {
        let agent_id = entry.agent_id.as_str();
        if !state.routes.references(agent_id) {
            continue;
        }
        state.routes.set_dynamic_weight(agent_id, entry.dynamic_weight);
        state.routes.set_score(agent_id, entry.score);
        report.routes += 1;
    }

    report
}

/// Reads and writes snapshot files in one directory.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Store snapshots under `dir`, created on first save.
    #[must_use]
    pub fn new(dir: impl AsRef<Path>) -> Self {
        Self {
            dir: dir.as_ref().to_path_buf(),
        }
    }

    /// Snapshot directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write both snapshots.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Persistence` if the directory or a file cannot be
    /// written.
    pub async fn save(
        &self,
        routing: &RoutingSnapshot,
        agents: &AgentStateSnapshot,
    ) -> MeshResult<()> {
        fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| MeshError::from(Error::directory_creation_failed(&self.dir, e.to_string())))?;
        self.write_json(ROUTING_FILE, routing).await?;
        self.write_json(AGENTS_FILE, agents).await?;
        info!(
            dir = %self.dir.display(),
            agents = agents.agents.len(),
            capabilities = routing.routes.len(),
            "Snapshots saved"
        );
        Ok(())
    }

    /// Load the routing snapshot, `None` if it was never written.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Persistence` if the file is unreadable or corrupt.
    pub async fn load_routing(&self) -> MeshResult<Option<RoutingSnapshot>> {
        self.read_json(ROUTING_FILE).await
    }

    /// Load the agent snapshot, `None` if it was never written.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Persistence` if the file is unreadable or corrupt.
    pub async fn load_agents(&self) -> MeshResult<Option<AgentStateSnapshot>> {
        self.read_json(AGENTS_FILE).await
    }

    async fn write_json<T: Serialize>(&self, name: &str, value: &T) -> MeshResult<()> {
        let file = self.dir.join(name);
        let temp_file = file.with_extension("json.tmp");

        let json = serde_json::to_vec_pretty(value)
            .map_err(|e| MeshError::from(Error::file_write_failed(&file, e.to_string())))?;
        fs::write(&temp_file, &json)
            .await
            .map_err(|e| MeshError::from(Error::file_write_failed(&temp_file, e.to_string())))?;

        if let Err(e) = fs::rename(&temp_file, &file).await {
            if let Err(cleanup) = fs::remove_file(&temp_file).await {
                warn!(file = %temp_file.display(), error = %cleanup, "Failed to remove temp snapshot");
            }
            return Err(Error::file_write_failed(&file, e.to_string()).into());
        }
        debug!(file = %file.display(), bytes = json.len(), "Snapshot written");
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, name: &str) -> MeshResult<Option<T>> {
        let file = self.dir.join(name);
        let content = match fs::read(&file).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::file_read_failed(&file, e.to_string()).into()),
        };
        serde_json::from_slice(&content)
            .map(Some)
            .map_err(|e| Error::json_parse_failed(format!("{}: {e}", file.display())).into())
    }
}
