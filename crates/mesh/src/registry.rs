//! Agent registry.
//!
//! Single source of truth for which agents exist, what they can do and how
//! they have been behaving. Reliability is an exponential moving average of
//! communication outcomes; activity timestamps drive the health monitor.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchboard_core::AgentId;
use switchboard_events::{AgentSpec, AgentStatus};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{MeshError, MeshResult};

const DEFAULT_RELIABILITY_ALPHA: f64 = 0.1;
const DEFAULT_INACTIVE_RETENTION_MS: u64 = 3_600_000;

/// Registry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RegistryConfig {
    /// Smoothing factor of the reliability moving average, in `(0, 1]`.
    #[serde(default = "default_reliability_alpha")]
    pub reliability_alpha: f64,
    /// How long an inactive agent is kept before it is removed.
    #[serde(default = "default_inactive_retention_ms")]
    pub inactive_retention_ms: u64,
}

const fn default_reliability_alpha() -> f64 {
    DEFAULT_RELIABILITY_ALPHA
}

const fn default_inactive_retention_ms() -> u64 {
    DEFAULT_INACTIVE_RETENTION_MS
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            reliability_alpha: DEFAULT_RELIABILITY_ALPHA,
            inactive_retention_ms: DEFAULT_INACTIVE_RETENTION_MS,
        }
    }
}

impl RegistryConfig {
    /// Retention window for inactive agents.
    #[must_use]
    pub const fn inactive_retention(&self) -> Duration {
        Duration::from_millis(self.inactive_retention_ms)
    }
}

/// Communication counters for one agent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentMetrics {
    pub total_communications: u64,
    pub successes: u64,
    pub failures: u64,
    /// Mean response time over every completed exchange.
    pub avg_response_ms: f64,
    pub last_response_ms: Option<u64>,
}

impl AgentMetrics {
    fn record(&mut self, success: bool, response_ms: u64) {
        self.total_communications = self.total_communications.saturating_add(1);
        if success {
            self.successes = self.successes.saturating_add(1);
        } else {
            self.failures = self.failures.saturating_add(1);
        }
        let n = self.total_communications as f64;
        self.avg_response_ms += (response_ms as f64 - self.avg_response_ms) / n;
        self.last_response_ms = Some(response_ms);
    }
}

/// Everything the mesh knows about a registered agent.
#[derive(Debug, Clone)]
pub struct AgentDescriptor {
    pub id: AgentId,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    pub weight: f64,
    pub priority: i32,
    pub status: AgentStatus,
    /// Moving average of outcomes, in `[0, 1]`.
    pub reliability: f64,
    pub metrics: AgentMetrics,
    pub registered_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    /// Monotonic twin of `last_seen_at`.
    pub last_seen: Instant,
    /// Registration order, used to break routing ties.
    pub registration_seq: u64,
}

impl AgentDescriptor {
    /// Whether the agent offers the capability.
    #[must_use]
    pub fn has_capability(&self, capability: &str) -> bool {
        self.capabilities.contains(capability)
    }

    /// The [`AgentSpec`] this agent would re-register with.
    #[must_use]
    pub fn to_spec(&self) -> AgentSpec {
        AgentSpec {
            id: self.id.clone(),
            name: self.name.clone(),
            capabilities: self.capabilities.clone(),
            weight: self.weight,
            priority: self.priority,
            reliability: Some(self.reliability),
        }
    }
}

/// Capability sets before and after an update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityChange {
    pub added: BTreeSet<String>,
    pub removed: BTreeSet<String>,
}

/// Registered agents, keyed by id.
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    config: RegistryConfig,
    agents: HashMap<AgentId, AgentDescriptor>,
    next_seq: u64,
}

impl AgentRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            agents: HashMap::new(),
            next_seq: 0,
        }
    }

    /// Registry configuration.
    #[must_use]
    pub const fn config(&self) -> &RegistryConfig {
        &self.config
    }

    /// Register a new agent with status `Active`.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::DuplicateAgent` if the id is already registered.
    pub fn register(&mut self, spec: AgentSpec, now: Instant) -> MeshResult<&AgentDescriptor> {
        if self.agents.contains_key(&spec.id) {
            return Err(MeshError::duplicate_agent(spec.id));
        }

        let seq = self.next_seq;
        self.next_seq = self.next_seq.saturating_add(1);
        let wall = Utc::now();
        let descriptor = AgentDescriptor {
            id: spec.id.clone(),
            name: spec.name,
            capabilities: spec.capabilities,
            weight: spec.weight,
            priority: spec.priority,
            status: AgentStatus::Active,
            reliability: spec.reliability.map_or(1.0, |r| r.clamp(0.0, 1.0)),
            metrics: AgentMetrics::default(),
            registered_at: wall,
            last_seen_at: wall,
            last_seen: now,
            registration_seq: seq,
        };

        info!(
            agent_id = %spec.id,
            capabilities = descriptor.capabilities.len(),
            "Agent registered"
        );
        Ok(self.agents.entry(spec.id).or_insert(descriptor))
    }

    /// Remove an agent.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::AgentNotFound` if the id is unknown.
    pub fn unregister(&mut self, agent_id: &str) -> MeshResult<AgentDescriptor> {
        let removed = self
            .agents
            .remove(agent_id)
            .ok_or_else(|| MeshError::agent_not_found(agent_id))?;
        info!(agent_id = %agent_id, "Agent unregistered");
        Ok(removed)
    }

    /// Set an agent's status, returning the previous one.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::AgentNotFound` if the id is unknown.
    pub fn update_status(&mut self, agent_id: &str, status: AgentStatus) -> MeshResult<AgentStatus> {
        let agent = self.get_mut(agent_id)?;
        let previous = agent.status;
        agent.status = status;
        if previous != status {
            debug!(agent_id = %agent_id, %previous, %status, "Agent status changed");
        }
        Ok(previous)
    }

    /// Replace an agent's capability set.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::AgentNotFound` if the id is unknown.
    pub fn update_capabilities(
        &mut self,
        agent_id: &str,
        capabilities: BTreeSet<String>,
    ) -> MeshResult<CapabilityChange> {
        let agent = self.get_mut(agent_id)?;
        let change = CapabilityChange {
            added: capabilities
                .difference(&agent.capabilities)
                .cloned()
                .collect(),
            removed: agent
                .capabilities
                .difference(&capabilities)
                .cloned()
                .collect(),
        };
        agent.capabilities = capabilities;
        Ok(change)
    }

    /// Fold one communication outcome into metrics and reliability.
    ///
    /// Returns the new reliability, or `None` for an unknown agent.
    pub fn record_outcome(&mut self, agent_id: &str, success: bool, response_ms: u64) -> Option<f64> {
        let alpha = self.config.reliability_alpha;
        let agent = self.agents.get_mut(agent_id)?;
        agent.metrics.record(success, response_ms);
        let observed = if success { 1.0 } else { 0.0 };
        agent.reliability = (1.0 - alpha).mul_add(agent.reliability, alpha * observed);
        Some(agent.reliability)
    }

    /// Restore counters saved in a snapshot.
    pub fn restore_metrics(&mut self, agent_id: &str, metrics: AgentMetrics) -> bool {
        self.agents
            .get_mut(agent_id)
            .map(|agent| agent.metrics = metrics)
            .is_some()
    }

    /// Mark the agent as seen at `now`.
    pub fn touch(&mut self, agent_id: &str, now: Instant) {
        if let Some(agent) = self.agents.get_mut(agent_id) {
            agent.last_seen = now;
            agent.last_seen_at = Utc::now();
        }
    }

    /// Look up an agent.
    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<&AgentDescriptor> {
        self.agents.get(agent_id)
    }

    /// Whether the id is registered.
    #[must_use]
    pub fn contains(&self, agent_id: &str) -> bool {
        self.agents.contains_key(agent_id)
    }

    /// All agents in registration order.
    #[must_use]
    pub fn list(&self) -> Vec<&AgentDescriptor> {
        let mut agents: Vec<_> = self.agents.values().collect();
        agents.sort_by_key(|a| a.registration_seq);
        agents
    }

    /// Agents offering a capability, in registration order.
    #[must_use]
    pub fn list_by_capability(&self, capability: &str) -> Vec<&AgentDescriptor> {
        self.list()
            .into_iter()
            .filter(|a| a.has_capability(capability))
            .collect()
    }

    /// Inactive agents not seen for longer than the retention window.
    #[must_use]
    pub fn expired(&self, now: Instant) -> Vec<AgentId> {
        let retention = self.config.inactive_retention();
        self.list()
            .into_iter()
            .filter(|a| a.status == AgentStatus::Inactive)
            .filter(|a| now.saturating_duration_since(a.last_seen) > retention)
            .map(|a| a.id.clone())
            .collect()
    }

    /// Number of registered agents.
    #[must_use]
    pub fn len(&self) -> usize {
        self.agents.len()
    }

    /// Whether no agent is registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    fn get_mut(&mut self, agent_id: &str) -> MeshResult<&mut AgentDescriptor> {
        self.agents
            .get_mut(agent_id)
            .ok_or_else(|| MeshError::agent_not_found(agent_id))
    }
}
