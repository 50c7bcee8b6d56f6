//! Capability routing table.
//!
//! Maps a capability to its candidate agents, kept sorted by route score.
//! Scores blend reliability, speed and recent load; unreliable agents are
//! penalised harder than slow or busy ones.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchboard_core::AgentId;
use tracing::debug;

use crate::registry::AgentDescriptor;

/// Reliability below which a route is heavily penalised.
pub const RELIABILITY_FLOOR: f64 = 0.8;
/// Normalised load above which a route is penalised.
pub const LOAD_CEILING: f64 = 0.8;

const RELIABILITY_FACTOR: f64 = 0.5;
const SPEED_FACTOR: f64 = 0.3;
const LOAD_FACTOR: f64 = 0.2;
const UNRELIABLE_PENALTY: f64 = 0.5;
const OVERLOAD_PENALTY: f64 = 0.8;

/// Inputs of the route score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScoreInputs {
    /// Reliability in `[0, 1]`.
    pub reliability: f64,
    /// Mean response time; zero when nothing has been observed.
    pub avg_response_ms: f64,
    /// Recent communications divided by capacity, clamped to `[0, 1]`.
    pub load: f64,
}

impl ScoreInputs {
    /// Normalise a recent communication count against the per-window capacity.
    #[must_use]
    pub fn normalise_load(recent: usize, capacity: u32) -> f64 {
        (recent as f64 / f64::from(capacity.max(1))).min(1.0)
    }

    /// Compute the route score.
    #[must_use]
    pub fn score(self) -> f64 {
        let speed = 1.0 / (1.0 + self.avg_response_ms.max(0.0) / 1000.0);
        let load = self.load.clamp(0.0, 1.0);
        let mut score = RELIABILITY_FACTOR.mul_add(
            self.reliability,
            SPEED_FACTOR.mul_add(speed, LOAD_FACTOR * (1.0 - load)),
        );
        if self.reliability < RELIABILITY_FLOOR {
            score *= UNRELIABLE_PENALTY;
        }
        if load > LOAD_CEILING {
            score *= OVERLOAD_PENALTY;
        }
        score
    }
}

/// One candidate agent for a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouteEntry {
    pub agent_id: AgentId,
    pub priority: i32,
    /// Static weight from the agent's registration.
    pub weight: f64,
    /// Weight maintained by the optimizer.
    pub dynamic_weight: f64,
    pub added_at: DateTime<Utc>,
    pub score: f64,
    /// Registration order of the agent.
    pub seq: u64,
}

/// Capability to ranked candidates.
#[derive(Debug, Clone, Default)]
pub struct RouteTable {
    routes: BTreeMap<String, Vec<RouteEntry>>,
}

impl RouteTable {
    /// Create an empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry for each of the agent's capabilities.
    pub fn add_agent(&mut self, agent: &AgentDescriptor) {
        let score = ScoreInputs {
            reliability: agent.reliability,
            avg_response_ms: agent.metrics.avg_response_ms,
            load: 0.0,
        }
        .score();
        let dynamic_weight = self.dynamic_weight(agent.id.as_str()).unwrap_or(1.0);
        for capability in &agent.capabilities {
            self.insert_entry(capability, agent, score, dynamic_weight);
        }
    }

    /// Add entries for newly offered capabilities.
    pub fn add_capabilities<'a>(
        &mut self,
        agent: &AgentDescriptor,
        capabilities: impl IntoIterator<Item = &'a String>,
    ) {
        let score = self.score_of(agent.id.as_str()).unwrap_or_else(|| {
            ScoreInputs {
                reliability: agent.reliability,
                avg_response_ms: agent.metrics.avg_response_ms,
                load: 0.0,
            }
            .score()
        });
        let dynamic_weight = self.dynamic_weight(agent.id.as_str()).unwrap_or(1.0);
        for capability in capabilities {
            self.insert_entry(capability, agent, score, dynamic_weight);
        }
    }

    /// Remove the agent from the given capabilities.
    pub fn remove_capabilities<'a>(
        &mut self,
        agent_id: &str,
        capabilities: impl IntoIterator<Item = &'a String>,
    ) {
        for capability in capabilities {
            if let Some(entries) = self.routes.get_mut(capability) {
                entries.retain(|e| e.agent_id.as_str() != agent_id);
                if entries.is_empty() {
                    self.routes.remove(capability);
                }
            }
        }
    }

    /// Remove every entry referencing the agent. Returns how many were removed.
    pub fn remove_agent(&mut self, agent_id: &str) -> usize {
        let mut removed = 0;
        self.routes.retain(|_, entries| {
            let before = entries.len();
            entries.retain(|e| e.agent_id.as_str() != agent_id);
            removed += before - entries.len();
            !entries.is_empty()
        });
        if removed > 0 {
            debug!(agent_id = %agent_id, removed, "Removed agent routes");
        }
        removed
    }

    /// Set the score of every entry of the agent and re-rank.
    pub fn set_score(&mut self, agent_id: &str, score: f64) {
        self.update_entries(agent_id, |e| e.score = score);
    }

    /// Set the optimizer weight of every entry of the agent.
    pub fn set_dynamic_weight(&mut self, agent_id: &str, weight: f64) {
        self.update_entries(agent_id, |e| e.dynamic_weight = weight);
    }

    /// Current score of the agent, if it has any route.
    #[must_use]
    pub fn score_of(&self, agent_id: &str) -> Option<f64> {
        self.entry_of(agent_id).map(|e| e.score)
    }

    /// Current optimizer weight of the agent, if it has any route.
    #[must_use]
    pub fn dynamic_weight(&self, agent_id: &str) -> Option<f64> {
        self.entry_of(agent_id).map(|e| e.dynamic_weight)
    }

    /// Ranked candidates for a capability, best first.
    #[must_use]
    pub fn candidates(&self, capability: &str) -> &[RouteEntry] {
        self.routes.get(capability).map_or(&[], Vec::as_slice)
    }

    /// Highest ranked candidate that is not excluded and is admitted by `eligible`.
    pub fn find_route(
        &self,
        capability: &str,
        excluding: &[AgentId],
        eligible: impl Fn(&AgentId) -> bool,
    ) -> Option<&RouteEntry> {
        self.candidates(capability)
            .iter()
            .filter(|e| !excluding.contains(&e.agent_id))
            .find(|e| eligible(&e.agent_id))
    }

    /// Whether any entry references the agent.
    #[must_use]
    pub fn references(&self, agent_id: &str) -> bool {
        self.entry_of(agent_id).is_some()
    }

    /// Every capability with at least one route.
    pub fn capabilities(&self) -> impl Iterator<Item = &str> {
        self.routes.keys().map(String::as_str)
    }

    /// All entries grouped by capability.
    #[must_use]
    pub const fn routes(&self) -> &BTreeMap<String, Vec<RouteEntry>> {
        &self.routes
    }

    /// Total number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.routes.values().map(Vec::len).sum()
    }

    /// Whether the table has no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }

    fn entry_of(&self, agent_id: &str) -> Option<&RouteEntry> {
        self.routes
            .values()
            .flatten()
            .find(|e| e.agent_id.as_str() == agent_id)
    }

    fn insert_entry(
        &mut self,
        capability: &str,
        agent: &AgentDescriptor,
        score: f64,
        dynamic_weight: f64,
    ) {
        let entries = self.routes.entry(capability.to_string()).or_default();
        if entries.iter().any(|e| e.agent_id == agent.id) {
            return;
        }
        entries.push(RouteEntry {
            agent_id: agent.id.clone(),
            priority: agent.priority,
            weight: agent.weight,
            dynamic_weight,
            added_at: Utc::now(),
            score,
            seq: agent.registration_seq,
        });
        rank(entries);
    }

    fn update_entries(&mut self, agent_id: &str, mut apply: impl FnMut(&mut RouteEntry)) {
        for entries in self.routes.values_mut() {
            let mut touched = false;
            for entry in entries.iter_mut().filter(|e| e.agent_id.as_str() == agent_id) {
                apply(entry);
                touched = true;
            }
            if touched {
                rank(entries);
            }
        }
    }
}

/// Order by score, then priority, then registration order.
fn rank(entries: &mut [RouteEntry]) {
    entries.sort_by(|a, b| {
        b.score
            .total_cmp(&a.score)
            .then_with(|| b.priority.cmp(&a.priority))
            .then_with(|| a.seq.cmp(&b.seq))
    });
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::registry::AgentRegistry;
    use switchboard_events::AgentSpec;
    use tokio::time::Instant;

    fn registry_with(specs: Vec<AgentSpec>) -> AgentRegistry {
        let mut registry = AgentRegistry::default();
        for spec in specs {
            registry.register(spec, Instant::now()).unwrap();
        }
        registry
    }

    fn table_for(registry: &AgentRegistry) -> RouteTable {
        let mut table = RouteTable::new();
        for agent in registry.list() {
            table.add_agent(agent);
        }
        table
    }

    #[test]
    fn test_unreliable_agent_is_penalised_more_than_slow_one() {
        let slow = ScoreInputs {
            reliability: 1.0,
            avg_response_ms: 3000.0,
            load: 0.0,
        };
        let unreliable = ScoreInputs {
            reliability: 0.7,
            avg_response_ms: 50.0,
            load: 0.0,
        };
        assert!(slow.score() > unreliable.score());
    }

    #[test]
    fn test_overload_is_penalised() {
        let idle = ScoreInputs {
            reliability: 1.0,
            avg_response_ms: 100.0,
            load: 0.5,
        };
        let busy = ScoreInputs { load: 0.9, ..idle };
        assert!(idle.score() > busy.score());
        assert!((ScoreInputs::normalise_load(250, 100) - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_find_route_prefers_reliable_agent() {
        let registry = registry_with(vec![
            AgentSpec::new("b", "B").with_capability("x").with_reliability(0.5),
            AgentSpec::new("a", "A").with_capability("x").with_reliability(1.0),
        ]);
        let table = table_for(&registry);
        let route = table.find_route("x", &[], |_| true).unwrap();
        assert_eq!(route.agent_id.as_str(), "a");
    }

    #[test]
    fn test_ties_go_to_earliest_registration() {
        let registry = registry_with(vec![
            AgentSpec::new("first", "F").with_capability("x"),
            AgentSpec::new("second", "S").with_capability("x"),
        ]);
        let table = table_for(&registry);
        let ids: Vec<_> = table.candidates("x").iter().map(|e| e.agent_id.as_str()).collect();
        assert_eq!(ids, vec!["first", "second"]);
    }

    #[test]
    fn test_find_route_honours_exclusions_and_eligibility() {
        let registry = registry_with(vec![
            AgentSpec::new("a", "A").with_capability("x"),
            AgentSpec::new("b", "B").with_capability("x"),
            AgentSpec::new("c", "C").with_capability("x"),
        ]);
        let table = table_for(&registry);
        let route = table
            .find_route("x", &[AgentId::from("a")], |id| id.as_str() != "b")
            .unwrap();
        assert_eq!(route.agent_id.as_str(), "c");
        assert!(table.find_route("missing", &[], |_| true).is_none());
    }

    #[test]
    fn test_remove_agent_drops_every_reference() {
        let registry = registry_with(vec![
            AgentSpec::new("a", "A").with_capability("x").with_capability("y"),
            AgentSpec::new("b", "B").with_capability("x"),
        ]);
        let mut table = table_for(&registry);
        assert_eq!(table.remove_agent("a"), 2);
        assert!(!table.references("a"));
        assert_eq!(table.capabilities().collect::<Vec<_>>(), vec!["x"]);
    }

    #[test]
    fn test_set_score_reranks() {
        let registry = registry_with(vec![
            AgentSpec::new("a", "A").with_capability("x"),
            AgentSpec::new("b", "B").with_capability("x"),
        ]);
        let mut table = table_for(&registry);
        table.set_score("a", 0.1);
        assert_eq!(table.candidates("x").first().map(|e| e.agent_id.as_str()), Some("b"));
    }

    #[test]
    fn test_capability_updates() {
        let registry = registry_with(vec![AgentSpec::new("a", "A").with_capability("x")]);
        let mut table = table_for(&registry);
        let agent = registry.get("a").unwrap();
        let added = ["y".to_string()];
        table.add_capabilities(agent, &added);
        table.remove_capabilities("a", &["x".to_string()]);
        assert!(table.candidates("x").is_empty());
        assert_eq!(table.candidates("y").len(), 1);
    }
}
