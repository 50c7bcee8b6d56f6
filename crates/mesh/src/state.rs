//! Shared mesh state.
//!
//! The registry, routing table, breaker bank, history and anomaly detector
//! only change together through the methods below, and always under the
//! single [`SharedState`] lock. None of these methods await, so the lock is
//! never held across I/O and no caller can observe a half-applied update.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use switchboard_core::AgentId;
use switchboard_events::{AgentSpec, AgentStatus, BroadcastTarget, Route};
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

use crate::anomaly::{Anomaly, AnomalyDetector, Metric};
use crate::balancer::{BalancerConfig, Candidate, LoadBalancingStrategy};
use crate::breaker::{BreakerEvent, CircuitBreakerBank, CircuitState};
use crate::config::MeshConfig;
use crate::error::{MeshError, MeshResult};
use crate::history::{CommunicationHistory, CommunicationRecord};
use crate::registry::{AgentDescriptor, AgentRegistry};
use crate::routing::{RouteTable, ScoreInputs};

/// State guarded by one async mutex.
pub type SharedState = Arc<Mutex<MeshState>>;

/// A dispatch target chosen under the lock.
#[derive(Debug, Clone, PartialEq)]
pub struct Selection {
    pub agent_id: AgentId,
    /// Lazy breaker transition materialised while admitting the request.
    pub breaker_event: Option<BreakerEvent>,
}

/// Effects of a completed exchange.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub breaker_event: Option<BreakerEvent>,
    pub anomalies: Vec<Anomaly>,
}

/// Effects of a status update.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusUpdate {
    pub previous: AgentStatus,
    pub status: AgentStatus,
    pub breaker_event: Option<BreakerEvent>,
}

impl StatusUpdate {
    /// Whether the status actually changed.
    #[must_use]
    pub fn changed(&self) -> bool {
        self.previous != self.status
    }
}

/// Every structure the mesh components share.
#[derive(Debug)]
pub struct MeshState {
    pub registry: AgentRegistry,
    pub routes: RouteTable,
    pub breakers: CircuitBreakerBank,
    pub history: CommunicationHistory,
    pub anomalies: AnomalyDetector,
    in_flight: HashMap<AgentId, usize>,
    balancer: BalancerConfig,
}

impl MeshState {
    /// Create empty state from configuration.
    #[must_use]
    pub fn new(config: &MeshConfig) -> Self {
        Self {
            registry: AgentRegistry::new(config.registry.clone()),
            routes: RouteTable::new(),
            breakers: CircuitBreakerBank::new(config.breaker.clone()),
            history: CommunicationHistory::new(config.history.capacity),
            anomalies: AnomalyDetector::new(config.anomaly.clone()),
            in_flight: HashMap::new(),
            balancer: config.balancer.clone(),
        }
    }

    /// Wrap in the shared lock.
    #[must_use]
    pub fn shared(self) -> SharedState {
        Arc::new(Mutex::new(self))
    }

    /// Register an agent with a closed breaker and its routes.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::DuplicateAgent` if the id is taken.
    pub fn register(&mut self, spec: AgentSpec, now: Instant) -> MeshResult<()> {
        let agent_id = spec.id.clone();
        let agent = self.registry.register(spec, now)?;
        self.routes.add_agent(agent);
        self.breakers.insert(agent_id);
        Ok(())
    }

    /// Remove an agent from the registry, routing table and breaker bank.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::AgentNotFound` if the id is unknown.
    pub fn unregister(&mut self, agent_id: &str) -> MeshResult<AgentDescriptor> {
        let removed = self.registry.unregister(agent_id)?;
        self.routes.remove_agent(agent_id);
        self.breakers.remove(agent_id);
        self.in_flight.remove(agent_id);
        self.anomalies.forget(agent_id);
        Ok(removed)
    }

    /// Apply a status and feed it into the agent's breaker.
    ///
    /// A degrading status counts as a breaker failure. A healthy status
    /// resets the failure count of a closed breaker, and restores routes
    /// removed by failure handling once the breaker admits traffic again.
    /// An open breaker is never closed here: it stays open until its
    /// recovery timeout and then recovers through half-open trials.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::AgentNotFound` if the id is unknown.
    pub fn update_status(
        &mut self,
        agent_id: &str,
        status: AgentStatus,
        now: Instant,
    ) -> MeshResult<StatusUpdate> {
        let previous = self.registry.update_status(agent_id, status)?;
        let breaker_event = if status.is_degrading() {
            self.breakers.record_failure(agent_id, now)
        } else if status.is_healthy() {
            match self.breakers.state(agent_id, now) {
                Some(CircuitState::Closed) => {
                    let event = self.breakers.record_success(agent_id, now);
                    self.restore_routes(agent_id, now);
                    event
                }
                Some(CircuitState::HalfOpen) => {
                    self.restore_routes(agent_id, now);
                    None
                }
                Some(CircuitState::Open) | None => None,
            }
        } else {
            None
        };
        Ok(StatusUpdate {
            previous,
            status,
            breaker_event,
        })
    }

    /// Replace an agent's capabilities and adjust its routes.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::AgentNotFound` if the id is unknown.
    pub fn update_capabilities(
        &mut self,
        agent_id: &str,
        capabilities: BTreeSet<String>,
    ) -> MeshResult<()> {
        let change = self.registry.update_capabilities(agent_id, capabilities)?;
        self.routes.remove_capabilities(agent_id, &change.removed);
        if let Some(agent) = self.registry.get(agent_id) {
            self.routes.add_capabilities(agent, &change.added);
        }
        Ok(())
    }

    /// Re-add the routes of an agent whose routes were withdrawn.
    pub fn restore_routes(&mut self, agent_id: &str, now: Instant) -> bool {
        if self.routes.references(agent_id) {
            return false;
        }
        match self.registry.get(agent_id) {
            Some(agent) if !agent.capabilities.is_empty() => {
                self.routes.add_agent(agent);
                self.rescore(agent_id, now);
                debug!(agent_id = %agent_id, "Restored agent routes");
                true
            }
            _ => false,
        }
    }

    /// Choose a dispatch target and admit the request through its breaker.
    ///
    /// A direct route bypasses the balancer but never the breaker. On
    /// success the target's in-flight count is incremented.
    ///
    /// # Errors
    ///
    /// - `AgentNotFound` for a direct route to an unknown agent
    /// - `NoRoute` when no agent offers the capability
    /// - `CircuitOpen` when every candidate's breaker rejects the request
    pub fn select(
        &mut self,
        route: &Route,
        excluding: &[AgentId],
        strategy: &dyn LoadBalancingStrategy,
        now: Instant,
    ) -> MeshResult<Selection> {
        let selection = match route {
            Route::Agent(agent_id) => self.admit_direct(agent_id, now)?,
            Route::Capability(capability) => {
                self.admit_balanced(capability, excluding, strategy, now)?
            }
        };
        *self.in_flight.entry(selection.agent_id.clone()).or_default() += 1;
        Ok(selection)
    }

    /// Record the outcome of an exchange started by [`MeshState::select`].
    ///
    /// `responded` is false when the agent never answered (timeout).
    pub fn complete(
        &mut self,
        agent_id: &AgentId,
        source: Option<AgentId>,
        success: bool,
        response_ms: u64,
        responded: bool,
        now: Instant,
    ) -> Completion {
        if let Some(count) = self.in_flight.get_mut(agent_id) {
            *count = count.saturating_sub(1);
        }
        if !self.registry.contains(agent_id.as_str()) {
            debug!(agent_id = %agent_id, "Outcome for unregistered agent ignored");
            return Completion::default();
        }

        let reliability = self
            .registry
            .record_outcome(agent_id.as_str(), success, response_ms);
        if responded {
            self.registry.touch(agent_id.as_str(), now);
        }
        let breaker_event = if success {
            self.breakers.record_success(agent_id.as_str(), now)
        } else {
            self.breakers.record_failure(agent_id.as_str(), now)
        };
        self.history.push(CommunicationRecord::new(
            source,
            agent_id.clone(),
            response_ms,
            success,
            now,
        ));
        self.rescore(agent_id.as_str(), now);

        let mut anomalies = Vec::new();
        if responded {
            anomalies.extend(self.anomalies.observe(
                agent_id,
                Metric::ResponseTime,
                response_ms as f64,
                now,
            ));
        }
        if let Some(reliability) = reliability {
            anomalies.extend(
                self.anomalies
                    .observe(agent_id, Metric::Reliability, reliability, now),
            );
        }

        Completion {
            breaker_event,
            anomalies,
        }
    }

    /// Highest ranked agent for a capability that its breaker admits.
    #[must_use]
    pub fn find_route(&self, capability: &str, excluding: &[AgentId], now: Instant) -> Option<AgentId> {
        self.routes
            .find_route(capability, excluding, |id| {
                self.breakers.allows(id.as_str(), now)
            })
            .map(|e| e.agent_id.clone())
    }

    /// Recompute the route score of one agent from its current metrics.
    pub fn rescore(&mut self, agent_id: &str, now: Instant) -> Option<f64> {
        let inputs = self.score_inputs(agent_id, now)?;
        let score = inputs.score();
        self.routes.set_score(agent_id, score);
        Some(score)
    }

    /// Score inputs of an agent as of `now`.
    #[must_use]
    pub fn score_inputs(&self, agent_id: &str, now: Instant) -> Option<ScoreInputs> {
        let agent = self.registry.get(agent_id)?;
        let recent = self
            .history
            .recent_count(agent_id, self.balancer.load_window(), now);
        Some(ScoreInputs {
            reliability: agent.reliability,
            avg_response_ms: agent.metrics.avg_response_ms,
            load: ScoreInputs::normalise_load(recent, self.balancer.load_capacity),
        })
    }

    /// Exchanges currently awaiting a reply from the agent.
    #[must_use]
    pub fn in_flight(&self, agent_id: &str) -> usize {
        self.in_flight.get(agent_id).copied().unwrap_or(0)
    }

    /// Agents whose breaker is open at `now`.
    #[must_use]
    pub fn open_breakers(&self, now: Instant) -> Vec<AgentId> {
        self.breakers.open_agents(now)
    }

    /// Breaker state of every agent, in registration order.
    #[must_use]
    pub fn breaker_states(&self, now: Instant) -> Vec<(AgentId, CircuitState)> {
        self.registry
            .list()
            .iter()
            .filter_map(|a| {
                self.breakers
                    .state(a.id.as_str(), now)
                    .map(|s| (a.id.clone(), s))
            })
            .collect()
    }

    /// Agents a broadcast target resolves to, in registration order.
    #[must_use]
    pub fn resolve_targets(&self, target: &BroadcastTarget) -> Vec<AgentId> {
        match target {
            BroadcastTarget::All => self.registry.list().iter().map(|a| a.id.clone()).collect(),
            BroadcastTarget::Capability(capability) => self
                .registry
                .list_by_capability(capability)
                .iter()
                .map(|a| a.id.clone())
                .collect(),
            BroadcastTarget::Agents(ids) => ids.clone(),
        }
    }

    fn admit_direct(&mut self, agent_id: &AgentId, now: Instant) -> MeshResult<Selection> {
        if !self.registry.contains(agent_id.as_str()) {
            return Err(MeshError::agent_not_found(agent_id.clone()));
        }
        let admission = self.breakers.acquire(agent_id.as_str(), now);
        if admission.allowed {
            Ok(Selection {
                agent_id: agent_id.clone(),
                breaker_event: admission.event,
            })
        } else {
            Err(MeshError::CircuitOpen {
                agent_id: agent_id.clone(),
            })
        }
    }

    fn admit_balanced(
        &mut self,
        capability: &str,
        excluding: &[AgentId],
        strategy: &dyn LoadBalancingStrategy,
        now: Instant,
    ) -> MeshResult<Selection> {
        let ranked: Vec<_> = self
            .routes
            .candidates(capability)
            .iter()
            .filter(|e| !excluding.contains(&e.agent_id))
            .cloned()
            .collect();
        let Some(best) = ranked.first().map(|e| e.agent_id.clone()) else {
            return Err(MeshError::no_route(capability));
        };

        let mut candidates: Vec<Candidate> = ranked
            .iter()
            .filter(|e| self.breakers.allows(e.agent_id.as_str(), now))
            .map(|e| Candidate::from_entry(e, self.in_flight(e.agent_id.as_str())))
            .collect();

        while let Some(agent_id) = strategy.select(&candidates) {
            let admission = self.breakers.acquire(agent_id.as_str(), now);
            if admission.allowed {
                return Ok(Selection {
                    agent_id,
                    breaker_event: admission.event,
                });
            }
            candidates.retain(|c| c.agent_id != agent_id);
        }

        Err(MeshError::CircuitOpen { agent_id: best })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::balancer::{AdaptiveStrategy, RoundRobinStrategy};
    use std::time::Duration;

    fn state_with(specs: Vec<AgentSpec>) -> MeshState {
        let mut state = MeshState::new(&MeshConfig::default());
        for spec in specs {
            state.register(spec, Instant::now()).unwrap();
        }
        state
    }

    fn capability(name: &str) -> Route {
        Route::Capability(name.to_string())
    }

    #[test]
    fn test_register_creates_routes_and_breaker() {
        let state = state_with(vec![AgentSpec::new("a", "A").with_capability("x")]);
        assert!(state.routes.references("a"));
        assert_eq!(
            state.breakers.state("a", Instant::now()),
            Some(CircuitState::Closed)
        );
    }

    #[test]
    fn test_unregister_removes_everything() {
        let mut state = state_with(vec![
            AgentSpec::new("a", "A").with_capability("x").with_capability("y"),
        ]);
        state.unregister("a").unwrap();
        assert!(!state.registry.contains("a"));
        assert!(!state.routes.references("a"));
        assert!(state.breakers.get("a").is_none());
        assert!(state.routes.is_empty());
    }

    #[test]
    fn test_select_skips_open_breaker() {
        let mut state = state_with(vec![
            AgentSpec::new("a", "A").with_capability("x"),
            AgentSpec::new("b", "B").with_capability("x").with_reliability(0.5),
        ]);
        let now = Instant::now();
        state.breakers.force_open("a", now);

        let selection = state
            .select(&capability("x"), &[], &AdaptiveStrategy::new(), now)
            .unwrap();
        assert_eq!(selection.agent_id.as_str(), "b");
        assert_eq!(state.in_flight("b"), 1);
    }

    #[test]
    fn test_select_reports_circuit_open_when_all_gated() {
        let mut state = state_with(vec![AgentSpec::new("a", "A").with_capability("x")]);
        let now = Instant::now();
        state.breakers.force_open("a", now);

        let err = state
            .select(&capability("x"), &[], &RoundRobinStrategy::new(), now)
            .unwrap_err();
        assert_eq!(err, MeshError::CircuitOpen { agent_id: "a".into() });
    }

    #[test]
    fn test_select_unknown_capability_is_no_route() {
        let mut state = state_with(vec![]);
        let err = state
            .select(&capability("x"), &[], &AdaptiveStrategy::new(), Instant::now())
            .unwrap_err();
        assert_eq!(err, MeshError::no_route("x"));
    }

    #[test]
    fn test_direct_route_is_gated_by_breaker() {
        let mut state = state_with(vec![AgentSpec::new("a", "A")]);
        let now = Instant::now();
        let route = Route::Agent("a".into());
        assert!(state.select(&route, &[], &AdaptiveStrategy::new(), now).is_ok());

        state.breakers.force_open("a", now);
        assert!(matches!(
            state.select(&route, &[], &AdaptiveStrategy::new(), now),
            Err(MeshError::CircuitOpen { .. })
        ));
    }

    #[test]
    fn test_complete_records_everywhere() {
        let mut state = state_with(vec![AgentSpec::new("a", "A").with_capability("x")]);
        let now = Instant::now();
        let selection = state
            .select(&capability("x"), &[], &AdaptiveStrategy::new(), now)
            .unwrap();

        state.complete(&selection.agent_id, None, false, 40, true, now);

        assert_eq!(state.in_flight("a"), 0);
        assert_eq!(state.history.len(), 1);
        assert_eq!(state.breakers.get("a").map(|b| b.consecutive_failures()), Some(1));
        let reliability = state.registry.get("a").map(|a| a.reliability).unwrap();
        assert!(reliability < 1.0);
    }

    #[test]
    fn test_five_failures_open_the_breaker() {
        let mut state = state_with(vec![AgentSpec::new("a", "A").with_capability("x")]);
        let now = Instant::now();
        let agent: AgentId = "a".into();
        let events: Vec<_> = (0..5)
            .filter_map(|_| state.complete(&agent, None, false, 10, false, now).breaker_event)
            .collect();
        assert_eq!(events.len(), 1);
        assert!(events.iter().all(BreakerEvent::opened));
        assert!(state.find_route("x", &[], now).is_none());
    }

    #[test]
    fn test_degrading_status_counts_as_failure() {
        let mut state = state_with(vec![AgentSpec::new("a", "A")]);
        let now = Instant::now();
        let update = state.update_status("a", AgentStatus::Error, now).unwrap();
        assert!(update.changed());
        assert_eq!(state.breakers.get("a").map(|b| b.consecutive_failures()), Some(1));
    }

    #[test]
    fn test_healthy_status_resets_failures_of_closed_breaker() {
        let mut state = state_with(vec![AgentSpec::new("a", "A").with_capability("x")]);
        let now = Instant::now();
        state.update_status("a", AgentStatus::Error, now).unwrap();
        state.update_status("a", AgentStatus::Error, now).unwrap();

        let update = state.update_status("a", AgentStatus::Healthy, now).unwrap();
        assert!(update.breaker_event.is_none());
        assert_eq!(state.breakers.get("a").map(|b| b.consecutive_failures()), Some(0));
        assert_eq!(state.breakers.state("a", now), Some(CircuitState::Closed));
    }

    #[test]
    fn test_healthy_status_leaves_open_breaker_isolated() {
        let mut state = state_with(vec![AgentSpec::new("a", "A").with_capability("x")]);
        let now = Instant::now();
        state.breakers.force_open("a", now);
        state.routes.remove_agent("a");

        let update = state.update_status("a", AgentStatus::Healthy, now).unwrap();
        assert!(update.breaker_event.is_none());
        assert_eq!(state.breakers.state("a", now), Some(CircuitState::Open));
        assert!(!state.routes.references("a"));
        assert!(state.find_route("x", &[], now).is_none());

        // Repeated healthy reports inside the recovery window change nothing.
        let later = now + Duration::from_secs(30);
        state.update_status("a", AgentStatus::Healthy, later).unwrap();
        assert_eq!(state.breakers.state("a", later), Some(CircuitState::Open));
        assert!(!state.routes.references("a"));
    }

    #[test]
    fn test_healthy_status_after_recovery_timeout_restores_routes_half_open() {
        let mut state = state_with(vec![AgentSpec::new("a", "A").with_capability("x")]);
        let now = Instant::now();
        state.breakers.force_open("a", now);
        state.routes.remove_agent("a");

        let later = now + Duration::from_secs(61);
        state.update_status("a", AgentStatus::Healthy, later).unwrap();
        assert_eq!(state.breakers.state("a", later), Some(CircuitState::HalfOpen));
        assert!(state.routes.references("a"));
        assert_eq!(state.find_route("x", &[], later), Some("a".into()));
    }

    #[test]
    fn test_load_lowers_score() {
        let mut state = state_with(vec![AgentSpec::new("a", "A").with_capability("x")]);
        let now = Instant::now();
        let agent: AgentId = "a".into();
        let idle = state.rescore("a", now).unwrap();
        for _ in 0..90 {
            state.complete(&agent, None, true, 0, true, now);
        }
        let busy = state.rescore("a", now).unwrap();
        assert!(busy < idle);
        let later = state.rescore("a", now + Duration::from_secs(120)).unwrap();
        assert!(later > busy);
    }
}
