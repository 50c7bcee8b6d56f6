//! Load balancing strategy trait and its inputs.

use switchboard_core::AgentId;

use crate::error::MeshResult;
use crate::routing::RouteEntry;

/// What a strategy knows about one eligible agent.
///
/// Candidates arrive ranked by route score and already filtered by the
/// circuit breaker bank.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub agent_id: AgentId,
    /// Static weight from registration.
    pub weight: f64,
    /// Weight maintained by the optimizer.
    pub dynamic_weight: f64,
    pub score: f64,
    /// Exchanges currently awaiting a reply.
    pub in_flight: usize,
    /// Registration order.
    pub seq: u64,
}

impl Candidate {
    /// Build a candidate from a route entry and its in-flight count.
    #[must_use]
    pub fn from_entry(entry: &RouteEntry, in_flight: usize) -> Self {
        Self {
            agent_id: entry.agent_id.clone(),
            weight: entry.weight,
            dynamic_weight: entry.dynamic_weight,
            score: entry.score,
            in_flight,
            seq: entry.seq,
        }
    }

    /// Create a candidate with neutral weights, mainly for tests.
    pub fn new(agent_id: impl Into<AgentId>) -> Self {
        Self {
            agent_id: agent_id.into(),
            weight: 1.0,
            dynamic_weight: 1.0,
            score: 0.0,
            in_flight: 0,
            seq: 0,
        }
    }

    /// Set the static weight.
    #[must_use]
    pub const fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Set the optimizer weight.
    #[must_use]
    pub const fn with_dynamic_weight(mut self, weight: f64) -> Self {
        self.dynamic_weight = weight;
        self
    }

    /// Set the route score.
    #[must_use]
    pub const fn with_score(mut self, score: f64) -> Self {
        self.score = score;
        self
    }

    /// Set the in-flight count.
    #[must_use]
    pub const fn with_in_flight(mut self, in_flight: usize) -> Self {
        self.in_flight = in_flight;
        self
    }
}

/// Picks one agent among ranked, breaker-approved candidates.
///
/// Implementations must be thread-safe; any rotation state lives behind
/// atomics so selection takes `&self`.
pub trait LoadBalancingStrategy: Send + Sync + std::fmt::Debug {
    /// Select an agent, or `None` when there is no candidate.
    fn select(&self, candidates: &[Candidate]) -> Option<AgentId>;

    /// Name used in configuration.
    fn name(&self) -> &'static str;

    /// Validate the strategy's own settings.
    ///
    /// # Errors
    ///
    /// Returns an error describing the invalid setting.
    fn validate(&self) -> MeshResult<()> {
        Ok(())
    }
}
