//! Least-connections load balancing strategy.

use switchboard_core::AgentId;

use super::strategy::{Candidate, LoadBalancingStrategy};

/// Picks the candidate with the fewest exchanges in flight.
///
/// Ties go to the better ranked candidate.
#[derive(Debug, Clone, Copy, Default)]
pub struct LeastConnectionsStrategy;

impl LeastConnectionsStrategy {
    /// Create a new least-connections strategy.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl LoadBalancingStrategy for LeastConnectionsStrategy {
    fn select(&self, candidates: &[Candidate]) -> Option<AgentId> {
        candidates
            .iter()
            .enumerate()
            .min_by_key(|(rank, c)| (c.in_flight, *rank))
            .map(|(_, c)| c.agent_id.clone())
    }

    fn name(&self) -> &'static str {
        "least_connections"
    }
}
