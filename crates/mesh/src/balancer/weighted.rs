//! Weighted load balancing strategy.

use rand::Rng;
use switchboard_core::AgentId;

use super::strategy::{Candidate, LoadBalancingStrategy};

/// Random selection proportional to static weight times optimizer weight.
///
/// Candidates with a non-positive effective weight are never picked unless
/// every candidate has one, in which case the best ranked wins.
#[derive(Debug, Clone, Copy, Default)]
pub struct WeightedStrategy;

impl WeightedStrategy {
    /// Create a new weighted strategy.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }

    fn effective_weight(candidate: &Candidate) -> f64 {
        let weight = candidate.weight * candidate.dynamic_weight;
        if weight.is_finite() { weight.max(0.0) } else { 0.0 }
    }
}

impl LoadBalancingStrategy for WeightedStrategy {
    fn select(&self, candidates: &[Candidate]) -> Option<AgentId> {
        let total: f64 = candidates.iter().map(Self::effective_weight).sum();
        if total <= 0.0 {
            return candidates.first().map(|c| c.agent_id.clone());
        }

        let mut point = rand::thread_rng().gen_range(0.0..total);
        candidates
            .iter()
            .filter(|c| Self::effective_weight(c) > 0.0)
            .find(|c| {
                point -= Self::effective_weight(c);
                point < 0.0
            })
            .or_else(|| {
                candidates
                    .iter()
                    .rev()
                    .find(|c| Self::effective_weight(c) > 0.0)
            })
            .map(|c| c.agent_id.clone())
    }

    fn name(&self) -> &'static str {
        "weighted"
    }
}
