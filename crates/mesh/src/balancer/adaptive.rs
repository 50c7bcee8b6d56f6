//! Adaptive load balancing strategy.

use switchboard_core::AgentId;

use super::strategy::{Candidate, LoadBalancingStrategy};

/// Picks the highest route score scaled by the optimizer weight.
///
/// Route scores and weights are recomputed by the optimizer, so this is the
/// strategy that learns from recent performance.
#[derive(Debug, Clone, Copy, Default)]
pub struct AdaptiveStrategy;

impl AdaptiveStrategy {
    /// Create a new adaptive strategy.
    #[must_use]
    pub const fn new() -> Self {
        Self
    }
}

impl LoadBalancingStrategy for AdaptiveStrategy {
    fn select(&self, candidates: &[Candidate]) -> Option<AgentId> {
        candidates
            .iter()
            .fold(None::<(&Candidate, f64)>, |best, c| {
                let value = c.score * c.dynamic_weight;
                match best {
                    Some((_, best_value)) if best_value >= value => best,
                    _ => Some((c, value)),
                }
            })
            .map(|(c, _)| c.agent_id.clone())
    }

    fn name(&self) -> &'static str {
        "adaptive"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adaptive_picks_best_weighted_score() {
        let candidates = vec![
            Candidate::new("a").with_score(0.9).with_dynamic_weight(0.5),
            Candidate::new("b").with_score(0.6).with_dynamic_weight(1.0),
        ];
        assert_eq!(
            AdaptiveStrategy::new().select(&candidates),
            Some(AgentId::from("b"))
        );
    }

    #[test]
    fn test_adaptive_tie_keeps_ranking() {
        let candidates = vec![
            Candidate::new("a").with_score(0.5),
            Candidate::new("b").with_score(0.5),
        ];
        assert_eq!(
            AdaptiveStrategy::new().select(&candidates),
            Some(AgentId::from("a"))
        );
    }
}
