//! Round-robin load balancing strategy.

use std::sync::atomic::{AtomicUsize, Ordering};

use switchboard_core::AgentId;

use super::strategy::{Candidate, LoadBalancingStrategy};

/// Rotates through the candidates in order, ignoring scores and load.
#[derive(Debug, Default)]
pub struct RoundRobinStrategy {
    next: AtomicUsize,
}

impl RoundRobinStrategy {
    /// Create a new round-robin strategy.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }
}

impl LoadBalancingStrategy for RoundRobinStrategy {
    fn select(&self, candidates: &[Candidate]) -> Option<AgentId> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % candidates.len();
        candidates.get(index).map(|c| c.agent_id.clone())
    }

    fn name(&self) -> &'static str {
        "round_robin"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_round_robin_rotates() {
        let strategy = RoundRobinStrategy::new();
        let candidates = vec![Candidate::new("a"), Candidate::new("b"), Candidate::new("c")];

        let picks: Vec<_> = (0..6)
            .filter_map(|_| strategy.select(&candidates))
            .map(|id| id.as_str().to_string())
            .collect();
        assert_eq!(picks, vec!["a", "b", "c", "a", "b", "c"]);
    }

    #[test]
    fn test_round_robin_empty() {
        assert!(RoundRobinStrategy::new().select(&[]).is_none());
    }
}
