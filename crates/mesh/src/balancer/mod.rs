//! Load balancing strategies.
//!
//! Strategies choose among the ranked candidates of a capability route:
//!
//! - `RoundRobinStrategy`: stateless rotation
//! - `LeastConnectionsStrategy`: fewest exchanges in flight
//! - `WeightedStrategy`: proportional to the registered weight
//! - `AdaptiveStrategy`: best route score, recomputed by the optimizer
//!
//! Every strategy only ever sees candidates the circuit breaker bank admits.
//!
//! # Example
//!
//! ```ignore
//! use switchboard_mesh::balancer::{create_strategy, Candidate};
//!
//! let strategy = create_strategy("least_connections").unwrap();
//! let candidates = vec![
//!     Candidate::new("a").with_in_flight(3),
//!     Candidate::new("b").with_in_flight(0),
//! ];
//! assert_eq!(strategy.select(&candidates).unwrap().as_str(), "b");
//! ```

mod adaptive;
mod least_connections;
mod round_robin;
mod strategy;
mod weighted;

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

pub use adaptive::AdaptiveStrategy;
pub use least_connections::LeastConnectionsStrategy;
pub use round_robin::RoundRobinStrategy;
pub use strategy::{Candidate, LoadBalancingStrategy};
pub use weighted::WeightedStrategy;

use crate::error::MeshError;

const DEFAULT_LOAD_CAPACITY: u32 = 100;
const DEFAULT_LOAD_WINDOW_MS: u64 = 60_000;

/// Configuration-selectable strategy.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    RoundRobin,
    LeastConnections,
    Weighted,
    #[default]
    Adaptive,
}

impl StrategyKind {
    /// Configuration name of the strategy.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::RoundRobin => "round_robin",
            Self::LeastConnections => "least_connections",
            Self::Weighted => "weighted",
            Self::Adaptive => "adaptive",
        }
    }

    /// Instantiate the strategy.
    #[must_use]
    pub fn build(self) -> Box<dyn LoadBalancingStrategy> {
        match self {
            Self::RoundRobin => Box::new(RoundRobinStrategy::new()),
            Self::LeastConnections => Box::new(LeastConnectionsStrategy::new()),
            Self::Weighted => Box::new(WeightedStrategy::new()),
            Self::Adaptive => Box::new(AdaptiveStrategy::new()),
        }
    }
}

impl fmt::Display for StrategyKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StrategyKind {
    type Err = MeshError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "round_robin" => Ok(Self::RoundRobin),
            "least_connections" => Ok(Self::LeastConnections),
            "weighted" => Ok(Self::Weighted),
            "adaptive" => Ok(Self::Adaptive),
            other => Err(MeshError::invalid_config(format!(
                "unknown load balancing strategy '{other}'"
            ))),
        }
    }
}

/// Load balancer configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BalancerConfig {
    #[serde(default)]
    pub strategy: StrategyKind,
    /// Communications per load window that count as fully loaded.
    #[serde(default = "default_load_capacity")]
    pub load_capacity: u32,
    /// Sliding window over which load is measured.
    #[serde(default = "default_load_window_ms")]
    pub load_window_ms: u64,
}

const fn default_load_capacity() -> u32 {
    DEFAULT_LOAD_CAPACITY
}

const fn default_load_window_ms() -> u64 {
    DEFAULT_LOAD_WINDOW_MS
}

impl Default for BalancerConfig {
    fn default() -> Self {
        Self {
            strategy: StrategyKind::default(),
            load_capacity: DEFAULT_LOAD_CAPACITY,
            load_window_ms: DEFAULT_LOAD_WINDOW_MS,
        }
    }
}

impl BalancerConfig {
    /// Load window as a duration.
    #[must_use]
    pub const fn load_window(&self) -> Duration {
        Duration::from_millis(self.load_window_ms)
    }
}

/// Create a boxed strategy by name.
///
/// # Supported names
///
/// - `"round_robin"`
/// - `"least_connections"`
/// - `"weighted"`
/// - `"adaptive"`
///
/// Returns `None` if the name is not recognized.
#[must_use]
pub fn create_strategy(name: &str) -> Option<Box<dyn LoadBalancingStrategy>> {
    name.parse::<StrategyKind>().ok().map(StrategyKind::build)
}

/// Names of every available strategy.
#[must_use]
pub const fn available_strategies() -> &'static [&'static str] {
    &["round_robin", "least_connections", "weighted", "adaptive"]
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_core::AgentId;

    #[test]
    fn test_create_strategy_by_name() {
        for name in available_strategies() {
            let strategy = create_strategy(name);
            assert_eq!(strategy.map(|s| s.name()), Some(*name));
        }
    }

    #[test]
    fn test_create_strategy_unknown() {
        assert!(create_strategy("random").is_none());
    }

    #[test]
    fn test_all_strategies_validate() {
        for name in available_strategies() {
            if let Some(strategy) = create_strategy(name) {
                assert!(strategy.validate().is_ok(), "strategy {name} should validate");
            }
        }
    }

    #[test]
    fn test_strategy_interchangeability() {
        let candidates = vec![
            Candidate::new("a").with_score(0.9).with_in_flight(1),
            Candidate::new("b").with_score(0.5),
        ];
        for name in available_strategies() {
            if let Some(strategy) = create_strategy(name) {
                let picked = strategy.select(&candidates);
                assert!(picked.is_some(), "strategy {name} should select an agent");
            }
        }
    }

    #[test]
    fn test_empty_candidates() {
        for name in available_strategies() {
            if let Some(strategy) = create_strategy(name) {
                assert_eq!(strategy.select(&[]), None::<AgentId>);
            }
        }
    }

    #[test]
    fn test_strategy_kind_serde_names() {
        let parsed: Result<StrategyKind, _> = serde_json::from_str("\"least_connections\"");
        assert_eq!(parsed.ok(), Some(StrategyKind::LeastConnections));
        assert_eq!(StrategyKind::default(), StrategyKind::Adaptive);
    }
}
