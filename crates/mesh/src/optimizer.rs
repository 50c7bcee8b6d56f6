//! Route optimizer.
//!
//! A pass recomputes every agent's route score from its metrics and recent
//! load, then nudges its balancing weight: fast reliable agents are boosted,
//! loaded or unreliable ones decayed, always within `[min_weight, max_weight]`.
//! Response-time degradation anomalies trigger an extra pass.

use std::sync::Arc;
use std::time::Duration;

use itertools::Itertools;
use serde::{Deserialize, Serialize};
use switchboard_core::AgentId;
use switchboard_events::{EventBus, EventPattern, Payload, Topic};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::anomaly::Metric;
use crate::mesh::stopped;
use crate::routing::{LOAD_CEILING, RELIABILITY_FLOOR};
use crate::state::SharedState;

/// Optimizer configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OptimizerConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Weight multiplier for fast reliable agents.
    #[serde(default = "default_boost_factor")]
    pub boost_factor: f64,
    /// Weight multiplier for loaded or unreliable agents.
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f64,
    #[serde(default = "default_min_weight")]
    pub min_weight: f64,
    #[serde(default = "default_max_weight")]
    pub max_weight: f64,
    /// Reliability above which an agent may be boosted.
    #[serde(default = "default_high_reliability")]
    pub high_reliability: f64,
    /// Average response time below which an agent may be boosted.
    #[serde(default = "default_fast_response_ms")]
    pub fast_response_ms: f64,
}

const fn default_interval_ms() -> u64 {
    300_000
}

const fn default_boost_factor() -> f64 {
    1.1
}

const fn default_decay_factor() -> f64 {
    0.9
}

const fn default_min_weight() -> f64 {
    0.1
}

const fn default_max_weight() -> f64 {
    10.0
}

const fn default_high_reliability() -> f64 {
    0.95
}

const fn default_fast_response_ms() -> f64 {
    1_000.0
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            boost_factor: default_boost_factor(),
            decay_factor: default_decay_factor(),
            min_weight: default_min_weight(),
            max_weight: default_max_weight(),
            high_reliability: default_high_reliability(),
            fast_response_ms: default_fast_response_ms(),
        }
    }
}

impl OptimizerConfig {
    /// Interval between passes.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

/// Summary of one optimization pass.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OptimizationReport {
    pub rescored: usize,
    pub boosted: Vec<AgentId>,
    pub decayed: Vec<AgentId>,
}

/// Recomputes route scores and balancing weights.
#[derive(Debug)]
pub struct Optimizer {
    config: OptimizerConfig,
    bus: Arc<EventBus>,
    state: SharedState,
    passes: Mutex<u64>,
}

impl Optimizer {
    /// Create an optimizer.
    #[must_use]
    pub fn new(config: OptimizerConfig, bus: Arc<EventBus>, state: SharedState) -> Self {
        Self {
            config,
            bus,
            state,
            passes: Mutex::new(0),
        }
    }

    /// Run one pass over every registered agent.
    ///
    /// Passes never interleave: a second caller waits for the running one.
    pub async fn optimize(&self) -> OptimizationReport {
        let mut passes = self.passes.lock().await;
        let mut report = OptimizationReport::default();
        let now = Instant::now();

        {
            let mut state = self.state.lock().await;
            let agents = state.registry.list().iter().map(|a| a.id.clone()).collect_vec();

            for agent_id in agents {
                let Some(inputs) = state.score_inputs(agent_id.as_str(), now) else {
                    continue;
                };
                state.rescore(agent_id.as_str(), now);
                report.rescored += 1;

                let Some(current) = state.routes.dynamic_weight(agent_id.as_str()) else {
                    continue;
                };
                let factor = if inputs.reliability < RELIABILITY_FLOOR || inputs.load > LOAD_CEILING {
                    report.decayed.push(agent_id.clone());
                    self.config.decay_factor
                } else if inputs.reliability > self.config.high_reliability
                    && inputs.avg_response_ms < self.config.fast_response_ms
                {
                    report.boosted.push(agent_id.clone());
                    self.config.boost_factor
                } else {
                    continue;
                };
                let weight = (current * factor).clamp(self.config.min_weight, self.config.max_weight);
                state.routes.set_dynamic_weight(agent_id.as_str(), weight);
            }

            state.anomalies.prune(now);
        }

        *passes += 1;
        debug!(
            pass = *passes,
            rescored = report.rescored,
            boosted = %report.boosted.iter().join(","),
            decayed = %report.decayed.iter().join(","),
            "Optimization pass complete"
        );
        report
    }

    /// Completed passes.
    pub async fn passes(&self) -> u64 {
        *self.passes.lock().await
    }

    /// Run passes on the interval and after every response-time degradation
    /// anomaly, until shutdown.
    pub async fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        let (subscriber_id, mut anomalies) = self
            .bus
            .subscribe_with_pattern(EventPattern::Topic(Topic::AnomalyDetected))
            .await;

        tokio::spawn(async move {
            let period = self.config.interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = self.config.interval_ms, "Optimizer started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.optimize().await;
                    }
                    event = anomalies.recv() => match event {
                        Ok(event) => {
                            if let Payload::AnomalyDetected { agent_id, metric, value, mean, .. } = event.payload {
                                if metric == Metric::ResponseTime.as_str() && value > mean {
                                    info!(agent_id = %agent_id, value, mean, "Response time degraded; re-optimizing routes");
                                    self.optimize().await;
                                }
                            }
                        }
                        Err(e) if e.is_recoverable() => {
                            warn!(error = %e, "Optimizer lagged behind anomaly events");
                        }
                        Err(_) => break,
                    },
                    () = stopped(&mut shutdown) => break,
                }
            }
            self.bus.unsubscribe(subscriber_id).await;
            debug!("Optimizer stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::MeshConfig;
    use crate::state::MeshState;
    use switchboard_events::AgentSpec;

    async fn optimizer(specs: Vec<AgentSpec>) -> (Optimizer, SharedState) {
        let config = MeshConfig::default();
        let state = MeshState::new(&config).shared();
        {
            let mut guard = state.lock().await;
            for spec in specs {
                guard.register(spec, Instant::now()).unwrap();
            }
        }
        let optimizer = Optimizer::new(
            config.optimizer,
            Arc::new(EventBus::new()),
            Arc::clone(&state),
        );
        (optimizer, state)
    }

    #[tokio::test]
    async fn test_boosts_reliable_and_decays_unreliable() {
        let (optimizer, state) = optimizer(vec![
            AgentSpec::new("good", "Good").with_capability("x"),
            AgentSpec::new("flaky", "Flaky").with_capability("x").with_reliability(0.5),
        ])
        .await;

        let report = optimizer.optimize().await;

        assert_eq!(report.rescored, 2);
        assert_eq!(report.boosted, vec![AgentId::from("good")]);
        assert_eq!(report.decayed, vec![AgentId::from("flaky")]);
        let guard = state.lock().await;
        assert!((guard.routes.dynamic_weight("good").unwrap() - 1.1).abs() < 1e-9);
        assert!((guard.routes.dynamic_weight("flaky").unwrap() - 0.9).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_weights_stay_clamped() {
        let (optimizer, state) = optimizer(vec![
            AgentSpec::new("flaky", "Flaky").with_capability("x").with_reliability(0.1),
        ])
        .await;

        for _ in 0..50 {
            optimizer.optimize().await;
        }

        let weight = state.lock().await.routes.dynamic_weight("flaky").unwrap();
        assert!((weight - 0.1).abs() < 1e-9);
        assert_eq!(optimizer.passes().await, 50);
    }

    #[tokio::test]
    async fn test_agent_without_routes_is_rescored_but_not_weighted() {
        let (optimizer, _state) = optimizer(vec![AgentSpec::new("bare", "Bare")]).await;
        let report = optimizer.optimize().await;
        assert_eq!(report.rescored, 1);
        assert!(report.boosted.is_empty());
    }
}
