//! Periodic agent health checks.
//!
//! Every pass marks agents without recent activity `inactive`, probes the
//! rest concurrently through the dispatcher and feeds the result into the
//! breaker bank via the status update. Inactive agents past the retention
//! window are unregistered.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use switchboard_core::AgentId;
use switchboard_events::{AgentStatus, EventBus, MeshEvent, Payload};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::dispatcher::Dispatcher;
use crate::error::MeshError;
use crate::mesh::stopped;
use crate::state::{SharedState, StatusUpdate};

/// Health check configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthConfig {
    /// Interval between passes. Agents silent for twice this long are
    /// marked inactive instead of probed.
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Timeout of one health probe.
    #[serde(default = "default_probe_timeout_ms")]
    pub probe_timeout_ms: u64,
}

const fn default_interval_ms() -> u64 {
    30_000
}

const fn default_probe_timeout_ms() -> u64 {
    5_000
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            probe_timeout_ms: default_probe_timeout_ms(),
        }
    }
}

impl HealthConfig {
    /// Interval between passes.
    #[must_use]
    pub const fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Timeout of one probe.
    #[must_use]
    pub const fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    /// Silence after which an agent is considered inactive.
    #[must_use]
    pub const fn inactivity_threshold(&self) -> Duration {
        Duration::from_millis(self.interval_ms.saturating_mul(2))
    }
}

/// Summary of one health pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub checked: usize,
    pub healthy: usize,
    pub unhealthy: usize,
    pub inactive: usize,
    /// Agents unregistered after staying inactive past retention.
    pub removed: Vec<AgentId>,
}

/// Runs health passes over every registered agent.
#[derive(Debug)]
pub struct HealthMonitor {
    config: HealthConfig,
    bus: Arc<EventBus>,
    state: SharedState,
    dispatcher: Arc<Dispatcher>,
}

impl HealthMonitor {
    /// Create a monitor.
    #[must_use]
    pub const fn new(
        config: HealthConfig,
        bus: Arc<EventBus>,
        state: SharedState,
        dispatcher: Arc<Dispatcher>,
    ) -> Self {
        Self {
            config,
            bus,
            state,
            dispatcher,
        }
    }

    /// Run one pass over every registered agent.
    pub async fn check_all(&self) -> HealthReport {
        let now = Instant::now();
        let threshold = self.config.inactivity_threshold();

        let (idle, live): (Vec<_>, Vec<_>) = {
            let state = self.state.lock().await;
            state
                .registry
                .list()
                .into_iter()
                .map(|agent| {
                    let silent = now.saturating_duration_since(agent.last_seen) > threshold;
                    (agent.id.clone(), silent)
                })
                .partition(|(_, silent)| *silent)
        };

        let timeout = self.config.probe_timeout();
        let probes = live.into_iter().map(|(agent_id, _)| async move {
            let outcome = self.dispatcher.probe(&agent_id, timeout).await;
            (agent_id, outcome)
        });
        let outcomes = join_all(probes).await;

        let mut report = HealthReport {
            checked: idle.len() + outcomes.len(),
            ..HealthReport::default()
        };
        let mut updates = Vec::new();
        {
            let mut state = self.state.lock().await;
            let now = Instant::now();

            for (agent_id, _) in idle {
                if let Ok(update) = state.update_status(agent_id.as_str(), AgentStatus::Inactive, now) {
                    report.inactive += 1;
                    updates.push((agent_id, update));
                }
            }

            for (agent_id, outcome) in outcomes {
                let status = match outcome {
                    Ok(latency_ms) => {
                        debug!(agent_id = %agent_id, latency_ms, "Health probe answered");
                        AgentStatus::Healthy
                    }
                    Err(MeshError::AgentNotFound { .. }) => continue,
                    Err(error) => {
                        debug!(agent_id = %agent_id, error = %error, "Health probe failed");
                        AgentStatus::Unhealthy
                    }
                };
                // Unregistered while the probe was in flight.
                let Ok(update) = state.update_status(agent_id.as_str(), status, now) else {
                    continue;
                };
                if status == AgentStatus::Healthy {
                    report.healthy += 1;
                } else {
                    report.unhealthy += 1;
                }
                updates.push((agent_id, update));
            }

            for agent_id in state.registry.expired(now) {
                if state.unregister(agent_id.as_str()).is_ok() {
                    info!(agent_id = %agent_id, "Removed agent inactive past retention");
                    report.removed.push(agent_id);
                }
            }
        }

        self.publish_updates(updates).await;
        debug!(
            checked = report.checked,
            healthy = report.healthy,
            unhealthy = report.unhealthy,
            inactive = report.inactive,
            removed = report.removed.len(),
            "Health pass complete"
        );
        report
    }

    /// Run passes on the configured interval until shutdown.
    pub fn spawn(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let period = self.config.interval();
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            info!(interval_ms = self.config.interval_ms, "Health monitor started");

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        self.check_all().await;
                    }
                    () = stopped(&mut shutdown) => break,
                }
            }
            debug!("Health monitor stopped");
        })
    }

    async fn publish_updates(&self, updates: Vec<(AgentId, StatusUpdate)>) {
        for (agent_id, update) in updates {
            if let Some(event) = &update.breaker_event {
                if event.opened() {
                    warn!(agent_id = %agent_id, "Circuit breaker opened by failed health checks");
                }
                self.bus.publish(event.to_event()).await;
            }
            if update.changed() {
                info!(
                    agent_id = %agent_id,
                    previous = %update.previous,
                    status = %update.status,
                    "Agent health changed"
                );
                self.bus
                    .publish(MeshEvent::new(Payload::HealthStatus {
                        agent_id,
                        previous: update.previous,
                        status: update.status,
                    }))
                    .await;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::balancer::AdaptiveStrategy;
    use crate::breaker::CircuitState;
    use crate::config::MeshConfig;
    use crate::state::MeshState;
    use switchboard_events::{AgentSpec, EventPattern, Topic};

    async fn monitor(agents: &[&str]) -> (HealthMonitor, Arc<EventBus>, SharedState, watch::Sender<bool>) {
        let config = MeshConfig::for_testing();
        let bus = Arc::new(EventBus::new());
        let state = MeshState::new(&config).shared();
        {
            let mut guard = state.lock().await;
            for id in agents {
                guard.register(AgentSpec::new(*id, *id).with_capability("x"), Instant::now()).unwrap();
            }
        }
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&bus),
            Arc::clone(&state),
            Box::new(AdaptiveStrategy::new()),
            config.dispatch.clone(),
        ));
        let (shutdown, rx) = watch::channel(false);
        dispatcher.start_reply_pump(rx).await;
        let monitor = HealthMonitor::new(config.health, Arc::clone(&bus), Arc::clone(&state), dispatcher);
        (monitor, bus, state, shutdown)
    }

    async fn answer_health_checks(bus: &Arc<EventBus>, agent: &'static str) {
        let (_, mut messages) = bus
            .subscribe_with_pattern(EventPattern::Topic(Topic::AgentMessage))
            .await;
        let bus = Arc::clone(bus);
        tokio::spawn(async move {
            while let Ok(event) = messages.recv().await {
                if let Payload::AgentMessage { correlation_id, agent_id, .. } = event.payload {
                    if agent_id.as_str() == agent {
                        bus.publish(MeshEvent::reply(correlation_id, agent_id, Ok(serde_json::Value::Null)))
                            .await;
                    }
                }
            }
        });
    }

    #[tokio::test(start_paused = true)]
    async fn test_probe_outcomes_set_status() {
        let (monitor, bus, state, _shutdown) = monitor(&["up", "down"]).await;
        answer_health_checks(&bus, "up").await;

        let report = monitor.check_all().await;

        assert_eq!(report.checked, 2);
        assert_eq!(report.healthy, 1);
        assert_eq!(report.unhealthy, 1);
        let guard = state.lock().await;
        assert_eq!(guard.registry.get("up").unwrap().status, AgentStatus::Healthy);
        assert_eq!(guard.registry.get("down").unwrap().status, AgentStatus::Unhealthy);
        assert_eq!(guard.breakers.get("down").unwrap().consecutive_failures(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_answered_probe_keeps_isolated_agent_isolated() {
        let (monitor, bus, state, _shutdown) = monitor(&["up"]).await;
        answer_health_checks(&bus, "up").await;
        {
            let mut guard = state.lock().await;
            guard.breakers.force_open("up", Instant::now());
            guard.routes.remove_agent("up");
        }

        let report = monitor.check_all().await;

        assert_eq!(report.healthy, 1);
        let guard = state.lock().await;
        let now = Instant::now();
        assert_eq!(guard.breakers.state("up", now), Some(CircuitState::Open));
        assert!(!guard.routes.references("up"));
        assert!(guard.find_route("x", &[], now).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_agent_marked_inactive_without_probe() {
        let (monitor, _bus, state, _shutdown) = monitor(&["quiet"]).await;
        // for_testing interval is 200ms
        tokio::time::advance(Duration::from_millis(401)).await;

        let report = monitor.check_all().await;

        assert_eq!(report.inactive, 1);
        assert_eq!(
            state.lock().await.registry.get("quiet").unwrap().status,
            AgentStatus::Inactive
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_event_only_on_change() {
        let (monitor, bus, _state, _shutdown) = monitor(&["up"]).await;
        answer_health_checks(&bus, "up").await;
        let (_, mut statuses) = bus
            .subscribe_with_pattern(EventPattern::Topic(Topic::HealthStatus))
            .await;

        monitor.check_all().await;
        monitor.check_all().await;

        assert!(statuses.recv().await.is_ok());
        assert!(statuses.try_recv().is_err());
    }
}
