//! Shared harness for mesh integration tests.
//!
//! A [`SimulatedAgent`] answers `agent.message` events addressed to it on
//! the bus, after a configurable latency, with a configurable behavior.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use switchboard_events::{EventBus, EventPattern, MeshEvent, MessageKind, Payload, Topic};
use switchboard_mesh::MeshConfig;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

/// How a simulated agent answers.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Reply with the payload.
    Reply(serde_json::Value),
    /// Reply with an error message.
    Fail(String),
    /// Answer health checks, reply to every request with an error message.
    FailRequests(String),
    /// Never answer.
    Silent,
}

/// An agent living on the bus.
pub struct SimulatedAgent {
    pub id: String,
    behavior: Arc<Mutex<Behavior>>,
    latency: Arc<Mutex<Duration>>,
    requests: Arc<AtomicUsize>,
    health_checks: Arc<AtomicUsize>,
    handle: JoinHandle<()>,
}

impl SimulatedAgent {
    /// Spawn an agent that replies `{"agent": id}` after 50ms.
    ///
    /// The agent is subscribed when this returns.
    pub async fn spawn(bus: &Arc<EventBus>, id: &str) -> Self {
        let behavior = Arc::new(Mutex::new(Behavior::Reply(
            serde_json::json!({ "agent": id }),
        )));
        let latency = Arc::new(Mutex::new(Duration::from_millis(50)));
        let requests = Arc::new(AtomicUsize::new(0));
        let health_checks = Arc::new(AtomicUsize::new(0));

        let (_, mut messages) = bus
            .subscribe_with_pattern(EventPattern::Topic(Topic::AgentMessage))
            .await;

        let handle = {
            let bus = Arc::clone(bus);
            let id = id.to_string();
            let behavior = Arc::clone(&behavior);
            let latency = Arc::clone(&latency);
            let requests = Arc::clone(&requests);
            let health_checks = Arc::clone(&health_checks);

            tokio::spawn(async move {
                while let Ok(event) = messages.recv().await {
                    let Payload::AgentMessage {
                        correlation_id,
                        agent_id,
                        kind,
                        ..
                    } = event.payload
                    else {
                        continue;
                    };
                    if agent_id.as_str() != id {
                        continue;
                    }
                    match kind {
                        MessageKind::Request => requests.fetch_add(1, Ordering::SeqCst),
                        MessageKind::HealthCheck => health_checks.fetch_add(1, Ordering::SeqCst),
                    };

                    let answer = behavior.lock().await.clone();
                    let delay = *latency.lock().await;
                    let bus = Arc::clone(&bus);
                    tokio::spawn(async move {
                        tokio::time::sleep(delay).await;
                        let result = match (answer, kind) {
                            (Behavior::Reply(payload), _) => Ok(payload),
                            (Behavior::FailRequests(_), MessageKind::HealthCheck) => {
                                Ok(serde_json::json!("ok"))
                            }
                            (Behavior::Fail(message) | Behavior::FailRequests(message), _) => {
                                Err(message)
                            }
                            (Behavior::Silent, _) => return,
                        };
                        bus.publish(MeshEvent::reply(correlation_id, agent_id, result))
                            .await;
                    });
                }
            })
        };

        Self {
            id: id.to_string(),
            behavior,
            latency,
            requests,
            health_checks,
            handle,
        }
    }

    pub async fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().await = behavior;
    }

    pub async fn set_latency(&self, latency: Duration) {
        *self.latency.lock().await = latency;
    }

    /// Requests received so far.
    pub fn requests(&self) -> usize {
        self.requests.load(Ordering::SeqCst)
    }

    /// Health checks received so far.
    pub fn health_checks(&self) -> usize {
        self.health_checks.load(Ordering::SeqCst)
    }
}

impl Drop for SimulatedAgent {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Default configuration with the periodic health and optimizer passes
/// pushed out of the way, so scenarios only see the traffic they drive.
pub fn quiet_config() -> MeshConfig {
    let mut config = MeshConfig::default();
    config.health.interval_ms = 3_600_000;
    config.optimizer.interval_ms = 3_600_000;
    config
}
