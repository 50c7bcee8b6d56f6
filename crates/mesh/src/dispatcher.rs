//! Request/response dispatch over the event bus.
//!
//! An exchange publishes an `agent.message` tagged with a correlation id and
//! races the matching `agent.reply` against a timer. Every outcome is recorded
//! in the shared state (registry metrics, breaker, history) before it is
//! returned, and announced as `communication.response`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use switchboard_core::{AgentId, CorrelationId};
use switchboard_events::{
    BroadcastTarget, EventBus, EventPattern, MeshEvent, MessageKind, Payload, Route, Topic,
};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::balancer::LoadBalancingStrategy;
use crate::breaker::BreakerEvent;
use crate::error::{MeshError, MeshResult};
use crate::state::{Completion, SharedState};

const DEFAULT_TIMEOUT_MS: u64 = 10_000;

/// Dispatcher configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DispatchConfig {
    /// Timeout of an exchange when the request names none.
    #[serde(default = "default_timeout_ms")]
    pub default_timeout_ms: u64,
}

const fn default_timeout_ms() -> u64 {
    DEFAULT_TIMEOUT_MS
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: DEFAULT_TIMEOUT_MS,
        }
    }
}

impl DispatchConfig {
    /// Default timeout as a duration.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        Duration::from_millis(self.default_timeout_ms)
    }
}

/// A request to dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendRequest {
    pub correlation_id: CorrelationId,
    pub source: Option<AgentId>,
    pub route: Route,
    pub payload: serde_json::Value,
    /// Overrides the configured default timeout.
    pub timeout: Option<Duration>,
}

impl SendRequest {
    /// Create a request with a fresh correlation id.
    #[must_use]
    pub fn new(route: Route, payload: serde_json::Value) -> Self {
        Self {
            correlation_id: CorrelationId::new(),
            source: None,
            route,
            payload,
            timeout: None,
        }
    }

    /// Attribute the request to a source agent.
    #[must_use]
    pub fn with_source(mut self, source: impl Into<AgentId>) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Set the timeout.
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

/// A successful exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    pub correlation_id: CorrelationId,
    pub agent_id: AgentId,
    pub payload: serde_json::Value,
    pub latency_ms: u64,
}

/// A failed exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchFailure {
    pub correlation_id: CorrelationId,
    pub error: MeshError,
    /// Whether this failure tripped the target's breaker.
    pub circuit_opened: bool,
}

impl fmt::Display for DispatchFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (correlation {})", self.error, self.correlation_id)
    }
}

impl std::error::Error for DispatchFailure {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&self.error)
    }
}

impl From<DispatchFailure> for MeshError {
    fn from(failure: DispatchFailure) -> Self {
        failure.error
    }
}

/// Per-agent outcome of a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastOutcome {
    pub agent_id: AgentId,
    pub result: Result<Response, DispatchFailure>,
}

/// Aggregate outcome of a broadcast.
#[derive(Debug, Clone, PartialEq)]
pub struct BroadcastReport {
    pub correlation_id: CorrelationId,
    pub successes: usize,
    pub failures: usize,
    pub outcomes: Vec<BroadcastOutcome>,
}

/// What an exchange produced before it was recorded.
enum Exchange {
    Reply(serde_json::Value),
    Remote(String),
    TimedOut,
    Closed,
}

/// Executes exchanges and records their outcomes.
pub struct Dispatcher {
    bus: Arc<EventBus>,
    state: SharedState,
    strategy: Box<dyn LoadBalancingStrategy>,
    config: DispatchConfig,
    pending: Mutex<HashMap<CorrelationId, oneshot::Sender<Result<serde_json::Value, String>>>>,
}

impl fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("strategy", &self.strategy.name())
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Dispatcher {
    /// Create a dispatcher. Replies are only resolved once
    /// [`Dispatcher::start_reply_pump`] is running.
    #[must_use]
    pub fn new(
        bus: Arc<EventBus>,
        state: SharedState,
        strategy: Box<dyn LoadBalancingStrategy>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            bus,
            state,
            strategy,
            config,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Name of the active balancing strategy.
    #[must_use]
    pub fn strategy_name(&self) -> &'static str {
        self.strategy.name()
    }

    /// Timeout applied when a request names none.
    #[must_use]
    pub const fn default_timeout(&self) -> Duration {
        self.config.default_timeout()
    }

    /// Subscribe to `agent.reply` and resolve pending exchanges until shutdown.
    ///
    /// The subscription exists when this returns, so no reply published
    /// afterwards is missed.
    pub async fn start_reply_pump(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let (subscriber_id, mut replies) = self
            .bus
            .subscribe_with_pattern(EventPattern::Topic(Topic::AgentReply))
            .await;
        let dispatcher = Arc::clone(self);

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = replies.recv() => match event {
                        Ok(event) => dispatcher.resolve(event).await,
                        Err(e) if e.is_recoverable() => {
                            warn!(error = %e, "Reply pump lagged");
                        }
                        Err(_) => break,
                    },
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
            dispatcher.bus.unsubscribe(subscriber_id).await;
            debug!("Reply pump stopped");
        })
    }

    /// Dispatch one request and record its outcome.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchFailure`] carrying `Timeout`, `CircuitOpen`,
    /// `NoRoute`, `Remote` or `AgentNotFound`.
    pub async fn send(&self, request: &SendRequest) -> Result<Response, DispatchFailure> {
        self.send_excluding(request, &[]).await
    }

    /// Dispatch, never selecting one of `excluding`.
    ///
    /// # Errors
    ///
    /// See [`Dispatcher::send`].
    pub async fn send_excluding(
        &self,
        request: &SendRequest,
        excluding: &[AgentId],
    ) -> Result<Response, DispatchFailure> {
        let correlation_id = request.correlation_id;
        let timeout = request.timeout.unwrap_or_else(|| self.default_timeout());

        let selection = {
            let mut state = self.state.lock().await;
            state.select(
                &request.route,
                excluding,
                self.strategy.as_ref(),
                Instant::now(),
            )
        };
        let selection = match selection {
            Ok(selection) => selection,
            Err(error) => {
                debug!(correlation_id = %correlation_id, route = %request.route, error = %error, "Request rejected");
                self.publish_response(correlation_id, None, 0, Err(&error)).await;
                return Err(DispatchFailure {
                    correlation_id,
                    error,
                    circuit_opened: false,
                });
            }
        };
        self.publish_breaker_event(selection.breaker_event.as_ref()).await;
        let agent_id = selection.agent_id;

        debug!(
            correlation_id = %correlation_id,
            agent_id = %agent_id,
            route = %request.route,
            "Dispatching request"
        );
        let started = Instant::now();
        let exchange = self
            .exchange(
                correlation_id,
                &agent_id,
                request.source.clone(),
                MessageKind::Request,
                request.payload.clone(),
                timeout,
            )
            .await;
        let latency_ms = elapsed_ms(started);

        let (result, responded) = match exchange {
            Exchange::Reply(payload) => (Ok(payload), true),
            Exchange::Remote(message) => (
                Err(MeshError::Remote {
                    agent_id: agent_id.clone(),
                    message,
                }),
                true,
            ),
            Exchange::TimedOut => (
                Err(MeshError::Timeout {
                    agent_id: agent_id.clone(),
                    timeout_ms: duration_ms(timeout),
                }),
                false,
            ),
            Exchange::Closed => (Err(MeshError::BusClosed), false),
        };

        let Completion {
            breaker_event,
            anomalies,
        } = {
            let mut state = self.state.lock().await;
            state.complete(
                &agent_id,
                request.source.clone(),
                result.is_ok(),
                latency_ms,
                responded,
                Instant::now(),
            )
        };
        let circuit_opened = breaker_event.as_ref().is_some_and(BreakerEvent::opened);
        self.publish_breaker_event(breaker_event.as_ref()).await;
        self.bus
            .publish_all(anomalies.iter().map(crate::anomaly::Anomaly::to_event))
            .await;

        self.publish_response(
            correlation_id,
            Some(agent_id.clone()),
            latency_ms,
            result.as_ref(),
        )
        .await;

        match result {
            Ok(payload) => Ok(Response {
                correlation_id,
                agent_id,
                payload,
                latency_ms,
            }),
            Err(error) => {
                debug!(correlation_id = %correlation_id, agent_id = %agent_id, error = %error, latency_ms, "Request failed");
                Err(DispatchFailure {
                    correlation_id,
                    error,
                    circuit_opened,
                })
            }
        }
    }

    /// Fan a request out to every agent of the target concurrently.
    ///
    /// Each agent gets its own exchange and timeout; the report is returned
    /// once every exchange has settled.
    pub async fn broadcast(
        &self,
        correlation_id: CorrelationId,
        target: &BroadcastTarget,
        source: Option<AgentId>,
        payload: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> BroadcastReport {
        let agents = self.state.lock().await.resolve_targets(target);

        let exchanges = agents.into_iter().map(|agent_id| {
            let request = SendRequest {
                correlation_id: CorrelationId::new(),
                source: source.clone(),
                route: Route::Agent(agent_id.clone()),
                payload: payload.clone(),
                timeout,
            };
            async move {
                let result = self.send(&request).await;
                BroadcastOutcome { agent_id, result }
            }
        });
        let outcomes = join_all(exchanges).await;

        let successes = outcomes.iter().filter(|o| o.result.is_ok()).count();
        let failures = outcomes.len() - successes;
        debug!(correlation_id = %correlation_id, successes, failures, "Broadcast settled");
        self.bus
            .publish(MeshEvent::new(Payload::CommunicationBroadcastResult {
                correlation_id,
                successes,
                failures,
            }))
            .await;

        BroadcastReport {
            correlation_id,
            successes,
            failures,
            outcomes,
        }
    }

    /// Send a health check to an agent, bypassing its breaker.
    ///
    /// Probes are not recorded as communications; a reply only counts as
    /// activity. Returns the round-trip time in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns `AgentNotFound`, `Timeout`, `Remote` or `BusClosed`.
    pub async fn probe(&self, agent_id: &AgentId, timeout: Duration) -> MeshResult<u64> {
        if !self.state.lock().await.registry.contains(agent_id.as_str()) {
            return Err(MeshError::agent_not_found(agent_id.clone()));
        }

        let started = Instant::now();
        let exchange = self
            .exchange(
                CorrelationId::new(),
                agent_id,
                None,
                MessageKind::HealthCheck,
                serde_json::Value::Null,
                timeout,
            )
            .await;
        let latency_ms = elapsed_ms(started);

        match exchange {
            Exchange::Reply(_) => {
                self.state.lock().await.registry.touch(agent_id.as_str(), Instant::now());
                Ok(latency_ms)
            }
            Exchange::Remote(message) => {
                self.state.lock().await.registry.touch(agent_id.as_str(), Instant::now());
                Err(MeshError::Remote {
                    agent_id: agent_id.clone(),
                    message,
                })
            }
            Exchange::TimedOut => Err(MeshError::Timeout {
                agent_id: agent_id.clone(),
                timeout_ms: duration_ms(timeout),
            }),
            Exchange::Closed => Err(MeshError::BusClosed),
        }
    }

    /// Exchanges awaiting a reply.
    pub async fn pending_count(&self) -> usize {
        self.pending.lock().await.len()
    }

    async fn exchange(
        &self,
        correlation_id: CorrelationId,
        agent_id: &AgentId,
        source: Option<AgentId>,
        kind: MessageKind,
        payload: serde_json::Value,
        timeout: Duration,
    ) -> Exchange {
        let (sender, receiver) = oneshot::channel();
        self.pending.lock().await.insert(correlation_id, sender);

        self.bus
            .publish(MeshEvent::new(Payload::AgentMessage {
                correlation_id,
                agent_id: agent_id.clone(),
                source,
                kind,
                payload,
            }))
            .await;

        let outcome = match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(Ok(payload))) => Exchange::Reply(payload),
            Ok(Ok(Err(message))) => Exchange::Remote(message),
            Ok(Err(_)) => Exchange::Closed,
            Err(_) => Exchange::TimedOut,
        };
        self.pending.lock().await.remove(&correlation_id);
        outcome
    }

    async fn resolve(&self, event: MeshEvent) {
        let Payload::AgentReply {
            correlation_id,
            agent_id,
            result,
        } = event.payload
        else {
            return;
        };

        let sender = self.pending.lock().await.remove(&correlation_id);
        match sender {
            Some(sender) => {
                if sender.send(result).is_err() {
                    debug!(correlation_id = %correlation_id, agent_id = %agent_id, "Reply arrived after the exchange settled");
                }
            }
            None => {
                debug!(correlation_id = %correlation_id, agent_id = %agent_id, "Reply for unknown correlation id ignored");
            }
        }
    }

    async fn publish_breaker_event(&self, event: Option<&BreakerEvent>) {
        if let Some(event) = event {
            if event.opened() {
                warn!(
                    agent_id = %event.agent_id,
                    consecutive_failures = event.consecutive_failures,
                    "Circuit breaker opened"
                );
            } else {
                debug!(
                    agent_id = %event.agent_id,
                    from = %event.transition.from,
                    to = %event.transition.to,
                    "Circuit breaker transition"
                );
            }
            self.bus.publish(event.to_event()).await;
        }
    }

    async fn publish_response(
        &self,
        correlation_id: CorrelationId,
        route: Option<AgentId>,
        latency_ms: u64,
        result: Result<&serde_json::Value, &MeshError>,
    ) {
        let (success, payload, error) = match result {
            Ok(payload) => (true, Some(payload.clone()), None),
            Err(error) => (false, None, Some(error.to_string())),
        };
        self.bus
            .publish(MeshEvent::new(Payload::CommunicationResponse {
                correlation_id,
                route,
                success,
                latency_ms,
                payload,
                error,
            }))
            .await;
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    duration_ms(started.elapsed())
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
