//! The mesh coordinator.
//!
//! Wires every component to one event bus and one shared state, consumes the
//! inbound topics and runs the background loops (reply pump, health checks,
//! optimization, snapshots) until shutdown.

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::future::join_all;
use serde::Serialize;
use switchboard_core::{AgentId, CorrelationId, FailureId, ResultExt};
use switchboard_events::{
    AgentSpec, AgentStatus, BroadcastTarget, ErrorReport, EventBus, EventPattern, MeshEvent,
    Payload, Topic,
};
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::config::MeshConfig;
use crate::dispatcher::{BroadcastReport, DispatchFailure, Dispatcher, Response, SendRequest};
use crate::error::MeshResult;
use crate::health::{HealthMonitor, HealthReport};
use crate::optimizer::{OptimizationReport, Optimizer};
use crate::persistence::{self, AgentStateSnapshot, RestoreReport, RoutingSnapshot, SnapshotStore};
use crate::recovery::{RecoveryManager, RecoveryStrategy, Remediation};
use crate::registry::AgentDescriptor;
use crate::state::{MeshState, SharedState, StatusUpdate};

/// Point-in-time counters.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct MeshStats {
    pub agents: usize,
    pub routes: usize,
    pub capabilities: usize,
    pub open_breakers: usize,
    pub history: usize,
    pub pending_failures: usize,
    pub retry_queue: usize,
    pub anomalies: usize,
}

/// Agent communication and resilience core.
pub struct Mesh {
    config: MeshConfig,
    bus: Arc<EventBus>,
    state: SharedState,
    dispatcher: Arc<Dispatcher>,
    recovery: Arc<RecoveryManager>,
    health: Arc<HealthMonitor>,
    optimizer: Arc<Optimizer>,
    snapshots: Option<SnapshotStore>,
    snapshot_lock: Mutex<()>,
    shutdown: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    started: AtomicBool,
}

impl std::fmt::Debug for Mesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mesh")
            .field("strategy", &self.dispatcher.strategy_name())
            .field("snapshots", &self.snapshots)
            .field("started", &self.started.load(Ordering::Acquire))
            .finish_non_exhaustive()
    }
}

impl Mesh {
    /// Build a mesh on a private bus.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::InvalidConfig` if the configuration is invalid.
    pub fn new(config: MeshConfig) -> MeshResult<Arc<Self>> {
        Self::with_bus(config, Arc::new(EventBus::new()))
    }

    /// Build a mesh on an existing bus shared with its participants.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::InvalidConfig` if the configuration is invalid.
    pub fn with_bus(config: MeshConfig, bus: Arc<EventBus>) -> MeshResult<Arc<Self>> {
        config.validate()?;

        let state = MeshState::new(&config).shared();
        let dispatcher = Arc::new(Dispatcher::new(
            Arc::clone(&bus),
            Arc::clone(&state),
            config.balancer.strategy.build(),
            config.dispatch.clone(),
        ));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let recovery = Arc::new(RecoveryManager::new(
            &config,
            Arc::clone(&bus),
            Arc::clone(&state),
            Arc::clone(&dispatcher),
            shutdown_rx,
        ));
        let health = Arc::new(HealthMonitor::new(
            config.health.clone(),
            Arc::clone(&bus),
            Arc::clone(&state),
            Arc::clone(&dispatcher),
        ));
        let optimizer = Arc::new(Optimizer::new(
            config.optimizer.clone(),
            Arc::clone(&bus),
            Arc::clone(&state),
        ));
        let snapshots = config.persistence.directory.as_ref().map(SnapshotStore::new);

        Ok(Arc::new(Self {
            config,
            bus,
            state,
            dispatcher,
            recovery,
            health,
            optimizer,
            snapshots,
            snapshot_lock: Mutex::new(()),
            shutdown,
            tasks: Mutex::new(Vec::new()),
            started: AtomicBool::new(false),
        }))
    }

    /// The bus agents and collaborators publish on.
    #[must_use]
    pub fn bus(&self) -> Arc<EventBus> {
        Arc::clone(&self.bus)
    }

    /// Active configuration.
    #[must_use]
    pub const fn config(&self) -> &MeshConfig {
        &self.config
    }

    /// Shared state, for inspection.
    #[must_use]
    pub fn state(&self) -> SharedState {
        Arc::clone(&self.state)
    }

    /// The recovery manager.
    #[must_use]
    pub fn recovery(&self) -> &Arc<RecoveryManager> {
        &self.recovery
    }

    /// Start the background loops. Calling it again is a no-op.
    ///
    /// Every subscription exists when this returns, so events published
    /// afterwards are not missed.
    pub async fn start(self: &Arc<Self>) {
        if self.started.swap(true, Ordering::AcqRel) {
            debug!("Mesh already started");
            return;
        }

        let mut tasks = Vec::new();
        tasks.push(
            self.dispatcher
                .start_reply_pump(self.shutdown.subscribe())
                .await,
        );
        tasks.push(self.start_inbound_loop().await);
        tasks.push(Arc::clone(&self.health).spawn(self.shutdown.subscribe()));
        tasks.push(
            Arc::clone(&self.optimizer)
                .spawn(self.shutdown.subscribe())
                .await,
        );
        if self.snapshots.is_some() {
            tasks.push(self.start_snapshot_loop());
        }
        self.tasks.lock().await.extend(tasks);

        info!(
            strategy = self.dispatcher.strategy_name(),
            snapshots = self.snapshots.is_some(),
            "Mesh started"
        );
    }

    /// Stop every loop, cancel scheduled retries and write final snapshots.
    pub async fn shutdown(&self) {
        if self.shutdown.send_replace(true) {
            return;
        }
        info!("Mesh shutting down");

        let tasks = std::mem::take(&mut *self.tasks.lock().await);
        for result in join_all(tasks).await {
            if let Err(e) = result {
                error!(error = %e, "Mesh task ended abnormally");
            }
        }
        self.save_snapshots().await.into_option_logged();
        info!("Mesh stopped");
    }

    /// Register an agent.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::DuplicateAgent` if the id is taken.
    pub async fn register_agent(&self, spec: AgentSpec) -> MeshResult<()> {
        let agent_id = spec.id.clone();
        let capabilities = spec.capabilities.len();
        self.state.lock().await.register(spec, Instant::now())?;
        info!(agent_id = %agent_id, capabilities, "Agent registered");
        Ok(())
    }

    /// Unregister an agent and every structure referencing it.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::AgentNotFound` if the id is unknown.
    pub async fn unregister_agent(&self, agent_id: &str) -> MeshResult<AgentDescriptor> {
        let removed = self.state.lock().await.unregister(agent_id)?;
        info!(agent_id = %agent_id, "Agent unregistered");
        Ok(removed)
    }

    /// Apply a status an agent reported about itself.
    ///
    /// A `failed` agent is isolated and handed to recovery.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::AgentNotFound` if the id is unknown.
    pub async fn update_status(
        self: &Arc<Self>,
        agent_id: &AgentId,
        status: AgentStatus,
    ) -> MeshResult<StatusUpdate> {
        let update = {
            let mut state = self.state.lock().await;
            let now = Instant::now();
            let update = state.update_status(agent_id.as_str(), status, now)?;
            state.registry.touch(agent_id.as_str(), now);
            update
        };
        debug!(agent_id = %agent_id, previous = %update.previous, %status, "Agent status updated");

        if let Some(event) = &update.breaker_event {
            self.bus.publish(event.to_event()).await;
        }
        if status == AgentStatus::Failed {
            self.recovery
                .handle_agent_failure(agent_id, "agent reported failed")
                .await;
        }
        Ok(update)
    }

    /// Replace an agent's capabilities.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::AgentNotFound` if the id is unknown.
    pub async fn update_capabilities(
        &self,
        agent_id: &str,
        capabilities: BTreeSet<String>,
    ) -> MeshResult<()> {
        self.state
            .lock()
            .await
            .update_capabilities(agent_id, capabilities)?;
        debug!(agent_id = %agent_id, "Agent capabilities updated");
        Ok(())
    }

    /// Copy of one agent.
    pub async fn get_agent(&self, agent_id: &str) -> Option<AgentDescriptor> {
        self.state.lock().await.registry.get(agent_id).cloned()
    }

    /// Every agent, in registration order.
    pub async fn list_agents(&self) -> Vec<AgentDescriptor> {
        self.state
            .lock()
            .await
            .registry
            .list()
            .into_iter()
            .cloned()
            .collect()
    }

    /// Agents offering a capability, in registration order.
    pub async fn list_by_capability(&self, capability: &str) -> Vec<AgentDescriptor> {
        self.state
            .lock()
            .await
            .registry
            .list_by_capability(capability)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Highest ranked agent for a capability whose breaker admits traffic.
    pub async fn find_route(&self, capability: &str, excluding: &[AgentId]) -> Option<AgentId> {
        self.state
            .lock()
            .await
            .find_route(capability, excluding, Instant::now())
    }

    /// Dispatch a request.
    ///
    /// Failures are returned to the caller and also handed to recovery with
    /// the request attached. A failure that opens the target's breaker
    /// isolates the agent.
    ///
    /// # Errors
    ///
    /// Returns a [`DispatchFailure`] carrying `Timeout`, `CircuitOpen`,
    /// `NoRoute`, `Remote` or `AgentNotFound`.
    pub async fn send(self: &Arc<Self>, request: SendRequest) -> Result<Response, DispatchFailure> {
        match self.dispatcher.send(&request).await {
            Ok(response) => Ok(response),
            Err(failure) => {
                self.on_dispatch_failure(&failure, Some(request)).await;
                Err(failure)
            }
        }
    }

    /// Send the same payload to every agent of a target concurrently.
    pub async fn broadcast(
        self: &Arc<Self>,
        target: &BroadcastTarget,
        payload: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> BroadcastReport {
        self.broadcast_as(CorrelationId::new(), target, None, payload, timeout)
            .await
    }

    /// Broadcast to an explicit subset of agents.
    pub async fn multicast(
        self: &Arc<Self>,
        agents: Vec<AgentId>,
        payload: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> BroadcastReport {
        self.broadcast(&BroadcastTarget::Agents(agents), payload, timeout)
            .await
    }

    /// Hand an error to recovery.
    pub async fn report_error(&self, report: ErrorReport) -> FailureId {
        self.recovery.handle_error(report, None, false).await
    }

    /// Hand a critical error to recovery; it escalates immediately.
    pub async fn report_critical(&self, report: ErrorReport) -> FailureId {
        self.recovery.handle_error(report, None, true).await
    }

    /// Supply the remediation for a recovery strategy.
    pub async fn register_remediation(
        &self,
        strategy: RecoveryStrategy,
        handler: Arc<dyn Remediation>,
    ) {
        self.recovery.register_remediation(strategy, handler).await;
    }

    /// Run an optimization pass now.
    pub async fn optimize_now(&self) -> OptimizationReport {
        self.optimizer.optimize().await
    }

    /// Run a health pass now.
    pub async fn check_health_now(&self) -> HealthReport {
        self.health.check_all().await
    }

    /// Current counters.
    pub async fn stats(&self) -> MeshStats {
        let mut stats = {
            let state = self.state.lock().await;
            MeshStats {
                agents: state.registry.len(),
                routes: state.routes.len(),
                capabilities: state.routes.capabilities().count(),
                open_breakers: state.open_breakers(Instant::now()).len(),
                history: state.history.len(),
                anomalies: state.anomalies.anomalies().len(),
                ..MeshStats::default()
            }
        };
        stats.pending_failures = self.recovery.pending_count().await;
        stats.retry_queue = self.recovery.queue_len().await;
        stats
    }

    /// Write both snapshots. Returns `false` when persistence is disabled.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Persistence` if a snapshot cannot be written.
    pub async fn save_snapshots(&self) -> MeshResult<bool> {
        let Some(store) = &self.snapshots else {
            return Ok(false);
        };
        let _serialized = self.snapshot_lock.lock().await;
        let (routing, agents) = {
            let state = self.state.lock().await;
            (RoutingSnapshot::capture(&state), AgentStateSnapshot::capture(&state))
        };
        store.save(&routing, &agents).await?;
        Ok(true)
    }

    /// Pre-seed the registry and routing table from the snapshots.
    ///
    /// Returns `None` when persistence is disabled or nothing was saved yet.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Persistence` if a snapshot is unreadable.
    pub async fn restore(&self) -> MeshResult<Option<RestoreReport>> {
        let Some(store) = &self.snapshots else {
            return Ok(None);
        };
        let Some(agents) = store.load_agents().await? else {
            debug!(dir = %store.dir().display(), "No agent snapshot to restore");
            return Ok(None);
        };
        let routing = store.load_routing().await?;

        let report = persistence::restore(
            &mut *self.state.lock().await,
            agents,
            routing,
            Instant::now(),
        );
        info!(
            agents = report.agents,
            skipped = report.skipped,
            routes = report.routes,
            "Restored from snapshots"
        );
        Ok(Some(report))
    }

    async fn broadcast_as(
        self: &Arc<Self>,
        correlation_id: CorrelationId,
        target: &BroadcastTarget,
        source: Option<AgentId>,
        payload: &serde_json::Value,
        timeout: Option<Duration>,
    ) -> BroadcastReport {
        let report = self
            .dispatcher
            .broadcast(correlation_id, target, source, payload, timeout)
            .await;
        for outcome in &report.outcomes {
            if let Err(failure) = &outcome.result {
                if failure.circuit_opened {
                    self.recovery
                        .handle_agent_failure(&outcome.agent_id, &failure.error.to_string())
                        .await;
                }
            }
        }
        report
    }

    async fn on_dispatch_failure(
        self: &Arc<Self>,
        failure: &DispatchFailure,
        request: Option<SendRequest>,
    ) {
        self.recovery
            .handle_error(failure.error.to_report(), request, false)
            .await;

        if failure.circuit_opened {
            if let Some(agent_id) = failure.error.agent_id() {
                self.recovery
                    .handle_agent_failure(agent_id, &failure.error.to_string())
                    .await;
            }
        }
    }

    async fn start_inbound_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let (subscriber_id, mut inbound) = self
            .bus
            .subscribe_with_pattern(EventPattern::Topics(Topic::inbound().to_vec()))
            .await;
        let mesh = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = inbound.recv() => match event {
                        Ok(event) => mesh.handle_inbound(event).await,
                        Err(e) if e.is_recoverable() => {
                            warn!(error = %e, "Inbound loop lagged; events were dropped");
                        }
                        Err(_) => break,
                    },
                    () = stopped(&mut shutdown) => break,
                }
            }
            mesh.bus.unsubscribe(subscriber_id).await;
            debug!("Inbound loop stopped");
        })
    }

    async fn handle_inbound(self: &Arc<Self>, event: MeshEvent) {
        let topic = event.topic();
        let result = match event.payload {
            Payload::AgentRegister { spec } => self.register_agent(spec).await,
            Payload::AgentUnregister { agent_id } => {
                self.unregister_agent(agent_id.as_str()).await.map(|_| ())
            }
            Payload::AgentStatusChange { agent_id, status } => {
                self.update_status(&agent_id, status).await.map(|_| ())
            }
            Payload::AgentCapabilityUpdate {
                agent_id,
                capabilities,
            } => {
                self.update_capabilities(agent_id.as_str(), capabilities.into_iter().collect())
                    .await
            }
            Payload::CommunicationRequest {
                correlation_id,
                source,
                route,
                payload,
                timeout_ms,
            } => {
                let request = SendRequest {
                    correlation_id,
                    source,
                    route,
                    payload,
                    timeout: timeout_ms.map(Duration::from_millis),
                };
                let mesh = Arc::clone(self);
                tokio::spawn(async move {
                    // The outcome is announced as communication.response.
                    if let Err(failure) = mesh.send(request).await {
                        debug!(
                            correlation_id = %failure.correlation_id,
                            error = %failure.error,
                            "Inbound request failed"
                        );
                    }
                });
                Ok(())
            }
            Payload::CommunicationBroadcast {
                correlation_id,
                source,
                target,
                payload,
                timeout_ms,
            } => {
                let mesh = Arc::clone(self);
                tokio::spawn(async move {
                    mesh.broadcast_as(
                        correlation_id,
                        &target,
                        source,
                        &payload,
                        timeout_ms.map(Duration::from_millis),
                    )
                    .await;
                });
                Ok(())
            }
            Payload::SystemError { report } => {
                self.recovery.handle_error(report, None, false).await;
                Ok(())
            }
            Payload::SystemCriticalError { report } => {
                self.recovery.handle_error(report, None, true).await;
                Ok(())
            }
            _ => Ok(()),
        };

        if let Err(e) = result {
            warn!(%topic, error = %e, "Inbound event rejected");
        }
    }

    fn start_snapshot_loop(self: &Arc<Self>) -> JoinHandle<()> {
        let mesh = Arc::clone(self);
        let mut shutdown = self.shutdown.subscribe();
        let period = self.config.persistence.snapshot_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        mesh.save_snapshots().await.into_option_logged();
                    }
                    () = stopped(&mut shutdown) => break,
                }
            }
            debug!("Snapshot loop stopped");
        })
    }
}

/// Resolve once shutdown has been requested or the sender is gone.
pub(crate) async fn stopped(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::panic)]

    use super::*;
    use crate::error::MeshError;
    use switchboard_events::Route;

    #[tokio::test]
    async fn test_invalid_config_is_rejected() {
        let mut config = MeshConfig::default();
        config.breaker.failure_threshold = 0;
        assert!(Mesh::new(config).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_register_event() {
        let mesh = Mesh::new(MeshConfig::for_testing()).unwrap();
        mesh.start().await;

        mesh.bus()
            .publish(MeshEvent::register(AgentSpec::new("a", "A").with_capability("x")))
            .await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(mesh.get_agent("a").await.is_some());
        assert_eq!(mesh.find_route("x", &[]).await, Some("a".into()));
        mesh.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_send_is_handed_to_recovery() {
        let mesh = Mesh::new(MeshConfig::for_testing()).unwrap();
        mesh.start().await;

        let failure = mesh
            .send(SendRequest::new(Route::Capability("none".into()), serde_json::Value::Null))
            .await
            .unwrap_err();

        assert_eq!(failure.error, MeshError::no_route("none"));
        assert_eq!(mesh.recovery().records().await.len(), 1);
        mesh.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_inbound_request_without_route_is_answered_and_recorded() {
        let mesh = Mesh::new(MeshConfig::for_testing()).unwrap();
        mesh.start().await;
        let (_, mut responses) = mesh
            .bus()
            .subscribe_with_pattern(EventPattern::Topic(Topic::CommunicationResponse))
            .await;

        let correlation_id = CorrelationId::new();
        mesh.bus()
            .publish(MeshEvent::new(Payload::CommunicationRequest {
                correlation_id,
                source: None,
                route: Route::Capability("none".into()),
                payload: serde_json::Value::Null,
                timeout_ms: None,
            }))
            .await;

        match responses.recv().await.unwrap().payload {
            Payload::CommunicationResponse {
                correlation_id: answered,
                success,
                route,
                ..
            } => {
                assert_eq!(answered, correlation_id);
                assert!(!success);
                assert!(route.is_none());
            }
            other => panic!("unexpected payload {other:?}"),
        }
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(mesh.recovery().records().await.len(), 1);
        mesh.shutdown().await;
    }

    #[tokio::test]
    async fn test_snapshots_disabled_by_default() {
        let mesh = Mesh::new(MeshConfig::default()).unwrap();
        assert!(!mesh.save_snapshots().await.unwrap());
        assert!(mesh.restore().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stats_count_agents_and_routes() {
        let mesh = Mesh::new(MeshConfig::default()).unwrap();
        mesh.register_agent(AgentSpec::new("a", "A").with_capability("x").with_capability("y"))
            .await
            .unwrap();
        let stats = mesh.stats().await;
        assert_eq!(stats.agents, 1);
        assert_eq!(stats.routes, 2);
        assert_eq!(stats.capabilities, 2);
    }
}
