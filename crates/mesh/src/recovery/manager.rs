//! Recovery manager.
//!
//! Owns every failure record. A failure is classified, its strategy runs
//! once, and retryable classes are rescheduled on the backoff sequence until
//! they recover or exhaust the retry budget. Critical failures escalate
//! without remediation.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchboard_core::{AgentId, CorrelationId, FailureId};
use switchboard_events::{ErrorReport, EventBus, MeshEvent, Payload, Severity};
use tokio::sync::{Mutex, watch};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::backoff::BackoffSchedule;
use super::classify::RecoveryStrategy;
use super::record::{FailureRecord, FailureStatus, RetryQueueItem};
use super::remediation::{
    CleanupRemediation, Remediation, RemediationContext, RemediationRegistry,
};
use crate::config::MeshConfig;
use crate::dispatcher::{Dispatcher, SendRequest};
use crate::error::{MeshError, MeshResult};
use crate::mesh::stopped;
use crate::state::SharedState;

/// Recovery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecoveryConfig {
    /// Retries allowed after the initial attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before retry `n` is `backoff_ms[n - 1]`.
    #[serde(default = "default_backoff_ms")]
    pub backoff_ms: Vec<u64>,
    /// Random jitter added to each delay, as a fraction of it.
    #[serde(default)]
    pub jitter_factor: f64,
    /// Timeout multiplier for the extended-timeout strategy.
    #[serde(default = "default_timeout_retry_factor")]
    pub timeout_retry_factor: f64,
    /// Probe failed agents and half-open their breaker on success.
    #[serde(default = "default_auto_recovery")]
    pub auto_recovery: bool,
    /// Delay before the recovery probe of a failed agent.
    #[serde(default = "default_recovery_probe_delay_ms")]
    pub recovery_probe_delay_ms: u64,
    /// Most failure records kept; the oldest settled ones go first.
    #[serde(default = "default_max_records")]
    pub max_records: usize,
}

const fn default_max_retries() -> u32 {
    3
}

fn default_backoff_ms() -> Vec<u64> {
    vec![1_000, 5_000, 15_000]
}

const fn default_timeout_retry_factor() -> f64 {
    2.0
}

const fn default_auto_recovery() -> bool {
    true
}

const fn default_recovery_probe_delay_ms() -> u64 {
    60_000
}

const fn default_max_records() -> usize {
    1_000
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            backoff_ms: default_backoff_ms(),
            jitter_factor: 0.0,
            timeout_retry_factor: default_timeout_retry_factor(),
            auto_recovery: default_auto_recovery(),
            recovery_probe_delay_ms: default_recovery_probe_delay_ms(),
            max_records: default_max_records(),
        }
    }
}

impl RecoveryConfig {
    /// Backoff schedule described by this config.
    #[must_use]
    pub fn backoff(&self) -> BackoffSchedule {
        BackoffSchedule::new(self.backoff_ms.clone()).with_jitter(self.jitter_factor)
    }

    /// Delay before the recovery probe.
    #[must_use]
    pub const fn recovery_probe_delay(&self) -> Duration {
        Duration::from_millis(self.recovery_probe_delay_ms)
    }
}

/// Outcome of one remediation attempt, applied to the record.
enum Verdict {
    Recovered,
    Retry { retry: u32, delay: Duration },
    Permanent,
}

/// Classifies failures, runs remediation and schedules retries.
pub struct RecoveryManager {
    config: RecoveryConfig,
    backoff: BackoffSchedule,
    probe_timeout: Duration,
    bus: Arc<EventBus>,
    state: SharedState,
    dispatcher: Arc<Dispatcher>,
    remediations: RemediationRegistry,
    cleanup: CleanupRemediation,
    records: Mutex<HashMap<FailureId, FailureRecord>>,
    queue: Mutex<BTreeMap<FailureId, RetryQueueItem>>,
    probing: Mutex<HashSet<AgentId>>,
    shutdown: watch::Receiver<bool>,
}

impl std::fmt::Debug for RecoveryManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryManager")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl RecoveryManager {
    /// Create a manager. Scheduled retries and probes stop once `shutdown`
    /// turns `true`.
    #[must_use]
    pub fn new(
        config: &MeshConfig,
        bus: Arc<EventBus>,
        state: SharedState,
        dispatcher: Arc<Dispatcher>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let cleanup = CleanupRemediation::new(
            Arc::clone(&state),
            config.history.capacity / 2,
            config.anomaly.min_samples,
        );
        Self {
            config: config.recovery.clone(),
            backoff: config.recovery.backoff(),
            probe_timeout: config.health.probe_timeout(),
            bus,
            state,
            dispatcher,
            remediations: RemediationRegistry::new(),
            cleanup,
            records: Mutex::new(HashMap::new()),
            queue: Mutex::new(BTreeMap::new()),
            probing: Mutex::new(HashSet::new()),
            shutdown,
        }
    }

    /// Recovery configuration.
    #[must_use]
    pub const fn config(&self) -> &RecoveryConfig {
        &self.config
    }

    /// Supply the remediation for a strategy.
    pub async fn register_remediation(
        &self,
        strategy: RecoveryStrategy,
        handler: Arc<dyn Remediation>,
    ) {
        self.remediations.register(strategy, handler).await;
    }

    /// Take ownership of a failure.
    ///
    /// Critical failures escalate before this returns. Everything else is
    /// remediated in the background.
    pub async fn handle_error(
        self: &Arc<Self>,
        report: ErrorReport,
        request: Option<SendRequest>,
        critical: bool,
    ) -> FailureId {
        let record = FailureRecord::new(report, request, critical);
        let failure_id = record.id;
        let escalate = record.escalates_immediately();
        info!(
            failure_id = %failure_id,
            class = %record.class,
            strategy = %record.strategy,
            message = %record.report.message,
            "Failure recorded"
        );
        self.insert_record(record).await;

        if escalate {
            self.settle(failure_id, Verdict::Permanent, "critical failure").await;
            return failure_id;
        }

        let manager = Arc::clone(self);
        tokio::spawn(async move { manager.attempt(failure_id, 0).await });
        failure_id
    }

    /// Isolate a failed agent: open its breaker, withdraw its routes and,
    /// with auto-recovery, schedule one delayed recovery probe.
    pub async fn handle_agent_failure(self: &Arc<Self>, agent_id: &AgentId, reason: &str) {
        let now = Instant::now();
        let (breaker_event, withdrawn) = {
            let mut state = self.state.lock().await;
            if !state.registry.contains(agent_id.as_str()) {
                debug!(agent_id = %agent_id, "Failure of unregistered agent ignored");
                return;
            }
            let event = state.breakers.force_open(agent_id.as_str(), now);
            (event, state.routes.remove_agent(agent_id.as_str()))
        };

        warn!(agent_id = %agent_id, reason, withdrawn, "Agent failed; routes withdrawn");
        if let Some(event) = breaker_event {
            self.bus.publish(event.to_event()).await;
        }
        self.bus
            .publish(MeshEvent::new(Payload::AgentFailure {
                agent_id: agent_id.clone(),
                reason: reason.to_string(),
            }))
            .await;

        if self.config.auto_recovery {
            self.schedule_probe(agent_id.clone()).await;
        }
    }

    /// Copy of every record.
    pub async fn records(&self) -> Vec<FailureRecord> {
        self.records.lock().await.values().cloned().collect()
    }

    /// Copy of one record.
    pub async fn record(&self, failure_id: FailureId) -> Option<FailureRecord> {
        self.records.lock().await.get(&failure_id).cloned()
    }

    /// Scheduled retries, oldest failure first.
    pub async fn queue(&self) -> Vec<RetryQueueItem> {
        self.queue.lock().await.values().copied().collect()
    }

    /// Number of scheduled retries.
    pub async fn queue_len(&self) -> usize {
        self.queue.lock().await.len()
    }

    /// Records not yet recovered or permanently failed.
    pub async fn pending_count(&self) -> usize {
        self.records
            .lock()
            .await
            .values()
            .filter(|r| !r.status.is_terminal())
            .count()
    }

    async fn insert_record(&self, record: FailureRecord) {
        let mut records = self.records.lock().await;
        records.insert(record.id, record);
        while records.len() > self.config.max_records {
            let oldest = records
                .values()
                .filter(|r| r.status.is_terminal())
                .map(|r| r.id)
                .min();
            match oldest {
                Some(id) => {
                    records.remove(&id);
                }
                None => break,
            }
        }
    }

    async fn attempt(self: Arc<Self>, failure_id: FailureId, retry: u32) {
        let Some(record) = self.record(failure_id).await else {
            return;
        };
        if record.status.is_terminal() {
            return;
        }

        if retry > 0 {
            if let Some(agent_id) = record.agent_id() {
                if !self.state.lock().await.registry.contains(agent_id.as_str()) {
                    self.queue.lock().await.remove(&failure_id);
                    debug!(
                        failure_id = %failure_id,
                        agent_id = %agent_id,
                        "Retry superseded; agent no longer registered"
                    );
                    return;
                }
            }
        }

        debug!(failure_id = %failure_id, strategy = %record.strategy, retry, "Running remediation");
        match self.remediate(&record, retry).await {
            Ok(()) => {
                self.settle(failure_id, Verdict::Recovered, "").await;
            }
            Err(error) => {
                let reason = error.to_string();
                let verdict = if record.class.is_retryable()
                    && record.retry_count < self.config.max_retries
                {
                    let retry = record.retry_count + 1;
                    Verdict::Retry {
                        retry,
                        delay: self.backoff.delay_for(retry),
                    }
                } else {
                    Verdict::Permanent
                };
                self.settle(failure_id, verdict, &reason).await;
            }
        }
    }

    async fn remediate(&self, record: &FailureRecord, attempt: u32) -> MeshResult<()> {
        let ctx = RemediationContext {
            failure_id: record.id,
            class: record.class,
            strategy: record.strategy,
            attempt,
            report: record.report.clone(),
            request: record.request.clone(),
        };

        if let Some(handler) = self.remediations.get(record.strategy).await {
            return handler.remediate(&ctx).await;
        }
        match (&record.request, record.strategy) {
            (Some(request), strategy) if strategy.replays() => {
                self.replay(request, strategy).await
            }
            (_, RecoveryStrategy::Cleanup) => self.cleanup.remediate(&ctx).await,
            (_, strategy) => Err(MeshError::remediation_failed(format!(
                "no remediation registered for {strategy}"
            ))),
        }
    }

    /// Re-dispatch a failed request as a new exchange.
    ///
    /// The replay never reuses the caller's correlation id: the caller already
    /// holds the failure under it, and late replies to it are discarded.
    async fn replay(&self, request: &SendRequest, strategy: RecoveryStrategy) -> MeshResult<()> {
        let mut request = request.clone();
        let original = std::mem::replace(&mut request.correlation_id, CorrelationId::new());
        debug!(
            original = %original,
            correlation_id = %request.correlation_id,
            "Replaying failed request"
        );
        if strategy == RecoveryStrategy::ExtendedTimeoutRetry {
            let base = request
                .timeout
                .unwrap_or_else(|| self.dispatcher.default_timeout());
            request.timeout = Some(base.mul_f64(self.config.timeout_retry_factor));
        }
        self.dispatcher.send(&request).await?;
        Ok(())
    }

    /// Apply a verdict to a record and announce it.
    async fn settle(self: &Arc<Self>, failure_id: FailureId, verdict: Verdict, reason: &str) {
        let mut events = Vec::new();
        let mut escalation = None;
        let mut scheduled = None;

        {
            let mut records = self.records.lock().await;
            let Some(record) = records.get_mut(&failure_id) else {
                return;
            };
            let class = record.class.as_str().to_string();

            match verdict {
                Verdict::Recovered => {
                    if !record.transition(FailureStatus::Recovered) {
                        return;
                    }
                    info!(failure_id = %failure_id, class = %class, retry_count = record.retry_count, "Failure recovered");
                    events.push(Payload::RecoverySuccess {
                        failure_id,
                        class,
                        retry_count: record.retry_count,
                    });
                }
                Verdict::Retry { retry, delay } => {
                    if !record.transition(FailureStatus::RecoveryFailed) {
                        return;
                    }
                    record.retry_count = retry;
                    record.last_error = Some(reason.to_string());
                    debug!(failure_id = %failure_id, retry, ?delay, "Retry scheduled");
                    events.push(Payload::RecoveryFailed {
                        failure_id,
                        class,
                        retry_count: retry,
                        reason: reason.to_string(),
                        will_retry: true,
                    });
                    scheduled = Some(RetryQueueItem {
                        failure_id,
                        retry,
                        due: Instant::now() + delay,
                    });
                }
                Verdict::Permanent => {
                    if !record.escalates_immediately() {
                        if record.status == FailureStatus::Pending {
                            record.transition(FailureStatus::RecoveryFailed);
                        }
                        events.push(Payload::RecoveryFailed {
                            failure_id,
                            class: class.clone(),
                            retry_count: record.retry_count,
                            reason: reason.to_string(),
                            will_retry: false,
                        });
                    }
                    if !record.transition(FailureStatus::PermanentFailure) {
                        return;
                    }
                    record.last_error = Some(reason.to_string());
                    let severity = if record.escalates_immediately() {
                        Severity::Critical
                    } else {
                        record.report.severity.max(record.class.severity())
                    };
                    warn!(
                        failure_id = %failure_id,
                        class = %class,
                        retry_count = record.retry_count,
                        %severity,
                        reason,
                        "Failure escalated; manual intervention required"
                    );
                    events.push(Payload::PermanentFailure {
                        failure_id,
                        class,
                        retry_count: record.retry_count,
                        reason: reason.to_string(),
                    });
                    escalation = Some(Payload::RecoveryEscalated {
                        failure_id,
                        severity,
                        reason: format!("{}: {reason}", record.report.message),
                    });
                }
            }
        }

        {
            let mut queue = self.queue.lock().await;
            match scheduled {
                Some(item) => {
                    queue.insert(failure_id, item);
                }
                None => {
                    queue.remove(&failure_id);
                }
            }
        }

        self.bus
            .publish_all(events.into_iter().chain(escalation).map(MeshEvent::new))
            .await;

        if let Some(item) = scheduled {
            self.spawn_retry(item);
        }
    }

    fn spawn_retry(self: &Arc<Self>, item: RetryQueueItem) {
        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep_until(item.due) => {
                    manager.attempt(item.failure_id, item.retry).await;
                }
                () = stopped(&mut shutdown) => {
                    debug!(failure_id = %item.failure_id, "Retry cancelled by shutdown");
                }
            }
        });
    }

    async fn schedule_probe(self: &Arc<Self>, agent_id: AgentId) {
        if !self.probing.lock().await.insert(agent_id.clone()) {
            debug!(agent_id = %agent_id, "Recovery probe already scheduled");
            return;
        }

        let manager = Arc::clone(self);
        let mut shutdown = self.shutdown.clone();
        let delay = self.config.recovery_probe_delay();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(delay) => manager.recovery_probe(&agent_id).await,
                () = stopped(&mut shutdown) => {}
            }
            manager.probing.lock().await.remove(&agent_id);
        });
    }

    async fn recovery_probe(&self, agent_id: &AgentId) {
        match self.dispatcher.probe(agent_id, self.probe_timeout).await {
            Ok(latency_ms) => {
                let event = {
                    let mut state = self.state.lock().await;
                    if !state.registry.contains(agent_id.as_str()) {
                        return;
                    }
                    let now = Instant::now();
                    let event = state.breakers.force_half_open(agent_id.as_str(), now);
                    state.restore_routes(agent_id.as_str(), now);
                    event
                };
                info!(agent_id = %agent_id, latency_ms, "Recovery probe succeeded; circuit half-open");
                if let Some(event) = event {
                    self.bus.publish(event.to_event()).await;
                }
            }
            Err(MeshError::AgentNotFound { .. }) => {
                debug!(agent_id = %agent_id, "Recovery probe superseded; agent no longer registered");
            }
            Err(error) => {
                warn!(agent_id = %agent_id, error = %error, "Recovery probe failed; circuit stays open");
            }
        }
    }
}
