//! Pluggable remediation handlers.
//!
//! The collaborator being protected supplies the real remediation logic
//! (reconnecting a database, correcting data) by registering a
//! [`Remediation`] for a strategy. A strategy with no handler counts as a
//! failed attempt.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use switchboard_core::FailureId;
use switchboard_events::ErrorReport;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::info;

use super::classify::{ErrorClass, RecoveryStrategy};
use crate::dispatcher::SendRequest;
use crate::error::MeshResult;
use crate::state::SharedState;

/// Everything a handler knows about the failure it remediates.
#[derive(Debug, Clone)]
pub struct RemediationContext {
    pub failure_id: FailureId,
    pub class: ErrorClass,
    pub strategy: RecoveryStrategy,
    /// 0 for the initial attempt, then the retry number.
    pub attempt: u32,
    pub report: ErrorReport,
    /// The request whose failure is being remediated, if any.
    pub request: Option<SendRequest>,
}

/// A remediation for one strategy.
#[async_trait]
pub trait Remediation: Send + Sync {
    /// Attempt the remediation once.
    ///
    /// # Errors
    ///
    /// Returns an error if the remediation did not resolve the failure.
    async fn remediate(&self, ctx: &RemediationContext) -> MeshResult<()>;

    /// Handler name for logs.
    fn name(&self) -> &'static str;
}

/// Handlers keyed by strategy.
#[derive(Default)]
pub struct RemediationRegistry {
    handlers: RwLock<HashMap<RecoveryStrategy, Arc<dyn Remediation>>>,
}

impl std::fmt::Debug for RemediationRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemediationRegistry").finish_non_exhaustive()
    }
}

impl RemediationRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the strategy.
    pub async fn register(&self, strategy: RecoveryStrategy, handler: Arc<dyn Remediation>) {
        info!(%strategy, handler = handler.name(), "Remediation registered");
        self.handlers.write().await.insert(strategy, handler);
    }

    /// Handler for a strategy.
    pub async fn get(&self, strategy: RecoveryStrategy) -> Option<Arc<dyn Remediation>> {
        self.handlers.read().await.get(&strategy).cloned()
    }
}

/// Built-in memory cleanup: trims the communication history and anomaly
/// sample windows.
pub struct CleanupRemediation {
    state: SharedState,
    keep_records: usize,
    keep_samples: usize,
}

impl CleanupRemediation {
    /// Keep at most `keep_records` history records and `keep_samples`
    /// samples per anomaly window.
    #[must_use]
    pub const fn new(state: SharedState, keep_records: usize, keep_samples: usize) -> Self {
        Self {
            state,
            keep_records,
            keep_samples,
        }
    }
}

#[async_trait]
impl Remediation for CleanupRemediation {
    async fn remediate(&self, ctx: &RemediationContext) -> MeshResult<()> {
        let mut state = self.state.lock().await;
        let records = state.history.retain_latest(self.keep_records);
        state.anomalies.trim_samples(self.keep_samples);
        let anomalies = state.anomalies.prune(Instant::now());
        info!(
            failure_id = %ctx.failure_id,
            records,
            anomalies,
            "Memory cleanup released history"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "cleanup"
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]

    use super::*;
    use crate::config::MeshConfig;
    use crate::history::CommunicationRecord;
    use crate::state::MeshState;
    use switchboard_core::AgentId;

    struct AlwaysFails;

    #[async_trait]
    impl Remediation for AlwaysFails {
        async fn remediate(&self, _ctx: &RemediationContext) -> MeshResult<()> {
            Err(crate::error::MeshError::remediation_failed("still down"))
        }

        fn name(&self) -> &'static str {
            "always_fails"
        }
    }

    fn context(strategy: RecoveryStrategy) -> RemediationContext {
        RemediationContext {
            failure_id: FailureId::new(),
            class: ErrorClass::Memory,
            strategy,
            attempt: 0,
            report: ErrorReport::new("out of memory"),
            request: None,
        }
    }

    #[tokio::test]
    async fn test_registry_lookup() {
        let registry = RemediationRegistry::new();
        assert!(registry.get(RecoveryStrategy::Reconnect).await.is_none());

        registry
            .register(RecoveryStrategy::Reconnect, Arc::new(AlwaysFails))
            .await;
        let handler = registry.get(RecoveryStrategy::Reconnect).await.unwrap();
        assert_eq!(handler.name(), "always_fails");
        assert!(handler.remediate(&context(RecoveryStrategy::Reconnect)).await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_trims_history() {
        let state = MeshState::new(&MeshConfig::default()).shared();
        {
            let mut guard = state.lock().await;
            for _ in 0..50 {
                guard.history.push(CommunicationRecord::new(
                    None,
                    AgentId::from("a"),
                    5,
                    true,
                    Instant::now(),
                ));
            }
        }

        let cleanup = CleanupRemediation::new(state.clone(), 10, 5);
        cleanup.remediate(&context(RecoveryStrategy::Cleanup)).await.unwrap();
        assert_eq!(state.lock().await.history.len(), 10);
    }
}
