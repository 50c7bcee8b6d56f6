//! Failure records and retry queue items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchboard_core::{AgentId, FailureId};
use switchboard_events::{ErrorReport, Route};
use tokio::time::Instant;

use super::classify::{ErrorClass, RecoveryStrategy};
use crate::dispatcher::SendRequest;

/// Lifecycle of a failure record.
///
/// `pending -> recovered`, or `pending -> recovery_failed`, which either
/// retries (back to `recovered` or `recovery_failed`) or ends in
/// `permanent_failure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureStatus {
    Pending,
    Recovered,
    RecoveryFailed,
    PermanentFailure,
}

impl FailureStatus {
    /// Whether the record will not change again.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Recovered | Self::PermanentFailure)
    }

    /// Whether moving to `next` is a legal transition.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending | Self::RecoveryFailed, Self::Recovered)
                | (Self::Pending | Self::RecoveryFailed, Self::RecoveryFailed)
                | (Self::Pending | Self::RecoveryFailed, Self::PermanentFailure)
        )
    }

    /// Status name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Recovered => "recovered",
            Self::RecoveryFailed => "recovery_failed",
            Self::PermanentFailure => "permanent_failure",
        }
    }
}

impl std::fmt::Display for FailureStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One failure handed to the recovery manager.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureRecord {
    pub id: FailureId,
    pub class: ErrorClass,
    pub strategy: RecoveryStrategy,
    pub report: ErrorReport,
    /// Original request, replayed by retry strategies.
    pub request: Option<SendRequest>,
    /// Whether the report arrived as a critical error.
    pub critical: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Retries performed so far; never exceeds the configured maximum.
    pub retry_count: u32,
    pub status: FailureStatus,
    pub last_error: Option<String>,
}

impl FailureRecord {
    /// Classify a report into a new pending record.
    #[must_use]
    pub fn new(report: ErrorReport, request: Option<SendRequest>, critical: bool) -> Self {
        let class = ErrorClass::of(&report);
        let now = Utc::now();
        Self {
            id: FailureId::new(),
            class,
            strategy: class.strategy(),
            report,
            request,
            critical,
            created_at: now,
            updated_at: now,
            retry_count: 0,
            status: FailureStatus::Pending,
            last_error: None,
        }
    }

    /// Whether the record skips remediation and escalates at once.
    #[must_use]
    pub const fn escalates_immediately(&self) -> bool {
        self.critical || self.class.is_critical()
    }

    /// Agent the failure is bound to, if any.
    #[must_use]
    pub fn agent_id(&self) -> Option<&AgentId> {
        self.report.agent_id.as_ref().or_else(|| {
            self.request.as_ref().and_then(|r| match &r.route {
                Route::Agent(id) => Some(id),
                Route::Capability(_) => None,
            })
        })
    }

    /// Move to `next`. Returns `false` and leaves the record untouched when
    /// the transition is illegal.
    pub fn transition(&mut self, next: FailureStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }
}

/// A scheduled retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryQueueItem {
    pub failure_id: FailureId,
    /// Retry number, 1-based.
    pub retry: u32,
    pub due: Instant,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_terminal_statuses_do_not_move() {
        for next in [
            FailureStatus::Pending,
            FailureStatus::Recovered,
            FailureStatus::RecoveryFailed,
            FailureStatus::PermanentFailure,
        ] {
            assert!(!FailureStatus::Recovered.can_transition_to(next));
            assert!(!FailureStatus::PermanentFailure.can_transition_to(next));
        }
    }

    #[test]
    fn test_nothing_returns_to_pending() {
        assert!(!FailureStatus::RecoveryFailed.can_transition_to(FailureStatus::Pending));
        assert!(!FailureStatus::Pending.can_transition_to(FailureStatus::Pending));
    }

    #[test]
    fn test_record_classifies_report() {
        let record = FailureRecord::new(
            ErrorReport::new("connection refused").with_agent("a"),
            None,
            false,
        );
        assert_eq!(record.class, ErrorClass::Network);
        assert_eq!(record.strategy, RecoveryStrategy::TimedRetry);
        assert_eq!(record.agent_id().map(AgentId::as_str), Some("a"));
        assert!(!record.escalates_immediately());
    }

    #[test]
    fn test_agent_from_direct_route() {
        let request = SendRequest::new(Route::Agent("b".into()), serde_json::Value::Null);
        let record = FailureRecord::new(ErrorReport::new("boom"), Some(request), false);
        assert_eq!(record.agent_id().map(AgentId::as_str), Some("b"));
    }

    #[test]
    fn test_critical_flag_escalates() {
        let record = FailureRecord::new(ErrorReport::new("disk full"), None, true);
        assert!(record.escalates_immediately());

        let mut record = FailureRecord::new(ErrorReport::new("boom"), None, false);
        assert!(record.transition(FailureStatus::RecoveryFailed));
        assert!(record.transition(FailureStatus::PermanentFailure));
        assert!(!record.transition(FailureStatus::Recovered));
        assert_eq!(record.status, FailureStatus::PermanentFailure);
    }
}
