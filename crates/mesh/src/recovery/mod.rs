//! Failure classification and remediation.
//!
//! # Taxonomy
//!
//! - **Transient** (network, timeout, rate limit, service unavailable):
//!   remediated, then retried on the backoff sequence
//! - **Data** (validation): one correction attempt, never retried
//! - **Resource** (memory, database): one dedicated remediation
//! - **Critical** (security, data corruption): escalated immediately
//!
//! Remediation itself is pluggable through [`Remediation`]. Retry strategies
//! replay the failed request when one is attached, and memory pressure is
//! handled by the built-in [`CleanupRemediation`].

mod backoff;
mod classify;
mod manager;
mod record;
mod remediation;

pub use backoff::BackoffSchedule;
pub use classify::{ErrorCategory, ErrorClass, RecoveryStrategy};
pub use manager::{RecoveryConfig, RecoveryManager};
pub use record::{FailureRecord, FailureStatus, RetryQueueItem};
pub use remediation::{CleanupRemediation, Remediation, RemediationContext, RemediationRegistry};
