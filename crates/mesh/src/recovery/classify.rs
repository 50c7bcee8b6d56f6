//! Failure classification.
//!
//! Maps an error report to an [`ErrorClass`] from its kind hint, falling back
//! to keywords in the message. The class decides the remediation strategy
//! and whether the failure may be retried.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use switchboard_events::{ErrorReport, Severity};

/// Failure classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Memory,
    Network,
    Database,
    Timeout,
    Validation,
    RateLimit,
    ServiceUnavailable,
    Security,
    DataCorruption,
    Unknown,
}

/// Coarse error taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    /// Retryable.
    Transient,
    /// Never retried, requires correction.
    Data,
    /// Remediated by a dedicated strategy.
    Resource,
    /// Escalated immediately.
    Critical,
    /// Unclassified.
    Unknown,
}

/// Remediation strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Release memory: trim history and caches.
    Cleanup,
    /// Retry after the backoff delay.
    TimedRetry,
    /// Re-establish a backend connection.
    Reconnect,
    /// Retry with a longer timeout.
    ExtendedTimeoutRetry,
    /// Correct the offending data.
    DataCorrection,
    /// Bounded retry for unclassified failures.
    GenericRetry,
    /// No remediation, manual intervention required.
    Escalate,
}

impl RecoveryStrategy {
    /// Strategy name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Cleanup => "cleanup",
            Self::TimedRetry => "timed_retry",
            Self::Reconnect => "reconnect",
            Self::ExtendedTimeoutRetry => "extended_timeout_retry",
            Self::DataCorrection => "data_correction",
            Self::GenericRetry => "generic_retry",
            Self::Escalate => "escalate",
        }
    }

    /// Whether the strategy re-dispatches the failed request.
    #[must_use]
    pub const fn replays(self) -> bool {
        matches!(
            self,
            Self::TimedRetry | Self::ExtendedTimeoutRetry | Self::GenericRetry
        )
    }
}

impl fmt::Display for RecoveryStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl ErrorClass {
    /// Class name.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Network => "network",
            Self::Database => "database",
            Self::Timeout => "timeout",
            Self::Validation => "validation",
            Self::RateLimit => "rate_limit",
            Self::ServiceUnavailable => "service_unavailable",
            Self::Security => "security",
            Self::DataCorruption => "data_corruption",
            Self::Unknown => "unknown",
        }
    }

    /// Classify a report: the kind hint wins, then message keywords.
    #[must_use]
    pub fn of(report: &ErrorReport) -> Self {
        report
            .kind
            .as_deref()
            .and_then(|kind| kind.parse().ok())
            .unwrap_or_else(|| Self::from_message(&report.message))
    }

    /// Classify by keywords in an error message.
    #[must_use]
    pub fn from_message(message: &str) -> Self {
        const RULES: &[(ErrorClass, &[&str])] = &[
            (ErrorClass::DataCorruption, &["corrupt", "checksum mismatch"]),
            (
                ErrorClass::Security,
                &["unauthorized", "forbidden", "permission denied", "security"],
            ),
            (ErrorClass::Memory, &["out of memory", "memory", "heap"]),
            (ErrorClass::Timeout, &["timeout", "timed out", "did not answer"]),
            (ErrorClass::RateLimit, &["rate limit", "too many requests", "throttl"]),
            (
                ErrorClass::ServiceUnavailable,
                &["unavailable", "circuit open", "no route"],
            ),
            (ErrorClass::Database, &["database", "sql", "deadlock"]),
            (
                ErrorClass::Network,
                &["network", "connection", "econnrefused", "econnreset", "socket", "dns"],
            ),
            (
                ErrorClass::Validation,
                &["validation", "invalid", "required field", "malformed"],
            ),
        ];

        let message = message.to_lowercase();
        RULES
            .iter()
            .find(|(_, keywords)| keywords.iter().any(|k| message.contains(k)))
            .map_or(Self::Unknown, |(class, _)| *class)
    }

    /// Taxonomy category.
    #[must_use]
    pub const fn category(self) -> ErrorCategory {
        match self {
            Self::Network | Self::Timeout | Self::RateLimit | Self::ServiceUnavailable => {
                ErrorCategory::Transient
            }
            Self::Validation => ErrorCategory::Data,
            Self::Memory | Self::Database => ErrorCategory::Resource,
            Self::Security | Self::DataCorruption => ErrorCategory::Critical,
            Self::Unknown => ErrorCategory::Unknown,
        }
    }

    /// Whether a failed remediation may be retried.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        matches!(self.category(), ErrorCategory::Transient)
    }

    /// Whether the class escalates without remediation.
    #[must_use]
    pub const fn is_critical(self) -> bool {
        matches!(self.category(), ErrorCategory::Critical)
    }

    /// Strategy used to remediate this class.
    #[must_use]
    pub const fn strategy(self) -> RecoveryStrategy {
        match self {
            Self::Memory => RecoveryStrategy::Cleanup,
            Self::Network | Self::RateLimit | Self::ServiceUnavailable => {
                RecoveryStrategy::TimedRetry
            }
            Self::Database => RecoveryStrategy::Reconnect,
            Self::Timeout => RecoveryStrategy::ExtendedTimeoutRetry,
            Self::Validation => RecoveryStrategy::DataCorrection,
            Self::Security | Self::DataCorruption => RecoveryStrategy::Escalate,
            Self::Unknown => RecoveryStrategy::GenericRetry,
        }
    }

    /// Severity implied by the class alone.
    #[must_use]
    pub const fn severity(self) -> Severity {
        match self.category() {
            ErrorCategory::Critical => Severity::Critical,
            ErrorCategory::Resource => Severity::High,
            ErrorCategory::Transient | ErrorCategory::Data | ErrorCategory::Unknown => {
                Severity::Medium
            }
        }
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ErrorClass {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().replace('-', "_").as_str() {
            "memory" | "out_of_memory" => Ok(Self::Memory),
            "network" | "connection" => Ok(Self::Network),
            "database" | "db" => Ok(Self::Database),
            "timeout" => Ok(Self::Timeout),
            "validation" | "invalid_input" => Ok(Self::Validation),
            "rate_limit" | "rate_limited" => Ok(Self::RateLimit),
            "service_unavailable" | "unavailable" => Ok(Self::ServiceUnavailable),
            "security" | "auth" => Ok(Self::Security),
            "data_corruption" | "corruption" => Ok(Self::DataCorruption),
            "unknown" => Ok(Self::Unknown),
            other => Err(format!("unknown error class '{other}'")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_hint_wins_over_message() {
        let report = ErrorReport::new("connection reset").with_kind("validation");
        assert_eq!(ErrorClass::of(&report), ErrorClass::Validation);
    }

    #[test]
    fn test_unknown_hint_falls_back_to_message() {
        let report = ErrorReport::new("request timed out").with_kind("weird");
        assert_eq!(ErrorClass::of(&report), ErrorClass::Timeout);
    }

    #[test]
    fn test_message_keywords() {
        assert_eq!(ErrorClass::from_message("ECONNREFUSED 127.0.0.1"), ErrorClass::Network);
        assert_eq!(ErrorClass::from_message("Too Many Requests"), ErrorClass::RateLimit);
        assert_eq!(ErrorClass::from_message("JavaScript heap out of memory"), ErrorClass::Memory);
        assert_eq!(ErrorClass::from_message("SQL syntax error"), ErrorClass::Database);
        assert_eq!(ErrorClass::from_message("invalid email"), ErrorClass::Validation);
        assert_eq!(ErrorClass::from_message("permission denied"), ErrorClass::Security);
        assert_eq!(ErrorClass::from_message("page checksum mismatch"), ErrorClass::DataCorruption);
        assert_eq!(ErrorClass::from_message("something odd"), ErrorClass::Unknown);
    }

    #[test]
    fn test_connection_timeout_is_timeout() {
        assert_eq!(ErrorClass::from_message("connection timeout"), ErrorClass::Timeout);
    }

    #[test]
    fn test_only_transient_classes_retry() {
        let retryable: Vec<_> = [
            ErrorClass::Memory,
            ErrorClass::Network,
            ErrorClass::Database,
            ErrorClass::Timeout,
            ErrorClass::Validation,
            ErrorClass::RateLimit,
            ErrorClass::ServiceUnavailable,
            ErrorClass::Security,
            ErrorClass::DataCorruption,
            ErrorClass::Unknown,
        ]
        .into_iter()
        .filter(|c| c.is_retryable())
        .collect();

        assert_eq!(
            retryable,
            vec![
                ErrorClass::Network,
                ErrorClass::Timeout,
                ErrorClass::RateLimit,
                ErrorClass::ServiceUnavailable
            ]
        );
    }

    #[test]
    fn test_strategy_mapping() {
        assert_eq!(ErrorClass::Memory.strategy(), RecoveryStrategy::Cleanup);
        assert_eq!(ErrorClass::Network.strategy(), RecoveryStrategy::TimedRetry);
        assert_eq!(ErrorClass::Database.strategy(), RecoveryStrategy::Reconnect);
        assert_eq!(ErrorClass::Timeout.strategy(), RecoveryStrategy::ExtendedTimeoutRetry);
        assert_eq!(ErrorClass::Validation.strategy(), RecoveryStrategy::DataCorrection);
        assert_eq!(ErrorClass::Unknown.strategy(), RecoveryStrategy::GenericRetry);
        assert_eq!(ErrorClass::Security.strategy(), RecoveryStrategy::Escalate);
    }

    #[test]
    fn test_critical_classes() {
        assert!(ErrorClass::Security.is_critical());
        assert!(ErrorClass::DataCorruption.is_critical());
        assert!(!ErrorClass::Database.is_critical());
        assert_eq!(ErrorClass::DataCorruption.severity(), Severity::Critical);
    }
}
