//! Error types surfaced by the mesh.

use switchboard_core::AgentId;
use switchboard_events::ErrorReport;
use thiserror::Error;

use crate::recovery::ErrorClass;

/// Result type for mesh operations.
pub type MeshResult<T> = Result<T, MeshError>;

/// Typed failure returned by every mesh operation.
///
/// A caller of `send` receives exactly one of `Timeout`, `CircuitOpen`,
/// `NoRoute` or `Remote` on failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum MeshError {
    #[error("agent '{agent_id}' is already registered")]
    DuplicateAgent { agent_id: AgentId },

    #[error("agent '{agent_id}' not found")]
    AgentNotFound { agent_id: AgentId },

    #[error("no route for capability '{capability}'")]
    NoRoute { capability: String },

    #[error("circuit open for agent '{agent_id}'")]
    CircuitOpen { agent_id: AgentId },

    #[error("agent '{agent_id}' did not answer within {timeout_ms}ms")]
    Timeout { agent_id: AgentId, timeout_ms: u64 },

    #[error("agent '{agent_id}' returned an error: {message}")]
    Remote { agent_id: AgentId, message: String },

    #[error("event bus closed")]
    BusClosed,

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },

    #[error("persistence failed: {reason}")]
    Persistence { reason: String },

    #[error("remediation failed: {reason}")]
    RemediationFailed { reason: String },
}

impl MeshError {
    /// Create a duplicate agent error.
    pub fn duplicate_agent(agent_id: impl Into<AgentId>) -> Self {
        Self::DuplicateAgent {
            agent_id: agent_id.into(),
        }
    }

    /// Create an agent not found error.
    pub fn agent_not_found(agent_id: impl Into<AgentId>) -> Self {
        Self::AgentNotFound {
            agent_id: agent_id.into(),
        }
    }

    /// Create a no route error.
    pub fn no_route(capability: impl Into<String>) -> Self {
        Self::NoRoute {
            capability: capability.into(),
        }
    }

    /// Create a remediation failure.
    pub fn remediation_failed(reason: impl Into<String>) -> Self {
        Self::RemediationFailed {
            reason: reason.into(),
        }
    }

    /// Create an invalid configuration error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }

    /// Agent the failure is attributed to, if any.
    #[must_use]
    pub const fn agent_id(&self) -> Option<&AgentId> {
        match self {
            Self::DuplicateAgent { agent_id }
            | Self::AgentNotFound { agent_id }
            | Self::CircuitOpen { agent_id }
            | Self::Timeout { agent_id, .. }
            | Self::Remote { agent_id, .. } => Some(agent_id),
            Self::NoRoute { .. }
            | Self::BusClosed
            | Self::InvalidConfig { .. }
            | Self::Persistence { .. }
            | Self::RemediationFailed { .. } => None,
        }
    }

    /// Classification hint handed to the recovery manager.
    ///
    /// `Remote` errors carry no hint; their message is classified instead.
    #[must_use]
    pub const fn kind_hint(&self) -> Option<&'static str> {
        match self {
            Self::Timeout { .. } => Some("timeout"),
            Self::CircuitOpen { .. } | Self::NoRoute { .. } => Some("service_unavailable"),
            Self::BusClosed => Some("network"),
            Self::Persistence { .. } => Some("database"),
            Self::DuplicateAgent { .. }
            | Self::AgentNotFound { .. }
            | Self::InvalidConfig { .. } => Some("validation"),
            Self::Remote { .. } | Self::RemediationFailed { .. } => None,
        }
    }

    /// Failure class of this error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        self.kind_hint()
            .and_then(|kind| kind.parse().ok())
            .unwrap_or_else(|| ErrorClass::from_message(&self.to_string()))
    }

    /// Whether recovery may retry this failure.
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        self.class().is_retryable()
    }

    /// Error report handed to the recovery manager.
    #[must_use]
    pub fn to_report(&self) -> ErrorReport {
        let report = ErrorReport::new(self.to_string());
        let report = match self.kind_hint() {
            Some(kind) => report.with_kind(kind),
            None => report,
        };
        match self.agent_id() {
            Some(agent_id) => report.with_agent(agent_id.clone()),
            None => report,
        }
    }

    /// Whether the failure was recorded against the agent's breaker.
    ///
    /// Rejections (`CircuitOpen`, `NoRoute`) never reached an agent.
    #[must_use]
    pub const fn reached_agent(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Remote { .. })
    }
}

impl From<switchboard_core::Error> for MeshError {
    fn from(err: switchboard_core::Error) -> Self {
        match err {
            switchboard_core::Error::InvalidConfig { reason }
            | switchboard_core::Error::TomlParseFailed { reason } => Self::InvalidConfig { reason },
            other => Self::Persistence {
                reason: other.to_string(),
            },
        }
    }
}
