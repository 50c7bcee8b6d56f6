//! Mesh events: a typed envelope around every message on the bus.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use switchboard_core::{AgentId, AnomalyId, CorrelationId, EventId, FailureId};

use crate::types::{
    AgentSpec, AgentStatus, BroadcastTarget, ErrorReport, MessageKind, Route, Severity,
};

/// Every topic the bus knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Topic {
    // Inbound
    AgentRegister,
    AgentUnregister,
    AgentStatusChange,
    AgentCapabilityUpdate,
    CommunicationRequest,
    CommunicationBroadcast,
    SystemError,
    SystemCriticalError,
    AgentReply,
    // Outbound
    AgentMessage,
    AgentFailure,
    CommunicationResponse,
    CommunicationBroadcastResult,
    CircuitOpened,
    CircuitClosed,
    CircuitHalfOpen,
    RecoverySuccess,
    RecoveryFailed,
    PermanentFailure,
    RecoveryEscalated,
    AnomalyDetected,
    HealthStatus,
}

impl Topic {
    /// Dotted wire name of the topic.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::AgentRegister => "agent.register",
            Self::AgentUnregister => "agent.unregister",
            Self::AgentStatusChange => "agent.status_change",
            Self::AgentCapabilityUpdate => "agent.capability_update",
            Self::CommunicationRequest => "communication.request",
            Self::CommunicationBroadcast => "communication.broadcast",
            Self::SystemError => "system.error",
            Self::SystemCriticalError => "system.critical_error",
            Self::AgentReply => "agent.reply",
            Self::AgentMessage => "agent.message",
            Self::AgentFailure => "agent.failure",
            Self::CommunicationResponse => "communication.response",
            Self::CommunicationBroadcastResult => "communication.broadcast_result",
            Self::CircuitOpened => "circuit.breaker.opened",
            Self::CircuitClosed => "circuit.breaker.closed",
            Self::CircuitHalfOpen => "circuit.breaker.half-open",
            Self::RecoverySuccess => "recovery.success",
            Self::RecoveryFailed => "recovery.failed",
            Self::PermanentFailure => "recovery.permanent_failure",
            Self::RecoveryEscalated => "recovery.escalated",
            Self::AnomalyDetected => "anomaly.detected",
            Self::HealthStatus => "health.status",
        }
    }

    /// Topics the mesh consumes from external participants.
    #[must_use]
    pub const fn inbound() -> &'static [Self] {
        &[
            Self::AgentRegister,
            Self::AgentUnregister,
            Self::AgentStatusChange,
            Self::AgentCapabilityUpdate,
            Self::CommunicationRequest,
            Self::CommunicationBroadcast,
            Self::SystemError,
            Self::SystemCriticalError,
        ]
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Event payloads, one variant per topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Payload {
    AgentRegister {
        spec: AgentSpec,
    },
    AgentUnregister {
        agent_id: AgentId,
    },
    AgentStatusChange {
        agent_id: AgentId,
        status: AgentStatus,
    },
    AgentCapabilityUpdate {
        agent_id: AgentId,
        capabilities: Vec<String>,
    },
    CommunicationRequest {
        correlation_id: CorrelationId,
        source: Option<AgentId>,
        route: Route,
        payload: serde_json::Value,
        timeout_ms: Option<u64>,
    },
    CommunicationBroadcast {
        correlation_id: CorrelationId,
        source: Option<AgentId>,
        target: BroadcastTarget,
        payload: serde_json::Value,
        timeout_ms: Option<u64>,
    },
    SystemError {
        report: ErrorReport,
    },
    SystemCriticalError {
        report: ErrorReport,
    },
    /// A correlated reply from an agent; health-check responses arrive here too.
    AgentReply {
        correlation_id: CorrelationId,
        agent_id: AgentId,
        result: Result<serde_json::Value, String>,
    },
    /// An exchange addressed to one agent.
    AgentMessage {
        correlation_id: CorrelationId,
        agent_id: AgentId,
        source: Option<AgentId>,
        kind: MessageKind,
        payload: serde_json::Value,
    },
    AgentFailure {
        agent_id: AgentId,
        reason: String,
    },
    CommunicationResponse {
        correlation_id: CorrelationId,
        route: Option<AgentId>,
        success: bool,
        latency_ms: u64,
        payload: Option<serde_json::Value>,
        error: Option<String>,
    },
    CommunicationBroadcastResult {
        correlation_id: CorrelationId,
        successes: usize,
        failures: usize,
    },
    CircuitOpened {
        agent_id: AgentId,
        consecutive_failures: u32,
    },
    CircuitClosed {
        agent_id: AgentId,
    },
    CircuitHalfOpen {
        agent_id: AgentId,
    },
    RecoverySuccess {
        failure_id: FailureId,
        class: String,
        retry_count: u32,
    },
    RecoveryFailed {
        failure_id: FailureId,
        class: String,
        retry_count: u32,
        reason: String,
        will_retry: bool,
    },
    PermanentFailure {
        failure_id: FailureId,
        class: String,
        retry_count: u32,
        reason: String,
    },
    /// Manual intervention is required.
    RecoveryEscalated {
        failure_id: FailureId,
        severity: Severity,
        reason: String,
    },
    AnomalyDetected {
        anomaly_id: AnomalyId,
        agent_id: AgentId,
        metric: String,
        value: f64,
        mean: f64,
        std_dev: f64,
        z_score: f64,
        severity: Severity,
    },
    HealthStatus {
        agent_id: AgentId,
        previous: AgentStatus,
        status: AgentStatus,
    },
}

impl Payload {
    /// Topic this payload is published on.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        match self {
            Self::AgentRegister { .. } => Topic::AgentRegister,
            Self::AgentUnregister { .. } => Topic::AgentUnregister,
            Self::AgentStatusChange { .. } => Topic::AgentStatusChange,
            Self::AgentCapabilityUpdate { .. } => Topic::AgentCapabilityUpdate,
            Self::CommunicationRequest { .. } => Topic::CommunicationRequest,
            Self::CommunicationBroadcast { .. } => Topic::CommunicationBroadcast,
            Self::SystemError { .. } => Topic::SystemError,
            Self::SystemCriticalError { .. } => Topic::SystemCriticalError,
            Self::AgentReply { .. } => Topic::AgentReply,
            Self::AgentMessage { .. } => Topic::AgentMessage,
            Self::AgentFailure { .. } => Topic::AgentFailure,
            Self::CommunicationResponse { .. } => Topic::CommunicationResponse,
            Self::CommunicationBroadcastResult { .. } => Topic::CommunicationBroadcastResult,
            Self::CircuitOpened { .. } => Topic::CircuitOpened,
            Self::CircuitClosed { .. } => Topic::CircuitClosed,
            Self::CircuitHalfOpen { .. } => Topic::CircuitHalfOpen,
            Self::RecoverySuccess { .. } => Topic::RecoverySuccess,
            Self::RecoveryFailed { .. } => Topic::RecoveryFailed,
            Self::PermanentFailure { .. } => Topic::PermanentFailure,
            Self::RecoveryEscalated { .. } => Topic::RecoveryEscalated,
            Self::AnomalyDetected { .. } => Topic::AnomalyDetected,
            Self::HealthStatus { .. } => Topic::HealthStatus,
        }
    }

    /// Agent the payload is about, when there is exactly one.
    #[must_use]
    pub fn agent_id(&self) -> Option<&AgentId> {
        match self {
            Self::AgentRegister { spec } => Some(&spec.id),
            Self::AgentUnregister { agent_id }
            | Self::AgentStatusChange { agent_id, .. }
            | Self::AgentCapabilityUpdate { agent_id, .. }
            | Self::AgentReply { agent_id, .. }
            | Self::AgentMessage { agent_id, .. }
            | Self::AgentFailure { agent_id, .. }
            | Self::CircuitOpened { agent_id, .. }
            | Self::CircuitClosed { agent_id }
            | Self::CircuitHalfOpen { agent_id }
            | Self::AnomalyDetected { agent_id, .. }
            | Self::HealthStatus { agent_id, .. } => Some(agent_id),
            Self::CommunicationResponse { route, .. } => route.as_ref(),
            Self::SystemError { report } | Self::SystemCriticalError { report } => {
                report.agent_id.as_ref()
            }
            Self::CommunicationRequest { .. }
            | Self::CommunicationBroadcast { .. }
            | Self::CommunicationBroadcastResult { .. }
            | Self::RecoverySuccess { .. }
            | Self::RecoveryFailed { .. }
            | Self::PermanentFailure { .. }
            | Self::RecoveryEscalated { .. } => None,
        }
    }
}

/// An event as carried on the bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MeshEvent {
    pub event_id: EventId,
    pub timestamp: DateTime<Utc>,
    pub payload: Payload,
}

impl MeshEvent {
    /// Wrap a payload in a fresh envelope.
    #[must_use]
    pub fn new(payload: Payload) -> Self {
        Self {
            event_id: EventId::new(),
            timestamp: Utc::now(),
            payload,
        }
    }

    /// Topic of the wrapped payload.
    #[must_use]
    pub const fn topic(&self) -> Topic {
        self.payload.topic()
    }

    /// Create an `agent.register` event.
    #[must_use]
    pub fn register(spec: AgentSpec) -> Self {
        Self::new(Payload::AgentRegister { spec })
    }

    /// Create an `agent.reply` event.
    pub fn reply(
        correlation_id: CorrelationId,
        agent_id: impl Into<AgentId>,
        result: Result<serde_json::Value, String>,
    ) -> Self {
        Self::new(Payload::AgentReply {
            correlation_id,
            agent_id: agent_id.into(),
            result,
        })
    }

    /// Create a `system.error` event.
    #[must_use]
    pub fn system_error(report: ErrorReport) -> Self {
        Self::new(Payload::SystemError { report })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_topic_names_are_dotted() {
        assert_eq!(Topic::CircuitHalfOpen.as_str(), "circuit.breaker.half-open");
        assert_eq!(Topic::AgentStatusChange.as_str(), "agent.status_change");
        assert_eq!(Topic::SystemCriticalError.to_string(), "system.critical_error");
    }

    #[test]
    fn test_payload_topic_matches_variant() {
        let event = MeshEvent::register(AgentSpec::new("a", "A"));
        assert_eq!(event.topic(), Topic::AgentRegister);
        assert_eq!(event.payload.agent_id().map(AgentId::as_str), Some("a"));
    }

    #[test]
    fn test_reply_round_trips_through_json() {
        let cid = CorrelationId::new();
        let event = MeshEvent::reply(cid, "a", Err("boom".to_string()));
        let json = serde_json::to_string(&event).ok();
        let back: Option<MeshEvent> = json.and_then(|j| serde_json::from_str(&j).ok());
        assert_eq!(back, Some(event));
    }

    #[test]
    fn test_inbound_topics_exclude_outbound() {
        assert!(Topic::inbound().contains(&Topic::CommunicationRequest));
        assert!(!Topic::inbound().contains(&Topic::CommunicationResponse));
        assert!(!Topic::inbound().contains(&Topic::AgentReply));
    }
}
