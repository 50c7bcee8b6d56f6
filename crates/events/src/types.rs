//! Payload types shared between the bus and its participants.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use switchboard_core::AgentId;

/// Liveness status of an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    /// Registered, nothing observed yet.
    Unknown,
    /// Serving traffic.
    Active,
    /// Last health probe succeeded.
    Healthy,
    /// Last health probe failed or timed out.
    Unhealthy,
    /// No activity within twice the health interval.
    Inactive,
    /// The agent reported an error.
    Error,
    /// The agent reported it has failed.
    Failed,
}

impl AgentStatus {
    /// Statuses that count as a breaker failure.
    #[must_use]
    pub const fn is_degrading(self) -> bool {
        matches!(self, Self::Unhealthy | Self::Error | Self::Failed)
    }

    /// Statuses that reset the breaker to closed.
    #[must_use]
    pub const fn is_healthy(self) -> bool {
        matches!(self, Self::Active | Self::Healthy)
    }

    /// Convert to a string representation.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "unknown",
            Self::Active => "active",
            Self::Healthy => "healthy",
            Self::Unhealthy => "unhealthy",
            Self::Inactive => "inactive",
            Self::Error => "error",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an agent announces when it registers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    pub id: AgentId,
    pub name: String,
    pub capabilities: BTreeSet<String>,
    /// Static weight used by the weighted balancing strategy.
    #[serde(default = "default_weight")]
    pub weight: f64,
    /// Higher priority wins when route scores tie.
    #[serde(default)]
    pub priority: i32,
    /// Seed reliability, used when restoring agents from a snapshot.
    #[serde(default)]
    pub reliability: Option<f64>,
}

const fn default_weight() -> f64 {
    1.0
}

impl AgentSpec {
    /// Create a descriptor with no capabilities and default weight.
    pub fn new(id: impl Into<AgentId>, name: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            capabilities: BTreeSet::new(),
            weight: default_weight(),
            priority: 0,
            reliability: None,
        }
    }

    /// Add a capability.
    #[must_use]
    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.capabilities.insert(capability.into());
        self
    }

    /// Set the static balancing weight.
    #[must_use]
    pub const fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Set the route priority.
    #[must_use]
    pub const fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Seed the reliability score.
    #[must_use]
    pub const fn with_reliability(mut self, reliability: f64) -> Self {
        self.reliability = Some(reliability);
        self
    }
}

/// Where a single communication should go.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Route {
    /// A specific agent, bypassing the load balancer.
    Agent(AgentId),
    /// Any agent offering the capability, chosen by the load balancer.
    Capability(String),
}

impl fmt::Display for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Agent(id) => write!(f, "agent:{id}"),
            Self::Capability(cap) => write!(f, "capability:{cap}"),
        }
    }
}

/// Fan-out selection for broadcast/multicast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastTarget {
    /// Every registered agent.
    All,
    /// Every agent offering the capability.
    Capability(String),
    /// An explicit subset.
    Agents(Vec<AgentId>),
}

/// Kind of exchange sent to an agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageKind {
    Request,
    HealthCheck,
}

/// Error severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
            Self::Critical => "critical",
        };
        f.write_str(s)
    }
}

/// An error raised by any participant and handed to the recovery manager.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    pub message: String,
    /// Classification hint such as `"network"` or `"validation"`.
    #[serde(default)]
    pub kind: Option<String>,
    #[serde(default)]
    pub agent_id: Option<AgentId>,
    #[serde(default = "default_severity")]
    pub severity: Severity,
    #[serde(default)]
    pub context: Option<serde_json::Value>,
}

const fn default_severity() -> Severity {
    Severity::Medium
}

impl ErrorReport {
    /// Create a medium-severity report with no classification hint.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            kind: None,
            agent_id: None,
            severity: default_severity(),
            context: None,
        }
    }

    /// Set the classification hint.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Attribute the error to an agent.
    #[must_use]
    pub fn with_agent(mut self, agent_id: impl Into<AgentId>) -> Self {
        self.agent_id = Some(agent_id.into());
        self
    }

    /// Set the severity.
    #[must_use]
    pub const fn with_severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    /// Attach free-form context.
    #[must_use]
    pub fn with_context(mut self, context: serde_json::Value) -> Self {
        self.context = Some(context);
        self
    }
}
