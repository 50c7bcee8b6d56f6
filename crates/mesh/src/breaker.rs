//! Circuit breaker pattern implementation.
//!
//! Prevents cascading failures by stopping dispatch to a failing agent.
//! One breaker per agent, transitioning between:
//! - Closed: normal operation, requests pass through
//! - Open: tripped, requests are rejected
//! - Half-Open: a limited number of trial requests test recovery
//!
//! The `Open -> HalfOpen` transition is never driven by a timer. The state is
//! computed from `now` and the last failure every time the breaker is
//! consulted, and materialised by the next mutating call.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use switchboard_core::AgentId;
use switchboard_events::{MeshEvent, Payload};
use tokio::time::Instant;

/// Default circuit breaker configuration.
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;
const DEFAULT_RECOVERY_TIMEOUT_MS: u64 = 60_000;
const DEFAULT_HALF_OPEN_MAX_CALLS: u32 = 3;

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Circuit is closed - normal operation
    Closed,
    /// Circuit is open - rejecting requests
    Open,
    /// Circuit is half-open - testing recovery
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

/// Circuit breaker configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Consecutive failures that trip the circuit
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    /// How long an open circuit waits before allowing trial calls
    #[serde(default = "default_recovery_timeout_ms")]
    pub recovery_timeout_ms: u64,
    /// Trial calls permitted while half-open; this many successes close the circuit
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

const fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

const fn default_recovery_timeout_ms() -> u64 {
    DEFAULT_RECOVERY_TIMEOUT_MS
}

const fn default_half_open_max_calls() -> u32 {
    DEFAULT_HALF_OPEN_MAX_CALLS
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            recovery_timeout_ms: DEFAULT_RECOVERY_TIMEOUT_MS,
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
        }
    }
}

impl BreakerConfig {
    /// Create a new circuit breaker config.
    #[must_use]
    pub fn new(failure_threshold: u32, recovery_timeout: Duration) -> Self {
        Self {
            failure_threshold,
            recovery_timeout_ms: u64::try_from(recovery_timeout.as_millis()).unwrap_or(u64::MAX),
            half_open_max_calls: DEFAULT_HALF_OPEN_MAX_CALLS,
        }
    }

    /// Set the half-open trial budget.
    #[must_use]
    pub const fn with_half_open_max_calls(mut self, calls: u32) -> Self {
        self.half_open_max_calls = calls;
        self
    }

    /// Recovery timeout as a duration.
    #[must_use]
    pub const fn recovery_timeout(&self) -> Duration {
        Duration::from_millis(self.recovery_timeout_ms)
    }
}

/// A state change produced by a breaker mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: CircuitState,
    pub to: CircuitState,
}

/// Circuit breaker guarding dispatch to one agent.
#[derive(Debug, Clone)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    /// Last materialised state; `state_at` may report a later one.
    stored: CircuitState,
    consecutive_failures: u32,
    last_failure: Option<Instant>,
    half_open_calls: u32,
    half_open_successes: u32,
}

impl CircuitBreaker {
    /// Create a closed circuit breaker.
    #[must_use]
    pub const fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            stored: CircuitState::Closed,
            consecutive_failures: 0,
            last_failure: None,
            half_open_calls: 0,
            half_open_successes: 0,
        }
    }

    /// State as of `now`.
    ///
    /// An open breaker whose recovery timeout has elapsed reports `HalfOpen`.
    #[must_use]
    pub fn state_at(&self, now: Instant) -> CircuitState {
        match self.stored {
            CircuitState::Open if self.recovery_elapsed(now) => CircuitState::HalfOpen,
            state => state,
        }
    }

    /// Whether a request could be dispatched at `now`, without consuming a trial.
    #[must_use]
    pub fn allows(&self, now: Instant) -> bool {
        match self.stored {
            CircuitState::Closed => true,
            CircuitState::Open => self.recovery_elapsed(now),
            CircuitState::HalfOpen => self.half_open_calls < self.config.half_open_max_calls,
        }
    }

    /// Admit a request, consuming a half-open trial when applicable.
    ///
    /// Returns whether the request may proceed and any lazy transition that
    /// was materialised on the way.
    pub fn try_acquire(&mut self, now: Instant) -> (bool, Option<Transition>) {
        let transition = self.settle(now);
        let allowed = match self.stored {
            CircuitState::Closed => true,
            CircuitState::Open => false,
            CircuitState::HalfOpen => {
                if self.half_open_calls < self.config.half_open_max_calls {
                    self.half_open_calls = self.half_open_calls.saturating_add(1);
                    true
                } else {
                    false
                }
            }
        };
        (allowed, transition)
    }

    /// Record a successful exchange.
    pub fn record_success(&mut self, now: Instant) -> Option<Transition> {
        let lazy = self.settle(now);
        match self.stored {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                lazy
            }
            CircuitState::HalfOpen => {
                self.half_open_successes = self.half_open_successes.saturating_add(1);
                if self.half_open_successes >= self.config.half_open_max_calls {
                    self.transition_to(CircuitState::Closed, now)
                } else {
                    lazy
                }
            }
            // A success reported while open belongs to a request admitted
            // before the circuit tripped.
            CircuitState::Open => lazy,
        }
    }

    /// Record a failed exchange.
    pub fn record_failure(&mut self, now: Instant) -> Option<Transition> {
        let lazy = self.settle(now);
        self.consecutive_failures = self.consecutive_failures.saturating_add(1);
        self.last_failure = Some(now);
        match self.stored {
            CircuitState::Closed if self.consecutive_failures >= self.config.failure_threshold => {
                self.transition_to(CircuitState::Open, now)
            }
            CircuitState::HalfOpen => self.transition_to(CircuitState::Open, now),
            CircuitState::Closed | CircuitState::Open => lazy,
        }
    }

    /// Trip the circuit regardless of the failure count.
    pub fn force_open(&mut self, now: Instant) -> Option<Transition> {
        self.last_failure = Some(now);
        self.transition_to(CircuitState::Open, now)
    }

    /// Move to half-open with a fresh trial budget.
    pub fn force_half_open(&mut self, now: Instant) -> Option<Transition> {
        self.transition_to(CircuitState::HalfOpen, now)
    }

    /// Close the circuit and clear all counters.
    pub fn force_closed(&mut self, now: Instant) -> Option<Transition> {
        self.transition_to(CircuitState::Closed, now)
    }

    /// Consecutive failures since the last success or reset.
    #[must_use]
    pub const fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Time of the most recent failure.
    #[must_use]
    pub const fn last_failure(&self) -> Option<Instant> {
        self.last_failure
    }

    /// Successful trials since entering half-open.
    #[must_use]
    pub const fn half_open_successes(&self) -> u32 {
        self.half_open_successes
    }

    fn recovery_elapsed(&self, now: Instant) -> bool {
        self.last_failure.is_none_or(|failed_at| {
            now.saturating_duration_since(failed_at) >= self.config.recovery_timeout()
        })
    }

    /// Materialise a pending `Open -> HalfOpen` transition.
    fn settle(&mut self, now: Instant) -> Option<Transition> {
        if self.stored == CircuitState::Open && self.recovery_elapsed(now) {
            self.transition_to(CircuitState::HalfOpen, now)
        } else {
            None
        }
    }

    fn transition_to(&mut self, to: CircuitState, now: Instant) -> Option<Transition> {
        let from = self.stored;
        self.stored = to;
        self.half_open_calls = 0;
        self.half_open_successes = 0;
        match to {
            CircuitState::Closed => {
                self.consecutive_failures = 0;
                self.last_failure = None;
            }
            CircuitState::Open => {
                self.last_failure = Some(self.last_failure.unwrap_or(now));
            }
            CircuitState::HalfOpen => {}
        }
        (from != to).then_some(Transition { from, to })
    }
}

/// A breaker transition attributed to an agent, ready to publish.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerEvent {
    pub agent_id: AgentId,
    pub transition: Transition,
    pub consecutive_failures: u32,
}

impl BreakerEvent {
    /// Whether this event tripped the circuit.
    #[must_use]
    pub fn opened(&self) -> bool {
        self.transition.to == CircuitState::Open
    }

    /// Convert to the matching `circuit.breaker.*` event.
    #[must_use]
    pub fn to_event(&self) -> MeshEvent {
        let agent_id = self.agent_id.clone();
        let payload = match self.transition.to {
            CircuitState::Open => Payload::CircuitOpened {
                agent_id,
                consecutive_failures: self.consecutive_failures,
            },
            CircuitState::HalfOpen => Payload::CircuitHalfOpen { agent_id },
            CircuitState::Closed => Payload::CircuitClosed { agent_id },
        };
        MeshEvent::new(payload)
    }
}

/// Result of asking the bank to admit a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Admission {
    pub allowed: bool,
    pub event: Option<BreakerEvent>,
}

/// One circuit breaker per registered agent.
#[derive(Debug, Clone, Default)]
pub struct CircuitBreakerBank {
    config: BreakerConfig,
    breakers: HashMap<AgentId, CircuitBreaker>,
}

impl CircuitBreakerBank {
    /// Create an empty bank.
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            breakers: HashMap::new(),
        }
    }

    /// Install a closed breaker for the agent, replacing any previous one.
    pub fn insert(&mut self, agent_id: AgentId) {
        self.breakers
            .insert(agent_id, CircuitBreaker::new(self.config.clone()));
    }

    /// Remove the agent's breaker.
    pub fn remove(&mut self, agent_id: &str) -> bool {
        self.breakers.remove(agent_id).is_some()
    }

    /// Borrow an agent's breaker.
    #[must_use]
    pub fn get(&self, agent_id: &str) -> Option<&CircuitBreaker> {
        self.breakers.get(agent_id)
    }

    /// Computed state of an agent's breaker.
    #[must_use]
    pub fn state(&self, agent_id: &str, now: Instant) -> Option<CircuitState> {
        self.breakers.get(agent_id).map(|b| b.state_at(now))
    }

    /// Whether the agent may be selected at `now`. Unknown agents never are.
    #[must_use]
    pub fn allows(&self, agent_id: &str, now: Instant) -> bool {
        self.breakers.get(agent_id).is_some_and(|b| b.allows(now))
    }

    /// Admit a request to the agent.
    pub fn acquire(&mut self, agent_id: &str, now: Instant) -> Admission {
        match self.breakers.get_mut(agent_id) {
            Some(breaker) => {
                let (allowed, transition) = breaker.try_acquire(now);
                Admission {
                    allowed,
                    event: Self::attribute(agent_id, breaker, transition),
                }
            }
            None => Admission {
                allowed: false,
                event: None,
            },
        }
    }

    /// Record a success against the agent's breaker.
    pub fn record_success(&mut self, agent_id: &str, now: Instant) -> Option<BreakerEvent> {
        let breaker = self.breakers.get_mut(agent_id)?;
        let transition = breaker.record_success(now);
        Self::attribute(agent_id, breaker, transition)
    }

    /// Record a failure against the agent's breaker.
    pub fn record_failure(&mut self, agent_id: &str, now: Instant) -> Option<BreakerEvent> {
        let breaker = self.breakers.get_mut(agent_id)?;
        let transition = breaker.record_failure(now);
        Self::attribute(agent_id, breaker, transition)
    }

    /// Trip the agent's circuit.
    pub fn force_open(&mut self, agent_id: &str, now: Instant) -> Option<BreakerEvent> {
        let breaker = self.breakers.get_mut(agent_id)?;
        let transition = breaker.force_open(now);
        Self::attribute(agent_id, breaker, transition)
    }

    /// Move the agent's circuit to half-open.
    pub fn force_half_open(&mut self, agent_id: &str, now: Instant) -> Option<BreakerEvent> {
        let breaker = self.breakers.get_mut(agent_id)?;
        let transition = breaker.force_half_open(now);
        Self::attribute(agent_id, breaker, transition)
    }

    /// Agents whose circuit is open at `now`.
    #[must_use]
    pub fn open_agents(&self, now: Instant) -> Vec<AgentId> {
        self.breakers
            .iter()
            .filter(|(_, b)| b.state_at(now) == CircuitState::Open)
            .map(|(id, _)| id.clone())
            .collect()
    }

    /// Number of breakers in the bank.
    #[must_use]
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Whether the bank is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }

    fn attribute(
        agent_id: &str,
        breaker: &CircuitBreaker,
        transition: Option<Transition>,
    ) -> Option<BreakerEvent> {
        transition.map(|transition| BreakerEvent {
            agent_id: AgentId::from(agent_id),
            transition,
            consecutive_failures: breaker.consecutive_failures(),
        })
    }
}
