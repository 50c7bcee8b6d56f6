//! Bounded communication history.
//!
//! Feeds the load component of route scores and the optimizer. Backed by a
//! persistent vector so snapshots for analysis are cheap clones.

use std::time::Duration;

use chrono::{DateTime, Utc};
use im::Vector;
use serde::{Deserialize, Serialize};
use switchboard_core::{AgentId, RecordId};
use tokio::time::Instant;

const DEFAULT_CAPACITY: usize = 1000;

/// History configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryConfig {
    /// Most records kept; the oldest is evicted first.
    #[serde(default = "default_capacity")]
    pub capacity: usize,
}

const fn default_capacity() -> usize {
    DEFAULT_CAPACITY
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CAPACITY,
        }
    }
}

/// One completed exchange.
#[derive(Debug, Clone, PartialEq)]
pub struct CommunicationRecord {
    pub id: RecordId,
    pub source: Option<AgentId>,
    pub target: AgentId,
    pub response_time_ms: u64,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
    pub recorded_at: Instant,
}

impl CommunicationRecord {
    /// Create a record stamped at `now`.
    pub fn new(
        source: Option<AgentId>,
        target: AgentId,
        response_time_ms: u64,
        success: bool,
        now: Instant,
    ) -> Self {
        Self {
            id: RecordId::new(),
            source,
            target,
            response_time_ms,
            success,
            timestamp: Utc::now(),
            recorded_at: now,
        }
    }
}

/// Ring of the most recent communication records.
#[derive(Debug, Clone)]
pub struct CommunicationHistory {
    records: Vector<CommunicationRecord>,
    capacity: usize,
}

impl Default for CommunicationHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl CommunicationHistory {
    /// Create an empty history. A zero capacity is treated as one.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            records: Vector::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append a record, evicting the oldest when full.
    pub fn push(&mut self, record: CommunicationRecord) {
        self.records.push_back(record);
        while self.records.len() > self.capacity {
            self.records.pop_front();
        }
    }

    /// Exchanges with `agent_id` recorded within `window` of `now`.
    #[must_use]
    pub fn recent_count(&self, agent_id: &str, window: Duration, now: Instant) -> usize {
        self.records
            .iter()
            .rev()
            .take_while(|r| now.saturating_duration_since(r.recorded_at) <= window)
            .filter(|r| r.target.as_str() == agent_id)
            .count()
    }

    /// Records targeting `agent_id`, oldest first.
    #[must_use]
    pub fn records_for(&self, agent_id: &str) -> Vec<CommunicationRecord> {
        self.records
            .iter()
            .filter(|r| r.target.as_str() == agent_id)
            .cloned()
            .collect()
    }

    /// Drop records older than `max_age`. Returns how many were removed.
    pub fn prune_older_than(&mut self, max_age: Duration, now: Instant) -> usize {
        let before = self.records.len();
        self.records
            .retain(|r| now.saturating_duration_since(r.recorded_at) <= max_age);
        before - self.records.len()
    }

    /// Keep only the `keep` most recent records. Returns how many were removed.
    pub fn retain_latest(&mut self, keep: usize) -> usize {
        let excess = self.records.len().saturating_sub(keep);
        if excess > 0 {
            self.records = self.records.skip(excess);
        }
        excess
    }

    /// Drop every record of an agent.
    pub fn forget(&mut self, agent_id: &str) {
        self.records.retain(|r| r.target.as_str() != agent_id);
    }

    /// Cheap copy of the whole history.
    #[must_use]
    pub fn snapshot(&self) -> Vector<CommunicationRecord> {
        self.records.clone()
    }

    /// Number of records held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the history is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Maximum number of records.
    #[must_use]
    pub const fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(target: &str, now: Instant) -> CommunicationRecord {
        CommunicationRecord::new(None, AgentId::from(target), 10, true, now)
    }

    #[test]
    fn test_push_evicts_oldest_when_full() {
        let now = Instant::now();
        let mut history = CommunicationHistory::new(3);
        for target in ["a", "b", "c", "d"] {
            history.push(record(target, now));
        }
        assert_eq!(history.len(), 3);
        assert!(history.records_for("a").is_empty());
        assert_eq!(history.records_for("d").len(), 1);
    }

    #[test]
    fn test_recent_count_respects_window() {
        let t0 = Instant::now();
        let mut history = CommunicationHistory::new(10);
        history.push(record("a", t0));
        history.push(record("a", t0 + Duration::from_secs(50)));
        history.push(record("b", t0 + Duration::from_secs(55)));

        let now = t0 + Duration::from_secs(70);
        assert_eq!(history.recent_count("a", Duration::from_secs(60), now), 1);
        assert_eq!(history.recent_count("b", Duration::from_secs(60), now), 1);
        assert_eq!(history.recent_count("a", Duration::from_secs(600), now), 2);
    }

    #[test]
    fn test_prune_older_than() {
        let t0 = Instant::now();
        let mut history = CommunicationHistory::new(10);
        history.push(record("a", t0));
        history.push(record("a", t0 + Duration::from_secs(100)));

        let removed = history.prune_older_than(Duration::from_secs(60), t0 + Duration::from_secs(120));
        assert_eq!(removed, 1);
        assert_eq!(history.len(), 1);
    }

    #[test]
    fn test_retain_latest() {
        let now = Instant::now();
        let mut history = CommunicationHistory::new(10);
        for target in ["a", "b", "c", "d"] {
            history.push(record(target, now));
        }
        assert_eq!(history.retain_latest(2), 2);
        assert!(history.records_for("b").is_empty());
        assert_eq!(history.records_for("c").len(), 1);
        assert_eq!(history.retain_latest(5), 0);
    }

    #[test]
    fn test_zero_capacity_keeps_one() {
        let mut history = CommunicationHistory::new(0);
        history.push(record("a", Instant::now()));
        history.push(record("b", Instant::now()));
        assert_eq!(history.capacity(), 1);
        assert_eq!(history.len(), 1);
    }
}
