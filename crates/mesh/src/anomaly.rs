//! Statistical anomaly detection.
//!
//! Keeps a rolling window of samples per agent and metric. A sample whose
//! z-score against the window exceeds the threshold is recorded as an
//! anomaly; above the critical threshold its severity escalates. Anomalies
//! are surfaced as events and only a response-time degradation triggers any
//! action (a re-optimization pass).

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use im::Vector;
use serde::{Deserialize, Serialize};
use switchboard_core::{AgentId, AnomalyId};
use switchboard_events::{MeshEvent, Payload, Severity};
use tokio::time::Instant;
use tracing::warn;

const DEFAULT_Z_THRESHOLD: f64 = 2.5;
const DEFAULT_CRITICAL_Z: f64 = 3.0;
const DEFAULT_WINDOW_SIZE: usize = 100;
const DEFAULT_MIN_SAMPLES: usize = 10;
const DEFAULT_RETENTION_MS: u64 = 3_600_000;
const DEFAULT_MAX_ANOMALIES: usize = 1000;

/// Anomaly detector configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyConfig {
    /// z-score above which a sample is anomalous.
    #[serde(default = "default_z_threshold")]
    pub z_threshold: f64,
    /// z-score above which an anomaly is high severity.
    #[serde(default = "default_critical_z")]
    pub critical_z: f64,
    /// Samples kept per agent and metric.
    #[serde(default = "default_window_size")]
    pub window_size: usize,
    /// Samples required before anything is flagged.
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// How long recorded anomalies are kept.
    #[serde(default = "default_retention_ms")]
    pub retention_ms: u64,
    /// Most anomalies kept regardless of age.
    #[serde(default = "default_max_anomalies")]
    pub max_anomalies: usize,
}

const fn default_z_threshold() -> f64 {
    DEFAULT_Z_THRESHOLD
}

const fn default_critical_z() -> f64 {
    DEFAULT_CRITICAL_Z
}

const fn default_window_size() -> usize {
    DEFAULT_WINDOW_SIZE
}

const fn default_min_samples() -> usize {
    DEFAULT_MIN_SAMPLES
}

const fn default_retention_ms() -> u64 {
    DEFAULT_RETENTION_MS
}

const fn default_max_anomalies() -> usize {
    DEFAULT_MAX_ANOMALIES
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            z_threshold: DEFAULT_Z_THRESHOLD,
            critical_z: DEFAULT_CRITICAL_Z,
            window_size: DEFAULT_WINDOW_SIZE,
            min_samples: DEFAULT_MIN_SAMPLES,
            retention_ms: DEFAULT_RETENTION_MS,
            max_anomalies: DEFAULT_MAX_ANOMALIES,
        }
    }
}

impl AnomalyConfig {
    /// Retention window for recorded anomalies.
    #[must_use]
    pub const fn retention(&self) -> Duration {
        Duration::from_millis(self.retention_ms)
    }
}

/// Metrics tracked per agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Metric {
    ResponseTime,
    Reliability,
}

impl Metric {
    /// Metric name as published.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::ResponseTime => "response_time_ms",
            Self::Reliability => "reliability",
        }
    }
}

impl fmt::Display for Metric {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A flagged sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Anomaly {
    pub id: AnomalyId,
    pub agent_id: AgentId,
    pub metric: Metric,
    pub value: f64,
    pub mean: f64,
    pub std_dev: f64,
    pub z_score: f64,
    pub severity: Severity,
    pub detected_at: DateTime<Utc>,
    pub observed_at: Instant,
}

impl Anomaly {
    /// Whether this is a response-time increase.
    #[must_use]
    pub fn is_degradation(&self) -> bool {
        self.metric == Metric::ResponseTime && self.value > self.mean
    }

    /// Convert to an `anomaly.detected` event.
    #[must_use]
    pub fn to_event(&self) -> MeshEvent {
        MeshEvent::new(Payload::AnomalyDetected {
            anomaly_id: self.id,
            agent_id: self.agent_id.clone(),
            metric: self.metric.as_str().to_string(),
            value: self.value,
            mean: self.mean,
            std_dev: self.std_dev,
            z_score: self.z_score,
            severity: self.severity,
        })
    }
}

/// Rolling z-score detector.
#[derive(Debug, Clone, Default)]
pub struct AnomalyDetector {
    config: AnomalyConfig,
    samples: HashMap<(AgentId, Metric), VecDeque<f64>>,
    anomalies: Vector<Anomaly>,
}

impl AnomalyDetector {
    /// Create a detector.
    #[must_use]
    pub fn new(config: AnomalyConfig) -> Self {
        Self {
            config,
            samples: HashMap::new(),
            anomalies: Vector::new(),
        }
    }

    /// Score a sample against the window, then add it to the window.
    pub fn observe(
        &mut self,
        agent_id: &AgentId,
        metric: Metric,
        value: f64,
        now: Instant,
    ) -> Option<Anomaly> {
        let window_size = self.config.window_size.max(1);
        let window = self
            .samples
            .entry((agent_id.clone(), metric))
            .or_default();

        let anomaly = if window.len() >= self.config.min_samples.max(2) {
            let (mean, std_dev) = mean_and_std_dev(window);
            let z_score = if std_dev > f64::EPSILON {
                (value - mean).abs() / std_dev
            } else {
                0.0
            };
            (z_score > self.config.z_threshold).then(|| Anomaly {
                id: AnomalyId::new(),
                agent_id: agent_id.clone(),
                metric,
                value,
                mean,
                std_dev,
                z_score,
                severity: if z_score > self.config.critical_z {
                    Severity::High
                } else {
                    Severity::Medium
                },
                detected_at: Utc::now(),
                observed_at: now,
            })
        } else {
            None
        };

        window.push_back(value);
        while window.len() > window_size {
            window.pop_front();
        }

        if let Some(anomaly) = &anomaly {
            warn!(
                agent_id = %anomaly.agent_id,
                metric = %anomaly.metric,
                value = anomaly.value,
                z_score = anomaly.z_score,
                severity = %anomaly.severity,
                "Anomaly detected"
            );
            self.anomalies.push_back(anomaly.clone());
            while self.anomalies.len() > self.config.max_anomalies.max(1) {
                self.anomalies.pop_front();
            }
        }
        anomaly
    }

    /// Drop anomalies older than the retention window.
    pub fn prune(&mut self, now: Instant) -> usize {
        let retention = self.config.retention();
        let before = self.anomalies.len();
        self.anomalies
            .retain(|a| now.saturating_duration_since(a.observed_at) <= retention);
        before - self.anomalies.len()
    }

    /// Shrink every sample window to its most recent `keep` samples.
    pub fn trim_samples(&mut self, keep: usize) {
        for window in self.samples.values_mut() {
            while window.len() > keep {
                window.pop_front();
            }
        }
        self.samples.retain(|_, window| !window.is_empty());
    }

    /// Forget every sample of an agent.
    pub fn forget(&mut self, agent_id: &str) {
        self.samples.retain(|(id, _), _| id.as_str() != agent_id);
    }

    /// Recorded anomalies, oldest first.
    #[must_use]
    pub fn anomalies(&self) -> Vector<Anomaly> {
        self.anomalies.clone()
    }

    /// Number of samples held for an agent and metric.
    #[must_use]
    pub fn sample_count(&self, agent_id: &str, metric: Metric) -> usize {
        self.samples
            .get(&(AgentId::from(agent_id), metric))
            .map_or(0, VecDeque::len)
    }
}

fn mean_and_std_dev(window: &VecDeque<f64>) -> (f64, f64) {
    let n = window.len() as f64;
    let mean = window.iter().sum::<f64>() / n;
    let variance = window.iter().map(|v| (v - mean).powi(2)).sum::<f64>() / n;
    (mean, variance.sqrt())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(detector: &mut AnomalyDetector, agent: &AgentId, now: Instant) {
        for value in [100.0, 110.0, 90.0, 105.0, 95.0, 100.0, 102.0, 98.0, 101.0, 99.0] {
            assert!(detector.observe(agent, Metric::ResponseTime, value, now).is_none());
        }
    }

    #[test]
    fn test_no_anomaly_before_min_samples() {
        let mut detector = AnomalyDetector::default();
        let agent = AgentId::from("a");
        let now = Instant::now();
        for _ in 0..5 {
            detector.observe(&agent, Metric::ResponseTime, 100.0, now);
        }
        assert!(detector.observe(&agent, Metric::ResponseTime, 10_000.0, now).is_none());
    }

    #[test]
    fn test_outlier_is_flagged_with_high_severity() {
        let mut detector = AnomalyDetector::default();
        let agent = AgentId::from("a");
        let now = Instant::now();
        seeded(&mut detector, &agent, now);

        let anomaly = detector.observe(&agent, Metric::ResponseTime, 500.0, now);
        let anomaly = anomaly.as_ref();
        assert_eq!(anomaly.map(|a| a.severity), Some(Severity::High));
        assert!(anomaly.is_some_and(Anomaly::is_degradation));
        assert_eq!(detector.anomalies().len(), 1);
    }

    #[test]
    fn test_moderate_outlier_is_medium() {
        let config = AnomalyConfig {
            z_threshold: 2.0,
            critical_z: 100.0,
            ..AnomalyConfig::default()
        };
        let mut detector = AnomalyDetector::new(config);
        let agent = AgentId::from("a");
        let now = Instant::now();
        seeded(&mut detector, &agent, now);

        let anomaly = detector.observe(&agent, Metric::ResponseTime, 120.0, now);
        assert_eq!(anomaly.map(|a| a.severity), Some(Severity::Medium));
    }

    #[test]
    fn test_constant_series_never_flags() {
        let mut detector = AnomalyDetector::default();
        let agent = AgentId::from("a");
        let now = Instant::now();
        for _ in 0..20 {
            assert!(detector.observe(&agent, Metric::Reliability, 1.0, now).is_none());
        }
    }

    #[test]
    fn test_prune_respects_retention() {
        let config = AnomalyConfig {
            retention_ms: 1_000,
            ..AnomalyConfig::default()
        };
        let mut detector = AnomalyDetector::new(config);
        let agent = AgentId::from("a");
        let t0 = Instant::now();
        seeded(&mut detector, &agent, t0);
        detector.observe(&agent, Metric::ResponseTime, 900.0, t0);

        assert_eq!(detector.prune(t0), 0);
        assert_eq!(detector.prune(t0 + Duration::from_secs(2)), 1);
        assert!(detector.anomalies().is_empty());
    }

    #[test]
    fn test_trim_samples() {
        let mut detector = AnomalyDetector::default();
        let agent = AgentId::from("a");
        let now = Instant::now();
        seeded(&mut detector, &agent, now);
        detector.trim_samples(3);
        assert_eq!(detector.sample_count("a", Metric::ResponseTime), 3);
    }
}
