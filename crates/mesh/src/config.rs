//! Mesh configuration.
//!
//! Every section has working defaults, so an empty TOML file is a valid
//! configuration. Durations are integers suffixed with their unit.

use std::path::Path;

use serde::{Deserialize, Serialize};
use switchboard_core::Error;

use crate::anomaly::AnomalyConfig;
use crate::balancer::BalancerConfig;
use crate::breaker::BreakerConfig;
use crate::dispatcher::DispatchConfig;
use crate::error::{MeshError, MeshResult};
use crate::health::HealthConfig;
use crate::history::HistoryConfig;
use crate::optimizer::OptimizerConfig;
use crate::persistence::PersistenceConfig;
use crate::recovery::RecoveryConfig;
use crate::registry::RegistryConfig;

/// Configuration of every mesh component.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MeshConfig {
    #[serde(default)]
    pub breaker: BreakerConfig,
    #[serde(default)]
    pub dispatch: DispatchConfig,
    #[serde(default)]
    pub health: HealthConfig,
    #[serde(default)]
    pub recovery: RecoveryConfig,
    #[serde(default)]
    pub optimizer: OptimizerConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub history: HistoryConfig,
    #[serde(default)]
    pub registry: RegistryConfig,
    #[serde(default)]
    pub balancer: BalancerConfig,
    #[serde(default)]
    pub persistence: PersistenceConfig,
}

impl MeshConfig {
    /// Create a config with defaults.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Short intervals and small budgets for tests.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            breaker: BreakerConfig {
                failure_threshold: 3,
                recovery_timeout_ms: 1_000,
                half_open_max_calls: 1,
            },
            dispatch: DispatchConfig {
                default_timeout_ms: 500,
            },
            health: HealthConfig {
                interval_ms: 200,
                probe_timeout_ms: 100,
            },
            recovery: RecoveryConfig {
                backoff_ms: vec![10, 50, 150],
                recovery_probe_delay_ms: 1_000,
                ..RecoveryConfig::default()
            },
            optimizer: OptimizerConfig {
                interval_ms: 1_000,
                ..OptimizerConfig::default()
            },
            ..Self::default()
        }
    }

    /// Parse a TOML document.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::InvalidConfig` if the document does not parse or
    /// fails validation.
    pub fn from_toml_str(content: &str) -> MeshResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| {
            MeshError::from(Error::toml_parse_failed(e.to_string()))
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::Persistence` if the file cannot be read and
    /// `MeshError::InvalidConfig` if it is not a valid configuration.
    pub async fn load(path: impl AsRef<Path>) -> MeshResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| MeshError::from(Error::file_read_failed(path, e.to_string())))?;
        Self::from_toml_str(&content)
    }

    /// Render as TOML.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::InvalidConfig` if serialization fails.
    pub fn to_toml_string(&self) -> MeshResult<String> {
        toml::to_string_pretty(self).map_err(|e| MeshError::invalid_config(e.to_string()))
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns `MeshError::InvalidConfig` naming the first invalid setting.
    pub fn validate(&self) -> MeshResult<()> {
        let fail = |reason: &str| Err(MeshError::invalid_config(reason));

        if self.breaker.failure_threshold == 0 {
            return fail("breaker.failure_threshold must be greater than 0");
        }
        if self.breaker.half_open_max_calls == 0 {
            return fail("breaker.half_open_max_calls must be greater than 0");
        }
        if self.dispatch.default_timeout_ms == 0 {
            return fail("dispatch.default_timeout_ms must be greater than 0");
        }
        if self.health.interval_ms == 0 {
            return fail("health.interval_ms must be greater than 0");
        }
        if self.health.probe_timeout_ms == 0 {
            return fail("health.probe_timeout_ms must be greater than 0");
        }
        if self.recovery.backoff_ms.is_empty() {
            return fail("recovery.backoff_ms must not be empty");
        }
        if !(self.recovery.jitter_factor >= 0.0 && self.recovery.jitter_factor <= 1.0) {
            return fail("recovery.jitter_factor must be within [0, 1]");
        }
        if self.recovery.timeout_retry_factor < 1.0 {
            return fail("recovery.timeout_retry_factor must be at least 1");
        }
        if self.optimizer.interval_ms == 0 {
            return fail("optimizer.interval_ms must be greater than 0");
        }
        if self.optimizer.min_weight <= 0.0 || self.optimizer.min_weight > self.optimizer.max_weight
        {
            return fail("optimizer weights must satisfy 0 < min_weight <= max_weight");
        }
        if self.anomaly.z_threshold <= 0.0 {
            return fail("anomaly.z_threshold must be greater than 0");
        }
        if self.anomaly.critical_z < self.anomaly.z_threshold {
            return fail("anomaly.critical_z must not be below anomaly.z_threshold");
        }
        if self.history.capacity == 0 {
            return fail("history.capacity must be greater than 0");
        }
        if !(self.registry.reliability_alpha > 0.0 && self.registry.reliability_alpha <= 1.0) {
            return fail("registry.reliability_alpha must be within (0, 1]");
        }
        if self.balancer.load_capacity == 0 {
            return fail("balancer.load_capacity must be greater than 0");
        }
        if self.persistence.snapshot_interval_ms == 0 {
            return fail("persistence.snapshot_interval_ms must be greater than 0");
        }
        Ok(())
    }
}
