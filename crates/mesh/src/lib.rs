//! Agent communication and resilience core.
//!
//! Agents register with a set of capabilities and exchange messages through
//! the mesh instead of addressing each other directly. For every request the
//! mesh picks a target, delivers it over the event bus and correlates the
//! reply:
//!
//! - **Routing**: capability routes ranked by reliability, latency and load
//! - **Balancing**: round-robin, least-connections, weighted or adaptive
//! - **Circuit breaking**: one breaker per agent, lazy half-open probing
//! - **Health**: periodic probes, inactivity detection, retention cleanup
//! - **Recovery**: classified failures, pluggable remediation, bounded retries
//! - **Optimization**: score and weight tuning, anomaly-triggered passes
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use switchboard_events::{AgentSpec, Route};
//! use switchboard_mesh::{Mesh, MeshConfig, SendRequest};
//!
//! #[tokio::main]
//! async fn main() -> switchboard_mesh::MeshResult<()> {
//!     let mesh = Mesh::new(MeshConfig::default())?;
//!     mesh.start().await;
//!
//!     mesh.register_agent(AgentSpec::new("summarizer", "Summarizer").with_capability("summarize"))
//!         .await?;
//!
//!     let request = SendRequest::new(Route::Capability("summarize".into()), serde_json::json!({"text": "..."}));
//!     let response = mesh.send(request).await?;
//!     println!("{} answered in {}ms", response.agent_id, response.latency_ms);
//!
//!     mesh.shutdown().await;
//!     Ok(())
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod anomaly;
pub mod balancer;
pub mod breaker;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod health;
pub mod history;
pub mod mesh;
pub mod optimizer;
pub mod persistence;
pub mod recovery;
pub mod registry;
pub mod routing;
pub mod state;

pub use anomaly::{Anomaly, AnomalyConfig, AnomalyDetector, Metric};
pub use balancer::{BalancerConfig, LoadBalancingStrategy, StrategyKind};
pub use breaker::{BreakerConfig, CircuitBreaker, CircuitBreakerBank, CircuitState};
pub use config::MeshConfig;
pub use dispatcher::{
    BroadcastOutcome, BroadcastReport, DispatchConfig, DispatchFailure, Dispatcher, Response,
    SendRequest,
};
pub use error::{MeshError, MeshResult};
pub use health::{HealthConfig, HealthMonitor, HealthReport};
pub use history::{CommunicationHistory, CommunicationRecord, HistoryConfig};
pub use mesh::{Mesh, MeshStats};
pub use optimizer::{OptimizationReport, Optimizer, OptimizerConfig};
pub use persistence::{PersistenceConfig, RestoreReport, SnapshotStore};
pub use recovery::{
    ErrorCategory, ErrorClass, FailureRecord, FailureStatus, RecoveryConfig, RecoveryManager,
    RecoveryStrategy, Remediation, RemediationContext,
};
pub use registry::{AgentDescriptor, AgentMetrics, AgentRegistry, RegistryConfig};
pub use routing::{RouteEntry, RouteTable};
pub use state::{MeshState, SharedState};
