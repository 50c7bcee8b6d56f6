//! # switchboard-core
//!
//! Shared error type, result combinators and typed identifiers used by every
//! switchboard crate.

#![forbid(unsafe_code)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod error;
pub mod ids;
pub mod result;

pub use error::Error;
pub use ids::{AgentId, AnomalyId, CorrelationId, EventId, FailureId, RecordId};
pub use result::{Result, ResultExt};
