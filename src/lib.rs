#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

//! # Switchboard
//!
//! In-process agent routing with circuit breaking, load balancing, health
//! checks and automatic recovery.
//!
//! This library re-exports the workspace crates for convenience.

pub mod cli;

pub use switchboard_core;
pub use switchboard_events;
pub use switchboard_mesh;
