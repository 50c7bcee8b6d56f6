//! Typed in-process event bus.
//!
//! Every participant of the mesh (agents, the dispatcher, the recovery
//! manager, external collaborators) talks through one [`EventBus`]:
//!
//! - **Topics**: a closed set of dotted names, so a typo cannot silently drop events
//! - **Patterns**: subscribe to everything, one topic, several topics or a dotted prefix
//! - **Envelope**: every event carries a ULID and a UTC timestamp
//!
//! # Example
//!
//! ```ignore
//! use switchboard_events::{EventBus, EventPattern, MeshEvent, Payload, Topic};
//!
//! #[tokio::main]
//! async fn main() {
//!     let bus = EventBus::new();
//!     let (_id, mut sub) = bus
//!         .subscribe_with_pattern(EventPattern::Prefix("circuit.breaker.".into()))
//!         .await;
//!
//!     bus.publish(MeshEvent::new(Payload::CircuitClosed { agent_id: "a".into() }))
//!         .await;
//!
//!     let event = sub.recv().await.unwrap();
//!     assert_eq!(event.topic(), Topic::CircuitClosed);
//! }
//! ```

#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]

pub mod bus;
pub mod error;
pub mod event;
pub mod types;

pub use bus::{EventBus, EventBusBuilder, EventPattern, EventSubscription, SubscriberId};
pub use error::{Error, Result};
pub use event::{MeshEvent, Payload, Topic};
pub use types::{
    AgentSpec, AgentStatus, BroadcastTarget, ErrorReport, MessageKind, Route, Severity,
};
