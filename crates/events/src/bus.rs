//! Event bus for pub/sub coordination.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use tokio::sync::{RwLock, broadcast};
use tracing::debug;

use crate::error::{Error, Result};
use crate::event::{MeshEvent, Topic};
use switchboard_core::EventId;

const DEFAULT_CHANNEL_CAPACITY: usize = 1024;
const DEFAULT_SUBSCRIBER_CAPACITY: usize = 256;
const DEFAULT_FAILURE_THRESHOLD: u32 = 5;

/// Delivery breaker for a single pattern subscriber.
///
/// A subscriber whose receiver was dropped fails every delivery; after
/// `threshold` consecutive failures it is removed from the bus.
struct DeliveryBreaker {
    failure_count: AtomicU32,
    threshold: u32,
}

impl DeliveryBreaker {
    fn new(threshold: u32) -> Self {
        Self {
            failure_count: AtomicU32::new(0),
            threshold,
        }
    }

    fn is_tripped(&self) -> bool {
        self.failure_count.load(Ordering::Relaxed) >= self.threshold
    }

    fn record_success(&self) {
        self.failure_count.store(0, Ordering::Relaxed);
    }

    fn record_failure(&self) -> u32 {
        self.failure_count
            .fetch_add(1, Ordering::Relaxed)
            .saturating_add(1)
    }
}

/// Identifier returned by [`EventBus::subscribe_with_pattern`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriberId(u64);

impl fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// Pattern-based subscriber.
struct Subscriber {
    sender: broadcast::Sender<MeshEvent>,
    pattern: EventPattern,
    breaker: Arc<DeliveryBreaker>,
}

/// Subscription handle for receiving events.
pub struct EventSubscription {
    receiver: broadcast::Receiver<MeshEvent>,
}

impl EventSubscription {
    /// Receive the next event.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Lagged`] when events were dropped because the
    /// subscriber fell behind (the subscription stays usable), and
    /// [`Error::ChannelClosed`] once the bus is gone.
    pub async fn recv(&mut self) -> Result<MeshEvent> {
        self.receiver.recv().await.map_err(|err| match err {
            broadcast::error::RecvError::Lagged(skipped) => Error::Lagged { skipped },
            broadcast::error::RecvError::Closed => Error::ChannelClosed,
        })
    }

    /// Try to receive an event without waiting.
    ///
    /// # Errors
    ///
    /// Returns [`Error::ChannelClosed`] when nothing is buffered or the bus is gone.
    pub fn try_recv(&mut self) -> Result<MeshEvent> {
        self.receiver.try_recv().map_err(|err| match err {
            broadcast::error::TryRecvError::Lagged(skipped) => Error::Lagged { skipped },
            broadcast::error::TryRecvError::Empty | broadcast::error::TryRecvError::Closed => {
                Error::ChannelClosed
            }
        })
    }
}

/// Pattern for filtering events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPattern {
    /// Match all events.
    All,
    /// Match one topic.
    Topic(Topic),
    /// Match any of several topics.
    Topics(Vec<Topic>),
    /// Match every topic whose dotted name starts with the prefix.
    Prefix(String),
}

impl EventPattern {
    /// Check if an event matches this pattern.
    #[must_use]
    pub fn matches(&self, event: &MeshEvent) -> bool {
        self.matches_topic(event.topic())
    }

    /// Check if a topic matches this pattern.
    #[must_use]
    pub fn matches_topic(&self, topic: Topic) -> bool {
        match self {
            Self::All => true,
            Self::Topic(t) => *t == topic,
            Self::Topics(topics) => topics.contains(&topic),
            Self::Prefix(prefix) => topic.as_str().starts_with(prefix.as_str()),
        }
    }
}

/// Event bus for publishing and subscribing to events.
pub struct EventBus {
    /// Broadcast sender for all events.
    broadcast: broadcast::Sender<MeshEvent>,
    /// Pattern-based subscribers.
    subscribers: RwLock<HashMap<SubscriberId, Subscriber>>,
    /// Next subscriber ID.
    next_id: AtomicU64,
    /// Capacity of each pattern subscriber's channel.
    subscriber_capacity: usize,
    /// Failed deliveries before a pattern subscriber is dropped.
    failure_threshold: u32,
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventBus")
            .field("global_receivers", &self.broadcast.receiver_count())
            .field("subscriber_capacity", &self.subscriber_capacity)
            .field("failure_threshold", &self.failure_threshold)
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Create a new event bus with default capacities.
    #[must_use]
    pub fn new() -> Self {
        EventBusBuilder::new().build()
    }

    /// Publish an event to every matching subscriber.
    ///
    /// Publishing never fails: an event nobody listens to is simply dropped.
    pub async fn publish(&self, event: MeshEvent) -> EventId {
        let event_id = event.event_id;

        debug!(
            event_id = %event_id,
            topic = %event.topic(),
            "Publishing event"
        );

        // Broadcast to global subscribers; no receivers is not an error
        let _ = self.broadcast.send(event.clone());

        let tripped = {
            let subscribers = self.subscribers.read().await;
            let mut tripped = Vec::new();
            for (id, sub) in subscribers
                .iter()
                .filter(|(_, sub)| sub.pattern.matches(&event))
            {
                if sub.breaker.is_tripped() {
                    tripped.push(*id);
                    continue;
                }

                match sub.sender.send(event.clone()) {
                    Ok(_) => sub.breaker.record_success(),
                    Err(broadcast::error::SendError(_)) => {
                        let failures = sub.breaker.record_failure();
                        debug!(
                            subscriber = %id,
                            topic = %event.topic(),
                            subscriber_failures = failures,
                            "Failed to deliver event to subscriber"
                        );
                        if sub.breaker.is_tripped() {
                            tripped.push(*id);
                        }
                    }
                }
            }
            tripped
        };

        if !tripped.is_empty() {
            let mut subscribers = self.subscribers.write().await;
            for id in tripped {
                debug!(subscriber = %id, "Dropping subscriber after repeated delivery failures");
                subscribers.remove(&id);
            }
        }

        event_id
    }

    /// Publish several events in order.
    pub async fn publish_all(&self, events: impl IntoIterator<Item = MeshEvent>) {
        for event in events {
            self.publish(event).await;
        }
    }

    /// Subscribe to all events.
    #[must_use]
    pub fn subscribe(&self) -> EventSubscription {
        EventSubscription {
            receiver: self.broadcast.subscribe(),
        }
    }

    /// Subscribe to events matching a pattern.
    pub async fn subscribe_with_pattern(
        &self,
        pattern: EventPattern,
    ) -> (SubscriberId, EventSubscription) {
        let (sender, receiver) = broadcast::channel(self.subscriber_capacity);
        let id = SubscriberId(self.next_id.fetch_add(1, Ordering::Relaxed));

        let mut subscribers = self.subscribers.write().await;
        subscribers.insert(
            id,
            Subscriber {
                sender,
                pattern,
                breaker: Arc::new(DeliveryBreaker::new(self.failure_threshold)),
            },
        );

        (id, EventSubscription { receiver })
    }

    /// Unsubscribe a pattern-based subscriber.
    pub async fn unsubscribe(&self, subscriber_id: SubscriberId) {
        let mut subscribers = self.subscribers.write().await;
        subscribers.remove(&subscriber_id);
    }

    /// Number of live pattern subscribers.
    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.read().await.len()
    }

    /// Failed deliveries tolerated before a subscriber is dropped.
    #[must_use]
    pub const fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Builder for [`EventBus`].
pub struct EventBusBuilder {
    channel_capacity: usize,
    subscriber_capacity: usize,
    failure_threshold: u32,
}

impl EventBusBuilder {
    /// Create a new builder.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            subscriber_capacity: DEFAULT_SUBSCRIBER_CAPACITY,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
        }
    }

    /// Set the global broadcast channel capacity.
    #[must_use]
    pub const fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Set the per-subscriber channel capacity.
    #[must_use]
    pub const fn with_subscriber_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_capacity = capacity;
        self
    }

    /// Set the delivery failure threshold.
    #[must_use]
    pub const fn with_failure_threshold(mut self, threshold: u32) -> Self {
        self.failure_threshold = threshold;
        self
    }

    /// Build the event bus.
    #[must_use]
    pub fn build(self) -> EventBus {
        let (broadcast, _) = broadcast::channel(self.channel_capacity.max(1));

        EventBus {
            broadcast,
            subscribers: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            subscriber_capacity: self.subscriber_capacity.max(1),
            failure_threshold: self.failure_threshold.max(1),
        }
    }
}

impl Default for EventBusBuilder {
    fn default() -> Self {
        Self::new()
    }
}
