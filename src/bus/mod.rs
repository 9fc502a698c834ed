//! In-process publish/subscribe event bus.
//!
//! Generalizes the orchestrator's single `mpsc::UnboundedSender<TaskResult>`
//! result-broadcast channel (`agents/orchestrator/mod.rs`) into a
//! multi-subscriber, bounded, prefix-filtered bus. Built on
//! `tokio::sync::broadcast`, whose ring buffer drops the oldest queued event
//! once a subscriber falls `capacity` events behind rather than rejecting
//! the newest one — the behavior §4.2/§5 call for. A slow subscriber only
//! ever loses its own backlog; it never blocks the publisher or any other
//! subscriber.

use crate::constants::EVENT_BUS_SUBSCRIBER_CAPACITY;
use chrono::{DateTime, Utc};
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::broadcast;
use tokio_stream::wrappers::{errors::BroadcastStreamRecvError, BroadcastStream};
use tokio_stream::StreamExt;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BusEvent {
    pub kind: String,
    pub entity_id: String,
    pub project_id: Option<String>,
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub timestamp: DateTime<Utc>,
}

impl BusEvent {
    pub fn new(kind: impl Into<String>, entity_id: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            entity_id: entity_id.into(),
            project_id: None,
            before: None,
            after: None,
            timestamp: Utc::now(),
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = Some(project_id.into());
        self
    }

    pub fn with_before(mut self, value: Value) -> Self {
        self.before = Some(value);
        self
    }

    pub fn with_after(mut self, value: Value) -> Self {
        self.after = Some(value);
        self
    }

    /// `true` when this event's kind matches a subscription prefix such as
    /// `task:*` or an exact kind such as `heartbeat`.
    pub fn matches_prefix(&self, prefix: &str) -> bool {
        match prefix.strip_suffix('*') {
            Some(stem) => self.kind.starts_with(stem),
            None => self.kind == prefix,
        }
    }

    fn overflow() -> Self {
        Self::new("overflow", String::new())
    }
}

/// Bounded fan-out bus: one shared ring buffer sized `capacity`, one
/// independent read cursor per subscriber. Publishing never blocks.
pub struct EventBus {
    sender: broadcast::Sender<BusEvent>,
}

/// A single subscriber's view of the bus, filtered to its requested kind
/// prefixes. Wraps a fresh `broadcast::Receiver` cursor; drop it to
/// unsubscribe.
pub struct Subscription {
    stream: BroadcastStream<BusEvent>,
    prefixes: Vec<String>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(EVENT_BUS_SUBSCRIBER_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Registers a subscriber for one or more kind prefixes (`"task:*"`,
    /// `"heartbeat"`, ...). Returns a handle the caller polls for events.
    pub fn subscribe(&self, prefixes: Vec<String>) -> Subscription {
        Subscription {
            stream: BroadcastStream::new(self.sender.subscribe()),
            prefixes,
        }
    }

    /// Publishes an event to every subscriber's ring. Subscribers filter by
    /// prefix on read, not on write, so a publish never blocks regardless of
    /// how far behind any one subscriber has fallen.
    pub fn publish(&self, event: BusEvent) {
        // No receivers is not an error; publishing is fire-and-forget.
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl Subscription {
    /// Awaits the next event matching this subscription's prefixes. A
    /// receiver that lagged past the ring's capacity surfaces as a single
    /// synthetic `overflow` event per gap, mirroring the old per-subscriber
    /// marker semantics.
    pub async fn recv(&mut self) -> Option<BusEvent> {
        loop {
            match self.stream.next().await {
                None => return None,
                Some(Ok(event)) => {
                    if self.prefixes.iter().any(|prefix| event.matches_prefix(prefix)) {
                        return Some(event);
                    }
                }
                Some(Err(BroadcastStreamRecvError::Lagged(_))) => {
                    return Some(BusEvent::overflow());
                }
            }
        }
    }

    /// Consumes this subscription into a `Stream` of matching events, for
    /// SSE and other push consumers.
    pub fn into_stream(self) -> impl Stream<Item = BusEvent> {
        let prefixes = self.prefixes;
        self.stream.filter_map(move |item| match item {
            Ok(event) if prefixes.iter().any(|prefix| event.matches_prefix(prefix)) => Some(event),
            Ok(_) => None,
            Err(BroadcastStreamRecvError::Lagged(_)) => Some(BusEvent::overflow()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn subscriber_receives_matching_prefix_only() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(vec!["task:*".to_string()]);

        bus.publish(BusEvent::new("task:created", "t1"));
        bus.publish(BusEvent::new("agent:heartbeat", "a1"));

        let received = sub.recv().await.unwrap();
        assert_eq!(received.kind, "task:created");
    }

    #[tokio::test]
    async fn exact_kind_subscription_does_not_match_other_kinds() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe(vec!["heartbeat".to_string()]);

        bus.publish(BusEvent::new("heartbeat", "x"));
        bus.publish(BusEvent::new("heartbeat:extra", "x"));
        bus.publish(BusEvent::new("heartbeat", "y"));

        let first = sub.recv().await.unwrap();
        assert_eq!(first.entity_id, "x");
        let second = sub.recv().await.unwrap();
        assert_eq!(second.entity_id, "y");
    }

    #[tokio::test]
    async fn a_lagging_subscriber_sees_an_overflow_marker_instead_of_blocking_the_publisher() {
        let bus = EventBus::with_capacity(2);
        let mut sub = bus.subscribe(vec!["task:*".to_string()]);

        // Publish well past the ring's capacity; none of these calls block
        // even though `sub` hasn't read anything yet.
        for i in 0..10 {
            bus.publish(BusEvent::new("task:created", format!("t{i}")));
        }

        let next = sub.recv().await.unwrap();
        assert_eq!(next.kind, "overflow");
    }

    #[tokio::test]
    async fn independent_subscribers_each_get_their_own_cursor() {
        let bus = EventBus::new();
        let mut a = bus.subscribe(vec!["task:*".to_string()]);
        let mut b = bus.subscribe(vec!["task:*".to_string()]);

        bus.publish(BusEvent::new("task:created", "t1"));

        assert_eq!(a.recv().await.unwrap().entity_id, "t1");
        assert_eq!(b.recv().await.unwrap().entity_id, "t1");
    }
}
