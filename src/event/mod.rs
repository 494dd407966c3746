//! Event system for data and link broadcasts.
//!
//! Notifications, read results, write results and link transitions are
//! published on one broadcast channel. Subscribers pick what they want with an
//! [`EventFilter`]. Delivery is best-effort: a slow subscriber loses the oldest
//! events rather than blocking the publisher.

use std::sync::Arc;

use bytes::Bytes;
use futures::Stream;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::error::Result;
use crate::types::{CharacteristicTarget, DeviceAddress, LinkEvent};

/// Default broadcast capacity.
pub const DEFAULT_CAPACITY: usize = 32;

/// An unsolicited characteristic value change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub address: DeviceAddress,
    pub service: Uuid,
    pub characteristic: Uuid,
    pub value: Bytes,
}

/// Outcome of a completed read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadOutcome {
    pub target: CharacteristicTarget,
    pub result: Result<Bytes>,
}

/// Outcome of a completed write. `Ok` carries the number of bytes written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteOutcome {
    pub target: CharacteristicTarget,
    pub result: Result<usize>,
}

/// Event types that can be dispatched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Characteristic changed.
    Notification(Notification),
    /// Read finished.
    Read(ReadOutcome),
    /// Write finished.
    Write(WriteOutcome),
    /// A link changed state.
    Link(LinkEvent),
}

/// Payload-free discriminant of an [`Event`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Notification,
    Read,
    Write,
    Link,
}

impl Event {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Notification(_) => EventKind::Notification,
            Self::Read(_) => EventKind::Read,
            Self::Write(_) => EventKind::Write,
            Self::Link(_) => EventKind::Link,
        }
    }

    /// Returns the device the event concerns.
    #[must_use]
    pub const fn address(&self) -> DeviceAddress {
        match self {
            Self::Notification(n) => n.address,
            Self::Read(r) => r.target.address,
            Self::Write(w) => w.target.address,
            Self::Link(l) => l.address,
        }
    }

    /// Returns the characteristic the event concerns, if any.
    #[must_use]
    pub const fn characteristic(&self) -> Option<Uuid> {
        match self {
            Self::Notification(n) => Some(n.characteristic),
            Self::Read(r) => Some(r.target.characteristic),
            Self::Write(w) => Some(w.target.characteristic),
            Self::Link(_) => None,
        }
    }
}

/// Subscription filter for specific events.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Filter by event kinds.
    pub kinds: Option<Vec<EventKind>>,
    /// Filter by device.
    pub address: Option<DeviceAddress>,
    /// Filter by characteristic.
    pub characteristic: Option<Uuid>,
}

impl EventFilter {
    /// Creates a filter for specific event kinds.
    #[must_use]
    pub const fn kinds(kinds: Vec<EventKind>) -> Self {
        Self {
            kinds: Some(kinds),
            address: None,
            characteristic: None,
        }
    }

    /// Creates a filter for one event kind.
    #[must_use]
    pub fn kind(kind: EventKind) -> Self {
        Self::kinds(vec![kind])
    }

    /// Narrows the filter to one device.
    #[must_use]
    pub const fn address(mut self, address: DeviceAddress) -> Self {
        self.address = Some(address);
        self
    }

    /// Narrows the filter to one characteristic.
    #[must_use]
    pub const fn characteristic(mut self, characteristic: Uuid) -> Self {
        self.characteristic = Some(characteristic);
        self
    }

    /// Checks if an event matches this filter.
    #[must_use]
    pub fn matches(&self, event: &Event) -> bool {
        if let Some(ref kinds) = self.kinds {
            if !kinds.contains(&event.kind()) {
                return false;
            }
        }

        if let Some(address) = self.address {
            if event.address() != address {
                return false;
            }
        }

        if let Some(characteristic) = self.characteristic {
            if event.characteristic() != Some(characteristic) {
                return false;
            }
        }

        true
    }
}

/// A subscription to events.
pub struct Subscription {
    receiver: broadcast::Receiver<Event>,
    filter: EventFilter,
}

impl Subscription {
    /// Receives the next matching event.
    ///
    /// Returns `None` once the dispatcher is gone.
    pub async fn recv(&mut self) -> Option<Event> {
        loop {
            match self.receiver.recv().await {
                Ok(event) if self.filter.matches(&event) => return Some(event),
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::trace!("subscriber lagged, {} events dropped", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Converts the subscription into a stream of matching events.
    pub fn into_stream(self) -> impl Stream<Item = Event> + Send + Unpin {
        Box::pin(futures::stream::unfold(self, |mut sub| async move {
            sub.recv().await.map(|event| (event, sub))
        }))
    }
}

struct EventDispatcherInner {
    sender: broadcast::Sender<Event>,
}

/// Dispatches events to subscribers.
#[derive(Clone)]
pub struct EventDispatcher {
    inner: Arc<EventDispatcherInner>,
}

impl EventDispatcher {
    /// Creates a new event dispatcher.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            inner: Arc::new(EventDispatcherInner { sender }),
        }
    }

    /// Dispatches an event to all subscribers.
    pub fn dispatch(&self, event: Event) {
        // No receivers is fine
        let _ = self.inner.sender.send(event);
    }

    /// Subscribes to events with an optional filter.
    #[must_use]
    pub fn subscribe(&self, filter: Option<EventFilter>) -> Subscription {
        Subscription {
            receiver: self.inner.sender.subscribe(),
            filter: filter.unwrap_or_default(),
        }
    }

    /// Waits for an event matching the filter with timeout.
    ///
    /// Returns `None` if the timeout expires or the channel is closed.
    pub async fn wait_for(
        &self,
        filter: EventFilter,
        timeout: std::time::Duration,
    ) -> Option<Event> {
        let mut subscription = self.subscribe(Some(filter));

        tokio::select! {
            biased;
            result = subscription.recv() => result,
            () = tokio::time::sleep(timeout) => None,
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
