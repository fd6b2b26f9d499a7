//! # Message Bus
//!
//! Typed fan-out topics over [`tokio::sync::broadcast`]. Each topic is a
//! [`MessageBus<T>`]; consumers hold a [`Subscription`] for as long as they want
//! deliveries and drop it (or call [`Subscription::unsubscribe`]) to leave.
//!
//! Publishing never blocks. A subscriber that falls behind loses the oldest
//! messages and is told how many it missed, which suits notifications that
//! only say "something changed, go look".

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::certificate::{CommonName, SerialNumber};

/// Default per-topic buffer size
pub const DEFAULT_TOPIC_CAPACITY: usize = 256;

/// Published after a cached certificate has been replaced with a newly issued one.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationAnnouncement {
    pub common_name: CommonName,
    pub serial_number: SerialNumber,
}

/// Change notification for a MeshRootCertificate resource.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MrcEvent {
    pub mrc_name: String,
    pub kind: MrcEventKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MrcEventKind {
    Added,
    Updated,
}

/// A single typed topic.
#[derive(Debug, Clone)]
pub struct MessageBus<T: Clone> {
    topic: &'static str,
    sender: broadcast::Sender<T>,
}

impl<T: Clone + Send + 'static> MessageBus<T> {
    pub fn new(topic: &'static str) -> Self {
        Self::with_capacity(topic, DEFAULT_TOPIC_CAPACITY)
    }

    pub fn with_capacity(topic: &'static str, capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { topic, sender }
    }

    /// Publish a message to every current subscriber; returns how many received it.
    pub fn publish(&self, message: T) -> usize {
        match self.sender.send(message) {
            Ok(receivers) => receivers,
            Err(_) => {
                debug!(topic = %self.topic, "No subscribers for published message");
                0
            }
        }
    }

    pub fn subscribe(&self) -> Subscription<T> {
        Subscription { topic: self.topic, receiver: self.sender.subscribe() }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn topic(&self) -> &'static str {
        self.topic
    }
}

/// Receiving end of a topic.
#[derive(Debug)]
pub struct Subscription<T: Clone> {
    topic: &'static str,
    receiver: broadcast::Receiver<T>,
}

impl<T: Clone> Subscription<T> {
    /// Wait for the next message. Returns `None` once the topic is closed.
    ///
    /// Lagging subscribers skip the messages they missed and keep receiving.
    pub async fn recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.recv().await {
                Ok(message) => return Some(message),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped = skipped, "Subscriber lagged behind, messages dropped");
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }

    /// Non-blocking receive; `None` when nothing is pending or the topic is closed.
    pub fn try_recv(&mut self) -> Option<T> {
        loop {
            match self.receiver.try_recv() {
                Ok(message) => return Some(message),
                Err(broadcast::error::TryRecvError::Lagged(skipped)) => {
                    warn!(topic = %self.topic, skipped = skipped, "Subscriber lagged behind, messages dropped");
                }
                Err(_) => return None,
            }
        }
    }

    /// Leave the topic.
    pub fn unsubscribe(self) {
        debug!(topic = %self.topic, "Unsubscribed");
    }
}
