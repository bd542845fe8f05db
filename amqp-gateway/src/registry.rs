//! Message correlation registry
//!
//! Maps message ids to the most recently received raw broker message and
//! the consumer tag it arrived under. Acknowledgement looks entries up
//! here, so it can outlive a channel reconnect: a caller holding a stale
//! id waits until the broker redelivers the message on the new channel
//! (new tag) and then acks a delivery the broker still recognizes.

use bytes::Bytes;
use dashmap::DashMap;
use lapin::message::Delivery;
use lapin::BasicProperties;
use std::sync::Arc;
use tokio::sync::Notify;

use crate::error::{Error, Result};

/// An inbound broker message, still encrypted, as received.
#[derive(Debug, Clone)]
pub struct RawMessage {
    /// Broker delivery tag, valid only on the delivering channel
    pub delivery_tag: u64,
    /// Tag of the consumer that received this delivery
    pub consumer_tag: String,
    /// Source exchange
    pub exchange: String,
    /// Routing key the message arrived under
    pub routing_key: String,
    /// Whether the broker redelivered this message
    pub redelivered: bool,
    /// AMQP properties (headers, content type, reply_to)
    pub properties: BasicProperties,
    /// Encrypted content
    pub content: Bytes,
}

impl RawMessage {
    /// Capture a lapin delivery together with its owning consumer tag
    pub fn from_delivery(delivery: Delivery, consumer_tag: String) -> Self {
        Self {
            delivery_tag: delivery.delivery_tag,
            consumer_tag,
            exchange: delivery.exchange.as_str().to_string(),
            routing_key: delivery.routing_key.as_str().to_string(),
            redelivered: delivery.redelivered,
            properties: delivery.properties,
            content: Bytes::from(delivery.data),
        }
    }
}

/// Process-wide registry of in-flight messages, keyed by message id
#[derive(Default)]
pub struct MessageRegistry {
    entries: DashMap<String, Arc<RawMessage>>,
    update: Notify,
}

impl MessageRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the most recent raw message for an id and wake waiters
    pub fn record(&self, message_id: impl Into<String>, message: Arc<RawMessage>) {
        self.entries.insert(message_id.into(), message);
        self.update.notify_waiters();
    }

    /// Current entry for an id, if any
    pub fn get(&self, message_id: &str) -> Option<Arc<RawMessage>> {
        self.entries.get(message_id).map(|e| e.value().clone())
    }

    /// Remove an entry; called exactly once, at ack/reject
    pub fn remove(&self, message_id: &str) -> Option<Arc<RawMessage>> {
        self.entries.remove(message_id).map(|(_, v)| v)
    }

    /// Number of in-flight entries
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no messages are in flight
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wait until the entry for `message_id` satisfies `predicate`.
    ///
    /// Fails immediately with `MessageNotFound` when no entry exists —
    /// at call time or after a concurrent removal — instead of hanging.
    pub async fn wait_for<F>(&self, message_id: &str, predicate: F) -> Result<Arc<RawMessage>>
    where
        F: Fn(&RawMessage) -> bool,
    {
        loop {
            // arm the wakeup before checking, so an update between the
            // check and the await is not lost
            let notified = self.update.notified();

            match self.get(message_id) {
                None => return Err(Error::MessageNotFound(message_id.to_string())),
                Some(entry) if predicate(&entry) => return Ok(entry),
                Some(_) => notified.await,
            }
        }
    }
}
