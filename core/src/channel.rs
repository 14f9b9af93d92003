//! Best-effort propagation transports.
//!
//! Neither transport is reliable on its own. A [`BroadcastBus`] delivers a
//! message at most once to whoever is subscribed at send time; a
//! [`TabSignal`] only reaches other tabs on the same device. The periodic
//! poll against the authoritative store is what bounds staleness.

use crate::counter::CounterValue;
use crate::store::{BoxFuture, NotificationStream};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Event name carried by every broadcast message.
pub const COUNT_UPDATED_EVENT: &str = "count-updated";

/// Errors from a propagation transport. Logged, never shown to the user.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PropagationError {
    /// Failed to publish to a topic
    #[error("Publish failed for topic '{topic}': {reason}")]
    PublishFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to subscribe to a topic
    #[error("Subscription failed for topic '{topic}': {reason}")]
    SubscriptionFailed {
        /// The topic that failed
        topic: String,
        /// The reason for failure
        reason: String,
    },

    /// Payload could not be encoded or decoded
    #[error("Encoding error: {0}")]
    Encoding(String),

    /// The transport is closed
    #[error("Channel closed")]
    Closed,
}

/// Broadcast message announcing a new counter value.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountUpdated {
    /// Always [`COUNT_UPDATED_EVENT`]
    pub event: String,
    /// The announced value
    pub value: CounterValue,
}

impl CountUpdated {
    /// Build the message for a value
    #[must_use]
    pub fn new(value: CounterValue) -> Self {
        Self {
            event: COUNT_UPDATED_EVENT.to_string(),
            value,
        }
    }

    /// Encode as JSON bytes.
    ///
    /// # Errors
    ///
    /// Returns [`PropagationError::Encoding`] if serialization fails.
    pub fn encode(&self) -> Result<Vec<u8>, PropagationError> {
        serde_json::to_vec(self).map_err(|e| PropagationError::Encoding(e.to_string()))
    }

    /// Decode JSON bytes, ignoring messages for other events.
    ///
    /// # Errors
    ///
    /// Returns [`PropagationError::Encoding`] for malformed payloads or
    /// out-of-range values.
    pub fn decode(bytes: &[u8]) -> Result<Option<Self>, PropagationError> {
        let message: Self =
            serde_json::from_slice(bytes).map_err(|e| PropagationError::Encoding(e.to_string()))?;
        if message.event == COUNT_UPDATED_EVENT {
            Ok(Some(message))
        } else {
            Ok(None)
        }
    }
}

/// Low-latency publish/subscribe transport.
///
/// At-most-once, no persistence, no ordering guarantee relative to the
/// store's change feed.
pub trait BroadcastBus: Send + Sync {
    /// Publish a payload to a topic.
    ///
    /// # Errors
    ///
    /// Returns [`PropagationError::PublishFailed`] if the send fails.
    fn publish(&self, topic: &str, payload: Vec<u8>) -> BoxFuture<'_, Result<(), PropagationError>>;

    /// Subscribe to a topic. Only messages sent after subscribing are seen.
    ///
    /// # Errors
    ///
    /// Returns [`PropagationError::SubscriptionFailed`] if the subscription fails.
    fn subscribe(
        &self,
        topic: &str,
    ) -> BoxFuture<'_, Result<NotificationStream<Vec<u8>>, PropagationError>>;
}

/// Shared key/value slot visible to every tab on one device.
///
/// Writing a key notifies the *other* tabs watching it, never the writer.
pub trait TabSignal: Send + Sync {
    /// Write a value under a key.
    ///
    /// # Errors
    ///
    /// Returns [`PropagationError`] if the device storage rejects the write.
    fn write(&self, key: &str, value: &str) -> Result<(), PropagationError>;

    /// Values written under `key` by other tabs, as they happen.
    fn watch(&self, key: &str) -> NotificationStream<String>;
}

/// Parse a value written to the tab key, ignoring anything that is not a
/// ticket number in range.
#[must_use]
pub fn parse_tab_value(raw: &str) -> Option<CounterValue> {
    raw.trim()
        .parse::<i64>()
        .ok()
        .and_then(|n| CounterValue::from_i64(n).ok())
}
