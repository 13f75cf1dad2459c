//! Publish/subscribe channels.
//!
//! A channel is where broadcasters and the outbox dispatcher hand messages
//! over to external subscribers, addressed by topic string
//! (e.g. `/topic/challenge/rooms`).
//!
//! ```text
//!   TopicBroadcaster (post-commit) ──┐
//!                                    ├──> PubSubChannel::send(Message)
//!   ChannelRelay (outbox dispatch) ──┘          │
//!                           ┌───────────────────┼────────────────┐
//!                           ▼                   ▼                ▼
//!                    InMemoryChannel        LogChannel     EmitterChannel
//! ```

#[cfg(feature = "emitter")]
mod emitter;
mod in_memory;
mod log;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[cfg(feature = "emitter")]
pub use emitter::EmitterChannel;
pub use in_memory::{InMemoryChannel, Subscription};
pub use log::{LogChannel, LogChannelError};

/// Header carrying the outbox row id of a relayed message.
pub const OUTBOX_ID_HEADER: &str = "outbox-id";

/// A message addressed to a topic.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub topic: String,
    pub event_type: String,
    /// Serialized body, JSON for everything this crate sends.
    pub payload: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub headers: BTreeMap<String, String>,
}

impl Message {
    pub fn new(
        topic: impl Into<String>,
        event_type: impl Into<String>,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            topic: topic.into(),
            event_type: event_type.into(),
            payload: payload.into(),
            headers: BTreeMap::new(),
        }
    }

    /// Serialize `payload` as JSON.
    pub fn json<T: Serialize>(
        topic: impl Into<String>,
        event_type: impl Into<String>,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self::new(topic, event_type, serde_json::to_string(payload)?))
    }

    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }
}

/// Why a delivery did not happen.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DeliveryError {
    /// Worth retrying with backoff.
    #[error("delivery failed: {0}")]
    Transient(String),
    /// The downstream refused to take calls (circuit open, channel closed).
    /// Retried without consuming an attempt.
    #[error("channel unavailable: {0}")]
    Unavailable(String),
    /// Retrying cannot help.
    #[error("delivery rejected: {0}")]
    Permanent(String),
    #[error("delivery timed out after {0:?}")]
    Timeout(Duration),
}

impl DeliveryError {
    pub fn transient(err: impl std::fmt::Display) -> Self {
        DeliveryError::Transient(err.to_string())
    }

    pub fn permanent(err: impl std::fmt::Display) -> Self {
        DeliveryError::Permanent(err.to_string())
    }
}

impl From<serde_json::Error> for DeliveryError {
    fn from(err: serde_json::Error) -> Self {
        DeliveryError::Permanent(format!("serialization failed: {}", err))
    }
}

/// A publish/subscribe channel.
pub trait PubSubChannel: Send + Sync {
    fn send(&self, message: Message) -> Result<(), DeliveryError>;
}

impl<C: PubSubChannel + ?Sized> PubSubChannel for Arc<C> {
    fn send(&self, message: Message) -> Result<(), DeliveryError> {
        (**self).send(message)
    }
}

impl<C: PubSubChannel + ?Sized> PubSubChannel for &C {
    fn send(&self, message: Message) -> Result<(), DeliveryError> {
        (**self).send(message)
    }
}
