use std::collections::HashMap;
use std::sync::Arc;

use crate::channel::{DeliveryError, Message, PubSubChannel, OUTBOX_ID_HEADER};
use crate::outbox::OutboxEvent;

/// Delivers one claimed outbox event.
pub trait OutboxHandler: Send + Sync {
    fn handle(&self, event: &OutboxEvent) -> Result<(), DeliveryError>;
}

impl<F> OutboxHandler for F
where
    F: Fn(&OutboxEvent) -> Result<(), DeliveryError> + Send + Sync,
{
    fn handle(&self, event: &OutboxEvent) -> Result<(), DeliveryError> {
        self(event)
    }
}

/// Handlers keyed by outbox `event_type`.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn OutboxHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder form of [`HandlerRegistry::register`].
    pub fn with<H>(mut self, event_type: impl Into<String>, handler: H) -> Self
    where
        H: OutboxHandler + 'static,
    {
        self.register(event_type, handler);
        self
    }

    /// Route `event_type` to `handler`, replacing any earlier handler.
    pub fn register<H>(&mut self, event_type: impl Into<String>, handler: H)
    where
        H: OutboxHandler + 'static,
    {
        self.handlers.insert(event_type.into(), Arc::new(handler));
    }

    pub fn get(&self, event_type: &str) -> Option<Arc<dyn OutboxHandler>> {
        self.handlers.get(event_type).cloned()
    }

    pub fn event_types(&self) -> Vec<&str> {
        let mut types: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        types.sort_unstable();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

/// Forwards outbox payloads to a topic on a pub/sub channel.
///
/// Each message carries the outbox id in the `outbox-id` header so that
/// subscribers can drop the duplicates at-least-once delivery may produce.
pub struct ChannelRelay<C> {
    topic: String,
    channel: C,
}

impl<C: PubSubChannel> ChannelRelay<C> {
    pub fn new(topic: impl Into<String>, channel: C) -> Self {
        ChannelRelay {
            topic: topic.into(),
            channel,
        }
    }
}

impl<C: PubSubChannel> OutboxHandler for ChannelRelay<C> {
    fn handle(&self, event: &OutboxEvent) -> Result<(), DeliveryError> {
        let message = Message::new(&self.topic, &event.event_type, &event.payload)
            .with_header(OUTBOX_ID_HEADER, event.id.to_string())
            .with_header("aggregate-type", &event.aggregate_type)
            .with_header("aggregate-id", event.aggregate_id.to_string());
        self.channel.send(message)
    }
}
