use std::marker::PhantomData;

use serde::Serialize;
use tracing::debug;

use crate::channel::{DeliveryError, Message, PubSubChannel};

/// Pushes committed events of type `E` to external subscribers.
///
/// Register one with [`super::ListenerRegistry::add_broadcaster`]; it then runs
/// after commit only. Failures are logged by the registry and not retried.
pub trait Broadcaster<E>: Send + Sync {
    fn on_created(&self, event: &E) -> Result<(), DeliveryError>;
}

impl<E, F> Broadcaster<E> for F
where
    F: Fn(&E) -> Result<(), DeliveryError> + Send + Sync,
{
    fn on_created(&self, event: &E) -> Result<(), DeliveryError> {
        self(event)
    }
}

/// Sends each event as JSON to a fixed topic.
pub struct TopicBroadcaster<E, C> {
    topic: String,
    event_type: String,
    channel: C,
    _event: PhantomData<fn(&E)>,
}

impl<E, C> TopicBroadcaster<E, C> {
    /// The message `event_type` defaults to the last path segment of `E`'s type name.
    pub fn new(topic: impl Into<String>, channel: C) -> Self {
        TopicBroadcaster {
            topic: topic.into(),
            event_type: short_type_name::<E>().to_string(),
            channel,
            _event: PhantomData,
        }
    }

    pub fn with_event_type(mut self, event_type: impl Into<String>) -> Self {
        self.event_type = event_type.into();
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }
}

impl<E, C> Broadcaster<E> for TopicBroadcaster<E, C>
where
    E: Serialize,
    C: PubSubChannel,
{
    fn on_created(&self, event: &E) -> Result<(), DeliveryError> {
        let message = Message::json(&self.topic, &self.event_type, event)?;
        debug!(topic = %self.topic, event_type = %self.event_type, "broadcasting event");
        self.channel.send(message)
    }
}

fn short_type_name<E>() -> &'static str {
    let full = std::any::type_name::<E>();
    let base = full.split('<').next().unwrap_or(full);
    base.rsplit("::").next().unwrap_or(base)
}
