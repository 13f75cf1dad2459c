use std::sync::Mutex;

use event_emitter_rs::EventEmitter;
use tracing::warn;

use super::{DeliveryError, Message, PubSubChannel};

/// A channel that fans messages out to in-process listeners through an
/// [`EventEmitter`], using the topic as the event name.
///
/// Listeners receive the whole [`Message`]. The emitter runs each listener on
/// its own thread, so `send` returns before they finish.
pub struct EmitterChannel {
    emitter: Mutex<EventEmitter>,
}

impl EmitterChannel {
    pub fn new() -> Self {
        Self::with_emitter(EventEmitter::new())
    }

    pub fn with_emitter(emitter: EventEmitter) -> Self {
        EmitterChannel {
            emitter: Mutex::new(emitter),
        }
    }

    /// Register a listener for `topic`. Returns the listener id.
    pub fn on<F>(&self, topic: &str, callback: F) -> Result<String, DeliveryError>
    where
        F: Fn(Message) + Send + Sync + 'static,
    {
        let mut emitter = self
            .emitter
            .lock()
            .map_err(|_| DeliveryError::Unavailable("emitter poisoned".into()))?;
        Ok(emitter.on(topic, move |json: String| {
            match serde_json::from_str::<Message>(&json) {
                Ok(message) => callback(message),
                Err(err) => warn!(error = %err, "dropping undecodable emitter message"),
            }
        }))
    }

    /// Remove a listener previously returned by [`EmitterChannel::on`].
    pub fn remove_listener(&self, id: &str) -> Result<(), DeliveryError> {
        self.emitter
            .lock()
            .map_err(|_| DeliveryError::Unavailable("emitter poisoned".into()))?
            .remove_listener(id);
        Ok(())
    }
}

impl Default for EmitterChannel {
    fn default() -> Self {
        Self::new()
    }
}

impl PubSubChannel for EmitterChannel {
    fn send(&self, message: Message) -> Result<(), DeliveryError> {
        let json = serde_json::to_string(&message)?;
        let mut emitter = self
            .emitter
            .lock()
            .map_err(|_| DeliveryError::Unavailable("emitter poisoned".into()))?;
        emitter.emit(&message.topic, json);
        Ok(())
    }
}
