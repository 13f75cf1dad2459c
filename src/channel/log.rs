use std::sync::{Arc, Mutex};

use tracing::info;

use super::{DeliveryError, Message, PubSubChannel};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LogChannelError {
    #[error("log channel buffer poisoned")]
    BufferPoisoned,
}

impl From<LogChannelError> for DeliveryError {
    fn from(err: LogChannelError) -> Self {
        DeliveryError::Unavailable(err.to_string())
    }
}

/// A channel that writes each message to the log, or to a buffer when given one.
#[derive(Clone, Default)]
pub struct LogChannel {
    buffer: Option<Arc<Mutex<Vec<String>>>>,
}

impl LogChannel {
    pub fn new() -> Self {
        LogChannel { buffer: None }
    }

    pub fn with_buffer(buffer: Arc<Mutex<Vec<String>>>) -> Self {
        LogChannel {
            buffer: Some(buffer),
        }
    }
}

impl PubSubChannel for LogChannel {
    fn send(&self, message: Message) -> Result<(), DeliveryError> {
        match &self.buffer {
            Some(buffer) => {
                let line = format!(
                    "[{}] {} {}",
                    message.topic, message.event_type, message.payload
                );
                buffer
                    .lock()
                    .map_err(|_| LogChannelError::BufferPoisoned)?
                    .push(line);
            }
            None => info!(
                topic = %message.topic,
                event_type = %message.event_type,
                payload = %message.payload,
                "broadcast"
            ),
        }
        Ok(())
    }
}
