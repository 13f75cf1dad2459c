//! In-memory channel for tests and single-process deployments.

use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use super::{DeliveryError, Message, PubSubChannel};

/// Thread-safe append-only message log.
///
/// Clones share the log. Subscriptions read a single topic from their own
/// position, so several consumers can read the same messages independently.
#[derive(Clone, Default)]
pub struct InMemoryChannel {
    log: Arc<RwLock<Vec<Message>>>,
}

impl InMemoryChannel {
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribe to `topic`, starting from the first message ever sent.
    pub fn subscribe(&self, topic: impl Into<String>) -> Subscription {
        Subscription {
            log: Arc::clone(&self.log),
            topic: topic.into(),
            position: Arc::new(Mutex::new(0)),
        }
    }

    /// Every message sent so far.
    pub fn messages(&self) -> Vec<Message> {
        self.log.read().map(|log| log.clone()).unwrap_or_default()
    }

    /// Messages sent to `topic`.
    pub fn on_topic(&self, topic: &str) -> Vec<Message> {
        self.log
            .read()
            .map(|log| log.iter().filter(|m| m.topic == topic).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.log.read().map(|log| log.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        if let Ok(mut log) = self.log.write() {
            log.clear();
        }
    }
}

impl PubSubChannel for InMemoryChannel {
    fn send(&self, message: Message) -> Result<(), DeliveryError> {
        self.log
            .write()
            .map_err(|_| DeliveryError::Unavailable("in-memory channel poisoned".into()))?
            .push(message);
        Ok(())
    }
}

/// A single-topic reader over an [`InMemoryChannel`].
#[derive(Clone)]
pub struct Subscription {
    log: Arc<RwLock<Vec<Message>>>,
    topic: String,
    position: Arc<Mutex<usize>>,
}

impl Subscription {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Next message on the topic, waiting up to `timeout`.
    pub fn poll(&self, timeout: Duration) -> Option<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(message) = self.try_next() {
                return Some(message);
            }
            if Instant::now() >= deadline {
                return None;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    /// Drain every message currently waiting on the topic.
    pub fn drain(&self) -> Vec<Message> {
        std::iter::from_fn(|| self.try_next()).collect()
    }

    fn try_next(&self) -> Option<Message> {
        let log = self.log.read().ok()?;
        let mut position = self.position.lock().ok()?;
        while *position < log.len() {
            let message = &log[*position];
            *position += 1;
            if message.topic == self.topic {
                return Some(message.clone());
            }
        }
        None
    }
}
