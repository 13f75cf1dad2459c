use std::sync::atomic::{AtomicUsize, Ordering};

use motionit_outbox::{DeliveryError, InMemoryChannel, Message, PubSubChannel};

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Transient,
    Unavailable,
}

/// Fails the first `failures` sends, then forwards to an in-memory channel.
pub struct FlakyChannel {
    inner: InMemoryChannel,
    failures: AtomicUsize,
    kind: Failure,
    attempts: AtomicUsize,
}

impl FlakyChannel {
    pub fn new(inner: InMemoryChannel, failures: usize, kind: Failure) -> Self {
        FlakyChannel {
            inner,
            failures: AtomicUsize::new(failures),
            kind,
            attempts: AtomicUsize::new(0),
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

impl PubSubChannel for FlakyChannel {
    fn send(&self, message: Message) -> Result<(), DeliveryError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |left| left.checked_sub(1))
            .is_ok();
        if !failing {
            return self.inner.send(message);
        }
        Err(match self.kind {
            Failure::Transient => DeliveryError::transient("broker refused the message"),
            Failure::Unavailable => DeliveryError::Unavailable("broker connection lost".into()),
        })
    }
}
