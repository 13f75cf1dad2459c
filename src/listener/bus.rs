use std::any::Any;
use std::sync::Arc;

use tracing::debug;

use super::{ListenerRegistry, PublishedEvent};

/// Something domain code can publish events into.
///
/// Publishing never blocks on subscribers. A [`crate::tx::Transaction`] holds
/// the event until it finishes; an [`EventBus`] runs the fallback listeners
/// straight away.
pub trait EventPublisher {
    fn publish<E: Any + Send + Sync>(&mut self, event: E);
}

/// Publishes events that happen outside any transaction.
#[derive(Clone, Default)]
pub struct EventBus {
    registry: Arc<ListenerRegistry>,
}

impl EventBus {
    pub fn new(registry: Arc<ListenerRegistry>) -> Self {
        EventBus { registry }
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }
}

impl EventPublisher for EventBus {
    fn publish<E: Any + Send + Sync>(&mut self, event: E) {
        let event = PublishedEvent::new(event);
        let report = self.registry.fire_without_transaction(&event);
        debug!(
            event = event.type_name(),
            invoked = report.invoked,
            "published outside transaction"
        );
    }
}
