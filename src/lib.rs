//! Transactional outbox and post-commit event broadcasting for the motionit
//! challenge backend.
//!
//! - [`tx`]: a transaction writes domain records and outbox rows atomically
//!   and runs after-commit listeners once it commits.
//! - [`listener`]: typed listener registry, [`Broadcaster`]s and the
//!   [`EventPublisher`] seam.
//! - [`dispatch`]: the scheduled [`OutboxDispatcher`] with CAS claims,
//!   retries and dead-lettering.
//! - [`business`]: [`BusinessError`] codes and the response envelope.

pub mod audit;
pub mod business;
pub mod challenge;
pub mod channel;
pub mod clock;
pub mod config;
pub mod dispatch;
mod error;
pub mod listener;
pub mod outbox;
pub mod store;
pub mod telemetry;
pub mod tx;

pub use audit::{Audit, Audited};
pub use business::{translate, BusinessError, ErrorCode, ResponseData};
#[cfg(feature = "emitter")]
pub use channel::EmitterChannel;
pub use channel::{DeliveryError, InMemoryChannel, LogChannel, Message, PubSubChannel};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{ConfigError, ConfigLoader, OutboxConfig};
pub use dispatch::{
    ChannelRelay, DispatchOutcome, DispatchReport, DispatcherStats, DispatcherThread,
    HandlerRegistry, OutboxDispatcher, OutboxHandler, RetryPolicy,
};
pub use error::{Error, Result};
pub use listener::{
    Broadcaster, EventBus, EventPublisher, ListenerError, ListenerOptions, ListenerRegistry,
    TopicBroadcaster, TransactionPhase,
};
pub use outbox::{NewOutboxEvent, OutboxEvent, OutboxStatus};
pub use store::{InMemoryStore, OutboxStore, Record, StoreError, TransactionalStore};
pub use tx::{CommitReceipt, Transaction, TransactionManager};

// Re-export the EventEmitter listeners register with.
#[cfg(feature = "emitter")]
pub use event_emitter_rs::EventEmitter;
