//! Typed, transaction-aware event listeners.
//!
//! Listeners are registered per event type and per [`TransactionPhase`].
//! Events published inside a [`crate::tx::Transaction`] are held until the
//! transaction finishes, then handed to the listeners of the matching phase on
//! the thread that finished it. Events published through an [`EventBus`]
//! outside any transaction only reach listeners registered with
//! `fallback_execution`.

mod broadcaster;
mod bus;

use std::any::{type_name, Any, TypeId};
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use tracing::{debug, error};

use crate::channel::DeliveryError;

pub use broadcaster::{Broadcaster, TopicBroadcaster};
pub use bus::{EventBus, EventPublisher};

/// Point in a transaction's life at which a listener runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransactionPhase {
    AfterCommit,
    AfterRollback,
    /// After either outcome.
    AfterCompletion,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ListenerError {
    #[error("listener failed: {0}")]
    Failed(String),
    #[error("listener panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Delivery(#[from] DeliveryError),
}

impl ListenerError {
    pub fn failed(err: impl std::fmt::Display) -> Self {
        ListenerError::Failed(err.to_string())
    }
}

/// When a listener runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerOptions {
    pub phase: TransactionPhase,
    /// Also run, immediately, for events published outside a transaction.
    pub fallback_execution: bool,
}

impl ListenerOptions {
    pub fn after_commit() -> Self {
        Self::phase(TransactionPhase::AfterCommit)
    }

    pub fn after_rollback() -> Self {
        Self::phase(TransactionPhase::AfterRollback)
    }

    pub fn after_completion() -> Self {
        Self::phase(TransactionPhase::AfterCompletion)
    }

    pub fn phase(phase: TransactionPhase) -> Self {
        ListenerOptions {
            phase,
            fallback_execution: false,
        }
    }

    pub fn with_fallback_execution(mut self) -> Self {
        self.fallback_execution = true;
        self
    }
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self::after_commit()
    }
}

/// An event value waiting for its transaction to finish.
#[derive(Clone)]
pub struct PublishedEvent {
    type_id: TypeId,
    type_name: &'static str,
    value: Arc<dyn Any + Send + Sync>,
}

impl PublishedEvent {
    pub fn new<E: Any + Send + Sync>(event: E) -> Self {
        PublishedEvent {
            type_id: TypeId::of::<E>(),
            type_name: type_name::<E>(),
            value: Arc::new(event),
        }
    }

    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    pub fn downcast_ref<E: Any>(&self) -> Option<&E> {
        self.value.downcast_ref::<E>()
    }
}

impl std::fmt::Debug for PublishedEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublishedEvent")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Counts from one round of listener invocations.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ListenerReport {
    pub invoked: usize,
    pub failed: usize,
}

impl ListenerReport {
    pub fn merge(&mut self, other: ListenerReport) {
        self.invoked += other.invoked;
        self.failed += other.failed;
    }
}

type ErasedListener = Arc<dyn Fn(&dyn Any) -> Result<(), ListenerError> + Send + Sync>;

#[derive(Clone)]
struct Registration {
    name: String,
    options: ListenerOptions,
    listener: ErasedListener,
}

/// Listener dispatch table keyed by event type.
///
/// Shared by every transaction of a [`crate::tx::TransactionManager`] and by
/// its [`EventBus`].
#[derive(Default)]
pub struct ListenerRegistry {
    listeners: RwLock<HashMap<TypeId, Vec<Registration>>>,
}

impl ListenerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener for events of type `E`.
    pub fn on<E, F>(&self, name: impl Into<String>, options: ListenerOptions, listener: F)
    where
        E: Any + Send + Sync,
        F: Fn(&E) -> Result<(), ListenerError> + Send + Sync + 'static,
    {
        let erased: ErasedListener = Arc::new(move |value: &dyn Any| match value.downcast_ref::<E>() {
            Some(event) => listener(event),
            None => Ok(()),
        });
        let registration = Registration {
            name: name.into(),
            options,
            listener: erased,
        };
        let mut listeners = self
            .listeners
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        listeners
            .entry(TypeId::of::<E>())
            .or_default()
            .push(registration);
    }

    /// Bind a broadcaster to the commit of every transaction publishing `E`.
    pub fn add_broadcaster<E, B>(&self, name: impl Into<String>, broadcaster: B)
    where
        E: Any + Send + Sync,
        B: Broadcaster<E> + 'static,
    {
        self.on::<E, _>(name, ListenerOptions::after_commit(), move |event| {
            broadcaster.on_created(event).map_err(ListenerError::from)
        });
    }

    /// Number of listeners registered for `E`.
    pub fn listener_count<E: Any>(&self) -> usize {
        self.listeners
            .read()
            .map(|listeners| listeners.get(&TypeId::of::<E>()).map_or(0, Vec::len))
            .unwrap_or_default()
    }

    /// Run every listener of `event` registered for `phase`.
    pub(crate) fn fire(&self, event: &PublishedEvent, phase: TransactionPhase) -> ListenerReport {
        self.run(event, |options| options.phase == phase, phase_name(phase))
    }

    /// Run the `fallback_execution` listeners of an event published outside a
    /// transaction.
    pub(crate) fn fire_without_transaction(&self, event: &PublishedEvent) -> ListenerReport {
        self.run(event, |options| options.fallback_execution, "no transaction")
    }

    fn run<P>(&self, event: &PublishedEvent, select: P, phase: &'static str) -> ListenerReport
    where
        P: Fn(&ListenerOptions) -> bool,
    {
        // Copy out the matching listeners so none of them runs under the lock.
        let selected: Vec<Registration> = match self.listeners.read() {
            Ok(listeners) => listeners
                .get(&event.type_id)
                .map(|registered| {
                    registered
                        .iter()
                        .filter(|registration| select(&registration.options))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default(),
            Err(_) => {
                error!(event = event.type_name, "listener registry poisoned");
                return ListenerReport::default();
            }
        };

        if selected.is_empty() {
            debug!(event = event.type_name, phase, "no listeners");
        }

        let mut report = ListenerReport::default();
        for registration in selected {
            report.invoked += 1;
            let outcome = catch_unwind(AssertUnwindSafe(|| {
                (registration.listener)(event.value.as_ref())
            }))
            .unwrap_or_else(|panic| Err(ListenerError::Panicked(panic_message(&panic))));

            if let Err(err) = outcome {
                report.failed += 1;
                error!(
                    listener = %registration.name,
                    event = event.type_name,
                    phase,
                    error = %err,
                    "event listener failed"
                );
            }
        }
        report
    }
}

fn phase_name(phase: TransactionPhase) -> &'static str {
    match phase {
        TransactionPhase::AfterCommit => "after commit",
        TransactionPhase::AfterRollback => "after rollback",
        TransactionPhase::AfterCompletion => "after completion",
    }
}

fn panic_message(panic: &Box<dyn Any + Send>) -> String {
    if let Some(message) = panic.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}
