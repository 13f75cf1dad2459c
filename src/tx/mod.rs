//! Transaction boundary.
//!
//! A [`Transaction`] buffers domain writes, outbox rows and published events.
//! `commit` hands the write set to the store in one atomic `apply`, then runs
//! the after-commit listeners on the calling thread. Anything else (an
//! explicit `rollback`, an `Err` from [`TransactionManager::in_transaction`], a
//! failed apply, or dropping the transaction) discards the writes and runs the
//! after-rollback listeners instead.

use std::any::Any;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use crate::clock::{Clock, SystemClock};
use crate::listener::{
    EventBus, EventPublisher, ListenerRegistry, ListenerReport, PublishedEvent, TransactionPhase,
};
use crate::outbox::{NewOutboxEvent, OutboxEvent};
use crate::store::{Record, StoreError, TransactionalStore, Write, WriteSet};

/// Opens transactions against a store and shares one listener registry
/// between them.
pub struct TransactionManager<S> {
    store: S,
    registry: Arc<ListenerRegistry>,
    clock: Arc<dyn Clock>,
}

impl<S: TransactionalStore> TransactionManager<S> {
    pub fn new(store: S, registry: Arc<ListenerRegistry>) -> Self {
        TransactionManager {
            store,
            registry,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn registry(&self) -> &Arc<ListenerRegistry> {
        &self.registry
    }

    /// Publisher for events raised outside a transaction.
    pub fn event_bus(&self) -> EventBus {
        EventBus::new(self.registry.clone())
    }

    pub fn begin(&self) -> Transaction<'_, S> {
        Transaction {
            store: &self.store,
            registry: &self.registry,
            clock: self.clock.as_ref(),
            writes: WriteSet::new(),
            events: Vec::new(),
            finished: false,
        }
    }

    /// Run `work` in a transaction: commit on `Ok`, roll back on `Err`.
    pub fn in_transaction<T, E, F>(&self, work: F) -> Result<T, E>
    where
        F: FnOnce(&mut Transaction<'_, S>) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut tx = self.begin();
        match work(&mut tx) {
            Ok(value) => {
                tx.commit()?;
                Ok(value)
            }
            Err(err) => {
                tx.rollback();
                Err(err)
            }
        }
    }
}

/// What a successful commit produced.
#[derive(Debug, Clone, Default)]
pub struct CommitReceipt {
    /// Outbox rows written by the commit, with their assigned ids.
    pub outbox: Vec<OutboxEvent>,
    pub listeners: ListenerReport,
}

pub struct Transaction<'a, S> {
    store: &'a S,
    registry: &'a ListenerRegistry,
    clock: &'a dyn Clock,
    writes: WriteSet,
    events: Vec<PublishedEvent>,
    finished: bool,
}

impl<'a, S: TransactionalStore> Transaction<'a, S> {
    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    /// Stage a new record. An id is taken from the table's sequence unless
    /// the record already has one, in which case that id must be free.
    pub fn insert<R: Record>(&mut self, mut record: R) -> Result<R, StoreError> {
        let id = match record.id() {
            Some(id) => {
                if self.row(R::TABLE, id)?.is_some() {
                    return Err(StoreError::Duplicate {
                        table: R::TABLE.to_string(),
                        id,
                    });
                }
                self.store.reserve_id(R::TABLE, id)?;
                id
            }
            None => self.store.next_id(R::TABLE)?,
        };
        record.set_id(id);
        record.audit_mut().stamp_created(self.now());
        let row = serde_json::to_value(&record)?;
        self.writes.push(Write::Insert {
            table: R::TABLE,
            id,
            row,
        });
        Ok(record)
    }

    /// Stage a change to an existing record.
    pub fn update<R: Record>(&mut self, mut record: R) -> Result<R, StoreError> {
        let id = record.id().ok_or(StoreError::MissingId(R::TABLE))?;
        if self.row(R::TABLE, id)?.is_none() {
            return Err(StoreError::NotFound {
                table: R::TABLE.to_string(),
                id,
            });
        }
        record.audit_mut().stamp_modified(self.now());
        let row = serde_json::to_value(&record)?;
        self.writes.push(Write::Update {
            table: R::TABLE,
            id,
            row,
        });
        Ok(record)
    }

    pub fn delete<R: Record>(&mut self, id: u64) -> Result<(), StoreError> {
        if self.row(R::TABLE, id)?.is_none() {
            return Err(StoreError::NotFound {
                table: R::TABLE.to_string(),
                id,
            });
        }
        self.writes.push(Write::Delete { table: R::TABLE, id });
        Ok(())
    }

    /// Read a record, seeing this transaction's own writes first.
    pub fn get<R: Record>(&self, id: u64) -> Result<Option<R>, StoreError> {
        match self.row(R::TABLE, id)? {
            Some(row) => Ok(Some(serde_json::from_value(row)?)),
            None => Ok(None),
        }
    }

    /// Stage an outbox row, written atomically with the rest of the transaction.
    pub fn enqueue(&mut self, event: NewOutboxEvent) {
        self.writes.push(Write::Outbox(event));
    }

    pub fn pending_writes(&self) -> usize {
        self.writes.len()
    }

    pub fn commit(mut self) -> Result<CommitReceipt, StoreError> {
        let writes = std::mem::take(&mut self.writes);
        let events = std::mem::take(&mut self.events);
        self.finished = true;

        let outbox = match self.store.apply(writes, self.now()) {
            Ok(outbox) => outbox,
            Err(err) => {
                warn!(error = %err, "commit failed, rolling back");
                run_phase(self.registry, &events, TransactionPhase::AfterRollback);
                run_phase(self.registry, &events, TransactionPhase::AfterCompletion);
                return Err(err);
            }
        };

        let mut listeners = run_phase(self.registry, &events, TransactionPhase::AfterCommit);
        listeners.merge(run_phase(
            self.registry,
            &events,
            TransactionPhase::AfterCompletion,
        ));
        debug!(
            outbox = outbox.len(),
            events = events.len(),
            listeners = listeners.invoked,
            "transaction committed"
        );
        Ok(CommitReceipt { outbox, listeners })
    }

    pub fn rollback(mut self) -> ListenerReport {
        self.discard()
    }

    fn discard(&mut self) -> ListenerReport {
        self.finished = true;
        self.writes = WriteSet::new();
        let events = std::mem::take(&mut self.events);
        let mut report = run_phase(self.registry, &events, TransactionPhase::AfterRollback);
        report.merge(run_phase(
            self.registry,
            &events,
            TransactionPhase::AfterCompletion,
        ));
        debug!(events = events.len(), "transaction rolled back");
        report
    }

    fn row(&self, table: &'static str, id: u64) -> Result<Option<serde_json::Value>, StoreError> {
        match self.writes.row(table, id) {
            Some(buffered) => Ok(buffered.cloned()),
            None => self.store.read_row(table, id),
        }
    }
}

impl<'a, S: TransactionalStore> EventPublisher for Transaction<'a, S> {
    fn publish<E: Any + Send + Sync>(&mut self, event: E) {
        self.events.push(PublishedEvent::new(event));
    }
}

impl<'a, S> Drop for Transaction<'a, S> {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        debug!(
            writes = self.writes.len(),
            events = self.events.len(),
            "transaction dropped without commit"
        );
        let events = std::mem::take(&mut self.events);
        run_phase(self.registry, &events, TransactionPhase::AfterRollback);
        run_phase(self.registry, &events, TransactionPhase::AfterCompletion);
    }
}

fn run_phase(
    registry: &ListenerRegistry,
    events: &[PublishedEvent],
    phase: TransactionPhase,
) -> ListenerReport {
    let mut report = ListenerReport::default();
    for event in events {
        report.merge(registry.fire(event, phase));
    }
    report
}
