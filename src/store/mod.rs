//! Event record store.
//!
//! [`OutboxStore`] is the contract the dispatcher works against: ordered
//! reads of pending rows plus guarded status transitions. Every transition is
//! a single atomic operation, so a crash between two of them can at worst
//! leave a row `PROCESSING` until its claim lease runs out.
//!
//! [`TransactionalStore`] adds what a [`crate::tx::Transaction`] needs to
//! apply a buffered write set (domain rows and new outbox rows) all at once.

mod in_memory;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::audit::Audited;
use crate::outbox::{NewOutboxEvent, OutboxEvent, OutboxStatus, Release};

pub use in_memory::InMemoryStore;

/// Largest batch a single poll may load.
pub const MAX_POLL_BATCH: usize = 100;

/// Table name of the outbox.
pub const OUTBOX_TABLE: &str = "outbox_event";

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("store lock poisoned during {0}")]
    LockPoisoned(&'static str),
    #[error("{table} row {id} not found")]
    NotFound { table: String, id: u64 },
    #[error("{table} row {id} already exists")]
    Duplicate { table: String, id: u64 },
    #[error("{0} record has no id")]
    MissingId(&'static str),
    #[error("outbox event {id} is not claimed by {worker_id}")]
    ClaimLost { id: u64, worker_id: String },
    #[error("outbox event {id} is {actual}, expected {expected}")]
    InvalidStatus {
        id: u64,
        expected: OutboxStatus,
        actual: OutboxStatus,
    },
    #[error("record serialization failed: {0}")]
    Serialization(String),
    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        StoreError::Serialization(err.to_string())
    }
}

/// A persisted domain record with an embedded audit value.
pub trait Record: Serialize + DeserializeOwned + Audited {
    const TABLE: &'static str;

    fn id(&self) -> Option<u64>;
    fn set_id(&mut self, id: u64);
}

/// A single buffered write.
#[derive(Debug, Clone, PartialEq)]
pub enum Write {
    Insert {
        table: &'static str,
        id: u64,
        row: Value,
    },
    Update {
        table: &'static str,
        id: u64,
        row: Value,
    },
    Delete {
        table: &'static str,
        id: u64,
    },
    Outbox(NewOutboxEvent),
}

/// Ordered writes applied together or not at all.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct WriteSet {
    writes: Vec<Write>,
}

impl WriteSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, write: Write) {
        self.writes.push(write);
    }

    pub fn is_empty(&self) -> bool {
        self.writes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.writes.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Write> {
        self.writes.iter()
    }

    /// Latest buffered state of a row: `Some(Some(row))` if written,
    /// `Some(None)` if deleted, `None` if untouched.
    pub fn row(&self, table: &str, id: u64) -> Option<Option<&Value>> {
        self.writes.iter().rev().find_map(|write| match write {
            Write::Insert { table: t, id: i, row } | Write::Update { table: t, id: i, row }
                if *t == table && *i == id =>
            {
                Some(Some(row))
            }
            Write::Delete { table: t, id: i } if *t == table && *i == id => Some(None),
            _ => None,
        })
    }

    pub fn outbox_count(&self) -> usize {
        self.writes
            .iter()
            .filter(|write| matches!(write, Write::Outbox(_)))
            .count()
    }

    pub fn into_writes(self) -> Vec<Write> {
        self.writes
    }
}

/// Storage for outbox rows.
pub trait OutboxStore: Send + Sync {
    /// Insert a new `PENDING` event outside of any transaction.
    fn insert(&self, event: NewOutboxEvent, now: DateTime<Utc>) -> Result<OutboxEvent, StoreError>;

    fn get(&self, id: u64) -> Result<Option<OutboxEvent>, StoreError>;

    /// Up to `limit` events in `status`, ascending by id.
    fn find_top_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Up to `limit` pending events whose backoff gate has passed, ascending by id.
    fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEvent>, StoreError>;

    /// Compare-and-swap `PENDING` -> `PROCESSING`.
    ///
    /// Succeeds only if the row is still pending at `expected_version`.
    /// `Ok(None)` means somebody else got there first.
    fn claim(
        &self,
        id: u64,
        expected_version: u64,
        worker_id: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxEvent>, StoreError>;

    fn mark_sent(&self, id: u64, worker_id: &str, now: DateTime<Utc>)
        -> Result<OutboxEvent, StoreError>;

    fn release(
        &self,
        id: u64,
        worker_id: &str,
        release: &Release,
        now: DateTime<Utc>,
    ) -> Result<OutboxEvent, StoreError>;

    fn mark_failed(
        &self,
        id: u64,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<OutboxEvent, StoreError>;

    /// Return `PROCESSING` rows whose lease ran out to `PENDING`.
    fn release_expired_claims(&self, now: DateTime<Utc>) -> Result<usize, StoreError>;

    /// Move a dead-lettered event back to `PENDING` with a fresh attempt budget.
    fn requeue_failed(&self, id: u64, now: DateTime<Utc>) -> Result<OutboxEvent, StoreError>;

    fn count_by_status(&self, status: OutboxStatus) -> Result<usize, StoreError>;

    /// Hard-delete `SENT` rows last modified before `cutoff`.
    fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError>;
}

/// Storage able to apply a transaction's write set atomically.
pub trait TransactionalStore: OutboxStore {
    /// Allocate the next id of `table`. Ids are never reused, even when the
    /// transaction that took one rolls back.
    fn next_id(&self, table: &'static str) -> Result<u64, StoreError>;

    /// Keep the sequence of `table` from ever handing out `id`, which the
    /// caller chose itself.
    fn reserve_id(&self, table: &'static str, id: u64) -> Result<(), StoreError>;

    fn read_row(&self, table: &str, id: u64) -> Result<Option<Value>, StoreError>;

    /// Apply every write or none. Returns the outbox rows created.
    fn apply(&self, writes: WriteSet, now: DateTime<Utc>) -> Result<Vec<OutboxEvent>, StoreError>;
}
