use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};
use serde_json::Value;

use super::{OutboxStore, Record, StoreError, TransactionalStore, Write, WriteSet, OUTBOX_TABLE};
use crate::outbox::{NewOutboxEvent, OutboxEvent, OutboxStatus, Release};

#[derive(Default)]
struct State {
    outbox: BTreeMap<u64, OutboxEvent>,
    tables: HashMap<String, BTreeMap<u64, Value>>,
    sequences: HashMap<String, u64>,
}

impl State {
    fn next_id(&mut self, table: &str) -> u64 {
        let next = self.sequences.entry(table.to_string()).or_insert(0);
        *next += 1;
        *next
    }

    /// Move the sequence of `table` past an id chosen by the caller.
    fn advance_past(&mut self, table: &str, id: u64) {
        let current = self.sequences.entry(table.to_string()).or_insert(0);
        *current = (*current).max(id);
    }

    fn row_exists(&self, table: &str, id: u64) -> bool {
        self.tables
            .get(table)
            .map_or(false, |rows| rows.contains_key(&id))
    }
}

/// In-process store holding the outbox and domain tables.
///
/// Cloning creates another handle to the same storage, so request threads
/// and dispatcher threads can share one store. Every operation takes the
/// state lock once, which makes each call atomic. Id sequences live under
/// the same lock, so outbox ids become visible in ascending order.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    state: Arc<RwLock<State>>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read a committed domain record.
    pub fn find<R: Record>(&self, id: u64) -> Result<Option<R>, StoreError> {
        match self.read_row(R::TABLE, id)? {
            Some(row) => Ok(Some(serde_json::from_value(row)?)),
            None => Ok(None),
        }
    }

    /// Every committed record of `R`, ascending by id.
    pub fn all<R: Record>(&self) -> Result<Vec<R>, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned("read"))?;
        let Some(table) = state.tables.get(R::TABLE) else {
            return Ok(Vec::new());
        };
        table
            .values()
            .map(|row| serde_json::from_value(row.clone()).map_err(StoreError::from))
            .collect()
    }

    /// Snapshot of every outbox row, ascending by id.
    pub fn outbox_events(&self) -> Result<Vec<OutboxEvent>, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
        Ok(state.outbox.values().cloned().collect())
    }

    fn with_claimed<F>(
        &self,
        id: u64,
        worker_id: &str,
        operation: &'static str,
        f: F,
    ) -> Result<OutboxEvent, StoreError>
    where
        F: FnOnce(&mut OutboxEvent),
    {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned(operation))?;
        let event = state.outbox.get_mut(&id).ok_or_else(|| StoreError::NotFound {
            table: OUTBOX_TABLE.to_string(),
            id,
        })?;
        if !event.is_claimed_by(worker_id) {
            return Err(StoreError::ClaimLost {
                id,
                worker_id: worker_id.to_string(),
            });
        }
        f(event);
        Ok(event.clone())
    }
}

fn not_found(table: &str, id: u64) -> StoreError {
    StoreError::NotFound {
        table: table.to_string(),
        id,
    }
}

impl OutboxStore for InMemoryStore {
    fn insert(&self, event: NewOutboxEvent, now: DateTime<Utc>) -> Result<OutboxEvent, StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned("outbox insert"))?;
        let id = state.next_id(OUTBOX_TABLE);
        let event = OutboxEvent::from_new(id, event, now);
        state.outbox.insert(id, event.clone());
        Ok(event)
    }

    fn get(&self, id: u64) -> Result<Option<OutboxEvent>, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
        Ok(state.outbox.get(&id).cloned())
    }

    fn find_top_by_status(
        &self,
        status: OutboxStatus,
        limit: usize,
    ) -> Result<Vec<OutboxEvent>, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
        Ok(state
            .outbox
            .values()
            .filter(|event| event.status == status)
            .take(limit)
            .cloned()
            .collect())
    }

    fn find_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<OutboxEvent>, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
        Ok(state
            .outbox
            .values()
            .filter(|event| event.is_due(now))
            .take(limit)
            .cloned()
            .collect())
    }

    fn claim(
        &self,
        id: u64,
        expected_version: u64,
        worker_id: &str,
        until: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<Option<OutboxEvent>, StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned("outbox claim"))?;
        let Some(event) = state.outbox.get_mut(&id) else {
            return Ok(None);
        };
        if !event.is_pending() || event.version != expected_version {
            return Ok(None);
        }
        event.claim(worker_id, until, now);
        Ok(Some(event.clone()))
    }

    fn mark_sent(
        &self,
        id: u64,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<OutboxEvent, StoreError> {
        self.with_claimed(id, worker_id, "outbox complete", |event| event.complete(now))
    }

    fn release(
        &self,
        id: u64,
        worker_id: &str,
        release: &Release,
        now: DateTime<Utc>,
    ) -> Result<OutboxEvent, StoreError> {
        self.with_claimed(id, worker_id, "outbox release", |event| {
            event.release(release, now)
        })
    }

    fn mark_failed(
        &self,
        id: u64,
        worker_id: &str,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<OutboxEvent, StoreError> {
        self.with_claimed(id, worker_id, "outbox fail", |event| event.fail(error, now))
    }

    fn release_expired_claims(&self, now: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned("outbox recover"))?;
        let mut released = 0;
        for event in state.outbox.values_mut() {
            if event.claim_expired(now) {
                event.release(
                    &Release {
                        error: "claim lease expired".to_string(),
                        next_attempt_at: None,
                        refund_attempt: false,
                    },
                    now,
                );
                released += 1;
            }
        }
        Ok(released)
    }

    fn requeue_failed(&self, id: u64, now: DateTime<Utc>) -> Result<OutboxEvent, StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned("outbox requeue"))?;
        let event = state
            .outbox
            .get_mut(&id)
            .ok_or_else(|| not_found(OUTBOX_TABLE, id))?;
        if !event.is_failed() {
            return Err(StoreError::InvalidStatus {
                id,
                expected: OutboxStatus::Failed,
                actual: event.status,
            });
        }
        event.requeue(now);
        Ok(event.clone())
    }

    fn count_by_status(&self, status: OutboxStatus) -> Result<usize, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned("outbox read"))?;
        Ok(state
            .outbox
            .values()
            .filter(|event| event.status == status)
            .count())
    }

    fn purge_sent_before(&self, cutoff: DateTime<Utc>) -> Result<usize, StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned("outbox purge"))?;
        let before = state.outbox.len();
        state.outbox.retain(|_, event| {
            !(event.is_sent() && event.audit.modified_at.map_or(false, |at| at < cutoff))
        });
        Ok(before - state.outbox.len())
    }
}

impl TransactionalStore for InMemoryStore {
    fn next_id(&self, table: &'static str) -> Result<u64, StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned("sequence"))?;
        Ok(state.next_id(table))
    }

    fn reserve_id(&self, table: &'static str, id: u64) -> Result<(), StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned("sequence"))?;
        state.advance_past(table, id);
        Ok(())
    }

    fn read_row(&self, table: &str, id: u64) -> Result<Option<Value>, StoreError> {
        let state = self
            .state
            .read()
            .map_err(|_| StoreError::LockPoisoned("read"))?;
        Ok(state
            .tables
            .get(table)
            .and_then(|rows| rows.get(&id))
            .cloned())
    }

    fn apply(&self, writes: WriteSet, now: DateTime<Utc>) -> Result<Vec<OutboxEvent>, StoreError> {
        let mut state = self
            .state
            .write()
            .map_err(|_| StoreError::LockPoisoned("commit"))?;

        // Validate the whole set first so a bad write cannot leave half of it applied.
        let mut created: HashSet<(&str, u64)> = HashSet::new();
        let mut deleted: HashSet<(&str, u64)> = HashSet::new();
        for write in writes.iter() {
            match write {
                Write::Insert { table, id, .. } => {
                    let key = (*table, *id);
                    let live = (state.row_exists(table, *id) && !deleted.contains(&key))
                        || created.contains(&key);
                    if live {
                        return Err(StoreError::Duplicate {
                            table: table.to_string(),
                            id: *id,
                        });
                    }
                    created.insert(key);
                    deleted.remove(&key);
                }
                Write::Update { table, id, .. } | Write::Delete { table, id } => {
                    let committed = state.row_exists(table, *id);
                    let exists = (committed || created.contains(&(*table, *id)))
                        && !deleted.contains(&(*table, *id));
                    if !exists {
                        return Err(not_found(table, *id));
                    }
                    if matches!(write, Write::Delete { .. }) {
                        created.remove(&(*table, *id));
                        deleted.insert((*table, *id));
                    }
                }
                Write::Outbox(_) => {}
            }
        }

        let mut inserted = Vec::new();
        for write in writes.into_writes() {
            match write {
                Write::Insert { table, id, row } => {
                    state.advance_past(table, id);
                    state
                        .tables
                        .entry(table.to_string())
                        .or_default()
                        .insert(id, row);
                }
                Write::Update { table, id, row } => {
                    state
                        .tables
                        .entry(table.to_string())
                        .or_default()
                        .insert(id, row);
                }
                Write::Delete { table, id } => {
                    if let Some(rows) = state.tables.get_mut(table) {
                        rows.remove(&id);
                    }
                }
                Write::Outbox(new) => {
                    let id = state.next_id(OUTBOX_TABLE);
                    let event = OutboxEvent::from_new(id, new, now);
                    state.outbox.insert(id, event.clone());
                    inserted.push(event);
                }
            }
        }

        Ok(inserted)
    }
}
