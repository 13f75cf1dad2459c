//! Outbox records.
//!
//! An [`OutboxEvent`] is written in the same transaction as the domain change
//! that produced it and later delivered by the dispatcher. Status moves
//! `PENDING -> PROCESSING -> SENT`, or back to `PENDING` for a retry, or to
//! `FAILED` once retries are exhausted.

mod event;

pub use event::{NewOutboxEvent, OutboxEvent, OutboxStatus, Release, MAX_ERROR_LEN};
