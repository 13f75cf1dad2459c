use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::audit::{Audit, Audited};

/// Longest error text kept on a record.
pub const MAX_ERROR_LEN: usize = 490;

/// Delivery status of an outbox event.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OutboxStatus {
    #[default]
    Pending,
    Processing,
    Sent,
    /// Dead letter: retries exhausted or the event can never be delivered.
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            OutboxStatus::Pending => "PENDING",
            OutboxStatus::Processing => "PROCESSING",
            OutboxStatus::Sent => "SENT",
            OutboxStatus::Failed => "FAILED",
        }
    }
}

impl std::fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A row of the `outbox_event` table.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: u64,
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: u64,
    pub payload: String,
    pub status: OutboxStatus,
    pub attempt_count: u32,
    pub last_tried_at: Option<DateTime<Utc>>,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub claimed_by: Option<String>,
    pub claimed_until: Option<DateTime<Utc>>,
    pub version: u64,
    #[serde(flatten)]
    pub audit: Audit,
}

impl OutboxEvent {
    pub(crate) fn from_new(id: u64, new: NewOutboxEvent, now: DateTime<Utc>) -> Self {
        let mut audit = Audit::default();
        audit.stamp_created(now);
        Self {
            id,
            event_type: new.event_type,
            aggregate_type: new.aggregate_type,
            aggregate_id: new.aggregate_id,
            payload: new.payload,
            status: OutboxStatus::Pending,
            attempt_count: new.attempt_count,
            last_tried_at: None,
            next_attempt_at: None,
            last_error: None,
            claimed_by: None,
            claimed_until: None,
            version: 0,
            audit,
        }
    }

    /// Decode the JSON payload.
    pub fn decode<T: serde::de::DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_str(&self.payload)
    }

    pub fn is_pending(&self) -> bool {
        self.status == OutboxStatus::Pending
    }

    pub fn is_processing(&self) -> bool {
        self.status == OutboxStatus::Processing
    }

    pub fn is_sent(&self) -> bool {
        self.status == OutboxStatus::Sent
    }

    pub fn is_failed(&self) -> bool {
        self.status == OutboxStatus::Failed
    }

    /// Pending and past its backoff gate.
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.is_pending() && self.next_attempt_at.map_or(true, |at| at <= now)
    }

    /// Whether `worker_id` currently holds the claim.
    pub fn is_claimed_by(&self, worker_id: &str) -> bool {
        self.is_processing() && self.claimed_by.as_deref() == Some(worker_id)
    }

    pub fn claim_expired(&self, now: DateTime<Utc>) -> bool {
        self.is_processing() && self.claimed_until.map_or(true, |until| until <= now)
    }

    // Transitions. Guards live in the store, which checks status and version
    // before calling these.

    pub(crate) fn claim(&mut self, worker_id: &str, until: DateTime<Utc>, now: DateTime<Utc>) {
        self.status = OutboxStatus::Processing;
        self.attempt_count += 1;
        self.last_tried_at = Some(now);
        self.claimed_by = Some(worker_id.to_string());
        self.claimed_until = Some(until);
        self.touch(now);
    }

    pub(crate) fn complete(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Sent;
        self.last_error = None;
        self.next_attempt_at = None;
        self.clear_claim();
        self.touch(now);
    }

    pub(crate) fn release(&mut self, release: &Release, now: DateTime<Utc>) {
        self.status = OutboxStatus::Pending;
        if release.refund_attempt {
            self.attempt_count = self.attempt_count.saturating_sub(1);
        }
        self.last_error = truncate_error(&release.error);
        self.next_attempt_at = release.next_attempt_at;
        self.clear_claim();
        self.touch(now);
    }

    pub(crate) fn fail(&mut self, error: &str, now: DateTime<Utc>) {
        self.status = OutboxStatus::Failed;
        self.last_error = truncate_error(error);
        self.next_attempt_at = None;
        self.clear_claim();
        self.touch(now);
    }

    pub(crate) fn requeue(&mut self, now: DateTime<Utc>) {
        self.status = OutboxStatus::Pending;
        self.attempt_count = 0;
        self.next_attempt_at = None;
        self.clear_claim();
        self.touch(now);
    }

    fn clear_claim(&mut self) {
        self.claimed_by = None;
        self.claimed_until = None;
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        self.version += 1;
        self.audit.stamp_modified(now);
    }
}

impl Audited for OutboxEvent {
    fn audit(&self) -> &Audit {
        &self.audit
    }

    fn audit_mut(&mut self) -> &mut Audit {
        &mut self.audit
    }
}

/// How a claimed event goes back to `PENDING`.
#[derive(Clone, Debug, PartialEq)]
pub struct Release {
    pub error: String,
    pub next_attempt_at: Option<DateTime<Utc>>,
    /// Give the attempt back, e.g. when the channel was never reached.
    pub refund_attempt: bool,
}

/// An outbox event that has not been stored yet.
#[derive(Clone, Debug, PartialEq)]
pub struct NewOutboxEvent {
    pub event_type: String,
    pub aggregate_type: String,
    pub aggregate_id: u64,
    pub payload: String,
    pub attempt_count: u32,
}

impl NewOutboxEvent {
    /// Create an event with an already serialized payload.
    pub fn new(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: u64,
        payload: impl Into<String>,
    ) -> Self {
        Self {
            event_type: event_type.into(),
            aggregate_type: aggregate_type.into(),
            aggregate_id,
            payload: payload.into(),
            attempt_count: 0,
        }
    }

    /// Create an event whose payload is `payload` serialized as JSON.
    pub fn json<T: Serialize>(
        event_type: impl Into<String>,
        aggregate_type: impl Into<String>,
        aggregate_id: u64,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let payload = serde_json::to_string(payload)?;
        Ok(Self::new(event_type, aggregate_type, aggregate_id, payload))
    }

    /// Start with attempts already recorded (imports, tests).
    pub fn with_attempts(mut self, attempts: u32) -> Self {
        self.attempt_count = attempts;
        self
    }
}

fn truncate_error(error: &str) -> Option<String> {
    if error.is_empty() {
        return None;
    }
    match error.char_indices().nth(MAX_ERROR_LEN) {
        Some((idx, _)) => Some(error[..idx].to_string()),
        None => Some(error.to_string()),
    }
}
