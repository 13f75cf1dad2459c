use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use tracing::{debug, error, info, warn};

use super::{HandlerRegistry, OutboxHandler, RetryPolicy};
use crate::channel::DeliveryError;
use crate::clock::{Clock, SystemClock};
use crate::config::OutboxConfig;
use crate::outbox::{OutboxEvent, Release};
use crate::store::{OutboxStore, StoreError, MAX_POLL_BATCH};

const DEFAULT_CLAIM_LEASE: Duration = Duration::from_secs(60);
const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);

/// How often a waiting dispatcher re-checks its clock against the deadline.
const WAIT_SLICE: Duration = Duration::from_millis(10);

/// What happened to one record during a poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Sent,
    /// Back to `PENDING` with a backoff gate.
    Retried {
        attempt: u32,
        next_attempt_at: DateTime<Utc>,
    },
    /// Channel unavailable; back to `PENDING` without using up an attempt.
    Deferred,
    /// Moved to `FAILED`.
    DeadLettered,
    /// Another dispatcher claimed it first.
    Skipped,
}

/// Counts from one [`OutboxDispatcher::poll_and_dispatch`] run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchReport {
    pub recovered: usize,
    pub loaded: usize,
    pub sent: usize,
    pub retried: usize,
    pub deferred: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
    /// Records whose status update failed; they are retried on a later poll.
    pub store_errors: usize,
    /// Timed-out deliveries whose handler was still running when the poll ended.
    pub stalled_deliveries: usize,
}

impl DispatchReport {
    fn record(&mut self, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Sent => self.sent += 1,
            DispatchOutcome::Retried { .. } => self.retried += 1,
            DispatchOutcome::Deferred => self.deferred += 1,
            DispatchOutcome::DeadLettered => self.dead_lettered += 1,
            DispatchOutcome::Skipped => self.skipped += 1,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.loaded == 0 && self.recovered == 0
    }
}

/// Polls the outbox and delivers pending records through registered handlers.
///
/// ## Example
///
/// ```ignore
/// let handlers = HandlerRegistry::new()
///     .with(YOUTUBE_VIDEO, ChannelRelay::new("/topic/challenge/videos", channel));
/// let dispatcher = OutboxDispatcher::new(store.clone(), handlers)
///     .with_worker_id("dispatcher-a")
///     .with_delivery_timeout(Duration::from_secs(2));
///
/// let report = dispatcher.poll_and_dispatch()?;
/// ```
pub struct OutboxDispatcher<S> {
    store: S,
    handlers: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    worker_id: String,
    batch_size: usize,
    retry: RetryPolicy,
    claim_lease: Duration,
    delivery_timeout: Duration,
    sent_retention: Duration,
    running: Arc<AtomicUsize>,
}

impl<S: OutboxStore> OutboxDispatcher<S> {
    pub fn new(store: S, handlers: HandlerRegistry) -> Self {
        OutboxDispatcher {
            store,
            handlers: Arc::new(handlers),
            clock: Arc::new(SystemClock),
            worker_id: "outbox-dispatcher".to_string(),
            batch_size: MAX_POLL_BATCH,
            retry: RetryPolicy::default(),
            claim_lease: DEFAULT_CLAIM_LEASE,
            delivery_timeout: DEFAULT_DELIVERY_TIMEOUT,
            sent_retention: Duration::from_secs(7 * 24 * 60 * 60),
            running: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn from_config(store: S, handlers: HandlerRegistry, config: &OutboxConfig) -> Self {
        Self::new(store, handlers)
            .with_worker_id(config.worker_id.clone())
            .with_batch_size(config.batch_size)
            .with_retry_policy(config.retry_policy())
            .with_claim_lease(config.claim_lease())
            .with_delivery_timeout(config.delivery_timeout())
            .with_sent_retention(config.sent_retention())
    }

    pub fn with_worker_id(mut self, worker_id: impl Into<String>) -> Self {
        self.worker_id = worker_id.into();
        self
    }

    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// Records loaded per poll, clamped to `1..=100`.
    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.clamp(1, MAX_POLL_BATCH);
        self
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_claim_lease(mut self, lease: Duration) -> Self {
        self.claim_lease = lease;
        self
    }

    /// Count a delivery as failed once it runs longer than `timeout`.
    ///
    /// A delivery must give up before its claim lease runs out, or another
    /// dispatcher could recover the row and deliver it a second time. A
    /// timeout not below the lease is replaced by half the lease.
    pub fn with_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.delivery_timeout = timeout;
        self
    }

    pub fn with_sent_retention(mut self, retention: Duration) -> Self {
        self.sent_retention = retention;
        self
    }

    pub fn worker_id(&self) -> &str {
        &self.worker_id
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    /// The timeout deliveries actually run with, always below the claim lease.
    pub fn delivery_timeout(&self) -> Duration {
        if self.delivery_timeout < self.claim_lease {
            self.delivery_timeout
        } else {
            self.claim_lease / 2
        }
    }

    /// Delivery threads still running, including timed-out ones.
    pub fn running_deliveries(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// One poll cycle: recover expired claims, then deliver up to
    /// `batch_size` due records in id order.
    ///
    /// Only failing to read the outbox is an error. Problems with individual
    /// records are logged and counted in the report, and never stop the batch.
    pub fn poll_and_dispatch(&self) -> Result<DispatchReport, StoreError> {
        let mut report = DispatchReport::default();
        let now = self.clock.now();

        report.recovered = self.store.release_expired_claims(now)?;
        if report.recovered > 0 {
            warn!(
                worker = %self.worker_id,
                recovered = report.recovered,
                "recovered outbox events with expired claims"
            );
        }

        let due = self.store.find_due(now, self.batch_size)?;
        report.loaded = due.len();

        for event in due {
            let (event_id, event_type) = (event.id, event.event_type.clone());
            match self.dispatch_one(event) {
                Ok(outcome) => report.record(outcome),
                Err(err) => {
                    report.store_errors += 1;
                    error!(
                        worker = %self.worker_id,
                        event_id,
                        event_type = %event_type,
                        error = %err,
                        "failed to update outbox event"
                    );
                }
            }
        }

        report.stalled_deliveries = self.running_deliveries();
        if report.stalled_deliveries > 0 {
            warn!(
                worker = %self.worker_id,
                stalled = report.stalled_deliveries,
                "timed-out outbox deliveries still running"
            );
        }
        if !report.is_idle() {
            debug!(worker = %self.worker_id, ?report, "outbox poll finished");
        }
        Ok(report)
    }

    /// Claim and deliver a single record loaded by a poll.
    pub fn dispatch_one(&self, event: OutboxEvent) -> Result<DispatchOutcome, StoreError> {
        let now = self.clock.now();
        let until = offset(now, self.claim_lease);
        let Some(claimed) = self
            .store
            .claim(event.id, event.version, &self.worker_id, until, now)?
        else {
            debug!(
                worker = %self.worker_id,
                event_id = event.id,
                "outbox event already claimed elsewhere"
            );
            return Ok(DispatchOutcome::Skipped);
        };

        match self.deliver(&claimed) {
            Ok(()) => {
                self.store
                    .mark_sent(claimed.id, &self.worker_id, self.clock.now())?;
                info!(
                    event_id = claimed.id,
                    event_type = %claimed.event_type,
                    attempt = claimed.attempt_count,
                    "outbox event sent"
                );
                Ok(DispatchOutcome::Sent)
            }
            Err(err) => self.handle_failure(&claimed, err),
        }
    }

    /// Hard-delete `SENT` records older than the retention period.
    pub fn purge_delivered(&self) -> Result<usize, StoreError> {
        let cutoff = offset_back(self.clock.now(), self.sent_retention);
        let purged = self.store.purge_sent_before(cutoff)?;
        if purged > 0 {
            info!(purged, %cutoff, "purged delivered outbox events");
        }
        Ok(purged)
    }

    fn deliver(&self, event: &OutboxEvent) -> Result<(), DeliveryError> {
        let handler = self.handlers.get(&event.event_type).ok_or_else(|| {
            DeliveryError::Permanent(format!(
                "no handler registered for event type {}",
                event.event_type
            ))
        })?;

        let timeout = self.delivery_timeout();
        let deadline = offset(self.clock.now(), timeout);
        let started = Instant::now();

        let (tx, rx) = mpsc::channel();
        let owned = event.clone();
        let running = Arc::clone(&self.running);
        running.fetch_add(1, Ordering::SeqCst);
        let spawned = thread::Builder::new()
            .name(format!("outbox-delivery-{}", event.id))
            .spawn(move || {
                let result = invoke(handler.as_ref(), &owned);
                running.fetch_sub(1, Ordering::SeqCst);
                let _ = tx.send(result);
            });
        if let Err(err) = spawned {
            self.running.fetch_sub(1, Ordering::SeqCst);
            return Err(DeliveryError::transient(err));
        }

        // The deadline is checked against both the wall clock and the
        // dispatcher clock, whichever passes first. A delivery that outlives
        // it keeps running on its own thread; the retry that follows may
        // duplicate it.
        loop {
            match rx.recv_timeout(WAIT_SLICE.min(timeout)) {
                Ok(result) => return result,
                Err(RecvTimeoutError::Timeout) => {
                    if started.elapsed() >= timeout || self.clock.now() >= deadline {
                        warn!(
                            event_id = event.id,
                            event_type = %event.event_type,
                            ?timeout,
                            running = self.running_deliveries(),
                            "outbox delivery timed out"
                        );
                        return Err(DeliveryError::Timeout(timeout));
                    }
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(DeliveryError::Transient(
                        "delivery thread exited without a result".into(),
                    ))
                }
            }
        }
    }

    fn handle_failure(
        &self,
        event: &OutboxEvent,
        err: DeliveryError,
    ) -> Result<DispatchOutcome, StoreError> {
        let now = self.clock.now();
        let attempt = event.attempt_count;
        let message = err.to_string();

        match err {
            DeliveryError::Unavailable(_) => {
                let next_attempt_at = offset(now, self.retry.base);
                let release = Release {
                    error: message,
                    next_attempt_at: Some(next_attempt_at),
                    refund_attempt: true,
                };
                self.store.release(event.id, &self.worker_id, &release, now)?;
                warn!(
                    event_id = event.id,
                    event_type = %event.event_type,
                    error = %release.error,
                    "channel unavailable, outbox event deferred"
                );
                Ok(DispatchOutcome::Deferred)
            }
            DeliveryError::Permanent(_) => self.dead_letter(event, &message, now),
            _ if self.retry.is_exhausted(attempt) => self.dead_letter(event, &message, now),
            _ => {
                let next_attempt_at = offset(now, self.retry.delay_for(attempt));
                let release = Release {
                    error: message,
                    next_attempt_at: Some(next_attempt_at),
                    refund_attempt: false,
                };
                self.store.release(event.id, &self.worker_id, &release, now)?;
                warn!(
                    event_id = event.id,
                    event_type = %event.event_type,
                    attempt,
                    max_attempts = self.retry.max_attempts,
                    %next_attempt_at,
                    error = %release.error,
                    "outbox delivery failed, will retry"
                );
                Ok(DispatchOutcome::Retried {
                    attempt,
                    next_attempt_at,
                })
            }
        }
    }

    fn dead_letter(
        &self,
        event: &OutboxEvent,
        message: &str,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, StoreError> {
        self.store
            .mark_failed(event.id, &self.worker_id, message, now)?;
        error!(
            event_id = event.id,
            event_type = %event.event_type,
            attempt = event.attempt_count,
            error = %message,
            "outbox event dead-lettered"
        );
        Ok(DispatchOutcome::DeadLettered)
    }
}

fn invoke(handler: &dyn OutboxHandler, event: &OutboxEvent) -> Result<(), DeliveryError> {
    catch_unwind(AssertUnwindSafe(|| handler.handle(event)))
        .unwrap_or_else(|_| Err(DeliveryError::Transient("outbox handler panicked".into())))
}

fn offset(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| now.checked_add_signed(by))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn offset_back(now: DateTime<Utc>, by: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(by)
        .ok()
        .and_then(|by| now.checked_sub_signed(by))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}
