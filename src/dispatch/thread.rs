//! Background dispatcher thread.

use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{error, info};

use super::OutboxDispatcher;
use crate::store::OutboxStore;

/// Longest idle delay after repeated store failures.
const MAX_ERROR_BACKOFF: Duration = Duration::from_secs(60);

/// Totals from a dispatcher thread's lifetime.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DispatcherStats {
    pub polls: usize,
    pub sent: usize,
    pub retried: usize,
    pub deferred: usize,
    pub dead_lettered: usize,
    pub skipped: usize,
    pub purged: usize,
    /// Expired claims returned to `PENDING`.
    pub recovered: usize,
    /// Records whose status update failed after delivery.
    pub store_errors: usize,
    /// Polls that could not read the store.
    pub poll_errors: usize,
}

/// Runs [`OutboxDispatcher::poll_and_dispatch`] on a fixed delay.
///
/// ```ignore
/// let thread = DispatcherThread::spawn(dispatcher, Duration::from_secs(5));
/// // ... serve requests ...
/// let stats = thread.stop();
/// ```
///
/// After a failed poll the delay doubles, up to a minute, and resets on the
/// next successful one.
pub struct DispatcherThread {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<DispatcherStats>>,
}

impl DispatcherThread {
    pub fn spawn<S>(dispatcher: OutboxDispatcher<S>, poll_interval: Duration) -> Self
    where
        S: OutboxStore + 'static,
    {
        Self::spawn_with_purge(dispatcher, poll_interval, None)
    }

    /// Like [`DispatcherThread::spawn`], also purging delivered records every
    /// `purge_every` polls.
    pub fn spawn_with_purge<S>(
        dispatcher: OutboxDispatcher<S>,
        poll_interval: Duration,
        purge_every: Option<usize>,
    ) -> Self
    where
        S: OutboxStore + 'static,
    {
        let (stop_tx, stop_rx) = channel();

        let handle = thread::spawn(move || {
            let mut stats = DispatcherStats::default();
            let mut delay = poll_interval;
            info!(worker = dispatcher.worker_id(), ?poll_interval, "outbox dispatcher started");

            loop {
                stats.polls += 1;
                match dispatcher.poll_and_dispatch() {
                    Ok(report) => {
                        stats.sent += report.sent;
                        stats.retried += report.retried;
                        stats.deferred += report.deferred;
                        stats.dead_lettered += report.dead_lettered;
                        stats.skipped += report.skipped;
                        stats.recovered += report.recovered;
                        stats.store_errors += report.store_errors;
                        delay = poll_interval;
                    }
                    Err(err) => {
                        stats.poll_errors += 1;
                        delay = (delay * 2).min(MAX_ERROR_BACKOFF.max(poll_interval));
                        error!(
                            worker = dispatcher.worker_id(),
                            error = %err,
                            retry_in = ?delay,
                            "outbox poll failed"
                        );
                    }
                }

                if let Some(every) = purge_every.filter(|every| *every > 0) {
                    if stats.polls % every == 0 {
                        match dispatcher.purge_delivered() {
                            Ok(purged) => stats.purged += purged,
                            Err(err) => error!(error = %err, "outbox purge failed"),
                        }
                    }
                }

                match stop_rx.recv_timeout(delay) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }

            info!(worker = dispatcher.worker_id(), ?stats, "outbox dispatcher stopped");
            stats
        });

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Signal the thread to stop and wait for it. Returns its totals.
    pub fn stop(mut self) -> DispatcherStats {
        let _ = self.stop_tx.send(());
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => DispatcherStats::default(),
        }
    }

    /// Signal the thread to stop without waiting.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

impl Drop for DispatcherThread {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
