//! Outbox dispatcher.
//!
//! ```text
//!   poll_and_dispatch()
//!     release_expired_claims      PROCESSING (lease over) -> PENDING
//!     find_due(≤ 100, by id)      PENDING and past next_attempt_at
//!     for each record:
//!       claim (CAS on version)    PENDING -> PROCESSING, attempt + 1
//!       HandlerRegistry[event_type].handle()
//!         ok                      -> SENT
//!         Unavailable             -> PENDING, attempt refunded
//!         Permanent / exhausted   -> FAILED
//!         otherwise               -> PENDING, exponential backoff
//! ```

mod dispatcher;
mod handler;
mod policy;
mod thread;

pub use dispatcher::{DispatchOutcome, DispatchReport, OutboxDispatcher};
pub use handler::{ChannelRelay, HandlerRegistry, OutboxHandler};
pub use policy::RetryPolicy;
pub use thread::{DispatcherStats, DispatcherThread};
