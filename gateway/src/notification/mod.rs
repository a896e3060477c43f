//! # Notification Module
//!
//! Callback delivery, paced per destination host.
//!
//! ```text
//! latency.rs   : HostLatencyTracker: rolling per-host delivery times
//! scheduler.rs : NotificationScheduler: bounded fast/slow queues
//! envelope.rs  : the signed JSON body POSTed to subscribers
//! dispatcher.rs: worker pool, outcome bookkeeping, recovery sweep
//! ```

pub mod dispatcher;
pub mod envelope;
pub mod latency;
pub mod scheduler;

pub use dispatcher::{CallbackError, CallbackTransport, NotificationDispatcher};
pub use envelope::{CallbackMessage, CallbackReason, SignedEnvelope};
pub use latency::{host_of, HostLatencyTracker};
pub use scheduler::NotificationScheduler;
