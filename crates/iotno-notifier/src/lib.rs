//! # iotno-notifier
//!
//! Delivers completion and error callbacks to the subscriber-supplied sink.
//!
//! Consumes `all-devices.completed` and `notify.error.requested` from the
//! broker and turns each into one `CloudEvents` HTTP POST. Delivery is
//! best-effort: the at-most-once-per-phase guarantee comes from the worker's
//! notifier election upstream, and HTTP failures are classified and
//! swallowed rather than retried in-process.

pub mod notifier;

pub use notifier::NotificationWorker;
