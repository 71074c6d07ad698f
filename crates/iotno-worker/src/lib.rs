//! # iotno-worker
//!
//! The actuation worker consumes per-device `device.actuation.request`
//! events, drives the device through the configuration backend, records the
//! outcome, and detects phase completion.
//!
//! Which operation runs is a function of `(action, enabled)`:
//!
//! | action | enabled | operation |
//! |--------|---------|-----------|
//! | start  | true    | capture original state, then apply power-saving |
//! | start  | false   | restore the captured original state |
//! | end    | true    | restore the captured original state |
//! | end    | false   | apply power-saving |
//!
//! Completion detection is the subtle part: after recording a terminal
//! outcome, the worker counts terminal devices in the post-image and, when
//! all are terminal, runs the notifier election, a conditional flag update
//! that exactly one worker wins. Only the winner emits
//! `all-devices.completed` and, when no further phase is scheduled, marks
//! the transaction completed.

pub mod actuation;

pub use actuation::ActuationWorker;
