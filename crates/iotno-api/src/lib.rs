//! # iotno-api
//!
//! Admission service: the public HTTP surface of the power-saving system.
//!
//! `POST /features/power-saving` validates a declarative reconfiguration
//! request, resolves every device to its canonical identifier, enforces the
//! restore precondition and the one-in-flight-transaction-per-device rule,
//! and hands the admitted request to the scheduler by publishing a
//! `schedule.requested` event. The 202 response carries the allocated
//! transaction ID; the scheduler materializes the transaction row, so a
//! status query racing the admission may briefly answer 404.

pub mod auth;
pub mod error;
pub mod models;
pub mod routes;
pub mod server;
pub mod validation;

pub use error::{ApiError, ApiResult};
pub use server::{AppState, router, serve};
