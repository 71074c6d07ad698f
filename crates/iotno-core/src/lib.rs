//! # iotno-core
//!
//! Shared domain model for the IoT power-saving orchestration services.
//!
//! This crate holds everything the four services (admission API, scheduler,
//! actuation worker, notifier) agree on:
//!
//! - **Identifiers**: [`TransactionId`] and the canonical per-device
//!   [`NetworkAccessIdentifier`] with pluggable resolution
//! - **Device model**: the polymorphic [`Device`] identifier product type
//! - **Subscriptions**: callback sink, credential, and declared event types
//! - **Events**: the `CloudEvents`-compatible [`EventEnvelope`] and the typed
//!   payloads exchanged through the broker
//! - **Configuration**: environment-variable configuration for every service
//! - **Observability**: logging initialization shared by all binaries
//!
//! ## Event flow
//!
//! ```text
//! API ──schedule.requested──► Scheduler ──device.actuation.request──► Worker
//!                                 ▲                                     │
//!                                 └───────all-devices.completed─────────┤
//!                                                                       ▼
//!                            Notifier ◄──────completed / error──────────┘
//! ```

pub mod config;
pub mod device;
pub mod error;
pub mod event;
pub mod id;
pub mod observability;
pub mod subscription;

pub use device::{Device, DeviceIpv4Addr, NaiResolver, NetworkAccessIdentifier};
pub use error::{Error, Result};
pub use event::{Action, EventEnvelope, EventSource, EventType};
pub use id::TransactionId;
pub use subscription::{SinkCredential, SubscriptionRequest};
