//! # iotno-bus
//!
//! Broker contract and transports.
//!
//! The broker itself is an external collaborator; this crate pins down the
//! two sides of its contract:
//!
//! - [`EventSender`]: publish one structured envelope
//! - [`EventHandler`]: consume envelopes delivered for a subscription
//!
//! Two transports implement the contract:
//!
//! - [`memory::InMemoryBus`]: an in-process, type-filtered bus. Delivery is
//!   asynchronous (handlers run on spawned tasks), may be concurrent, and,
//!   like a real broker, makes no ordering promises across events.
//! - [`http`]: a `CloudEvents` HTTP sender targeting the `K_SINK` publish
//!   URL, and a receiver server that accepts broker deliveries and feeds
//!   them to a handler. A non-2xx receiver response is the non-ack that
//!   triggers broker redelivery.

pub mod http;
pub mod memory;

use async_trait::async_trait;

use iotno_core::EventEnvelope;

/// The result type used by bus operations.
pub type Result<T> = std::result::Result<T, BusError>;

/// Errors surfaced by bus transports and handlers.
#[derive(Debug, thiserror::Error)]
pub enum BusError {
    /// Publishing an event failed.
    #[error("publish failed: {message}")]
    Publish {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// An event handler failed; the delivery should be retried.
    #[error("handler failed: {message}")]
    Handler {
        /// Description of the failure.
        message: String,
        /// The underlying cause, if any.
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// The transport is misconfigured.
    #[error("bus configuration error: {message}")]
    Config {
        /// Description of the problem.
        message: String,
    },
}

impl BusError {
    /// Creates a publish error from a message.
    #[must_use]
    pub fn publish(message: impl Into<String>) -> Self {
        Self::Publish {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a handler error from a message.
    #[must_use]
    pub fn handler(message: impl Into<String>) -> Self {
        Self::Handler {
            message: message.into(),
            source: None,
        }
    }

    /// Creates a handler error wrapping a source error.
    #[must_use]
    pub fn handler_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Handler {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }
}

/// Publishes structured envelopes to the broker.
#[async_trait]
pub trait EventSender: Send + Sync {
    /// Publishes one envelope.
    async fn send(&self, envelope: EventEnvelope) -> Result<()>;
}

/// Consumes envelopes delivered for a subscription.
///
/// The broker may deliver the same event more than once and in any order;
/// handlers must be idempotent. Returning an error is a non-ack and leads to
/// redelivery.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handles one delivered envelope.
    async fn handle(&self, envelope: EventEnvelope) -> Result<()>;
}
