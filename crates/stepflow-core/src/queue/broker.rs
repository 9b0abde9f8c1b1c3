//! Message broker trait definition.
//!
//! The engine's at-least-once callback path runs through a durable queue:
//! workers (and the dispatcher, for synthetic failures) publish callback
//! messages, and the intake consumers pull them off with explicit ack/nack.
//! Implementations live in stepflow-infra; the in-process broker backs
//! development and tests, and the same trait fronts a hosted queue in
//! production.

use serde_json::Value;
use thiserror::Error;

/// Queue that carries worker callback messages to the intake consumers.
pub const RESULT_QUEUE: &str = "stepflow.results";

/// Errors from broker operations.
#[derive(Debug, Error)]
pub enum BrokerError {
    /// The broker has shut down and no longer accepts operations.
    #[error("broker is closed")]
    Closed,

    /// The named queue was never declared via `ensure_topology`.
    #[error("unknown queue: {0}")]
    UnknownQueue(String),

    /// The delivery tag does not match any in-flight delivery.
    #[error("unknown delivery tag {tag} on queue {queue}")]
    UnknownDelivery { queue: String, tag: u64 },

    /// Publishing failed for a broker-specific reason.
    #[error("publish failed: {0}")]
    Publish(String),
}

/// One message pulled off a queue, pending ack or nack.
#[derive(Debug, Clone)]
pub struct Delivery {
    /// Broker-assigned tag identifying this delivery for ack/nack.
    pub delivery_tag: u64,
    /// The message body.
    pub payload: Value,
    /// True when this message was redelivered after a nack or a
    /// visibility timeout.
    pub redelivered: bool,
}

/// At-least-once message broker.
///
/// A message stays in flight after `consume` until it is acked; a nack (or
/// a consumer crash, for brokers with visibility timeouts) puts it back on
/// the queue for redelivery. Consumers must therefore tolerate duplicates.
pub trait MessageBroker: Send + Sync {
    /// Declare the queues the engine uses. Idempotent.
    fn ensure_topology(&self) -> impl std::future::Future<Output = Result<(), BrokerError>> + Send;

    /// Publish a message onto a queue.
    fn publish(
        &self,
        queue: &str,
        payload: Value,
    ) -> impl std::future::Future<Output = Result<(), BrokerError>> + Send;

    /// Wait for and take the next message from a queue.
    ///
    /// The returned delivery is in flight until acked or nacked. Resolves
    /// with [`BrokerError::Closed`] once the broker shuts down.
    fn consume(
        &self,
        queue: &str,
    ) -> impl std::future::Future<Output = Result<Delivery, BrokerError>> + Send;

    /// Acknowledge a delivery, removing it permanently.
    fn ack(
        &self,
        queue: &str,
        delivery_tag: u64,
    ) -> impl std::future::Future<Output = Result<(), BrokerError>> + Send;

    /// Reject a delivery, putting it back on the queue for redelivery.
    fn nack(
        &self,
        queue: &str,
        delivery_tag: u64,
    ) -> impl std::future::Future<Output = Result<(), BrokerError>> + Send;
}
