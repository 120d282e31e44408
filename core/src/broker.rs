//! Message broker abstraction.
//!
//! The request/response protocol is built on a fire-and-forget
//! publish/subscribe transport. This module defines the minimal contract the
//! runtime needs from that transport, without committing to a concrete client
//! library:
//!
//! - [`Broker`]: an established connection that can open channels
//! - [`BrokerChannel`]: declares queues, binds them, publishes and consumes
//! - [`Delivery`] / [`MessageProperties`]: what travels over the wire
//!
//! # Implementations
//!
//! - `InMemoryBroker` (in `shardlink-testing`) - For testing (fast, deterministic)
//! - `LapinBroker` (in `shardlink-amqp`) - For production (AMQP 0-9-1)
//!
//! # Dyn Compatibility
//!
//! Both traits return `Pin<Box<dyn Future>>` rather than using `async fn` so
//! they can be used as trait objects (`Arc<dyn Broker>`), which is how the
//! runtime receives its transport.

use futures::Stream;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use thiserror::Error;

/// Errors raised by the transport. All of them are transport-class failures.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    /// Failed to connect to the broker
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Failed to open a channel on an established connection
    #[error("Failed to open channel: {0}")]
    ChannelOpenFailed(String),

    /// No usable channel is available (never opened, or being recreated)
    #[error("No usable channel is available")]
    ChannelUnavailable,

    /// The channel was closed by either side
    #[error("Channel closed: {0}")]
    ChannelClosed(String),

    /// Failed to declare a queue
    #[error("Queue declaration failed: {0}")]
    QueueDeclareFailed(String),

    /// Failed to bind a queue to an exchange
    #[error("Binding queue '{queue}' to exchange '{exchange}' with key '{routing_key}' failed: {reason}")]
    BindFailed {
        /// The queue being bound
        queue: String,
        /// The exchange it was bound to
        exchange: String,
        /// The binding key
        routing_key: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to start consuming from a queue
    #[error("Consume failed for queue '{queue}': {reason}")]
    ConsumeFailed {
        /// The queue
        queue: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to publish a message
    #[error("Publish failed to exchange '{exchange}' with key '{routing_key}': {reason}")]
    PublishFailed {
        /// The exchange
        exchange: String,
        /// The routing key
        routing_key: String,
        /// The reason for failure
        reason: String,
    },

    /// Failed to receive a delivery from an active consumer
    #[error("Delivery failed: {0}")]
    DeliveryFailed(String),
}

/// Message properties used by the RPC protocol.
///
/// Only the properties the protocol reads or writes are modelled; everything
/// else is left to the broker defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    /// Correlation key linking a reply to its request
    pub correlation_id: Option<String>,
    /// Queue the reply should be addressed to
    pub reply_to: Option<String>,
    /// Message type; carries the status on replies (`"200"`, `"404"`, ...)
    pub kind: Option<String>,
    /// Content type; `application/octet-stream` marks a compressed body
    pub content_type: Option<String>,
}

impl MessageProperties {
    /// Set the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, id: impl Into<String>) -> Self {
        self.correlation_id = Some(id.into());
        self
    }

    /// Set the reply-to queue.
    #[must_use]
    pub fn with_reply_to(mut self, queue: impl Into<String>) -> Self {
        self.reply_to = Some(queue.into());
        self
    }

    /// Set the message type.
    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Set the content type.
    #[must_use]
    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// A message received from a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    /// Exchange the message was published to (empty for the default exchange)
    pub exchange: String,
    /// Routing key the message was published with
    pub routing_key: String,
    /// Message properties
    pub properties: MessageProperties,
    /// Raw body
    pub body: Vec<u8>,
}

/// Queue declaration parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    /// Queue name; empty lets the server generate one
    pub name: String,
    /// Survive broker restarts
    pub durable: bool,
    /// Only usable by the declaring connection
    pub exclusive: bool,
    /// Deleted once the last consumer goes away
    pub auto_delete: bool,
}

impl QueueSpec {
    /// A private reply queue: server-named, non-durable, exclusive, auto-delete.
    #[must_use]
    pub fn reply_queue() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }

    /// A server-named, non-durable, auto-delete queue for broadcast events.
    #[must_use]
    pub fn event_queue() -> Self {
        Self {
            name: String::new(),
            durable: false,
            exclusive: false,
            auto_delete: true,
        }
    }
}

/// Stream of deliveries from one consumer.
///
/// The stream ends when the consumer is cancelled or its channel closes.
pub type DeliveryStream = Pin<Box<dyn Stream<Item = Result<Delivery, BrokerError>> + Send>>;

/// Boxed future returned by the broker traits.
pub type BrokerFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, BrokerError>> + Send + 'a>>;

/// An established broker connection.
///
/// Connecting is implementation-specific (see `LapinBroker::connect`); once
/// connected, the runtime only needs to open channels. Implementations never
/// retry internally: retry policy belongs to the caller.
pub trait Broker: Send + Sync {
    /// Open a fresh channel on this connection.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ChannelOpenFailed`] or
    /// [`BrokerError::ConnectionFailed`] if the connection is unusable.
    fn open_channel(&self) -> BrokerFuture<'_, Arc<dyn BrokerChannel>>;
}

/// A channel on a broker connection.
pub trait BrokerChannel: Send + Sync {
    /// Declare a queue and return its (possibly server-generated) name.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::QueueDeclareFailed`] on failure.
    fn declare_queue(&self, spec: QueueSpec) -> BrokerFuture<'_, String>;

    /// Bind `queue` to `exchange` with `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::BindFailed`] on failure.
    fn bind_queue<'a>(
        &'a self,
        queue: &'a str,
        exchange: &'a str,
        routing_key: &'a str,
    ) -> BrokerFuture<'a, ()>;

    /// Publish `body` to `exchange` with `routing_key`.
    ///
    /// The empty exchange name addresses the broker's default exchange, which
    /// routes directly to the queue named by `routing_key`.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::PublishFailed`] or
    /// [`BrokerError::ChannelClosed`] if the message could not be handed over.
    fn publish<'a>(
        &'a self,
        exchange: &'a str,
        routing_key: &'a str,
        properties: MessageProperties,
        body: Vec<u8>,
    ) -> BrokerFuture<'a, ()>;

    /// Start consuming `queue` with automatic acknowledgement.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ConsumeFailed`] on failure.
    fn consume<'a>(&'a self, queue: &'a str) -> BrokerFuture<'a, DeliveryStream>;

    /// Close the channel.
    ///
    /// # Errors
    ///
    /// Returns [`BrokerError::ChannelClosed`] if the channel could not be
    /// closed cleanly (for example because it is already dead).
    fn close(&self) -> BrokerFuture<'_, ()>;

    /// Whether the channel is still usable.
    fn is_open(&self) -> bool;
}
