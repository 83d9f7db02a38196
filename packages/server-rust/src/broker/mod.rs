//! Message broker seam.
//!
//! `RpcService` talks to the broker only through the [`Broker`] trait:
//! - [`amqp::AmqpBroker`] speaks AMQP 0-9-1 via `lapin`
//! - [`memory::InMemoryBroker`] is deterministic and used by tests and local runs

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use authrpc_core::AmqpConfig;
use futures_util::stream::BoxStream;
use serde_json::Value;

pub use amqp::AmqpBroker;
pub use memory::{BrokerEvent, InMemoryBroker};

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

/// One inbound request taken off a procedure queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub payload: Vec<u8>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
}

/// A reply published to the caller's `reply_to` queue.
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundReply {
    pub reply_to: String,
    pub correlation_id: Option<String>,
    pub body: Value,
    /// Set for failures no handler translated; published with message type `error`.
    pub is_error: bool,
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery, BrokerError>>;

// ---------------------------------------------------------------------------
// BrokerError
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum BrokerError {
    #[error("broker is not connected")]
    NotConnected,

    #[error("broker connection is closed")]
    Closed,

    #[error("queue `{0}` has not been declared")]
    UnknownQueue(String),

    #[error("consumer for queue `{0}` ended")]
    ConsumerEnded(String),

    #[error("connection refused: {0}")]
    Connect(String),

    #[error("failed to encode reply: {0}")]
    Encode(#[from] serde_json::Error),

    #[error(transparent)]
    Amqp(#[from] lapin::Error),
}

// ---------------------------------------------------------------------------
// Broker trait
// ---------------------------------------------------------------------------

/// Connection to a message broker able to serve RPC queues.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Opens the connection and the channel calls are served on.
    ///
    /// # Errors
    ///
    /// Returns an error if the broker cannot be reached or refuses the login.
    async fn connect(&self, config: &AmqpConfig) -> Result<(), BrokerError>;

    /// Declares a durable, auto-delete queue.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected or the broker rejects the declaration.
    async fn declare_queue(&self, queue: &str) -> Result<(), BrokerError>;

    /// Starts consuming a previously declared queue.
    ///
    /// # Errors
    ///
    /// Returns an error if not connected or the queue is unknown.
    async fn consume(&self, queue: &str) -> Result<DeliveryStream, BrokerError>;

    /// # Errors
    ///
    /// Returns an error if the reply cannot be encoded or published.
    async fn reply(&self, reply: OutboundReply) -> Result<(), BrokerError>;

    /// # Errors
    ///
    /// Returns an error if the channel is gone.
    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// Negative acknowledgement without requeue.
    ///
    /// # Errors
    ///
    /// Returns an error if the channel is gone.
    async fn reject(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    /// # Errors
    ///
    /// Returns an error if the broker fails to close cleanly.
    async fn close(&self) -> Result<(), BrokerError>;
}
