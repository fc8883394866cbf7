//! Transport adapter: the broker-agnostic surface a channel talks to.
//!
//! A [`Connection`] opens broker channels; each broker channel is a [`Transport`]. Every
//! operation is async so a caller waiting on the broker suspends only its own task.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::header::Headers;

/// One message handed to a consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Delivery {
    pub body: Vec<u8>,
    pub headers: Headers,
    pub delivery_tag: u64,
    pub routing_key: String,
    pub redelivered: bool,
}

/// Consumer callback. Invoked in delivery order; must not block or call back into the broker.
pub type DeliveryCallback = Arc<dyn Fn(Delivery) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExchangeKind {
    Direct,
    Fanout,
    Topic,
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ExchangeKind::Direct => "direct",
            ExchangeKind::Fanout => "fanout",
            ExchangeKind::Topic => "topic",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueOptions {
    pub durable: bool,
    pub auto_delete: bool,
    pub exclusive: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct PublishOptions {
    pub durable: bool,
    /// Fail with [`TransportError::Unroutable`] when no queue receives the message.
    pub mandatory: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct QueueStats {
    pub message_count: u32,
    pub consumer_count: u32,
}

/// How long `stop_consume` waits for the broker to confirm a cancel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

impl Default for CancelPolicy {
    fn default() -> Self {
        Self {
            attempts: 10,
            interval: Duration::from_millis(50),
        }
    }
}

/// Broker-level failure. Every adapter maps its client errors into this one type.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum TransportError {
    #[error("connection lost: {0}")]
    ConnectionLost(String),
    #[error("broker channel {0} is closed")]
    ChannelClosed(u16),
    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },
    #[error("precondition failed: {0}")]
    PreconditionFailed(String),
    #[error("resource locked: {0}")]
    ResourceLocked(String),
    #[error("message to {exchange}/{routing_key} was not routed to any queue")]
    Unroutable { exchange: String, routing_key: String },
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
    #[error("consumer {tag} cancel not confirmed after {attempts} attempts")]
    CancelUnconfirmed { tag: String, attempts: u32 },
    #[error("no broker channel numbers left")]
    ChannelsExhausted,
    #[error("broker link protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(String),
}

impl From<std::io::Error> for TransportError {
    fn from(e: std::io::Error) -> Self {
        TransportError::Io(e.to_string())
    }
}

/// A single broker channel.
#[async_trait]
pub trait Transport: Send + Sync {
    /// The broker's own number for this channel.
    fn channel_number(&self) -> u16;

    fn is_open(&self) -> bool;

    /// Whether the channel can be handed out again from a pool. Implementations check whatever
    /// their client library exposes (open state, registered callbacks, error flags).
    fn is_healthy(&self) -> bool;

    fn cancel_policy(&self) -> CancelPolicy {
        CancelPolicy::default()
    }

    async fn declare_exchange(
        &self,
        exchange: &str,
        kind: ExchangeKind,
        durable: bool,
        auto_delete: bool,
    ) -> Result<(), TransportError>;

    async fn delete_exchange(&self, exchange: &str) -> Result<(), TransportError>;

    /// Declare a queue. An empty name asks the broker to generate one; the resolved name is returned.
    async fn declare_queue(&self, queue: &str, options: QueueOptions)
        -> Result<String, TransportError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), TransportError>;

    async fn bind(&self, exchange: &str, queue: &str, binding: &str)
        -> Result<(), TransportError>;

    async fn unbind(&self, exchange: &str, queue: &str, binding: &str)
        -> Result<(), TransportError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Vec<u8>,
        headers: Headers,
        options: PublishOptions,
    ) -> Result<(), TransportError>;

    /// Register a consumer on `queue`. Returns the consumer tag.
    async fn start_consume(
        &self,
        callback: DeliveryCallback,
        queue: &str,
        no_ack: bool,
        exclusive: bool,
    ) -> Result<String, TransportError>;

    /// Ask the broker to cancel a consumer. Confirmation is observed via [`Transport::consumer_active`].
    async fn cancel_consumer(&self, consumer_tag: &str) -> Result<(), TransportError>;

    async fn consumer_active(&self, consumer_tag: &str) -> Result<bool, TransportError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    async fn reject(&self, delivery_tag: u64, requeue: bool) -> Result<(), TransportError>;

    async fn queue_stats(&self, queue: &str) -> Result<QueueStats, TransportError>;

    async fn purge(&self, queue: &str) -> Result<u32, TransportError>;

    /// Close the broker channel. Closing twice is not an error.
    async fn close(&self) -> Result<(), TransportError>;

    /// Cancel a consumer and wait until the broker no longer reports it, so no delivery can
    /// arrive after this returns.
    async fn stop_consume(&self, consumer_tag: &str) -> Result<(), TransportError> {
        let policy = self.cancel_policy();
        self.cancel_consumer(consumer_tag).await?;
        for attempt in 0..policy.attempts {
            if !self.consumer_active(consumer_tag).await? {
                return Ok(());
            }
            tracing::debug!(consumer_tag, attempt, "waiting for consumer cancel confirmation");
            tokio::time::sleep(policy.interval).await;
        }
        Err(TransportError::CancelUnconfirmed {
            tag: consumer_tag.to_string(),
            attempts: policy.attempts,
        })
    }
}

/// A broker connection that hands out channels.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Human-readable endpoint, for logs.
    fn describe(&self) -> String;

    fn is_open(&self) -> bool;

    async fn open_channel(&self) -> Result<Arc<dyn Transport>, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
