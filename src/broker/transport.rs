//! Transport seam between the replication logic and a concrete broker.
//!
//! [`ConnectionManager`](super::ConnectionManager), the publisher and the
//! consumer only see these traits; [`AmqpTransport`](super::AmqpTransport)
//! talks to RabbitMQ and [`MemoryBroker`](super::MemoryBroker) runs in-process.

use crate::Result;
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// When a delivery is acknowledged to the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckMode {
    /// Broker considers the message delivered as soon as it is sent.
    /// A failed apply is lost.
    Auto,
    /// Ack after a successful apply; reject (no requeue) otherwise.
    #[default]
    AfterApply,
}

impl fmt::Display for AckMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AckMode::Auto => f.write_str("auto"),
            AckMode::AfterApply => f.write_str("after_apply"),
        }
    }
}

/// How to bind a consumer queue to the exchange.
///
/// The queue itself is always anonymous, exclusive and auto-deleted.
#[derive(Debug, Clone, PartialEq)]
pub struct SubscribeOptions {
    pub exchange: String,
    pub ack_mode: AckMode,
    pub prefetch: u16,
    pub dead_letter_exchange: Option<String>,
}

impl SubscribeOptions {
    pub fn new(exchange: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            ack_mode: AckMode::default(),
            prefetch: 32,
            dead_letter_exchange: None,
        }
    }
}

#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn reject(&self, requeue: bool) -> Result<()>;
}

/// One message taken off a consumer queue.
pub struct Delivery {
    pub body: Bytes,
    pub redelivered: bool,
    acker: Option<Arc<dyn Acker>>,
}

impl Delivery {
    /// A delivery that needs no acknowledgement.
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            redelivered: false,
            acker: None,
        }
    }

    pub fn with_acker(mut self, acker: Arc<dyn Acker>) -> Self {
        self.acker = Some(acker);
        self
    }

    pub fn redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn requires_ack(&self) -> bool {
        self.acker.is_some()
    }

    pub async fn ack(&self) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.ack().await,
            None => Ok(()),
        }
    }

    pub async fn reject(&self, requeue: bool) -> Result<()> {
        match &self.acker {
            Some(acker) => acker.reject(requeue).await,
            None => Ok(()),
        }
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("bytes", &self.body.len())
            .field("redelivered", &self.redelivered)
            .field("requires_ack", &self.requires_ack())
            .finish()
    }
}

/// Ends when the broker cancels the subscription or the connection drops.
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

#[async_trait]
pub trait BrokerChannel: Clone + Send + Sync + 'static {
    fn is_open(&self) -> bool;

    /// Durable fan-out. Redeclaring with the same properties is a no-op;
    /// a mismatch is [`Error::ExchangeMismatch`](crate::Error::ExchangeMismatch).
    async fn declare_fanout_exchange(&self, exchange: &str) -> Result<()>;

    async fn publish(&self, exchange: &str, body: &[u8], persistent: bool) -> Result<()>;

    async fn subscribe(&self, options: &SubscribeOptions) -> Result<DeliveryStream>;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait Transport: Send + Sync + 'static {
    type Channel: BrokerChannel;

    /// Broker address safe to log.
    fn endpoint(&self) -> String;

    async fn open(&self) -> Result<Self::Channel>;
}
