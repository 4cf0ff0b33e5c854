//! Broker collaborator surface.
//!
//! The pattern and RPC code only ever talks to these traits. [`AmqpBroker`]
//! drives a real RabbitMQ through lapin, [`MemoryBroker`] keeps everything
//! in-process for tests and local development.

pub mod amqp;
pub mod memory;

use async_trait::async_trait;
use futures_util::stream::BoxStream;
use std::fmt;
use std::sync::Arc;

use crate::error::Result;

pub use amqp::AmqpBroker;
pub use memory::MemoryBroker;

/// Stream of deliveries produced by [`Channel::consume`]
pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// Exchange routing behaviour
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    /// Every bound queue receives every message
    Fanout,
    /// Exact routing-key match
    Direct,
    /// Dot-separated word patterns with `*` and `#` wildcards
    Topic,
}

impl ExchangeKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Fanout => "fanout",
            Self::Direct => "direct",
            Self::Topic => "topic",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Options for [`Channel::assert_queue`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueOptions {
    pub durable: bool,
    /// Owned by the declaring connection and deleted when it closes
    pub exclusive: bool,
    /// Deleted once its last consumer is cancelled
    pub auto_delete: bool,
}

/// Options for [`Channel::assert_exchange`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
}

/// Options for [`Channel::consume`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConsumeOptions {
    /// Deliveries count as acknowledged as soon as they are sent
    pub no_ack: bool,
}

/// Message metadata carried alongside the body
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MessageProperties {
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub persistent: bool,
    pub content_type: Option<String>,
}

impl MessageProperties {
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_reply_to(mut self, reply_to: impl Into<String>) -> Self {
        self.reply_to = Some(reply_to.into());
        self
    }

    pub fn with_persistent(mut self, persistent: bool) -> Self {
        self.persistent = persistent;
        self
    }

    pub fn with_content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }
}

/// A raw message handed to a consumer
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Entry point to a broker
#[async_trait]
pub trait Broker: Send + Sync {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>>;
}

/// One broker connection, multiplexing many channels
#[async_trait]
pub trait Connection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>>;

    async fn close(&self) -> Result<()>;

    fn is_connected(&self) -> bool;
}

/// A channel on a [`Connection`]
#[async_trait]
pub trait Channel: Send + Sync {
    /// Declare a queue; an empty name asks the broker to generate one.
    /// Returns the actual queue name.
    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String>;

    async fn assert_exchange(&self, name: &str, kind: ExchangeKind, options: ExchangeOptions) -> Result<()>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()>;

    /// Limit unacknowledged deliveries per consumer started afterwards
    async fn prefetch(&self, count: u16) -> Result<()>;

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream>;

    /// Publish through the default exchange straight to `queue`
    async fn send_to_queue(&self, queue: &str, body: &[u8], properties: MessageProperties) -> Result<()>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<()>;

    async fn ack(&self, delivery: &Delivery) -> Result<()>;

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()>;

    async fn close(&self) -> Result<()>;
}
