use async_trait::async_trait;
use futures_util::StreamExt;
use lapin::{
    options::*,
    types::FieldTable,
    BasicProperties, ConnectionProperties,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

use super::{
    Broker, Channel, ConsumeOptions, Connection, Delivery, DeliveryStream, ExchangeKind,
    ExchangeOptions, MessageProperties, QueueOptions,
};
use crate::error::Result;

/// AMQP 0-9-1 delivery mode for messages that survive a broker restart
const PERSISTENT_DELIVERY_MODE: u8 = 2;

/// Broker backed by a RabbitMQ server through lapin
#[derive(Debug, Clone, Default)]
pub struct AmqpBroker;

impl AmqpBroker {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Broker for AmqpBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>> {
        debug!("Attempting to connect to {}", url);

        let connection = lapin::Connection::connect(
            url,
            ConnectionProperties::default()
                .with_connection_name(format!("amqp-patterns-{}", Uuid::new_v4()).into()),
        )
        .await?;

        debug!("AMQP connection established");
        Ok(Arc::new(AmqpConnection { inner: connection }))
    }
}

/// A lapin connection
pub struct AmqpConnection {
    inner: lapin::Connection,
}

#[async_trait]
impl Connection for AmqpConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let channel = self.inner.create_channel().await?;
        debug!("Created channel {}", channel.id());
        Ok(Arc::new(AmqpChannel { inner: channel }))
    }

    async fn close(&self) -> Result<()> {
        if self.inner.status().connected() {
            self.inner.close(200, "OK").await?;
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.inner.status().connected()
    }
}

/// A lapin channel
pub struct AmqpChannel {
    inner: lapin::Channel,
}

fn to_basic_properties(properties: MessageProperties) -> BasicProperties {
    let mut basic = BasicProperties::default();
    if let Some(correlation_id) = properties.correlation_id {
        basic = basic.with_correlation_id(correlation_id.into());
    }
    if let Some(reply_to) = properties.reply_to {
        basic = basic.with_reply_to(reply_to.into());
    }
    if let Some(content_type) = properties.content_type {
        basic = basic.with_content_type(content_type.into());
    }
    if properties.persistent {
        basic = basic.with_delivery_mode(PERSISTENT_DELIVERY_MODE);
    }
    basic
}

fn from_lapin_delivery(delivery: lapin::message::Delivery) -> Delivery {
    let properties = &delivery.properties;
    let properties = MessageProperties {
        correlation_id: properties.correlation_id().as_ref().map(|id| id.to_string()),
        reply_to: properties.reply_to().as_ref().map(|queue| queue.to_string()),
        persistent: *properties.delivery_mode() == Some(PERSISTENT_DELIVERY_MODE),
        content_type: properties.content_type().as_ref().map(|ct| ct.to_string()),
    };

    Delivery {
        delivery_tag: delivery.delivery_tag,
        exchange: delivery.exchange.to_string(),
        routing_key: delivery.routing_key.to_string(),
        redelivered: delivery.redelivered,
        body: delivery.data,
        properties,
    }
}

fn to_lapin_kind(kind: ExchangeKind) -> lapin::ExchangeKind {
    match kind {
        ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        ExchangeKind::Direct => lapin::ExchangeKind::Direct,
        ExchangeKind::Topic => lapin::ExchangeKind::Topic,
    }
}

#[async_trait]
impl Channel for AmqpChannel {
    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let queue = self
            .inner
            .queue_declare(
                name,
                QueueDeclareOptions {
                    durable: options.durable,
                    exclusive: options.exclusive,
                    auto_delete: options.auto_delete,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!("Declared queue: {}", queue.name());
        Ok(queue.name().to_string())
    }

    async fn assert_exchange(&self, name: &str, kind: ExchangeKind, options: ExchangeOptions) -> Result<()> {
        self.inner
            .exchange_declare(
                name,
                to_lapin_kind(kind),
                ExchangeDeclareOptions {
                    durable: options.durable,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!("Declared {} exchange: {}", kind, name);
        Ok(())
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        self.inner
            .queue_bind(
                queue,
                exchange,
                routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await?;

        debug!("Bound queue {} to {} with key '{}'", queue, exchange, routing_key);
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        self.inner.basic_qos(count, BasicQosOptions::default()).await?;
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let consumer_tag = format!("amqp-patterns-{}", Uuid::new_v4());
        let consumer = self
            .inner
            .basic_consume(
                queue,
                &consumer_tag,
                BasicConsumeOptions {
                    no_ack: options.no_ack,
                    exclusive: false,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await?;

        debug!("Created consumer {} for queue: {}", consumer_tag, queue);
        Ok(consumer
            .map(|delivery| delivery.map(from_lapin_delivery).map_err(Into::into))
            .boxed())
    }

    async fn send_to_queue(&self, queue: &str, body: &[u8], properties: MessageProperties) -> Result<()> {
        self.publish("", queue, body, properties).await
    }

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: &[u8],
        properties: MessageProperties,
    ) -> Result<()> {
        self.inner
            .basic_publish(
                exchange,
                routing_key,
                BasicPublishOptions::default(),
                body,
                to_basic_properties(properties),
            )
            .await?
            .await?;

        debug!("Published message to exchange '{}' with key '{}'", exchange, routing_key);
        Ok(())
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        self.inner
            .basic_ack(delivery.delivery_tag, BasicAckOptions::default())
            .await?;
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        self.inner
            .basic_nack(
                delivery.delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue,
                },
            )
            .await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if self.inner.status().connected() {
            self.inner.close(200, "OK").await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_properties_mapping() {
        let basic = to_basic_properties(
            MessageProperties::default()
                .with_correlation_id("abc")
                .with_reply_to("amq.gen-1")
                .with_persistent(true),
        );

        assert_eq!(basic.correlation_id().as_ref().map(|id| id.as_str()), Some("abc"));
        assert_eq!(basic.reply_to().as_ref().map(|q| q.as_str()), Some("amq.gen-1"));
        assert_eq!(*basic.delivery_mode(), Some(PERSISTENT_DELIVERY_MODE));
    }

    #[tokio::test]
    async fn test_connect_to_live_broker() {
        // This test requires RabbitMQ running
        if let Ok(url) = std::env::var("RABBITMQ_URL") {
            let connection = AmqpBroker::new().connect(&url).await.unwrap();
            assert!(connection.is_connected());
            connection.close().await.unwrap();
        }
    }
}
