//! Consumer patterns: work queue, pub/sub, routed, topic and RPC server.
//!
//! A [`Pattern`] is declared once and registered against a broker connection.
//! Registration opens a dedicated channel, declares the exchange/queue
//! topology for its kind and spawns the consumer loop that feeds decoded
//! messages to the handler.

use futures_util::StreamExt;
use serde::Serialize;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{
    Channel, ConsumeOptions, Connection, Delivery, DeliveryStream, ExchangeKind, ExchangeOptions,
    QueueOptions,
};
use crate::codec;
use crate::error::{PatternsError, Result};
use crate::handler::{self, MessageHandler};
use crate::message::{json_properties, Message};

/// Unacknowledged deliveries a queue consumer may hold at once
pub const QUEUE_PREFETCH: u16 = 1;

/// Pause before requeueing a delivery that already failed once
pub const REDELIVERY_BACKOFF: Duration = Duration::from_millis(250);

/// Subscribers and publishers must declare exchanges identically
pub(crate) const EXCHANGE_OPTIONS: ExchangeOptions = ExchangeOptions { durable: false };

/// Routing keys or topic patterns a queue is bound with.
///
/// Duplicates are dropped; first-seen order is kept.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RoutingKeys(Vec<String>);

impl RoutingKeys {
    pub fn new<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut unique: Vec<String> = Vec::new();
        for key in keys {
            let key = key.into();
            if !unique.contains(&key) {
                unique.push(key);
            }
        }
        Self(unique)
    }

    pub fn iter(&self) -> impl Iterator<Item = &str> {
        self.0.iter().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for RoutingKeys {
    fn from(key: &str) -> Self {
        Self::new([key])
    }
}

impl From<String> for RoutingKeys {
    fn from(key: String) -> Self {
        Self::new([key])
    }
}

impl From<Vec<String>> for RoutingKeys {
    fn from(keys: Vec<String>) -> Self {
        Self::new(keys)
    }
}

impl From<Vec<&str>> for RoutingKeys {
    fn from(keys: Vec<&str>) -> Self {
        Self::new(keys)
    }
}

impl From<&[&str]> for RoutingKeys {
    fn from(keys: &[&str]) -> Self {
        Self::new(keys.iter().copied())
    }
}

impl<const N: usize> From<[&str; N]> for RoutingKeys {
    fn from(keys: [&str; N]) -> Self {
        Self::new(keys)
    }
}

/// The closed set of consumer patterns
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PatternKind {
    /// Named durable queue, one message per worker at a time
    WorkQueue,
    /// Fanout exchange; every subscriber receives every message
    PubSub,
    /// Direct exchange; exact routing-key match
    Routed { routes: RoutingKeys },
    /// Topic exchange; wildcard matching done by the broker
    Topic { topics: RoutingKeys },
    /// Named queue answering requests on their `reply_to` address
    RpcServer,
}

impl PatternKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::WorkQueue => "work-queue",
            Self::PubSub => "pub-sub",
            Self::Routed { .. } => "routed",
            Self::Topic { .. } => "topic",
            Self::RpcServer => "rpc",
        }
    }

    /// Queue-style kinds acknowledge after the handler; subscriptions don't
    pub fn acknowledges(&self) -> bool {
        matches!(self, Self::WorkQueue | Self::RpcServer)
    }

    /// Exchange type a subscription kind binds to; `None` for queue kinds
    pub fn exchange_kind(&self) -> Option<ExchangeKind> {
        match self {
            Self::WorkQueue | Self::RpcServer => None,
            Self::PubSub => Some(ExchangeKind::Fanout),
            Self::Routed { .. } => Some(ExchangeKind::Direct),
            Self::Topic { .. } => Some(ExchangeKind::Topic),
        }
    }

    pub fn routing_keys(&self) -> Option<&RoutingKeys> {
        match self {
            Self::Routed { routes } => Some(routes),
            Self::Topic { topics } => Some(topics),
            _ => None,
        }
    }
}

impl fmt::Display for PatternKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Per-pattern topology settings
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PatternConfig {
    /// Durability of the named queue. Subscriptions must leave it false.
    pub durable: bool,
    pub exclusive: bool,
    pub auto_delete: bool,
    /// Must match the pattern kind: `None` for plain queues
    pub exchange_kind: Option<ExchangeKind>,
    pub prefetch: Option<u16>,
}

impl PatternConfig {
    pub fn work_queue() -> Self {
        Self {
            durable: true,
            exclusive: false,
            auto_delete: false,
            exchange_kind: None,
            prefetch: Some(QUEUE_PREFETCH),
        }
    }

    pub fn rpc_server() -> Self {
        Self {
            durable: false,
            ..Self::work_queue()
        }
    }

    /// Exclusive broker-named queue bound to a non-durable exchange
    pub fn subscription(exchange_kind: ExchangeKind) -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: false,
            exchange_kind: Some(exchange_kind),
            prefetch: None,
        }
    }

    pub fn for_kind(kind: &PatternKind) -> Self {
        match (kind, kind.exchange_kind()) {
            (PatternKind::RpcServer, _) => Self::rpc_server(),
            (_, Some(exchange_kind)) => Self::subscription(exchange_kind),
            (_, None) => Self::work_queue(),
        }
    }

    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    fn queue_options(&self) -> QueueOptions {
        QueueOptions {
            durable: self.durable,
            exclusive: self.exclusive,
            auto_delete: self.auto_delete,
        }
    }
}

/// Serializable summary of a declared pattern
#[derive(Debug, Clone, Serialize)]
pub struct PatternInfo {
    pub name: String,
    pub kind: &'static str,
    pub routing_keys: Option<RoutingKeys>,
}

/// One consumer registration: a fully-qualified name, its kind and a handler
#[derive(Clone)]
pub struct Pattern {
    name: String,
    kind: PatternKind,
    config: PatternConfig,
    handler: Arc<dyn MessageHandler>,
}

impl Pattern {
    /// `name` is the fully-qualified queue or exchange name
    pub fn new(name: impl Into<String>, kind: PatternKind, handler: Arc<dyn MessageHandler>) -> Self {
        let config = PatternConfig::for_kind(&kind);
        Self {
            name: name.into(),
            kind,
            config,
            handler,
        }
    }

    pub fn work_queue(queue: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self::new(queue, PatternKind::WorkQueue, handler)
    }

    pub fn pub_sub(exchange: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self::new(exchange, PatternKind::PubSub, handler)
    }

    pub fn routed(
        exchange: impl Into<String>,
        routes: impl Into<RoutingKeys>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self::new(exchange, PatternKind::Routed { routes: routes.into() }, handler)
    }

    pub fn topic(
        exchange: impl Into<String>,
        topics: impl Into<RoutingKeys>,
        handler: Arc<dyn MessageHandler>,
    ) -> Self {
        Self::new(exchange, PatternKind::Topic { topics: topics.into() }, handler)
    }

    pub fn rpc_server(queue: impl Into<String>, handler: Arc<dyn MessageHandler>) -> Self {
        Self::new(queue, PatternKind::RpcServer, handler)
    }

    /// Override the default topology settings; prefetch stays fixed
    pub fn with_config(mut self, config: PatternConfig) -> Self {
        let prefetch = self.config.prefetch;
        self.config = PatternConfig { prefetch, ..config };
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &PatternKind {
        &self.kind
    }

    pub fn config(&self) -> &PatternConfig {
        &self.config
    }

    pub fn info(&self) -> PatternInfo {
        PatternInfo {
            name: self.name.clone(),
            kind: self.kind.label(),
            routing_keys: self.kind.routing_keys().cloned(),
        }
    }

    fn validate(&self) -> Result<()> {
        if self.kind.routing_keys().is_some_and(RoutingKeys::is_empty) {
            return Err(PatternsError::config_error(format!(
                "{} pattern '{}' needs at least one routing key",
                self.kind, self.name
            )));
        }

        let expected = self.kind.exchange_kind();
        if self.config.exchange_kind != expected {
            return Err(PatternsError::config_error(format!(
                "{} pattern '{}' uses exchange type {:?}, not {:?}",
                self.kind, self.name, expected, self.config.exchange_kind
            )));
        }
        if expected.is_some() && self.config.durable {
            return Err(PatternsError::config_error(format!(
                "{} pattern '{}' cannot be durable: publishers declare its exchange non-durable",
                self.kind, self.name
            )));
        }
        Ok(())
    }

    /// Open a channel, declare the topology and start consuming
    pub async fn register(&self, connection: &Arc<dyn Connection>) -> Result<RegisteredHandle> {
        self.validate()?;

        let channel = connection.create_channel().await?;
        let started = async {
            let queue = self.declare(channel.as_ref()).await?;
            let deliveries = channel
                .consume(
                    &queue,
                    ConsumeOptions {
                        no_ack: !self.kind.acknowledges(),
                    },
                )
                .await?;
            Ok::<_, PatternsError>((queue, deliveries))
        }
        .await;

        let (queue, deliveries) = match started {
            Ok(started) => started,
            Err(e) => {
                if let Err(close_error) = channel.close().await {
                    debug!("Failed to close channel after setup error: {}", close_error);
                }
                return Err(e);
            }
        };

        let consumer = Consumer {
            name: self.name.clone(),
            kind: self.kind.clone(),
            channel: channel.clone(),
            handler: self.handler.clone(),
        };
        let task = tokio::spawn(consumer.run(deliveries));

        info!("Registered {} pattern {} on queue {}", self.kind, self.name, queue);
        Ok(RegisteredHandle {
            name: self.name.clone(),
            kind: self.kind.label(),
            queue,
            channel,
            task,
        })
    }

    async fn declare(&self, channel: &dyn Channel) -> Result<String> {
        match &self.kind {
            PatternKind::WorkQueue | PatternKind::RpcServer => {
                let queue = channel.assert_queue(&self.name, self.config.queue_options()).await?;
                if let Some(prefetch) = self.config.prefetch {
                    channel.prefetch(prefetch).await?;
                }
                Ok(queue)
            }
            PatternKind::PubSub => self.declare_subscription(channel, ExchangeKind::Fanout, [""]).await,
            PatternKind::Routed { routes } => {
                self.declare_subscription(channel, ExchangeKind::Direct, routes.iter()).await
            }
            PatternKind::Topic { topics } => {
                self.declare_subscription(channel, ExchangeKind::Topic, topics.iter()).await
            }
        }
    }

    async fn declare_subscription<'k>(
        &self,
        channel: &dyn Channel,
        exchange_kind: ExchangeKind,
        keys: impl IntoIterator<Item = &'k str>,
    ) -> Result<String> {
        channel
            .assert_exchange(&self.name, exchange_kind, EXCHANGE_OPTIONS)
            .await?;

        let queue = channel
            .assert_queue(
                "",
                QueueOptions {
                    durable: false,
                    exclusive: self.config.exclusive,
                    auto_delete: self.config.auto_delete,
                },
            )
            .await?;

        for key in keys {
            channel.bind_queue(&queue, &self.name, key).await?;
        }
        Ok(queue)
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pattern")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("config", &self.config)
            .field("handler", &self.handler.name())
            .finish()
    }
}

/// State owned by one consumer loop
struct Consumer {
    name: String,
    kind: PatternKind,
    channel: Arc<dyn Channel>,
    handler: Arc<dyn MessageHandler>,
}

impl Consumer {
    async fn run(self, mut deliveries: DeliveryStream) {
        debug!("Consumer loop started for {}", self.name);

        while let Some(delivery) = deliveries.next().await {
            match delivery {
                Ok(delivery) => self.process(delivery).await,
                Err(e) => error!("Error receiving message on {}: {}", self.name, e),
            }
        }

        warn!("Consumer loop stopped for {}", self.name);
    }

    async fn process(&self, delivery: Delivery) {
        let message = Message::from_delivery(&delivery);
        let result = handler::invoke(&self.handler, message).await;

        match self.kind {
            PatternKind::WorkQueue => self.settle(&delivery, result.map(|_| ())).await,
            PatternKind::RpcServer => {
                let outcome = match result {
                    Ok(reply) => self.reply(&delivery, reply).await,
                    Err(e) => Err(e),
                };
                self.settle(&delivery, outcome).await;
            }
            PatternKind::PubSub | PatternKind::Routed { .. } | PatternKind::Topic { .. } => {
                if let Err(e) = result {
                    warn!("Handler for {} failed, dropping delivery: {}", self.name, e);
                }
            }
        }
    }

    async fn reply(&self, request: &Delivery, reply: Option<Value>) -> Result<()> {
        let Some(reply_to) = request.properties.reply_to.as_deref() else {
            warn!("RPC request on {} has no reply_to, result discarded", self.name);
            return Ok(());
        };

        let mut properties = json_properties(false);
        properties.correlation_id = request.properties.correlation_id.clone();

        let body = codec::encode(&reply.unwrap_or(Value::Null));
        self.channel.send_to_queue(reply_to, &body, properties).await?;

        debug!(
            "Replied to {} for {} (correlation_id: {:?})",
            reply_to, self.name, request.properties.correlation_id
        );
        Ok(())
    }

    /// Ack on success; nack with requeue so the broker redelivers on failure
    async fn settle(&self, delivery: &Delivery, outcome: Result<()>) {
        match outcome {
            Ok(()) => {
                if let Err(e) = self.channel.ack(delivery).await {
                    error!("Failed to acknowledge message on {}: {}", self.name, e);
                }
            }
            Err(e) => {
                if delivery.redelivered {
                    warn!(
                        "Redelivered message on {} failed again, requeueing in {:?}: {}",
                        self.name, REDELIVERY_BACKOFF, e
                    );
                    tokio::time::sleep(REDELIVERY_BACKOFF).await;
                } else {
                    error!("Handler for {} failed, requeueing: {}", self.name, e);
                }
                if let Err(e) = self.channel.nack(delivery, true).await {
                    error!("Failed to requeue message on {}: {}", self.name, e);
                }
            }
        }
    }
}

/// A live registration returned by [`Pattern::register`]
pub struct RegisteredHandle {
    name: String,
    kind: &'static str,
    queue: String,
    channel: Arc<dyn Channel>,
    task: JoinHandle<()>,
}

impl RegisteredHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    /// The queue actually consumed (broker-generated for subscriptions)
    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }

    /// Close the channel and stop the consumer loop
    pub async fn shutdown(self) -> Result<()> {
        let closed = self.channel.close().await;
        self.task.abort();
        debug!("Stopped consumer for {}", self.name);
        closed
    }
}

impl fmt::Debug for RegisteredHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegisteredHandle")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("queue", &self.queue)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Broker, MemoryBroker, MessageProperties};
    use crate::handler::handler_fn;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::mpsc;

    fn noop() -> Arc<dyn MessageHandler> {
        handler_fn("noop", |_msg: Message| async move { Ok(None) })
    }

    async fn connect(broker: &MemoryBroker) -> Arc<dyn Connection> {
        broker.connect("memory://test").await.unwrap()
    }

    #[test]
    fn test_routing_keys_collapse_duplicates() {
        let keys = RoutingKeys::from(["create", "read", "create"]);
        assert_eq!(keys.iter().collect::<Vec<_>>(), vec!["create", "read"]);
        assert_eq!(RoutingKeys::from("create").len(), 1);
        assert!(RoutingKeys::from(Vec::<String>::new()).is_empty());
    }

    #[test]
    fn test_default_configs() {
        let work = PatternConfig::work_queue();
        assert!(work.durable);
        assert_eq!(work.prefetch, Some(1));

        let rpc = PatternConfig::rpc_server();
        assert!(!rpc.durable);
        assert_eq!(rpc.prefetch, Some(1));

        let sub = PatternConfig::for_kind(&PatternKind::Topic { topics: "a.*".into() });
        assert!(sub.exclusive);
        assert!(!sub.durable);
        assert_eq!(sub.exchange_kind, Some(ExchangeKind::Topic));
    }

    #[test]
    fn test_with_config_keeps_prefetch() {
        let pattern = Pattern::work_queue("svc.jobs", noop()).with_config(PatternConfig {
            prefetch: Some(50),
            ..PatternConfig::work_queue().with_durable(false)
        });
        assert!(!pattern.config().durable);
        assert_eq!(pattern.config().prefetch, Some(QUEUE_PREFETCH));
    }

    #[tokio::test]
    async fn test_work_queue_declares_durable_named_queue() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker).await;

        let handle = Pattern::work_queue("svc.email", noop()).register(&connection).await.unwrap();
        assert_eq!(handle.queue(), "svc.email");
        assert_eq!(handle.kind(), "work-queue");
        assert!(broker.queue_exists("svc.email").await);
        assert_eq!(broker.consumer_count("svc.email").await, 1);
    }

    #[tokio::test]
    async fn test_routed_binds_once_per_key() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker).await;

        let handle = Pattern::routed("svc.crud", ["create", "delete"], noop())
            .register(&connection)
            .await
            .unwrap();

        let mut bindings = broker.bound_queues("svc.crud").await;
        bindings.sort();
        assert_eq!(
            bindings,
            vec![
                (handle.queue().to_string(), "create".to_string()),
                (handle.queue().to_string(), "delete".to_string()),
            ]
        );
        assert!(handle.queue().starts_with("amq.gen-"));
    }

    #[tokio::test]
    async fn test_routed_without_keys_is_rejected() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker).await;

        let result = Pattern::routed("svc.crud", Vec::<String>::new(), noop())
            .register(&connection)
            .await;
        assert!(matches!(result, Err(PatternsError::Config(_))));
        assert!(!broker.exchange_exists("svc.crud").await);
    }

    #[tokio::test]
    async fn test_exchange_kind_must_match_pattern_kind() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker).await;

        let result = Pattern::routed("svc.crud", ["create"], noop())
            .with_config(PatternConfig::subscription(ExchangeKind::Fanout))
            .register(&connection)
            .await;
        assert!(matches!(result, Err(PatternsError::Config(_))));
        assert!(!broker.exchange_exists("svc.crud").await);

        let result = Pattern::work_queue("svc.jobs", noop())
            .with_config(PatternConfig::subscription(ExchangeKind::Direct))
            .register(&connection)
            .await;
        assert!(matches!(result, Err(PatternsError::Config(_))));
    }

    #[tokio::test]
    async fn test_durable_subscription_is_rejected() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker).await;

        let result = Pattern::pub_sub("svc.save", noop())
            .with_config(PatternConfig::subscription(ExchangeKind::Fanout).with_durable(true))
            .register(&connection)
            .await;
        assert!(matches!(result, Err(PatternsError::Config(_))));
        assert!(!broker.exchange_exists("svc.save").await);
    }

    #[tokio::test]
    async fn test_repeated_failure_is_requeued_with_backoff() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker).await;
        let attempts = Arc::new(AtomicUsize::new(0));

        let handler = handler_fn("poison", {
            let attempts = attempts.clone();
            move |_msg: Message| {
                let attempts = attempts.clone();
                async move {
                    attempts.fetch_add(1, Ordering::SeqCst);
                    Err(PatternsError::handler_error("always fails"))
                }
            }
        });
        let _handle = Pattern::work_queue("svc.jobs", handler).register(&connection).await.unwrap();

        let producer = connection.create_channel().await.unwrap();
        producer.send_to_queue("svc.jobs", b"{}", MessageProperties::default()).await.unwrap();

        tokio::time::sleep(REDELIVERY_BACKOFF + Duration::from_millis(100)).await;
        let seen = attempts.load(Ordering::SeqCst);
        assert!((2..=3).contains(&seen), "handler ran {seen} times");
    }

    #[tokio::test]
    async fn test_rpc_server_replies_with_correlation_id() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker).await;
        let handler = handler_fn("double", |msg: Message| async move {
            let n = msg.payload["n"].as_i64().unwrap_or_default();
            Ok(Some(json!({"doubled": n * 2})))
        });
        let _handle = Pattern::rpc_server("svc.rpc.double", handler).register(&connection).await.unwrap();

        let client = connection.create_channel().await.unwrap();
        let reply_queue = client
            .assert_queue("", QueueOptions { exclusive: true, ..Default::default() })
            .await
            .unwrap();
        let mut replies = client.consume(&reply_queue, ConsumeOptions { no_ack: true }).await.unwrap();
        client
            .send_to_queue(
                "svc.rpc.double",
                br#"{"n":21}"#,
                MessageProperties::default()
                    .with_correlation_id("c-1")
                    .with_reply_to(reply_queue.clone()),
            )
            .await
            .unwrap();

        let reply = tokio::time::timeout(Duration::from_secs(1), replies.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(reply.properties.correlation_id.as_deref(), Some("c-1"));
        assert_eq!(codec::decode(&reply.body), json!({"doubled": 42}));
    }

    #[tokio::test]
    async fn test_failed_work_is_redelivered() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker).await;
        let attempts = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        let handler = handler_fn("flaky", {
            let attempts = attempts.clone();
            move |msg: Message| {
                let attempts = attempts.clone();
                let done_tx = done_tx.clone();
                async move {
                    if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                        return Err(PatternsError::handler_error("first attempt fails"));
                    }
                    let _ = done_tx.send(msg.redelivered);
                    Ok(None)
                }
            }
        });
        let _handle = Pattern::work_queue("svc.jobs", handler).register(&connection).await.unwrap();

        let producer = connection.create_channel().await.unwrap();
        producer.send_to_queue("svc.jobs", b"{}", MessageProperties::default()).await.unwrap();

        let redelivered = tokio::time::timeout(Duration::from_secs(1), done_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(redelivered);
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_shutdown_stops_consuming() {
        let broker = MemoryBroker::new();
        let connection = connect(&broker).await;

        let handle = Pattern::work_queue("svc.jobs", noop()).register(&connection).await.unwrap();
        handle.shutdown().await.unwrap();
        assert_eq!(broker.consumer_count("svc.jobs").await, 0);
    }
}
