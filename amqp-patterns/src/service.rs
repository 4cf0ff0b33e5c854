use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::broker::{AmqpBroker, Broker, ExchangeKind, QueueOptions};
use crate::codec;
use crate::connection::{ConnectionConfig, ConnectionManager, ConnectionStats};
use crate::error::{PatternsError, Result};
use crate::handler::{handler_fn, HandlerResult};
use crate::message::{json_properties, Message};
use crate::naming::{Naming, DEFAULT_DIVIDER};
use crate::pattern::{
    Pattern, PatternConfig, PatternInfo, PatternKind, RegisteredHandle, RoutingKeys, EXCHANGE_OPTIONS,
};
use crate::rpc::{RpcClient, RpcConfig, RpcStats};

/// Configuration for a service
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Namespace prefixed to every queue and exchange name
    pub namespace: String,
    pub divider: String,
    pub connection: ConnectionConfig,
    pub rpc: RpcConfig,
}

impl ServiceConfig {
    pub fn new(namespace: impl Into<String>, amqp_url: impl Into<String>) -> Self {
        Self {
            namespace: namespace.into(),
            divider: DEFAULT_DIVIDER.to_string(),
            connection: ConnectionConfig::new(amqp_url),
            rpc: RpcConfig::default(),
        }
    }

    /// Build from the process environment.
    ///
    /// Reads `AMQP_URL` (falling back to `RABBITMQ_URL`), `AMQP_NAMESPACE_DIVIDER`,
    /// `AMQP_RPC_TIMEOUT_MS` and `AMQP_RPC_REPLY_MODE` (`per-call` or `shared`).
    pub fn from_env(namespace: impl Into<String>) -> Result<Self> {
        Self::from_vars(namespace, |key| std::env::var(key).ok())
    }

    fn from_vars<F>(namespace: impl Into<String>, var: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self {
            namespace: namespace.into(),
            divider: DEFAULT_DIVIDER.to_string(),
            connection: ConnectionConfig::default(),
            rpc: RpcConfig::default(),
        };

        if let Some(url) = var("AMQP_URL").or_else(|| var("RABBITMQ_URL")) {
            config.connection.url = url;
        }
        if let Some(divider) = var("AMQP_NAMESPACE_DIVIDER") {
            config.divider = divider;
        }
        if let Some(timeout) = var("AMQP_RPC_TIMEOUT_MS") {
            let millis: u64 = timeout.trim().parse().map_err(|e| {
                PatternsError::config_error(format!("AMQP_RPC_TIMEOUT_MS '{timeout}': {e}"))
            })?;
            config.rpc.call_timeout = Some(Duration::from_millis(millis));
        }
        if let Some(mode) = var("AMQP_RPC_REPLY_MODE") {
            config.rpc.reply_mode = mode.trim().parse()?;
        }

        Ok(config)
    }
}

/// Service operational status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServiceStatus {
    /// Declared but not yet initialized
    Created,
    /// All patterns registered and consuming
    Running,
    ShuttingDown,
    Stopped,
    /// The last initialization attempt failed
    Error(String),
}

struct ServiceState {
    status: ServiceStatus,
    handles: Vec<RegisteredHandle>,
}

/// A namespaced set of consumer patterns plus the operations for talking to
/// other services.
///
/// Patterns are declared with the builder methods and start consuming on
/// [`Service::init`]. Everything shares one broker connection.
pub struct Service {
    config: ServiceConfig,
    naming: Naming,
    connection: Arc<ConnectionManager>,
    rpc: Arc<RpcClient>,
    patterns: Vec<Pattern>,
    rpc_servers: Vec<Pattern>,
    state: Mutex<ServiceState>,
}

impl Service {
    /// Create a service talking to RabbitMQ
    pub fn new(config: ServiceConfig) -> Result<Self> {
        Self::with_broker(config, Arc::new(AmqpBroker::new()))
    }

    /// Convenience constructor with just a namespace and AMQP URL
    pub fn new_simple(namespace: impl Into<String>, amqp_url: impl Into<String>) -> Result<Self> {
        Self::new(ServiceConfig::new(namespace, amqp_url))
    }

    /// Create a service on any broker implementation
    pub fn with_broker(config: ServiceConfig, broker: Arc<dyn Broker>) -> Result<Self> {
        let naming = Naming::new(config.namespace.clone(), config.divider.clone())?;
        let connection = Arc::new(ConnectionManager::with_config(config.connection.clone(), broker));
        let rpc = Arc::new(RpcClient::new(connection.clone(), naming.clone(), config.rpc.clone()));

        Ok(Self {
            config,
            naming,
            connection,
            rpc,
            patterns: Vec::new(),
            rpc_servers: Vec::new(),
            state: Mutex::new(ServiceState {
                status: ServiceStatus::Created,
                handles: Vec::new(),
            }),
        })
    }

    /// Consume `<namespace>.<queue>` as a work queue
    pub fn work_queue<F, Fut>(self, queue: &str, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.work_queue_with(queue, PatternConfig::work_queue(), handler)
    }

    pub fn work_queue_with<F, Fut>(self, queue: &str, config: PatternConfig, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = self.naming.queue_name(queue);
        let pattern = Pattern::work_queue(name.clone(), handler_fn(name, handler)).with_config(config);
        self.add_pattern(pattern)
    }

    /// Subscribe to every message published on `<namespace>.<exchange>`
    pub fn pub_sub<F, Fut>(self, exchange: &str, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.pub_sub_with(exchange, PatternConfig::subscription(ExchangeKind::Fanout), handler)
    }

    pub fn pub_sub_with<F, Fut>(self, exchange: &str, config: PatternConfig, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = self.naming.exchange_name(exchange);
        let pattern = Pattern::pub_sub(name.clone(), handler_fn(name, handler)).with_config(config);
        self.add_pattern(pattern)
    }

    /// Subscribe to `<namespace>.<exchange>` for exact routing keys
    pub fn routed<F, Fut>(self, exchange: &str, routes: impl Into<RoutingKeys>, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.routed_with(exchange, routes, PatternConfig::subscription(ExchangeKind::Direct), handler)
    }

    pub fn routed_with<F, Fut>(
        self,
        exchange: &str,
        routes: impl Into<RoutingKeys>,
        config: PatternConfig,
        handler: F,
    ) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = self.naming.exchange_name(exchange);
        let pattern = Pattern::routed(name.clone(), routes, handler_fn(name, handler)).with_config(config);
        self.add_pattern(pattern)
    }

    /// Subscribe to `<namespace>.<exchange>` with topic wildcards (`*`, `#`)
    pub fn topic<F, Fut>(self, exchange: &str, topics: impl Into<RoutingKeys>, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.topic_with(exchange, topics, PatternConfig::subscription(ExchangeKind::Topic), handler)
    }

    pub fn topic_with<F, Fut>(
        self,
        exchange: &str,
        topics: impl Into<RoutingKeys>,
        config: PatternConfig,
        handler: F,
    ) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = self.naming.exchange_name(exchange);
        let pattern = Pattern::topic(name.clone(), topics, handler_fn(name, handler)).with_config(config);
        self.add_pattern(pattern)
    }

    /// Answer calls to `<namespace>.rpc.<name>`.
    ///
    /// Returning `Ok(None)` replies with JSON `null`.
    pub fn rpc<F, Fut>(self, name: &str, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        self.rpc_with(name, PatternConfig::rpc_server(), handler)
    }

    pub fn rpc_with<F, Fut>(self, name: &str, config: PatternConfig, handler: F) -> Self
    where
        F: Fn(Message) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = HandlerResult> + Send + 'static,
    {
        let name = self.naming.rpc_name(name);
        let pattern = Pattern::rpc_server(name.clone(), handler_fn(name, handler)).with_config(config);
        self.add_pattern(pattern)
    }

    /// Add a prebuilt pattern; its name must already be fully qualified
    pub fn add_pattern(mut self, pattern: Pattern) -> Self {
        debug!("Declared {} pattern {}", pattern.kind(), pattern.name());
        match pattern.kind() {
            PatternKind::RpcServer => self.rpc_servers.push(pattern),
            _ => self.patterns.push(pattern),
        }
        self
    }

    /// Connect and register every declared pattern, RPC servers last.
    ///
    /// Calling it again on a running service is a no-op. If any registration
    /// fails, the ones that succeeded are torn down and the error returned.
    pub async fn init(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.status == ServiceStatus::Running {
            debug!("Service {} already initialized", self.naming.namespace());
            return Ok(());
        }

        info!("🚀 Initializing service {}", self.naming.namespace());
        let connection = match self.connection.connect().await {
            Ok(connection) => connection,
            Err(e) => {
                state.status = ServiceStatus::Error(e.to_string());
                return Err(e);
            }
        };

        let mut handles = Vec::with_capacity(self.patterns.len() + self.rpc_servers.len());
        for pattern in self.patterns.iter().chain(self.rpc_servers.iter()) {
            match pattern.register(&connection).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!("❌ Failed to register {} pattern {}: {}", pattern.kind(), pattern.name(), e);
                    for handle in handles {
                        if let Err(e) = handle.shutdown().await {
                            debug!("Error tearing down partial registration: {}", e);
                        }
                    }
                    state.status = ServiceStatus::Error(e.to_string());
                    return Err(e);
                }
            }
        }

        state.handles = handles;
        self.rpc.ensure_expiry_sweep().await;
        state.status = ServiceStatus::Running;

        info!(
            "✅ Service {} running with {} pattern(s) and {} RPC server(s)",
            self.naming.namespace(),
            self.patterns.len(),
            self.rpc_servers.len()
        );
        Ok(())
    }

    /// Send a persistent message to the work queue `<namespace>.<queue>`
    pub async fn broadcast(&self, queue: &str, args: impl Serialize) -> Result<()> {
        let queue = self.naming.queue_name(queue);
        let channel = self.connection.create_channel().await?;

        let sent = async {
            channel
                .assert_queue(
                    &queue,
                    QueueOptions {
                        durable: true,
                        ..Default::default()
                    },
                )
                .await?;
            channel.send_to_queue(&queue, &codec::encode(&args), json_properties(true)).await
        }
        .await;

        close_after_send(channel.close().await, &queue);
        debug!("Sent work to {}", queue);
        sent
    }

    /// Publish to every subscriber of `<namespace>.<exchange>`
    pub async fn publish(&self, exchange: &str, args: impl Serialize) -> Result<()> {
        self.publish_to(exchange, ExchangeKind::Fanout, "", &codec::encode(&args)).await
    }

    /// Publish to `<namespace>.<exchange>` with an exact routing key
    pub async fn publish_routed(&self, exchange: &str, routing_key: &str, args: impl Serialize) -> Result<()> {
        self.publish_to(exchange, ExchangeKind::Direct, routing_key, &codec::encode(&args)).await
    }

    /// Publish to `<namespace>.<exchange>` with a dotted topic key
    pub async fn publish_topic(&self, exchange: &str, routing_key: &str, args: impl Serialize) -> Result<()> {
        self.publish_to(exchange, ExchangeKind::Topic, routing_key, &codec::encode(&args)).await
    }

    async fn publish_to(&self, exchange: &str, kind: ExchangeKind, routing_key: &str, body: &[u8]) -> Result<()> {
        let exchange = self.naming.exchange_name(exchange);
        let channel = self.connection.create_channel().await?;

        let sent = async {
            channel
                .assert_exchange(&exchange, kind, EXCHANGE_OPTIONS)
                .await?;
            channel
                .publish(&exchange, routing_key, body, json_properties(false))
                .await
        }
        .await;

        close_after_send(channel.close().await, &exchange);
        debug!("Published to {} (routing key '{}')", exchange, routing_key);
        sent
    }

    /// Call `<namespace>.rpc.<name>` and wait for its reply
    pub async fn call_rpc(&self, name: &str, args: impl Serialize) -> Result<Value> {
        self.rpc.call(name, args).await
    }

    pub async fn call_rpc_with_timeout(&self, name: &str, args: impl Serialize, timeout: Duration) -> Result<Value> {
        self.rpc.call_with_timeout(name, args, timeout).await
    }

    /// Call and deserialize the reply
    pub async fn call_rpc_as<T: DeserializeOwned>(&self, name: &str, args: impl Serialize) -> Result<T> {
        self.rpc.call_as(name, args).await
    }

    /// Get the RPC client for calling other services
    pub fn rpc_client(&self) -> Arc<RpcClient> {
        self.rpc.clone()
    }

    pub fn naming(&self) -> &Naming {
        &self.naming
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    /// Every declared pattern, RPC servers last
    pub fn patterns(&self) -> impl Iterator<Item = &Pattern> {
        self.patterns.iter().chain(self.rpc_servers.iter())
    }

    /// Stop all consumers and close the connection
    pub async fn shutdown(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.status == ServiceStatus::Stopped {
            return Ok(());
        }

        info!("🛑 Shutting down service {}", self.naming.namespace());
        state.status = ServiceStatus::ShuttingDown;

        for handle in state.handles.drain(..) {
            let name = handle.name().to_string();
            if let Err(e) = handle.shutdown().await {
                warn!("Error stopping consumer {}: {}", name, e);
            }
        }
        if let Err(e) = self.rpc.close().await {
            warn!("Error closing RPC client: {}", e);
        }
        self.connection.close().await?;

        state.status = ServiceStatus::Stopped;
        info!("Service {} stopped", self.naming.namespace());
        Ok(())
    }

    /// Initialize, then serve until ctrl-c
    pub async fn run(&self) -> Result<()> {
        self.init().await?;
        tokio::signal::ctrl_c().await?;
        info!("Received ctrl-c");
        self.shutdown().await
    }

    pub async fn status(&self) -> ServiceStatus {
        self.state.lock().await.status.clone()
    }

    /// Check if service is healthy
    pub async fn is_healthy(&self) -> bool {
        self.status().await == ServiceStatus::Running && self.connection.is_connected().await
    }

    /// Get service statistics
    pub async fn get_stats(&self) -> ServiceStats {
        let (status, registered) = {
            let state = self.state.lock().await;
            (state.status.clone(), state.handles.len())
        };

        ServiceStats {
            namespace: self.naming.namespace().to_string(),
            status,
            patterns: self.patterns().map(Pattern::info).collect(),
            registered,
            connection_stats: self.connection.get_stats().await,
            rpc_stats: self.rpc.get_stats().await,
        }
    }
}

fn close_after_send(closed: Result<()>, target: &str) {
    if let Err(e) = closed {
        debug!("Failed to close send channel for {}: {}", target, e);
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("namespace", &self.naming.namespace())
            .field("patterns", &self.patterns)
            .field("rpc_servers", &self.rpc_servers)
            .finish()
    }
}

/// Service statistics for monitoring
#[derive(Debug, Clone, Serialize)]
pub struct ServiceStats {
    pub namespace: String,
    pub status: ServiceStatus,
    pub patterns: Vec<PatternInfo>,
    /// Patterns currently consuming
    pub registered: usize,
    pub connection_stats: ConnectionStats,
    pub rpc_stats: RpcStats,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use serde_json::json;
    use std::collections::HashMap;

    fn memory_service(broker: &MemoryBroker) -> Service {
        Service::with_broker(ServiceConfig::new("model.user", "memory://test"), Arc::new(broker.clone())).unwrap()
    }

    #[test]
    fn test_config_from_vars() {
        let vars: HashMap<&str, &str> = [
            ("RABBITMQ_URL", "amqp://rabbit:5672"),
            ("AMQP_NAMESPACE_DIVIDER", ":"),
            ("AMQP_RPC_TIMEOUT_MS", "2500"),
            ("AMQP_RPC_REPLY_MODE", "shared"),
        ]
        .into_iter()
        .collect();

        let config = ServiceConfig::from_vars("billing", |key| vars.get(key).map(|v| v.to_string())).unwrap();
        assert_eq!(config.connection.url, "amqp://rabbit:5672");
        assert_eq!(config.divider, ":");
        assert_eq!(config.rpc.call_timeout, Some(Duration::from_millis(2500)));
        assert_eq!(config.rpc.reply_mode, crate::rpc::ReplyMode::Shared);
    }

    #[test]
    fn test_config_from_vars_defaults_and_errors() {
        let config = ServiceConfig::from_vars("billing", |_| None).unwrap();
        assert_eq!(config.connection.url, "amqp://localhost:5672");
        assert_eq!(config.divider, ".");
        assert_eq!(config.rpc.call_timeout, None);

        let bad_timeout = ServiceConfig::from_vars("billing", |key| {
            (key == "AMQP_RPC_TIMEOUT_MS").then(|| "soon".to_string())
        });
        assert!(matches!(bad_timeout, Err(PatternsError::Config(_))));
    }

    #[test]
    fn test_empty_namespace_is_rejected() {
        let result = Service::with_broker(ServiceConfig::new("", "memory://test"), Arc::new(MemoryBroker::new()));
        assert!(matches!(result, Err(PatternsError::Config(_))));
    }

    #[tokio::test]
    async fn test_builder_qualifies_names() {
        let service = memory_service(&MemoryBroker::new())
            .work_queue("email", |_msg| async { Ok(None) })
            .routed("crud", ["create", "delete"], |_msg| async { Ok(None) })
            .rpc("getPassword", |_msg| async { Ok(Some(json!({"password": "abc123"}))) })
            .pub_sub("save", |_msg| async { Ok(None) });

        let names: Vec<_> = service.patterns().map(|p| p.name().to_string()).collect();
        assert_eq!(
            names,
            vec!["model.user.email", "model.user.crud", "model.user.save", "model.user.rpc.getPassword"]
        );
    }

    #[tokio::test]
    async fn test_init_is_idempotent() {
        let broker = MemoryBroker::new();
        let service = memory_service(&broker).work_queue("email", |_msg| async { Ok(None) });

        service.init().await.unwrap();
        service.init().await.unwrap();

        assert_eq!(broker.consumer_count("model.user.email").await, 1);
        let stats = service.get_stats().await;
        assert_eq!(stats.registered, 1);
        assert_eq!(stats.status, ServiceStatus::Running);
        assert!(service.is_healthy().await);
    }

    #[tokio::test]
    async fn test_failed_init_tears_down_partial_registrations() {
        let broker = MemoryBroker::new();
        let service = memory_service(&broker)
            .work_queue("email", |_msg| async { Ok(None) })
            .routed("crud", Vec::<String>::new(), |_msg| async { Ok(None) });

        assert!(matches!(service.init().await, Err(PatternsError::Config(_))));
        assert_eq!(broker.consumer_count("model.user.email").await, 0);
        assert!(matches!(service.status().await, ServiceStatus::Error(_)));
    }

    #[tokio::test]
    async fn test_broadcast_declares_durable_queue() {
        let broker = MemoryBroker::new();
        let service = memory_service(&broker);

        service.broadcast("email", json!({"to": "ada@example.com"})).await.unwrap();
        assert_eq!(broker.queue_depth("model.user.email").await, Some(1));
    }

    #[tokio::test]
    async fn test_shutdown_stops_consumers() {
        let broker = MemoryBroker::new();
        let service = memory_service(&broker).work_queue("email", |_msg| async { Ok(None) });

        service.init().await.unwrap();
        service.shutdown().await.unwrap();

        assert_eq!(broker.consumer_count("model.user.email").await, 0);
        assert_eq!(service.status().await, ServiceStatus::Stopped);
        assert!(!service.is_healthy().await);
    }
}
