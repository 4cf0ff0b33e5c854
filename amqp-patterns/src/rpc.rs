//! Client side of request/reply RPC.
//!
//! Every call carries a fresh [`CorrelationId`] and waits on an entry in the
//! [`PendingCalls`] table. Replies are matched against that table, so one reply
//! queue can safely serve many concurrent calls.

use futures_util::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::broker::{Channel, ConsumeOptions, Delivery, DeliveryStream, QueueOptions};
use crate::codec;
use crate::connection::ConnectionManager;
use crate::error::{PatternsError, Result};
use crate::message::json_properties;
use crate::naming::Naming;

/// Opaque token pairing an RPC request with its reply
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CorrelationId(String);

impl CorrelationId {
    /// Random v4 UUID
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CorrelationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CorrelationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for CorrelationId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for CorrelationId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Where replies for outgoing calls are received
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReplyMode {
    /// A private auto-delete reply queue and channel per call
    #[default]
    PerCall,
    /// One reply queue per client, demultiplexed by correlation id
    Shared,
}

impl std::str::FromStr for ReplyMode {
    type Err = PatternsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "per-call" => Ok(Self::PerCall),
            "shared" => Ok(Self::Shared),
            other => Err(PatternsError::config_error(format!(
                "unknown RPC reply mode '{other}' (expected 'per-call' or 'shared')"
            ))),
        }
    }
}

/// RPC client settings
#[derive(Debug, Clone, Default)]
pub struct RpcConfig {
    pub reply_mode: ReplyMode,
    /// Upper bound on waiting for a reply. `None` waits indefinitely.
    pub call_timeout: Option<Duration>,
    /// When set, a background sweep fails and removes calls older than this
    pub pending_expiry: Option<Duration>,
}

/// An outstanding call awaiting its reply
#[derive(Debug)]
pub struct PendingCall {
    resolver: oneshot::Sender<Result<Value>>,
    created_at: Instant,
}

impl PendingCall {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }
}

/// Outstanding calls keyed by correlation id.
///
/// Inserted by the calling task, removed by whichever of reply, cancellation
/// or expiry sweep gets there first.
#[derive(Debug, Default)]
pub struct PendingCalls {
    calls: Mutex<HashMap<String, PendingCall>>,
}

impl PendingCalls {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a call; the receiver resolves when a matching reply arrives
    pub async fn register(&self, correlation_id: &CorrelationId) -> oneshot::Receiver<Result<Value>> {
        let (resolver, receiver) = oneshot::channel();
        self.calls.lock().await.insert(
            correlation_id.to_string(),
            PendingCall {
                resolver,
                created_at: Instant::now(),
            },
        );
        receiver
    }

    /// Resolve the call matching the delivery's correlation id.
    ///
    /// Returns `false` for replies nobody is waiting for; those are ignored.
    pub async fn complete(&self, delivery: &Delivery) -> bool {
        let Some(correlation_id) = delivery.properties.correlation_id.as_deref() else {
            debug!("Ignoring reply without correlation id");
            return false;
        };

        let call = self.calls.lock().await.remove(correlation_id);
        match call {
            Some(call) => {
                let reply = codec::decode(&delivery.body);
                if call.resolver.send(Ok(reply)).is_err() {
                    warn!("Caller for {} gave up before its reply arrived", correlation_id);
                    return false;
                }
                debug!("Resolved RPC call {}", correlation_id);
                true
            }
            None => {
                debug!("Ignoring reply for unknown correlation id {}", correlation_id);
                false
            }
        }
    }

    /// Forget a call; its receiver sees the sender dropped
    pub async fn cancel(&self, correlation_id: &CorrelationId) -> bool {
        self.calls.lock().await.remove(correlation_id.as_str()).is_some()
    }

    /// Fail and remove every call older than `max_age`; returns how many
    pub async fn sweep_expired(&self, max_age: Duration) -> usize {
        let mut calls = self.calls.lock().await;
        let expired: Vec<String> = calls
            .iter()
            .filter(|(_, call)| call.age() > max_age)
            .map(|(id, _)| id.clone())
            .collect();

        for id in &expired {
            if let Some(call) = calls.remove(id) {
                let timeout_ms = call.age().as_millis() as u64;
                let _ = call.resolver.send(Err(PatternsError::Timeout { timeout_ms }));
                debug!("Cleaned up expired call: {}", id);
            }
        }
        expired.len()
    }

    pub async fn len(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.calls.lock().await.is_empty()
    }

    fn forget_now(self: &Arc<Self>, correlation_id: &CorrelationId) {
        match self.calls.try_lock() {
            Ok(mut calls) => {
                calls.remove(correlation_id.as_str());
            }
            Err(_) => {
                if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                    let calls = self.clone();
                    let correlation_id = correlation_id.clone();
                    runtime.spawn(async move {
                        calls.cancel(&correlation_id).await;
                    });
                }
            }
        }
    }
}

/// Removes the table entry (and closes a per-call channel) however the call ends
struct CallGuard {
    pending: Arc<PendingCalls>,
    correlation_id: CorrelationId,
    channel: Option<Arc<dyn Channel>>,
}

impl CallGuard {
    async fn finish(mut self) {
        if let Some(channel) = self.channel.take() {
            if let Err(e) = channel.close().await {
                warn!("Failed to close reply channel: {}", e);
            }
        }
    }
}

impl Drop for CallGuard {
    fn drop(&mut self) {
        self.pending.forget_now(&self.correlation_id);

        if let Some(channel) = self.channel.take() {
            if let Ok(runtime) = tokio::runtime::Handle::try_current() {
                runtime.spawn(async move {
                    let _ = channel.close().await;
                });
            }
        }
    }
}

struct SharedReply {
    channel: Arc<dyn Channel>,
    queue: String,
    task: JoinHandle<()>,
}

async fn demultiplex(mut replies: DeliveryStream, pending: Arc<PendingCalls>) {
    while let Some(delivery) = replies.next().await {
        match delivery {
            Ok(delivery) => {
                pending.complete(&delivery).await;
            }
            Err(e) => warn!("Error receiving RPC reply: {}", e),
        }
    }
}

async fn wait_for_reply<F>(timeout: Option<Duration>, reply: F) -> Result<Value>
where
    F: Future<Output = Result<Value>>,
{
    match timeout {
        Some(limit) => tokio::time::timeout(limit, reply).await.unwrap_or_else(|_| {
            Err(PatternsError::Timeout {
                timeout_ms: limit.as_millis() as u64,
            })
        }),
        None => reply.await,
    }
}

fn reply_lost(_: oneshot::error::RecvError) -> PatternsError {
    PatternsError::internal_error("pending call was cancelled before a reply arrived")
}

/// Issues correlated RPC requests to `<namespace>.rpc.<name>` endpoints
pub struct RpcClient {
    connection: Arc<ConnectionManager>,
    naming: Naming,
    config: RpcConfig,
    pending: Arc<PendingCalls>,
    shared_reply: Mutex<Option<SharedReply>>,
    expiry_sweep: Mutex<Option<JoinHandle<()>>>,
}

impl RpcClient {
    pub fn new(connection: Arc<ConnectionManager>, naming: Naming, config: RpcConfig) -> Self {
        Self {
            connection,
            naming,
            config,
            pending: Arc::new(PendingCalls::new()),
            shared_reply: Mutex::new(None),
            expiry_sweep: Mutex::new(None),
        }
    }

    pub fn pending_calls(&self) -> &Arc<PendingCalls> {
        &self.pending
    }

    pub fn config(&self) -> &RpcConfig {
        &self.config
    }

    /// Call `name` with the configured timeout policy
    pub async fn call(&self, name: &str, args: impl Serialize) -> Result<Value> {
        self.call_inner(name, &args, self.config.call_timeout).await
    }

    /// Call `name`, giving up after `timeout`
    pub async fn call_with_timeout(&self, name: &str, args: impl Serialize, timeout: Duration) -> Result<Value> {
        self.call_inner(name, &args, Some(timeout)).await
    }

    /// Call `name` and deserialize the reply
    pub async fn call_as<T: DeserializeOwned>(&self, name: &str, args: impl Serialize) -> Result<T> {
        let reply = self.call(name, args).await?;
        Ok(serde_json::from_value(reply)?)
    }

    async fn call_inner<A: Serialize + ?Sized>(
        &self,
        name: &str,
        args: &A,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        self.ensure_expiry_sweep().await;

        let rpc_name = self.naming.rpc_name(name);
        let body = codec::encode(args);
        let correlation_id = CorrelationId::new();

        debug!("Calling {} (correlation_id: {})", rpc_name, correlation_id);

        match self.config.reply_mode {
            ReplyMode::PerCall => self.call_per_call(&rpc_name, &body, correlation_id, timeout).await,
            ReplyMode::Shared => self.call_shared(&rpc_name, &body, correlation_id, timeout).await,
        }
    }

    async fn call_per_call(
        &self,
        rpc_name: &str,
        body: &[u8],
        correlation_id: CorrelationId,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let channel = self.connection.create_channel().await?;
        let guard = CallGuard {
            pending: self.pending.clone(),
            correlation_id: correlation_id.clone(),
            channel: Some(channel.clone()),
        };

        let reply_queue = channel
            .assert_queue(
                "",
                QueueOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: true,
                },
            )
            .await?;
        let replies = channel.consume(&reply_queue, ConsumeOptions { no_ack: true }).await?;
        let waiter = self.pending.register(&correlation_id).await;

        channel
            .send_to_queue(
                rpc_name,
                body,
                json_properties(false)
                    .with_correlation_id(correlation_id.as_str())
                    .with_reply_to(reply_queue.as_str()),
            )
            .await?;

        let pending = self.pending.clone();
        let outcome = wait_for_reply(timeout, async move {
            tokio::select! {
                reply = waiter => reply.unwrap_or_else(|e| Err(reply_lost(e))),
                _ = demultiplex(replies, pending) => {
                    Err(PatternsError::internal_error("reply queue closed before a reply arrived"))
                }
            }
        })
        .await;

        guard.finish().await;
        outcome
    }

    async fn call_shared(
        &self,
        rpc_name: &str,
        body: &[u8],
        correlation_id: CorrelationId,
        timeout: Option<Duration>,
    ) -> Result<Value> {
        let (channel, reply_queue) = self.shared_reply_queue().await?;
        let guard = CallGuard {
            pending: self.pending.clone(),
            correlation_id: correlation_id.clone(),
            channel: None,
        };
        let waiter = self.pending.register(&correlation_id).await;

        channel
            .send_to_queue(
                rpc_name,
                body,
                json_properties(false)
                    .with_correlation_id(correlation_id.as_str())
                    .with_reply_to(reply_queue.as_str()),
            )
            .await?;

        let outcome = wait_for_reply(timeout, async move { waiter.await.unwrap_or_else(|e| Err(reply_lost(e))) }).await;
        guard.finish().await;
        outcome
    }

    async fn shared_reply_queue(&self) -> Result<(Arc<dyn Channel>, String)> {
        let mut shared = self.shared_reply.lock().await;
        if let Some(reply) = shared.as_ref() {
            if !reply.task.is_finished() {
                return Ok((reply.channel.clone(), reply.queue.clone()));
            }
            warn!("Shared reply consumer on {} stopped, declaring a new one", reply.queue);
        }

        let channel = self.connection.create_channel().await?;
        let queue = channel
            .assert_queue(
                "",
                QueueOptions {
                    durable: false,
                    exclusive: true,
                    auto_delete: false,
                },
            )
            .await?;
        let replies = channel.consume(&queue, ConsumeOptions { no_ack: true }).await?;
        let task = tokio::spawn(demultiplex(replies, self.pending.clone()));

        info!("Shared RPC reply queue ready: {}", queue);
        *shared = Some(SharedReply {
            channel: channel.clone(),
            queue: queue.clone(),
            task,
        });
        Ok((channel, queue))
    }

    /// Start the periodic expiry sweep once, if `pending_expiry` is configured.
    ///
    /// Called on every outgoing call, so a client that never registers a
    /// pattern still gets its orphaned calls expired.
    pub async fn ensure_expiry_sweep(&self) -> bool {
        let Some(max_age) = self.config.pending_expiry else {
            return false;
        };

        let mut sweep = self.expiry_sweep.lock().await;
        if sweep.as_ref().is_some_and(|task| !task.is_finished()) {
            return true;
        }
        *sweep = Some(spawn_expiry_sweep(self.pending.clone(), max_age));
        true
    }

    /// Stop the expiry sweep and the shared reply consumer, if running
    pub async fn close(&self) -> Result<()> {
        if let Some(sweep) = self.expiry_sweep.lock().await.take() {
            sweep.abort();
        }
        if let Some(reply) = self.shared_reply.lock().await.take() {
            reply.task.abort();
            reply.channel.close().await?;
        }
        Ok(())
    }

    /// Get client statistics
    pub async fn get_stats(&self) -> RpcStats {
        RpcStats {
            pending_calls: self.pending.len().await,
            reply_mode: self.config.reply_mode,
            call_timeout_ms: self.config.call_timeout.map(|t| t.as_millis() as u64),
        }
    }
}

fn spawn_expiry_sweep(pending: Arc<PendingCalls>, max_age: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        info!("RPC expiry sweep started (max age {:?})", max_age);
        let mut interval = tokio::time::interval(max_age.max(Duration::from_millis(1)));
        loop {
            interval.tick().await;
            let expired = pending.sweep_expired(max_age).await;
            if expired > 0 {
                warn!("Expired {} RPC call(s) that never received a reply", expired);
            }
        }
    })
}

/// RPC client statistics
#[derive(Debug, Clone, serde::Serialize)]
pub struct RpcStats {
    pub pending_calls: usize,
    pub reply_mode: ReplyMode,
    pub call_timeout_ms: Option<u64>,
}

impl fmt::Debug for RpcClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcClient")
            .field("namespace", &self.naming.namespace())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MessageProperties;
    use serde_json::json;
    use std::collections::HashSet;

    fn reply(correlation_id: &str, body: &[u8]) -> Delivery {
        Delivery {
            delivery_tag: 1,
            exchange: String::new(),
            routing_key: "amq.gen-1".to_string(),
            redelivered: false,
            body: body.to_vec(),
            properties: MessageProperties::default().with_correlation_id(correlation_id),
        }
    }

    #[test]
    fn test_correlation_ids_do_not_collide() {
        let ids: HashSet<CorrelationId> = (0..100_000).map(|_| CorrelationId::new()).collect();
        assert_eq!(ids.len(), 100_000);
    }

    #[test]
    fn test_reply_mode_parsing() {
        assert_eq!("per-call".parse::<ReplyMode>().unwrap(), ReplyMode::PerCall);
        assert_eq!("shared".parse::<ReplyMode>().unwrap(), ReplyMode::Shared);
        assert!("pooled".parse::<ReplyMode>().is_err());
    }

    #[tokio::test]
    async fn test_complete_resolves_only_the_matching_call() {
        let pending = PendingCalls::new();
        let first = CorrelationId::new();
        let second = CorrelationId::new();
        let first_rx = pending.register(&first).await;
        let mut second_rx = pending.register(&second).await;

        assert!(pending.complete(&reply(first.as_str(), br#"{"n":1}"#)).await);
        assert_eq!(first_rx.await.unwrap().unwrap(), json!({"n": 1}));

        assert!(second_rx.try_recv().is_err());
        assert_eq!(pending.len().await, 1);
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_replies_are_ignored() {
        let pending = PendingCalls::new();
        let id = CorrelationId::new();
        let _rx = pending.register(&id).await;

        assert!(!pending.complete(&reply("someone-else", b"{}")).await);
        assert!(pending.complete(&reply(id.as_str(), b"{}")).await);
        assert!(!pending.complete(&reply(id.as_str(), b"{}")).await);

        let mut anonymous = reply("x", b"{}");
        anonymous.properties.correlation_id = None;
        assert!(!pending.complete(&anonymous).await);
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_malformed_reply_resolves_with_empty_object() {
        let pending = PendingCalls::new();
        let id = CorrelationId::new();
        let rx = pending.register(&id).await;

        pending.complete(&reply(id.as_str(), b"not json")).await;
        assert_eq!(rx.await.unwrap().unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_cancel_drops_the_resolver() {
        let pending = PendingCalls::new();
        let id = CorrelationId::new();
        let rx = pending.register(&id).await;

        assert!(pending.cancel(&id).await);
        assert!(!pending.cancel(&id).await);
        assert!(rx.await.is_err());
    }

    #[tokio::test]
    async fn test_sweep_expired_fails_old_calls() {
        let pending = PendingCalls::new();
        let old = CorrelationId::new();
        let old_rx = pending.register(&old).await;

        tokio::time::sleep(Duration::from_millis(40)).await;
        let fresh = CorrelationId::new();
        let _fresh_rx = pending.register(&fresh).await;

        assert_eq!(pending.sweep_expired(Duration::from_millis(20)).await, 1);
        assert!(matches!(old_rx.await.unwrap(), Err(PatternsError::Timeout { .. })));
        assert_eq!(pending.len().await, 1);
    }

    #[tokio::test]
    async fn test_guard_removes_entry_when_dropped() {
        let pending = Arc::new(PendingCalls::new());
        let id = CorrelationId::new();
        let _rx = pending.register(&id).await;

        drop(CallGuard {
            pending: pending.clone(),
            correlation_id: id,
            channel: None,
        });
        assert!(pending.is_empty().await);
    }

    #[tokio::test]
    async fn test_wait_for_reply_times_out() {
        let never = std::future::pending::<Result<Value>>();
        let result = wait_for_reply(Some(Duration::from_millis(20)), never).await;
        assert!(matches!(result, Err(PatternsError::Timeout { timeout_ms: 20 })));
    }
}
