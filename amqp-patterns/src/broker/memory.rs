//! In-process broker.
//!
//! Models the parts of AMQP 0-9-1 the patterns depend on: per-consumer
//! prefetch, manual ack and nack-with-requeue, round-robin delivery,
//! fanout/direct/topic exchanges, exclusive and auto-delete queues and
//! broker-generated queue names. Nothing is persisted.

use async_trait::async_trait;
use futures_util::StreamExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use super::{
    Broker, Channel, ConsumeOptions, Connection, Delivery, DeliveryStream, ExchangeKind,
    ExchangeOptions, MessageProperties, QueueOptions,
};
use crate::error::{PatternsError, Result};

/// Shared in-memory broker; clones talk to the same queues and exchanges
#[derive(Clone)]
pub struct MemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    available: Arc<AtomicBool>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(BrokerState::default())),
            available: Arc::new(AtomicBool::new(true)),
        }
    }

    /// Refuse (or accept again) new connections
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    pub async fn queue_exists(&self, name: &str) -> bool {
        self.state.lock().await.queues.contains_key(name)
    }

    pub async fn exchange_exists(&self, name: &str) -> bool {
        self.state.lock().await.exchanges.contains_key(name)
    }

    /// Messages waiting for a consumer
    pub async fn queue_depth(&self, name: &str) -> Option<usize> {
        self.state.lock().await.queues.get(name).map(|q| q.ready.len())
    }

    /// Messages delivered from `name` but not yet acknowledged
    pub async fn unacked_count(&self, name: &str) -> usize {
        let state = self.state.lock().await;
        state
            .channels
            .values()
            .flat_map(|channel| channel.unacked.values())
            .filter(|unacked| unacked.queue == name)
            .count()
    }

    pub async fn consumer_count(&self, name: &str) -> usize {
        self.state
            .lock()
            .await
            .queues
            .get(name)
            .map(|q| q.consumers.iter().filter(|c| !c.sender.is_closed()).count())
            .unwrap_or(0)
    }

    pub async fn bound_queues(&self, exchange: &str) -> Vec<(String, String)> {
        self.state
            .lock()
            .await
            .exchanges
            .get(exchange)
            .map(|e| {
                e.bindings
                    .iter()
                    .map(|b| (b.queue.clone(), b.routing_key.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryBroker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryBroker")
            .field("available", &self.available.load(Ordering::SeqCst))
            .finish()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    async fn connect(&self, url: &str) -> Result<Arc<dyn Connection>> {
        if !self.available.load(Ordering::SeqCst) {
            return Err(PatternsError::broker_error(format!("connection refused: {url}")));
        }

        let id = self.state.lock().await.next_id();
        debug!("Memory broker accepted connection {} for {}", id, url);

        Ok(Arc::new(MemoryConnection {
            id,
            state: self.state.clone(),
            open: AtomicBool::new(true),
        }))
    }
}

#[derive(Debug, Clone)]
struct StoredMessage {
    exchange: String,
    routing_key: String,
    redelivered: bool,
    body: Vec<u8>,
    properties: MessageProperties,
}

struct ConsumerState {
    id: u64,
    channel: u64,
    no_ack: bool,
    prefetch: u16,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct QueueState {
    options: QueueOptions,
    owner: Option<u64>,
    ready: VecDeque<StoredMessage>,
    consumers: Vec<ConsumerState>,
    cursor: usize,
    had_consumer: bool,
}

struct Binding {
    queue: String,
    routing_key: String,
}

struct ExchangeState {
    kind: ExchangeKind,
    options: ExchangeOptions,
    bindings: Vec<Binding>,
}

struct Unacked {
    queue: String,
    consumer: u64,
    message: StoredMessage,
}

struct ChannelState {
    connection: u64,
    prefetch: u16,
    unacked: HashMap<u64, Unacked>,
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, QueueState>,
    exchanges: HashMap<String, ExchangeState>,
    channels: HashMap<u64, ChannelState>,
    counter: u64,
}

impl BrokerState {
    fn next_id(&mut self) -> u64 {
        self.counter += 1;
        self.counter
    }

    fn ensure_channel(&self, channel: u64) -> Result<&ChannelState> {
        self.channels.get(&channel).ok_or(PatternsError::ChannelClosed)
    }

    fn enqueue(&mut self, queue: &str, message: StoredMessage) {
        if let Some(state) = self.queues.get_mut(queue) {
            state.ready.push_back(message);
            self.dispatch(queue);
        } else {
            debug!("Dropping message for unknown queue {}", queue);
        }
    }

    fn requeue(&mut self, unacked: Unacked) {
        let Unacked { queue, mut message, .. } = unacked;
        if let Some(state) = self.queues.get_mut(&queue) {
            message.redelivered = true;
            state.ready.push_front(message);
        }
    }

    fn route(&mut self, exchange: &str, routing_key: &str, message: StoredMessage) -> Result<()> {
        if exchange.is_empty() {
            self.enqueue(routing_key, message);
            return Ok(());
        }

        let state = self
            .exchanges
            .get(exchange)
            .ok_or_else(|| PatternsError::broker_error(format!("NOT_FOUND - no exchange '{exchange}'")))?;

        let mut targets = Vec::new();
        let mut seen = HashSet::new();
        for binding in &state.bindings {
            let matched = match state.kind {
                ExchangeKind::Fanout => true,
                ExchangeKind::Direct => binding.routing_key == routing_key,
                ExchangeKind::Topic => topic_matches(&binding.routing_key, routing_key),
            };
            if matched && seen.insert(binding.queue.clone()) {
                targets.push(binding.queue.clone());
            }
        }

        for queue in targets {
            self.enqueue(&queue, message.clone());
        }
        Ok(())
    }

    /// Drop consumers whose stream is gone and delete auto-delete queues left
    /// without any consumer.
    fn prune_consumers(&mut self, queue: &str) {
        let delete = match self.queues.get_mut(queue) {
            Some(state) => {
                state.consumers.retain(|c| !c.sender.is_closed());
                state.options.auto_delete && state.had_consumer && state.consumers.is_empty()
            }
            None => false,
        };
        if delete {
            self.delete_queue(queue);
        }
    }

    fn delete_queue(&mut self, queue: &str) {
        if self.queues.remove(queue).is_some() {
            debug!("Deleted queue {}", queue);
        }
        for exchange in self.exchanges.values_mut() {
            exchange.bindings.retain(|b| b.queue != queue);
        }
    }

    fn dispatch(&mut self, queue_name: &str) {
        self.prune_consumers(queue_name);

        loop {
            let BrokerState {
                queues,
                channels,
                counter,
                ..
            } = self;

            let Some(queue) = queues.get_mut(queue_name) else {
                return;
            };
            if queue.ready.is_empty() || queue.consumers.is_empty() {
                return;
            }

            let count = queue.consumers.len();
            let chosen = (0..count)
                .map(|offset| (queue.cursor + offset) % count)
                .find(|&idx| {
                    let consumer = &queue.consumers[idx];
                    if consumer.no_ack || consumer.prefetch == 0 {
                        return true;
                    }
                    let in_flight = channels
                        .get(&consumer.channel)
                        .map(|c| c.unacked.values().filter(|u| u.consumer == consumer.id).count())
                        .unwrap_or(0);
                    in_flight < consumer.prefetch as usize
                });

            let Some(idx) = chosen else {
                return;
            };
            let Some(message) = queue.ready.pop_front() else {
                return;
            };
            queue.cursor = (idx + 1) % count;

            *counter += 1;
            let tag = *counter;
            let consumer = &queue.consumers[idx];

            if !consumer.no_ack {
                if let Some(channel) = channels.get_mut(&consumer.channel) {
                    channel.unacked.insert(
                        tag,
                        Unacked {
                            queue: queue_name.to_string(),
                            consumer: consumer.id,
                            message: message.clone(),
                        },
                    );
                }
            }

            let delivery = Delivery {
                delivery_tag: tag,
                exchange: message.exchange.clone(),
                routing_key: message.routing_key.clone(),
                redelivered: message.redelivered,
                body: message.body.clone(),
                properties: message.properties.clone(),
            };

            if consumer.sender.send(Ok(delivery)).is_err() {
                let channel_id = consumer.channel;
                queue.consumers.remove(idx);
                queue.ready.push_front(message);
                if let Some(channel) = channels.get_mut(&channel_id) {
                    channel.unacked.remove(&tag);
                }
                self.prune_consumers(queue_name);
            }
        }
    }

    fn close_channel(&mut self, channel_id: u64) {
        let Some(channel) = self.channels.remove(&channel_id) else {
            return;
        };

        let mut unacked: Vec<(u64, Unacked)> = channel.unacked.into_iter().collect();
        unacked.sort_by_key(|(tag, _)| *tag);

        let mut affected: HashSet<String> = HashSet::new();
        for (_, entry) in unacked.into_iter().rev() {
            affected.insert(entry.queue.clone());
            self.requeue(entry);
        }

        for (name, queue) in self.queues.iter_mut() {
            let before = queue.consumers.len();
            queue.consumers.retain(|c| c.channel != channel_id);
            if queue.consumers.len() != before {
                affected.insert(name.clone());
            }
        }

        for queue in affected {
            self.dispatch(&queue);
        }
    }

    fn close_connection(&mut self, connection_id: u64) {
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == connection_id)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel);
        }

        let exclusive: Vec<String> = self
            .queues
            .iter()
            .filter(|(_, q)| q.owner == Some(connection_id))
            .map(|(name, _)| name.clone())
            .collect();
        for queue in exclusive {
            self.delete_queue(&queue);
        }
    }
}

/// AMQP topic matching: `*` stands for exactly one word, `#` for zero or more
pub fn topic_matches(pattern: &str, routing_key: &str) -> bool {
    let pattern: Vec<&str> = pattern.split('.').collect();
    let words: Vec<&str> = routing_key.split('.').collect();
    match_words(&pattern, &words)
}

fn match_words(pattern: &[&str], words: &[&str]) -> bool {
    match pattern.split_first() {
        None => words.is_empty(),
        Some((&"#", rest)) => (0..=words.len()).any(|skip| match_words(rest, &words[skip..])),
        Some((&"*", rest)) => !words.is_empty() && match_words(rest, &words[1..]),
        Some((literal, rest)) => words.first() == Some(literal) && match_words(rest, &words[1..]),
    }
}

/// Connection to a [`MemoryBroker`]
pub struct MemoryConnection {
    id: u64,
    state: Arc<Mutex<BrokerState>>,
    open: AtomicBool,
}

#[async_trait]
impl Connection for MemoryConnection {
    async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(PatternsError::ChannelClosed);
        }

        let mut state = self.state.lock().await;
        let id = state.next_id();
        state.channels.insert(
            id,
            ChannelState {
                connection: self.id,
                prefetch: 0,
                unacked: HashMap::new(),
            },
        );

        Ok(Arc::new(MemoryChannel {
            id,
            connection: self.id,
            state: self.state.clone(),
        }))
    }

    async fn close(&self) -> Result<()> {
        if self.open.swap(false, Ordering::SeqCst) {
            self.state.lock().await.close_connection(self.id);
            debug!("Closed memory connection {}", self.id);
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }
}

/// Channel on a [`MemoryConnection`]
pub struct MemoryChannel {
    id: u64,
    connection: u64,
    state: Arc<Mutex<BrokerState>>,
}

#[async_trait]
impl Channel for MemoryChannel {
    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String> {
        let mut state = self.state.lock().await;
        state.ensure_channel(self.id)?;

        let name = if name.is_empty() {
            format!("amq.gen-{}", state.next_id())
        } else {
            name.to_string()
        };

        if let Some(existing) = state.queues.get(&name) {
            if existing.owner.is_some_and(|owner| owner != self.connection) {
                return Err(PatternsError::broker_error(format!(
                    "RESOURCE_LOCKED - queue '{name}' is exclusive to another connection"
                )));
            }
            if existing.options.durable != options.durable {
                return Err(PatternsError::broker_error(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for queue '{name}'"
                )));
            }
            return Ok(name);
        }

        state.queues.insert(
            name.clone(),
            QueueState {
                options,
                owner: options.exclusive.then_some(self.connection),
                ready: VecDeque::new(),
                consumers: Vec::new(),
                cursor: 0,
                had_consumer: false,
            },
        );
        debug!("Declared memory queue {}", name);
        Ok(name)
    }

    async fn assert_exchange(&self, name: &str, kind: ExchangeKind, options: ExchangeOptions) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_channel(self.id)?;

        match state.exchanges.get(name) {
            Some(existing) if existing.kind != kind => Err(PatternsError::broker_error(format!(
                "PRECONDITION_FAILED - exchange '{name}' is {} not {kind}",
                existing.kind
            ))),
            Some(existing) if existing.options.durable != options.durable => {
                Err(PatternsError::broker_error(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'durable' for exchange '{name}'"
                )))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(
                    name.to_string(),
                    ExchangeState {
                        kind,
                        options,
                        bindings: Vec::new(),
                    },
                );
                debug!("Declared memory {} exchange {}", kind, name);
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str) -> Result<()> {
        let mut state = self.state.lock().await;
        state.ensure_channel(self.id)?;

        if !state.queues.contains_key(queue) {
            return Err(PatternsError::broker_error(format!("NOT_FOUND - no queue '{queue}'")));
        }
        let exchange_state = state
            .exchanges
            .get_mut(exchange)
            .ok_or_else(|| PatternsError::broker_error(format!("NOT_FOUND - no exchange '{exchange}'")))?;

        let exists = exchange_state
            .bindings
            .iter()
            .any(|b| b.queue == queue && b.routing_key == routing_key);
        if !exists {
            exchange_state.bindings.push(Binding {
                queue: queue.to_string(),
                routing_key: routing_key.to_string(),
            });
        }
        Ok(())
    }

    async fn prefetch(&self, count: u16) -> Result<()> {
        let mut state = self.state.lock().await;
        let channel = state.channels.get_mut(&self.id).ok_or(PatternsError::ChannelClosed)?;
        channel.prefetch = count;
        Ok(())
    }

    async fn consume(&self, queue: &str, options: ConsumeOptions) -> Result<DeliveryStream> {
        let mut state = self.state.lock().await;
        let prefetch = state.ensure_channel(self.id)?.prefetch;
        let consumer_id = state.next_id();

        let queue_state = state
            .queues
            .get_mut(queue)
            .ok_or_else(|| PatternsError::broker_error(format!("NOT_FOUND - no queue '{queue}'")))?;

        let (sender, receiver) = mpsc::unbounded_channel();
        queue_state.consumers.push(ConsumerState {
            id: consumer_id,
            channel: self.id,
            no_ack: options.no_ack,
            prefetch,
            sender,
        });
        queue_state.had_consumer = true;
        state.dispatch(queue);

        Ok(futures_util::stream::unfold(receiver, |mut receiver| async move {
            receiver.recv().await.map(|delivery| (delivery, receiver))
        })
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
        let mut state = self.state.lock().await;
        state.ensure_channel(self.id)?;

        let message = StoredMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            redelivered: false,
            body: body.to_vec(),
            properties,
        };
        state.route(exchange, routing_key, message)
    }

    async fn ack(&self, delivery: &Delivery) -> Result<()> {
        let mut state = self.state.lock().await;
        let channel = state.channels.get_mut(&self.id).ok_or(PatternsError::ChannelClosed)?;
        let entry = channel.unacked.remove(&delivery.delivery_tag).ok_or_else(|| {
            PatternsError::broker_error(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery.delivery_tag
            ))
        })?;
        state.dispatch(&entry.queue);
        Ok(())
    }

    async fn nack(&self, delivery: &Delivery, requeue: bool) -> Result<()> {
        let mut state = self.state.lock().await;
        let channel = state.channels.get_mut(&self.id).ok_or(PatternsError::ChannelClosed)?;
        let entry = channel.unacked.remove(&delivery.delivery_tag).ok_or_else(|| {
            PatternsError::broker_error(format!(
                "PRECONDITION_FAILED - unknown delivery tag {}",
                delivery.delivery_tag
            ))
        })?;

        let queue = entry.queue.clone();
        if requeue {
            state.requeue(entry);
        }
        state.dispatch(&queue);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().await.close_channel(self.id);
        Ok(())
    }
}
