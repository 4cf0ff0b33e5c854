//! # amqp-patterns - Namespaced messaging patterns over AMQP
//!
//! A service declares the queues and exchanges it consumes under one
//! namespace (`model.user.email`, `model.user.rpc.getPassword`, ...) and
//! gets the five classic RabbitMQ patterns on a single shared connection:
//! work queues, pub/sub fanout, routed (direct) and topic subscriptions, and
//! request/reply RPC with correlation ids.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use amqp_patterns::{Service, ServiceConfig};
//! use serde_json::json;
//!
//! #[tokio::main]
//! async fn main() -> amqp_patterns::Result<()> {
//!     let service = Service::new(ServiceConfig::new("model.user", "amqp://localhost:5672"))?
//!         .work_queue("email", |msg| async move {
//!             println!("sending email to {}", msg.payload["to"]);
//!             Ok(None)
//!         })
//!         .rpc("getPassword", |_msg| async move { Ok(Some(json!({"password": "abc123"}))) });
//!
//!     service.init().await?;
//!     let reply = service.call_rpc("getPassword", json!({"id": 7})).await?;
//!     println!("{reply}");
//!     service.shutdown().await
//! }
//! ```
//!
//! Handlers never see undecodable bodies: a payload that is not valid JSON
//! arrives as an empty object.

pub mod broker;
pub mod codec;
pub mod connection;
pub mod error;
pub mod handler;
pub mod message;
pub mod naming;
pub mod pattern;
pub mod rpc;
pub mod service;

pub use broker::{AmqpBroker, Broker, ExchangeKind, MemoryBroker};
pub use connection::{ConnectionConfig, ConnectionManager};
pub use error::{PatternsError, Result};
pub use handler::{handler_fn, HandlerResult, MessageHandler};
pub use message::Message;
pub use naming::Naming;
pub use pattern::{Pattern, PatternConfig, PatternKind, RegisteredHandle, RoutingKeys};
pub use rpc::{CorrelationId, ReplyMode, RpcClient, RpcConfig};
pub use service::{Service, ServiceConfig, ServiceStats, ServiceStatus};
