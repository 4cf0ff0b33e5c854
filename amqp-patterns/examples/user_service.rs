//! The `model.user` service: a work queue, a routed CRUD exchange, a pub/sub
//! exchange and one RPC endpoint.
//!
//! Run against a local broker with `AMQP_URL=amqp://localhost:5672`.

use amqp_patterns::{Message, Service, ServiceConfig};
use serde_json::json;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,amqp_patterns=debug")),
        )
        .init();

    let config = ServiceConfig::from_env("model.user")?;
    let service = Service::new(config)?
        .work_queue("email", |msg: Message| async move {
            info!("📧 Sending email: {}", msg.payload);
            Ok(None)
        })
        .routed("crud", ["create", "read", "update", "delete"], |msg: Message| async move {
            info!("📝 {} user: {}", msg.routing_key, msg.payload);
            Ok(None)
        })
        .pub_sub("save", |msg: Message| async move {
            info!("💾 User saved: {}", msg.payload);
            Ok(None)
        })
        .rpc("getPassword", |_msg: Message| async move { Ok(Some(json!({"password": "abc123"}))) });

    service.init().await?;

    service.broadcast("email", json!({"to": "ada@example.com"})).await?;
    service.publish_routed("crud", "create", json!({"name": "ada"})).await?;
    service.publish("save", json!({"id": 1})).await?;

    let password = service.call_rpc("getPassword", json!({"id": 1})).await?;
    info!("🔑 getPassword replied {}", password);

    info!("Serving until ctrl-c");
    tokio::signal::ctrl_c().await?;
    service.shutdown().await?;
    Ok(())
}
