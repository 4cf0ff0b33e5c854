use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::broker::{AmqpBroker, Broker, Channel, Connection};
use crate::error::Result;

/// Configuration for the broker connection
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// AMQP broker URL (e.g., "amqp://localhost:5672")
    pub url: String,
    /// Connection attempts before giving up; 1 means no automatic retry
    pub connect_attempts: u32,
    /// Delay between retry attempts in milliseconds
    pub retry_delay_ms: u64,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            url: "amqp://localhost:5672".to_string(),
            connect_attempts: 1,
            retry_delay_ms: 1_000,
        }
    }
}

impl ConnectionConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }
}

/// Owns the single broker connection shared by every pattern of a service.
///
/// The connection is opened lazily on first use and reused afterwards; a
/// connection that the broker dropped is replaced on the next request.
pub struct ConnectionManager {
    config: ConnectionConfig,
    broker: Arc<dyn Broker>,
    connection: Mutex<Option<Arc<dyn Connection>>>,
}

impl ConnectionManager {
    /// Connection manager for a RabbitMQ broker at `url`
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(ConnectionConfig::new(url), Arc::new(AmqpBroker::new()))
    }

    /// Create a connection manager with custom configuration and broker
    pub fn with_config(config: ConnectionConfig, broker: Arc<dyn Broker>) -> Self {
        Self {
            config,
            broker,
            connection: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    /// Return the shared connection, connecting first if needed
    pub async fn connect(&self) -> Result<Arc<dyn Connection>> {
        // Held across the connect so concurrent callers share one attempt
        let mut guard = self.connection.lock().await;
        if let Some(connection) = guard.as_ref() {
            if connection.is_connected() {
                return Ok(connection.clone());
            }
            warn!("Connection to {} lost, reconnecting", self.config.url);
        }

        let connection = self.connect_with_retry().await?;
        *guard = Some(connection.clone());
        Ok(connection)
    }

    async fn connect_with_retry(&self) -> Result<Arc<dyn Connection>> {
        let max_attempts = self.config.connect_attempts.max(1);
        let mut attempts = 0;

        loop {
            match self.broker.connect(&self.config.url).await {
                Ok(connection) => {
                    info!("Connected to broker at {}", self.config.url);
                    return Ok(connection);
                }
                Err(e) => {
                    attempts += 1;
                    if attempts >= max_attempts {
                        error!("Failed to connect to {} after {} attempt(s): {}", self.config.url, attempts, e);
                        return Err(e);
                    }

                    warn!(
                        "Connection attempt {} failed, retrying in {}ms: {}",
                        attempts, self.config.retry_delay_ms, e
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.retry_delay_ms)).await;
                }
            }
        }
    }

    /// Open a fresh channel on the shared connection
    pub async fn create_channel(&self) -> Result<Arc<dyn Channel>> {
        let connection = self.connect().await?;
        let channel = connection.create_channel().await?;
        debug!("Created new channel");
        Ok(channel)
    }

    /// Check if connection is healthy
    pub async fn is_connected(&self) -> bool {
        self.connection
            .lock()
            .await
            .as_ref()
            .map(|conn| conn.is_connected())
            .unwrap_or(false)
    }

    /// Close the shared connection; the next request reconnects
    pub async fn close(&self) -> Result<()> {
        let connection = self.connection.lock().await.take();
        match connection {
            Some(connection) => {
                connection.close().await?;
                info!("Closed connection to {}", self.config.url);
                Ok(())
            }
            None => Ok(()),
        }
    }

    /// Get connection statistics for monitoring
    pub async fn get_stats(&self) -> ConnectionStats {
        ConnectionStats {
            is_connected: self.is_connected().await,
            url: self.config.url.clone(),
        }
    }
}

/// Connection statistics for monitoring
#[derive(Debug, Clone, serde::Serialize)]
pub struct ConnectionStats {
    pub is_connected: bool,
    pub url: String,
}

impl std::fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::MemoryBroker;
    use crate::error::PatternsError;

    fn manager(broker: &MemoryBroker, attempts: u32) -> ConnectionManager {
        let config = ConnectionConfig {
            url: "memory://local".to_string(),
            connect_attempts: attempts,
            retry_delay_ms: 10,
        };
        ConnectionManager::with_config(config, Arc::new(broker.clone()))
    }

    #[tokio::test]
    async fn test_connection_is_shared() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 1);

        let first = manager.connect().await.unwrap();
        let second = manager.connect().await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert!(manager.is_connected().await);
    }

    #[tokio::test]
    async fn test_reconnects_after_close() {
        let broker = MemoryBroker::new();
        let manager = manager(&broker, 1);

        let first = manager.connect().await.unwrap();
        manager.close().await.unwrap();
        assert!(!manager.is_connected().await);

        let second = manager.connect().await.unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn test_connect_failure_is_returned_without_retry() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let manager = manager(&broker, 1);

        assert!(matches!(manager.connect().await, Err(PatternsError::Broker(_))));
        assert!(matches!(manager.create_channel().await, Err(PatternsError::Broker(_))));
    }

    #[tokio::test]
    async fn test_retry_until_broker_comes_up() {
        let broker = MemoryBroker::new();
        broker.set_available(false);
        let manager = Arc::new(manager(&broker, 50));

        let pending = tokio::spawn({
            let manager = manager.clone();
            async move { manager.connect().await.map(|_| ()) }
        });

        tokio::time::sleep(Duration::from_millis(30)).await;
        broker.set_available(true);
        assert!(pending.await.unwrap().is_ok());
    }
}
