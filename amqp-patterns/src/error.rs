use thiserror::Error;

/// Result type alias for amqp-patterns operations
pub type Result<T> = std::result::Result<T, PatternsError>;

/// Error types surfaced by pattern registration, publishing and RPC calls
#[derive(Error, Debug)]
pub enum PatternsError {
    /// AMQP connection errors
    #[error("AMQP connection error: {0}")]
    Connection(#[from] lapin::Error),

    /// Broker-side failures reported by a non-lapin broker
    #[error("Broker error: {0}")]
    Broker(String),

    /// Operation attempted on a channel or connection that is already closed
    #[error("Channel is closed")]
    ChannelClosed,

    /// Message serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// RPC timeout errors
    #[error("RPC call timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    /// Message handler errors
    #[error("Handler error: {0}")]
    Handler(String),

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    /// Network I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic errors from anyhow
    #[error(transparent)]
    Other(#[from] anyhow::Error),

    /// Tokio join errors (a handler task panicked or was aborted)
    #[error("Join error: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl PatternsError {
    /// Create a new handler error
    pub fn handler_error<T: ToString>(message: T) -> Self {
        Self::Handler(message.to_string())
    }

    /// Create a new config error
    pub fn config_error<T: ToString>(message: T) -> Self {
        Self::Config(message.to_string())
    }

    /// Create a new internal error
    pub fn internal_error<T: ToString>(message: T) -> Self {
        Self::Internal(message.to_string())
    }

    /// Create a new broker error
    pub fn broker_error<T: ToString>(message: T) -> Self {
        Self::Broker(message.to_string())
    }

    /// Check if error is a transport failure the caller may retry
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Connection(_) | Self::Broker(_) | Self::ChannelClosed | Self::Timeout { .. } | Self::Io(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recoverable_classification() {
        assert!(PatternsError::Timeout { timeout_ms: 10 }.is_recoverable());
        assert!(PatternsError::broker_error("refused").is_recoverable());
        assert!(PatternsError::ChannelClosed.is_recoverable());
        assert!(!PatternsError::config_error("empty namespace").is_recoverable());
        assert!(!PatternsError::handler_error("boom").is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = PatternsError::Timeout { timeout_ms: 250 };
        assert_eq!(err.to_string(), "RPC call timed out after 250ms");

        let err = PatternsError::handler_error("bad input");
        assert_eq!(err.to_string(), "Handler error: bad input");
    }
}
