use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::broker::{Delivery, MessageProperties};
use crate::codec;
use crate::error::Result;

/// A decoded message as seen by pattern handlers
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    /// Decoded body; an empty object when the body was not valid JSON
    pub payload: serde_json::Value,
    /// Exchange the message was published to (empty for direct queue sends)
    pub exchange: String,
    /// Routing key it was published with (the queue name for direct sends)
    pub routing_key: String,
    /// Request correlation token, present on RPC requests and replies
    pub correlation_id: Option<String>,
    /// Return address of an RPC request
    pub reply_to: Option<String>,
    /// The broker delivered this message before without an acknowledgment
    pub redelivered: bool,
    /// When the consumer decoded the message
    pub received_at: DateTime<Utc>,
}

impl Message {
    /// Decode a raw delivery; never fails, see [`codec::decode`]
    pub fn from_delivery(delivery: &Delivery) -> Self {
        Self {
            payload: codec::decode(&delivery.body),
            exchange: delivery.exchange.clone(),
            routing_key: delivery.routing_key.clone(),
            correlation_id: delivery.properties.correlation_id.clone(),
            reply_to: delivery.properties.reply_to.clone(),
            redelivered: delivery.redelivered,
            received_at: Utc::now(),
        }
    }

    /// Build a message around a payload, mostly useful when calling handlers directly
    pub fn from_payload(payload: serde_json::Value) -> Self {
        Self {
            payload,
            exchange: String::new(),
            routing_key: String::new(),
            correlation_id: None,
            reply_to: None,
            redelivered: false,
            received_at: Utc::now(),
        }
    }

    /// Deserialize payload to specific type
    pub fn deserialize_payload<T: for<'de> Deserialize<'de>>(&self) -> Result<T> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    /// Check if this message expects a reply
    pub fn is_request(&self) -> bool {
        self.reply_to.is_some() && self.correlation_id.is_some()
    }

    /// Get age of message in milliseconds
    pub fn age_ms(&self) -> i64 {
        (Utc::now() - self.received_at).num_milliseconds()
    }
}

/// Properties for a JSON body, optionally persistent
pub(crate) fn json_properties(persistent: bool) -> MessageProperties {
    MessageProperties::default()
        .with_content_type(codec::CONTENT_TYPE)
        .with_persistent(persistent)
}
