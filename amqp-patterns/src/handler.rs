use async_trait::async_trait;
use serde_json::Value;
use std::future::Future;
use std::sync::Arc;

use crate::error::Result;
use crate::message::Message;

/// What a handler produces: an optional reply payload.
///
/// Only RPC servers send the value anywhere; the other patterns discard it.
pub type HandlerResult = Result<Option<Value>>;

/// Trait for implementing pattern handlers
#[async_trait]
pub trait MessageHandler: Send + Sync {
    /// Handle one decoded message
    async fn handle(&self, message: Message) -> HandlerResult;

    /// Get handler name for debugging
    fn name(&self) -> &str {
        "MessageHandler"
    }
}

/// Simple function-based handler
pub struct FunctionHandler<F> {
    name: String,
    handler: F,
}

impl<F> FunctionHandler<F> {
    pub fn new(name: impl Into<String>, handler: F) -> Self {
        Self {
            name: name.into(),
            handler,
        }
    }
}

#[async_trait]
impl<F, Fut> MessageHandler for FunctionHandler<F>
where
    F: Fn(Message) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send,
{
    async fn handle(&self, message: Message) -> HandlerResult {
        (self.handler)(message).await
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Wrap a closure as a shareable handler
pub fn handler_fn<F, Fut>(name: impl Into<String>, handler: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Message) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FunctionHandler::new(name, handler))
}

/// Run a handler on its own task so a panic surfaces as an error
pub(crate) async fn invoke(handler: &Arc<dyn MessageHandler>, message: Message) -> HandlerResult {
    let handler = handler.clone();
    tokio::spawn(async move { handler.handle(message).await }).await?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PatternsError;
    use serde_json::json;

    #[tokio::test]
    async fn test_function_handler() {
        let handler = handler_fn("echo", |msg: Message| async move { Ok(Some(msg.payload)) });

        assert_eq!(handler.name(), "echo");
        let reply = handler.handle(Message::from_payload(json!({"a": 1}))).await.unwrap();
        assert_eq!(reply, Some(json!({"a": 1})));
    }

    #[tokio::test]
    async fn test_invoke_turns_panic_into_error() {
        let handler = handler_fn("explodes", |_msg: Message| async move {
            if true {
                panic!("handler blew up");
            }
            Ok(None)
        });

        let result = invoke(&handler, Message::from_payload(json!({}))).await;
        assert!(matches!(result, Err(PatternsError::Join(_))));
    }

    #[tokio::test]
    async fn test_invoke_passes_handler_errors_through() {
        let handler = handler_fn("fails", |_msg: Message| async move {
            Err(PatternsError::handler_error("nope"))
        });

        let result = invoke(&handler, Message::from_payload(json!({}))).await;
        assert!(matches!(result, Err(PatternsError::Handler(_))));
    }
}
