//! Message processor: a registry of handlers keyed by message kind
//!
//! The kind of an incoming JSON message is extracted by a pluggable
//! function; the default checks `channel`, then `type`, then falls back to
//! "unknown". Handlers must not block the listener; long work belongs on a
//! spawned task.

use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex};

use futures_util::future::BoxFuture;
use serde_json::Value;

use crate::errors::{Error, Result};

type KindExtractor = Box<dyn Fn(&Value) -> String + Send + Sync>;
type MessageHandler = Arc<dyn Fn(Value) -> BoxFuture<'static, ()> + Send + Sync>;

pub struct MessageProcessor {
    extractor: Mutex<KindExtractor>,
    handlers: Mutex<HashMap<String, MessageHandler>>,
}

impl Default for MessageProcessor {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageProcessor {
    pub fn new() -> Self {
        Self {
            extractor: Mutex::new(Box::new(default_kind)),
            handlers: Mutex::new(HashMap::new()),
        }
    }

    /// Replace the message-kind extractor
    pub fn set_kind_extractor<F>(&self, extractor: F)
    where
        F: Fn(&Value) -> String + Send + Sync + 'static,
    {
        *self.extractor.lock().unwrap_or_else(|e| e.into_inner()) = Box::new(extractor);
    }

    /// Register the handler for a message kind, replacing any previous one
    pub fn register<F, Fut>(&self, kind: &str, handler: F)
    where
        F: Fn(Value) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let wrapped: MessageHandler = Arc::new(move |value| Box::pin(handler(value)));
        self.handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(kind.to_string(), wrapped);
    }

    /// Dispatch a parsed message to its handler.
    ///
    /// Unknown kinds are an error for the caller to log; the message is
    /// dropped either way.
    pub async fn process(&self, message: Value) -> Result<()> {
        let kind = {
            let extractor = self.extractor.lock().unwrap_or_else(|e| e.into_inner());
            extractor(&message)
        };

        let handler = self
            .handlers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&kind)
            .cloned();

        match handler {
            Some(handler) => {
                handler(message).await;
                Ok(())
            }
            None => Err(Error::UnknownMessage(kind)),
        }
    }
}

/// Default kind extraction: channel, then type, then "unknown"
pub fn default_kind(message: &Value) -> String {
    if let Some(channel) = message.get("channel").and_then(Value::as_str) {
        if !channel.is_empty() {
            return channel.to_string();
        }
    }
    if let Some(kind) = message.get("type").and_then(Value::as_str) {
        if !kind.is_empty() {
            return kind.to_string();
        }
    }
    "unknown".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_default_kind_precedence() {
        assert_eq!(default_kind(&json!({"channel": "l2_data", "type": "x"})), "l2_data");
        assert_eq!(default_kind(&json!({"type": "subscriptions"})), "subscriptions");
        assert_eq!(default_kind(&json!({"other": 1})), "unknown");
        assert_eq!(default_kind(&json!({"channel": ""})), "unknown");
    }

    #[tokio::test]
    async fn test_dispatch_to_registered_handler() {
        let processor = MessageProcessor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));

        let sink = seen.clone();
        processor.register("l2_data", move |value| {
            let sink = sink.clone();
            async move {
                sink.lock().unwrap().push(value["n"].as_i64().unwrap());
            }
        });

        processor
            .process(json!({"channel": "l2_data", "n": 7}))
            .await
            .unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn test_unknown_kind_is_error() {
        let processor = MessageProcessor::new();
        let result = processor.process(json!({"channel": "mystery"})).await;
        assert!(matches!(result, Err(Error::UnknownMessage(kind)) if kind == "mystery"));
    }

    #[tokio::test]
    async fn test_custom_extractor() {
        let processor = MessageProcessor::new();
        processor.set_kind_extractor(|v| {
            v.get("e")
                .and_then(Value::as_str)
                .unwrap_or("unknown")
                .to_string()
        });

        let hits = Arc::new(Mutex::new(0u32));
        let sink = hits.clone();
        processor.register("executionReport", move |_| {
            let sink = sink.clone();
            async move {
                *sink.lock().unwrap() += 1;
            }
        });

        processor
            .process(json!({"e": "executionReport"}))
            .await
            .unwrap();
        assert_eq!(*hits.lock().unwrap(), 1);
    }
}
