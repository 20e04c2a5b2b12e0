//! Stream registry
//!
//! Maps stream IDs to live [`Stream`] state. Streams are created lazily on
//! first use, so publishers and subscribers can connect in either order.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;

use crate::registry::Stream;
use crate::server::ServerConfig;

/// Registry of all active streams
pub struct StreamRegistry {
    config: Arc<ServerConfig>,
    streams: Mutex<HashMap<String, Arc<Stream>>>,
}

impl StreamRegistry {
    pub fn new(config: Arc<ServerConfig>) -> Self {
        Self {
            config,
            streams: Mutex::new(HashMap::new()),
        }
    }

    pub fn config(&self) -> &Arc<ServerConfig> {
        &self.config
    }

    /// Get the stream for an ID, creating it on first sight
    pub async fn resolve(&self, stream_id: &str) -> Arc<Stream> {
        let mut streams = self.streams.lock().await;
        if let Some(stream) = streams.get(stream_id) {
            return stream.clone();
        }
        let stream = Stream::new(stream_id, self.config.clone());
        streams.insert(stream_id.to_string(), stream.clone());
        tracing::debug!(stream = %stream_id, "Stream created");
        stream
    }

    pub async fn stream_count(&self) -> usize {
        self.streams.lock().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolve_is_idempotent() {
        let registry = StreamRegistry::new(Arc::new(ServerConfig::default()));

        let a = registry.resolve("drone-1").await;
        let b = registry.resolve("drone-1").await;
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.stream_count().await, 1);

        let c = registry.resolve("drone-2").await;
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(registry.stream_count().await, 2);
    }
}
