// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Batched remote-cache and stream writer.
//!
//! A [`StreamFlusher`] accumulates deletions, hash updates and stream
//! publishes per Redis pool, then executes everything in one pipeline
//! round-trip per pool. Under a transaction the whole flusher is parked in
//! the engine's after-commit slot and flushed only once the outermost
//! commit succeeds.

use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use tracing::{debug, warn};

use crate::backend::KvOp;
use crate::error::OrmError;
use crate::schema::ValidatedRegistry;

pub struct StreamFlusher {
    registry: Arc<ValidatedRegistry>,
    ops: HashMap<String, Vec<KvOp>>,
}

impl StreamFlusher {
    #[must_use]
    pub fn new(registry: Arc<ValidatedRegistry>) -> Self {
        Self { registry, ops: HashMap::new() }
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ops.values().all(Vec::is_empty)
    }

    pub fn del(&mut self, pool: &str, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        self.ops
            .entry(pool.to_string())
            .or_default()
            .push(KvOp::Del { keys: keys.to_vec() });
    }

    pub fn set(&mut self, pool: &str, key: &str, value: &str, ttl_secs: Option<u64>) {
        self.ops.entry(pool.to_string()).or_default().push(KvOp::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl_secs,
        });
    }

    pub fn hset(&mut self, pool: &str, key: &str, fields: Vec<(String, String)>) {
        if fields.is_empty() {
            return;
        }
        self.ops
            .entry(pool.to_string())
            .or_default()
            .push(KvOp::HSet { key: key.to_string(), fields });
    }

    pub fn hdel(&mut self, pool: &str, key: &str, fields: Vec<String>) {
        self.ops
            .entry(pool.to_string())
            .or_default()
            .push(KvOp::HDel { key: key.to_string(), fields });
    }

    /// Publish a serializable event to a registered stream; the stream's
    /// pool is resolved from the registry.
    pub fn publish<T: Serialize>(&mut self, stream: &str, event: &T) -> Result<(), OrmError> {
        let payload = serde_json::to_string(event)
            .map_err(|e| OrmError::Stream(format!("event serialization failed: {e}")))?;
        let definition = self.registry.stream(stream)?;
        self.ops.entry(definition.pool.clone()).or_default().push(KvOp::XAdd {
            stream: stream.to_string(),
            payload,
        });
        Ok(())
    }

    /// Fold another flusher's pending operations into this one (after-commit
    /// accumulation across flushes in the same transaction).
    pub fn merge(&mut self, other: StreamFlusher) {
        for (pool, ops) in other.ops {
            self.ops.entry(pool).or_default().extend(ops);
        }
    }

    /// Execute all buffered operations, one pipeline per pool. The buffer
    /// drains even on failure so a retried flush cannot double-apply.
    pub async fn flush(&mut self) -> Result<(), OrmError> {
        let pending = std::mem::take(&mut self.ops);
        for (pool, ops) in pending {
            if ops.is_empty() {
                continue;
            }
            let kv = self.registry.kv(&pool)?;
            debug!(pool = %pool, commands = ops.len(), "redis pipeline exec");
            crate::metrics::record_pipeline_commands(&pool, ops.len());
            if let Err(err) = kv.pipeline(&ops).await {
                warn!(pool = %pool, error = %err, "redis pipeline failed");
                return Err(err);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{MemoryKv, MemorySql};
    use crate::schema::{EntitySchema, Registry};
    use crate::streams::{DirtyEvent, LAZY_CHANNEL};

    async fn registry_with_kv() -> (Arc<ValidatedRegistry>, Arc<MemoryKv>) {
        let kv = Arc::new(MemoryKv::new());
        let mut registry = Registry::new();
        registry.register_mysql_pool("default", Arc::new(MemorySql::new()));
        registry.register_redis_pool("default", kv.clone());
        registry.register_entity(EntitySchema::new("User", "users"));
        (Arc::new(registry.validate().await.unwrap()), kv)
    }

    #[tokio::test]
    async fn test_flush_executes_single_pipeline_per_pool() {
        let (registry, kv) = registry_with_kv().await;
        let mut flusher = StreamFlusher::new(registry);
        flusher.del("default", &["a".to_string(), "b".to_string()]);
        flusher.hset("default", "h", vec![("f".into(), "v".into())]);
        flusher.flush().await.unwrap();
        assert_eq!(kv.pipeline_count(), 1);
        assert!(flusher.is_empty());
    }

    #[tokio::test]
    async fn test_publish_resolves_stream_pool() {
        let (registry, kv) = registry_with_kv().await;
        let mut flusher = StreamFlusher::new(registry);
        flusher
            .publish(LAZY_CHANNEL, &DirtyEvent { entity: "User".into(), id: 1, action: "i".into() })
            .unwrap();
        flusher.flush().await.unwrap();
        assert_eq!(kv.stream_len(LAZY_CHANNEL), 1);
    }

    #[tokio::test]
    async fn test_publish_unknown_stream_fails() {
        let (registry, _) = registry_with_kv().await;
        let mut flusher = StreamFlusher::new(registry);
        let err = flusher.publish("unregistered", &serde_json::json!({})).unwrap_err();
        assert!(matches!(err, OrmError::Stream(_)));
    }

    #[tokio::test]
    async fn test_merge_accumulates_ops() {
        let (registry, kv) = registry_with_kv().await;
        let mut first = StreamFlusher::new(registry.clone());
        first.del("default", &["a".to_string()]);
        let mut second = StreamFlusher::new(registry);
        second.del("default", &["b".to_string()]);
        first.merge(second);
        first.flush().await.unwrap();
        assert_eq!(kv.pipeline_count(), 1);
        assert!(kv.deleted_keys().contains(&"a".to_string()));
        assert!(kv.deleted_keys().contains(&"b".to_string()));
    }
}
