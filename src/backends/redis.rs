// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Redis-backed KV/stream store.
//!
//! Implements [`Kv`] over a `ConnectionManager`. Buffered operations
//! execute as one `pipe()` round-trip; stream events are written as a
//! single `v` field holding the serialized payload. RediSearch lifecycle
//! commands pass straight through (`FT._LIST`, `FT.DROPINDEX`).

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::streams::{StreamReadOptions, StreamReadReply};
use redis::{cmd, pipe, AsyncCommands, Client};

use crate::backend::{Kv, KvOp, StreamEvent};
use crate::error::OrmError;
use crate::resilience::retry::{retry, RetryConfig};

/// Stream entry field carrying the event payload.
const PAYLOAD_FIELD: &str = "v";

pub struct RedisKv {
    connection: ConnectionManager,
}

impl RedisKv {
    /// Connect with startup-mode retry (fails fast on bad configuration).
    pub async fn connect(connection_string: &str) -> Result<Self, OrmError> {
        let client =
            Client::open(connection_string).map_err(|e| OrmError::Cache(e.to_string()))?;
        let connection = retry("redis_connect", &RetryConfig::startup(), || async {
            ConnectionManager::new(client.clone()).await
        })
        .await
        .map_err(|e: redis::RedisError| OrmError::Cache(e.to_string()))?;
        Ok(Self { connection })
    }

    fn cache_err(e: redis::RedisError) -> OrmError {
        OrmError::Cache(e.to_string())
    }
}

#[async_trait]
impl Kv for RedisKv {
    async fn get(&self, key: &str) -> Result<Option<String>, OrmError> {
        let conn = self.connection.clone();
        retry("redis_get", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move { conn.get(key).await }
        })
        .await
        .map_err(Self::cache_err)
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), OrmError> {
        let conn = self.connection.clone();
        retry("redis_set", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move {
                match ttl_secs {
                    Some(ttl) => conn.set_ex(key, value, ttl).await,
                    None => conn.set(key, value).await,
                }
            }
        })
        .await
        .map_err(Self::cache_err)
    }

    async fn del(&self, keys: &[String]) -> Result<(), OrmError> {
        if keys.is_empty() {
            return Ok(());
        }
        let conn = self.connection.clone();
        retry("redis_del", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            async move { conn.del(keys).await }
        })
        .await
        .map_err(Self::cache_err)
    }

    async fn pipeline(&self, ops: &[KvOp]) -> Result<(), OrmError> {
        if ops.is_empty() {
            return Ok(());
        }
        let mut pipeline = pipe();
        for op in ops {
            match op {
                KvOp::Set { key, value, ttl_secs } => {
                    match ttl_secs {
                        Some(ttl) => pipeline.cmd("SETEX").arg(key).arg(*ttl).arg(value),
                        None => pipeline.set(key, value),
                    };
                }
                KvOp::Del { keys } => {
                    pipeline.del(keys);
                }
                KvOp::HSet { key, fields } => {
                    let mut c = pipeline.cmd("HSET");
                    c = c.arg(key);
                    for (field, value) in fields {
                        c = c.arg(field).arg(value);
                    }
                }
                KvOp::HDel { key, fields } => {
                    pipeline.hdel(key, fields);
                }
                KvOp::Expire { key, ttl_secs } => {
                    pipeline.expire(key, *ttl_secs as i64);
                }
                KvOp::XAdd { stream, payload } => {
                    pipeline
                        .cmd("XADD")
                        .arg(stream)
                        .arg("*")
                        .arg(PAYLOAD_FIELD)
                        .arg(payload);
                }
            }
        }
        let conn = self.connection.clone();
        retry("redis_pipeline", &RetryConfig::query(), || {
            let mut conn = conn.clone();
            let pipeline = pipeline.clone();
            async move { pipeline.query_async::<()>(&mut conn).await }
        })
        .await
        .map_err(Self::cache_err)
    }

    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<(), OrmError> {
        let mut conn = self.connection.clone();
        let result: Result<(), redis::RedisError> = cmd("XGROUP")
            .arg("CREATE")
            .arg(stream)
            .arg(group)
            .arg("$")
            .arg("MKSTREAM")
            .query_async(&mut conn)
            .await;
        match result {
            Ok(()) => Ok(()),
            // Group already exists.
            Err(e) if e.to_string().contains("BUSYGROUP") => Ok(()),
            Err(e) => Err(Self::cache_err(e)),
        }
    }

    async fn xread_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEvent>, OrmError> {
        let mut conn = self.connection.clone();
        let options = StreamReadOptions::default()
            .group(group, consumer)
            .count(count)
            .block(block_ms as usize);
        let ids: Vec<&str> = streams.iter().map(|_| ">").collect();
        let reply: StreamReadReply = conn
            .xread_options(streams, &ids, &options)
            .await
            .map_err(Self::cache_err)?;
        let mut events = Vec::new();
        for stream_key in reply.keys {
            for entry in stream_key.ids {
                let payload = entry
                    .get::<String>(PAYLOAD_FIELD)
                    .unwrap_or_default();
                events.push(StreamEvent {
                    stream: stream_key.key.clone(),
                    id: entry.id.clone(),
                    payload,
                });
            }
        }
        Ok(events)
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), OrmError> {
        let mut conn = self.connection.clone();
        let _: i64 = conn.xack(stream, group, &[id]).await.map_err(Self::cache_err)?;
        Ok(())
    }

    async fn ft_list(&self) -> Result<Vec<String>, OrmError> {
        let mut conn = self.connection.clone();
        cmd("FT._LIST").query_async(&mut conn).await.map_err(Self::cache_err)
    }

    async fn ft_drop_index(&self, index: &str) -> Result<(), OrmError> {
        let mut conn = self.connection.clone();
        cmd("FT.DROPINDEX")
            .arg(index)
            .query_async::<()>(&mut conn)
            .await
            .map_err(Self::cache_err)
    }
}
