// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Consumer-group stream reader.
//!
//! Wraps `XGROUP CREATE` / `XREADGROUP` / `XACK` for every registered
//! stream a group subscribes to, grouped per Redis pool. Blocking reads are
//! bounded by `block_ms`; the caller drives the loop and acks events
//! individually after handling them.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::OnceCell;
use tracing::debug;

use crate::backend::StreamEvent;
use crate::error::OrmError;
use crate::schema::ValidatedRegistry;

pub struct EventsConsumer {
    registry: Arc<ValidatedRegistry>,
    name: String,
    group: String,
    pub block_ms: u64,
    pub limit: usize,
    groups_ready: OnceCell<()>,
}

impl EventsConsumer {
    #[must_use]
    pub fn new(registry: Arc<ValidatedRegistry>, name: &str, group: &str) -> Self {
        Self {
            registry,
            name: name.to_string(),
            group: group.to_string(),
            block_ms: 30_000,
            limit: 100,
            groups_ready: OnceCell::new(),
        }
    }

    /// Streams this group subscribes to, keyed by Redis pool.
    fn subscriptions(&self) -> HashMap<String, Vec<String>> {
        let mut by_pool: HashMap<String, Vec<String>> = HashMap::new();
        for definition in self.registry.streams.values() {
            if definition.groups.iter().any(|g| g == &self.group) {
                by_pool
                    .entry(definition.pool.clone())
                    .or_default()
                    .push(definition.name.clone());
            }
        }
        for streams in by_pool.values_mut() {
            streams.sort();
        }
        by_pool
    }

    async fn ensure_groups(&self) -> Result<(), OrmError> {
        self.groups_ready
            .get_or_try_init(|| async {
                for (pool, streams) in self.subscriptions() {
                    let kv = self.registry.kv(&pool)?;
                    for stream in streams {
                        kv.xgroup_create(&stream, &self.group).await?;
                        debug!(stream = %stream, group = %self.group, "consumer group ready");
                    }
                }
                Ok::<(), OrmError>(())
            })
            .await?;
        Ok(())
    }

    /// Read the next batch of events, blocking up to `block_ms`.
    pub async fn poll(&self) -> Result<Vec<StreamEvent>, OrmError> {
        self.ensure_groups().await?;
        let mut events = Vec::new();
        for (pool, streams) in self.subscriptions() {
            let kv = self.registry.kv(&pool)?;
            let batch = kv
                .xread_group(&self.group, &self.name, &streams, self.limit, self.block_ms)
                .await?;
            events.extend(batch);
            if events.len() >= self.limit {
                events.truncate(self.limit);
                break;
            }
        }
        if !events.is_empty() {
            crate::metrics::record_consumer_batch(events.len());
        }
        Ok(events)
    }

    pub async fn ack(&self, event: &StreamEvent) -> Result<(), OrmError> {
        let definition = self.registry.stream(&event.stream)?;
        let kv = self.registry.kv(&definition.pool)?;
        kv.xack(&event.stream, &self.group, &event.id).await
    }
}
