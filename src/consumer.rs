// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Background consumer.
//!
//! A long-lived worker (`default-consumer` in the `orm-async-consumer`
//! group) drains the three core streams and replays their work
//! at-least-once: lazy envelopes re-execute their SQL and resolve the `:0`
//! id placeholders, log envelopes land in the audit tables, indexer events
//! drive chunked search rebuilds. Payloads that fail to deserialize are
//! logged and acked; the streams carry work that was already accepted.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::backend::StreamEvent;
use crate::engine::Engine;
use crate::error::OrmError;
use crate::schema::DATETIME_LAYOUT;
use crate::search::SearchIndexPusher;
use crate::streams::consumer::EventsConsumer;
use crate::streams::flusher::StreamFlusher;
use crate::streams::{
    DirtyQueueValue, IndexerEvent, LazyEnvelope, LazyQuery, LogQueueValue, ASYNC_CONSUMER_GROUP,
    LAZY_CHANNEL, LOG_CHANNEL, SEARCH_FORCE_INDEX_LAST_ID_PREFIX, SEARCH_INDEXER_CHANNEL,
};
use crate::value::DbValue;

pub type LogLogger = Box<dyn Fn(&LogQueueValue) + Send + Sync>;

/// Cursor TTL between indexer chunks (one day).
const INDEXER_CURSOR_TTL: u64 = 86_400;

pub struct BackgroundConsumer {
    engine: Arc<Engine>,
    consumer: EventsConsumer,
    log_logger: Option<LogLogger>,
}

impl BackgroundConsumer {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        let consumer =
            EventsConsumer::new(engine.registry().clone(), "default-consumer", ASYNC_CONSUMER_GROUP);
        Self { engine, consumer, log_logger: None }
    }

    /// Register a callback invoked with every written log row (inside the
    /// insert transaction, with `log_id` populated).
    pub fn set_log_logger(&mut self, logger: LogLogger) {
        self.log_logger = Some(logger);
    }

    /// Drain streams until the shutdown signal flips. The current batch
    /// always completes before returning.
    pub async fn digest(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), OrmError> {
        info!("background consumer started");
        loop {
            if *shutdown.borrow() {
                info!("background consumer stopping");
                return Ok(());
            }
            let events = tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        info!("background consumer stopping");
                        return Ok(());
                    }
                    continue;
                }
                batch = self.consumer.poll() => batch?,
            };
            if events.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
                continue;
            }
            for event in events {
                self.dispatch(&event).await?;
                self.consumer.ack(&event).await?;
            }
        }
    }

    /// Process one batch without blocking (used by embedders that drive
    /// their own loop).
    pub async fn digest_once(&self) -> Result<usize, OrmError> {
        let events = self.consumer.poll().await?;
        let count = events.len();
        for event in events {
            self.dispatch(&event).await?;
            self.consumer.ack(&event).await?;
        }
        Ok(count)
    }

    async fn dispatch(&self, event: &StreamEvent) -> Result<(), OrmError> {
        match event.stream.as_str() {
            LAZY_CHANNEL => self.handle_lazy(&event.payload).await,
            LOG_CHANNEL => self.handle_log_event(&event.payload).await,
            SEARCH_INDEXER_CHANNEL => self.handle_indexer_event(&event.payload).await,
            other => {
                debug!(stream = other, "event on unhandled stream");
                Ok(())
            }
        }
    }

    // ------------------------------------------------------------------
    // Lazy envelopes
    // ------------------------------------------------------------------

    pub async fn handle_lazy(&self, payload: &str) -> Result<(), OrmError> {
        let Ok(mut envelope) = serde_json::from_str::<LazyEnvelope>(payload) else {
            warn!("discarding malformed lazy envelope");
            return Ok(());
        };
        crate::metrics::record_lazy_replay(envelope.queries.len());
        let ids = self.replay_queries(&mut envelope).await?;
        self.write_log_rows(&envelope.logs).await?;
        self.publish_dirty(&envelope.dirty).await?;
        self.invalidate_caches(&envelope, &ids).await?;
        Ok(())
    }

    /// Execute the envelope's SQL. Inserts resolve their placeholder slots
    /// in the `l` and `d` lists: ids run `L + k·autoincrement` from the
    /// batch's `LastInsertId`, consumed in declaration order.
    async fn replay_queries(&self, envelope: &mut LazyEnvelope) -> Result<Vec<u64>, OrmError> {
        let registry = self.engine.registry().clone();
        let mut assigned: Vec<u64> = Vec::new();
        let mut log_cursor = 0usize;
        let mut dirty_cursor = 0usize;
        let queries = envelope.queries.clone();
        for LazyQuery(pool, sql, args) in &queries {
            let db = registry.db(pool)?;
            let args: Vec<DbValue> = args.clone().unwrap_or_default();
            let result = db.exec(sql, &args).await?;
            if !sql.starts_with("INSERT INTO") {
                continue;
            }
            let rows = values_rows(sql);
            let increment = db.autoincrement();
            let mut id = result.last_insert_id;
            let mut sequence = Vec::with_capacity(rows);
            for _ in 0..rows {
                sequence.push(id);
                assigned.push(id);
                id += increment;
            }
            log_cursor = assign_log_ids(&mut envelope.logs, log_cursor, &sequence);
            dirty_cursor = assign_dirty_ids(&mut envelope.dirty, dirty_cursor, &sequence);
        }
        Ok(assigned)
    }

    async fn write_log_rows(&self, rows: &[LogQueueValue]) -> Result<(), OrmError> {
        for row in rows {
            let mut row = row.clone();
            row.updated = chrono::Utc::now();
            self.handle_log(&row).await?;
        }
        Ok(())
    }

    async fn publish_dirty(&self, rows: &[DirtyQueueValue]) -> Result<(), OrmError> {
        if rows.is_empty() {
            return Ok(());
        }
        let mut flusher = StreamFlusher::new(self.engine.registry().clone());
        for row in rows {
            for stream in &row.streams {
                flusher.publish(stream, &row.event)?;
            }
        }
        flusher.flush().await
    }

    /// Resolve `:0` placeholder suffixes against the assigned insert ids
    /// (one replacement consumes one id, `cr` and `cl` independently) and
    /// invalidate.
    async fn invalidate_caches(
        &self,
        envelope: &LazyEnvelope,
        ids: &[u64],
    ) -> Result<(), OrmError> {
        let registry = self.engine.registry().clone();
        let mut cursor = 0usize;
        for (pool, keys) in &envelope.remote_cache_deletes {
            let resolved = resolve_placeholder_keys(keys, ids, &mut cursor);
            registry.kv(pool)?.del(&resolved).await?;
        }
        let mut cursor = 0usize;
        for (code, keys) in &envelope.local_cache_deletes {
            let resolved = resolve_placeholder_keys(keys, ids, &mut cursor);
            self.engine.local_cache(code)?.remove(&resolved);
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Audit log
    // ------------------------------------------------------------------

    pub async fn handle_log_event(&self, payload: &str) -> Result<(), OrmError> {
        let Ok(value) = serde_json::from_str::<LogQueueValue>(payload) else {
            warn!("discarding malformed log envelope");
            return Ok(());
        };
        self.handle_log(&value).await
    }

    async fn handle_log(&self, value: &LogQueueValue) -> Result<(), OrmError> {
        let registry = self.engine.registry().clone();
        let db = registry.db(&value.pool_name)?;
        let sql = format!(
            "INSERT INTO `{}`(`entity_id`, `added_at`, `meta`, `before`, `changes`) VALUES(?, ?, ?, ?, ?)",
            value.table_name
        );
        let json_arg = |field: &Option<serde_json::Value>| match field {
            Some(v) => DbValue::Str(v.to_string()),
            None => DbValue::Null,
        };
        let args = vec![
            DbValue::U64(value.id),
            DbValue::Str(value.updated.format(DATETIME_LAYOUT).to_string()),
            json_arg(&value.meta),
            json_arg(&value.before),
            json_arg(&value.changes),
        ];

        match &self.log_logger {
            None => {
                db.exec(&sql, &args).await?;
            }
            Some(logger) => {
                // The callback observes the row id inside the transaction;
                // any failure rolls the insert back.
                db.begin().await?;
                let result = db.exec(&sql, &args).await;
                match result {
                    Ok(result) => {
                        let mut value = value.clone();
                        value.log_id = result.last_insert_id;
                        logger(&value);
                        db.commit().await?;
                    }
                    Err(err) => {
                        let _ = db.rollback().await;
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Search indexer
    // ------------------------------------------------------------------

    pub async fn handle_indexer_event(&self, payload: &str) -> Result<(), OrmError> {
        let Ok(event) = serde_json::from_str::<IndexerEvent>(payload) else {
            warn!("discarding malformed indexer event");
            return Ok(());
        };
        let registry = self.engine.registry().clone();
        let mut found = None;
        for (pool, indexes) in &registry.search_indexes {
            if let Some(definition) = indexes.get(&event.index) {
                found = Some((pool.clone(), definition.clone()));
                break;
            }
        }
        let Some((pool, definition)) = found else {
            debug!(index = %event.index, "indexer event for unknown index");
            return Ok(());
        };

        let kv = registry.kv(&pool)?;
        let cursor_key = format!(
            "{}{}{}",
            SEARCH_FORCE_INDEX_LAST_ID_PREFIX, event.index, event.index_id
        );
        let mut id: u64 = match kv.get(&cursor_key).await? {
            Some(raw) => raw.parse().unwrap_or(0),
            None => 0,
        };
        let mut pusher = SearchIndexPusher::new(kv.clone());
        loop {
            let mut has_more = false;
            let mut next_id = 0u64;
            if let Some(indexer) = &definition.indexer {
                let (new_id, more) = indexer.index(id, &mut pusher).await?;
                next_id = new_id;
                has_more = more;
                if pusher.pending() > 0 {
                    pusher.flush().await?;
                }
                if has_more {
                    kv.set(&cursor_key, &next_id.to_string(), Some(INDEXER_CURSOR_TTL)).await?;
                }
            }
            if !has_more {
                kv.del(&[cursor_key.clone()]).await?;
                // Retire older versions of this index.
                let versioned_prefix = format!("{}:", definition.name);
                for old_name in kv.ft_list().await? {
                    let Some(rest) = old_name.strip_prefix(&versioned_prefix) else { continue };
                    let old_id: u64 = match rest.split(':').next().and_then(|v| v.parse().ok()) {
                        Some(v) => v,
                        None => continue,
                    };
                    if old_id < event.index_id {
                        kv.ft_drop_index(&old_name).await?;
                    }
                }
                debug!(index = %event.index, version = event.index_id, "search index rebuild complete");
                return Ok(());
            }
            if next_id <= id {
                return Err(OrmError::IndexerLoop { index: definition.name.clone(), pool });
            }
            id = next_id;
        }
    }
}

/// Count `(…)` tuples in the VALUES section of a batch INSERT.
fn values_rows(sql: &str) -> usize {
    match sql.find(" VALUES ") {
        Some(pos) => sql[pos..].matches("),(").count() + 1,
        None => 1,
    }
}

fn resolve_placeholder_keys(keys: &[String], ids: &[u64], cursor: &mut usize) -> Vec<String> {
    keys.iter()
        .map(|key| match key.strip_suffix(":0") {
            Some(prefix) if *cursor < ids.len() => {
                let id = ids[*cursor];
                *cursor += 1;
                format!("{prefix}:{id}")
            }
            _ => key.clone(),
        })
        .collect()
}

fn assign_log_ids(rows: &mut [LogQueueValue], cursor: usize, sequence: &[u64]) -> usize {
    let mut cursor = cursor;
    let mut seq = sequence.iter();
    while cursor < rows.len() {
        if rows[cursor].id == 0 {
            match seq.next() {
                Some(id) => rows[cursor].id = *id,
                None => break,
            }
        }
        cursor += 1;
    }
    cursor
}

fn assign_dirty_ids(rows: &mut [DirtyQueueValue], cursor: usize, sequence: &[u64]) -> usize {
    let mut cursor = cursor;
    let mut seq = sequence.iter();
    while cursor < rows.len() {
        if rows[cursor].event.id == 0 {
            match seq.next() {
                Some(id) => rows[cursor].event.id = *id,
                None => break,
            }
        }
        cursor += 1;
    }
    cursor
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::streams::DirtyEvent;

    #[test]
    fn test_values_rows() {
        assert_eq!(values_rows("INSERT INTO t(`A`) VALUES (?)"), 1);
        assert_eq!(values_rows("INSERT INTO t(`A`,`B`) VALUES (?,?),(?,?),(?,?)"), 3);
        assert_eq!(values_rows("DELETE FROM t WHERE `ID` IN (?)"), 1);
    }

    #[test]
    fn test_resolve_placeholder_consumes_in_order() {
        let keys = vec!["usr:0".to_string(), "usr:all".to_string(), "usr:0".to_string()];
        let mut cursor = 0;
        let resolved = resolve_placeholder_keys(&keys, &[7, 9], &mut cursor);
        assert_eq!(resolved, vec!["usr:7".to_string(), "usr:all".to_string(), "usr:9".to_string()]);
        assert_eq!(cursor, 2);
    }

    #[test]
    fn test_assign_dirty_ids_skips_filled_slots() {
        let row = |id: u64| DirtyQueueValue {
            event: DirtyEvent { entity: "User".into(), id, action: "i".into() },
            streams: vec!["s".into()],
        };
        let mut rows = vec![row(0), row(5), row(0)];
        let cursor = assign_dirty_ids(&mut rows, 0, &[10, 11]);
        assert_eq!(rows[0].event.id, 10);
        assert_eq!(rows[1].event.id, 5);
        assert_eq!(rows[2].event.id, 11);
        assert_eq!(cursor, 3);
    }
}
