// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The engine: context-scoped access to pools, caches and entities.
//!
//! An [`Engine`] wraps a validated registry with the per-process runtime
//! state: local cache instances, the optional request cache, engine-wide
//! log metadata, the sharded field-edit map, and the after-commit slots
//! where transactional flushes park their cache mutations until the
//! outermost commit.
//!
//! Read paths resolve local cache → remote cache → database and refill the
//! tiers on the way back; a missing row is cached as a tombstone so repeat
//! lookups stay off the database.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tracing::debug;

use crate::cache::LocalCache;
use crate::entity::{Entity, EntityRef};
use crate::error::OrmError;
use crate::flush::Flusher;
use crate::schema::{EntitySchema, ValidatedRegistry, FAKE_DELETE_COLUMN};
use crate::streams::flusher::StreamFlusher;
use crate::streams::{IndexerEvent, SEARCH_INDEXER_CHANNEL};
use crate::value::{
    build_local_cache_value, decode_remote_row, encode_remote_row, CacheValue, DbValue, REMOTE_NIL,
};

pub(crate) const REQUEST_CACHE_KEY: &str = "_request";

pub struct Engine {
    registry: Arc<ValidatedRegistry>,
    local_caches: HashMap<String, Arc<LocalCache>>,
    request_cache: Option<Arc<LocalCache>>,
    log_meta: RwLock<serde_json::Map<String, serde_json::Value>>,
    pub(crate) after_commit_local_sets: Mutex<HashMap<String, Vec<(String, CacheValue)>>>,
    pub(crate) after_commit_local_deletes: Mutex<HashMap<String, Vec<String>>>,
    pub(crate) after_commit_stream_flusher: Mutex<Option<StreamFlusher>>,
    /// Field-level edits merged per (schema index, entity id) shard.
    pub(crate) edited: DashMap<(usize, u64), EntityRef>,
}

impl Engine {
    #[must_use]
    pub fn new(registry: Arc<ValidatedRegistry>) -> Arc<Self> {
        let local_caches = registry
            .local_cache_pools
            .iter()
            .map(|(code, capacity)| (code.clone(), Arc::new(LocalCache::new(code, *capacity))))
            .collect();
        let request_cache = registry
            .request_cache_size
            .map(|capacity| Arc::new(LocalCache::new(REQUEST_CACHE_KEY, capacity)));
        Arc::new(Self {
            registry,
            local_caches,
            request_cache,
            log_meta: RwLock::new(serde_json::Map::new()),
            after_commit_local_sets: Mutex::new(HashMap::new()),
            after_commit_local_deletes: Mutex::new(HashMap::new()),
            after_commit_stream_flusher: Mutex::new(None),
            edited: DashMap::new(),
        })
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<ValidatedRegistry> {
        &self.registry
    }

    pub fn new_entity(&self, entity_name: &str) -> Result<EntityRef, OrmError> {
        Ok(Entity::new(self.registry.schema(entity_name)?))
    }

    #[must_use]
    pub fn flusher(self: &Arc<Self>) -> Flusher {
        Flusher::new(self.clone())
    }

    pub fn local_cache(&self, code: &str) -> Result<Arc<LocalCache>, OrmError> {
        if code == REQUEST_CACHE_KEY {
            return self
                .request_cache
                .clone()
                .ok_or_else(|| OrmError::Cache("request cache is not enabled".into()));
        }
        self.local_caches
            .get(code)
            .cloned()
            .ok_or_else(|| OrmError::Cache(format!("unknown local cache pool {code}")))
    }

    /// The schema's local cache tier: its own pool, or the engine-wide
    /// request cache when one is enabled.
    #[must_use]
    pub fn schema_local_cache(&self, schema: &EntitySchema) -> Option<Arc<LocalCache>> {
        match &schema.local_cache {
            Some(code) => self.local_caches.get(code).cloned(),
            None => self.request_cache.clone(),
        }
    }

    /// Engine-wide audit-log metadata, merged into every log row (engine
    /// wins on conflict with entity meta).
    pub fn set_log_meta(&self, key: &str, value: serde_json::Value) {
        self.log_meta.write().insert(key.to_string(), value);
    }

    #[must_use]
    pub fn log_meta(&self) -> serde_json::Map<String, serde_json::Value> {
        self.log_meta.read().clone()
    }

    /// Trigger a full rebuild of a search index at the given version.
    pub async fn force_reindex(&self, index_name: &str, version: u64) -> Result<(), OrmError> {
        let mut flusher = StreamFlusher::new(self.registry.clone());
        flusher.publish(
            SEARCH_INDEXER_CHANNEL,
            &IndexerEvent { index: index_name.to_string(), index_id: version },
        )?;
        flusher.flush().await
    }

    // ------------------------------------------------------------------
    // After-commit deferral
    // ------------------------------------------------------------------

    pub(crate) fn park_local_sets(&self, code: &str, sets: Vec<(String, CacheValue)>) {
        self.after_commit_local_sets
            .lock()
            .entry(code.to_string())
            .or_default()
            .extend(sets);
    }

    pub(crate) fn park_local_deletes(&self, code: &str, keys: Vec<String>) {
        self.after_commit_local_deletes
            .lock()
            .entry(code.to_string())
            .or_default()
            .extend(keys);
    }

    pub(crate) fn park_stream_flusher(&self, flusher: StreamFlusher) {
        let mut slot = self.after_commit_stream_flusher.lock();
        match slot.as_mut() {
            Some(existing) => existing.merge(flusher),
            None => *slot = Some(flusher),
        }
    }

    /// Apply everything parked by transactional flushes. Called after the
    /// outermost commit succeeds.
    pub(crate) async fn apply_after_commit(&self) -> Result<(), OrmError> {
        let deletes = std::mem::take(&mut *self.after_commit_local_deletes.lock());
        for (code, keys) in deletes {
            self.local_cache(&code)?.remove(&keys);
        }
        let sets = std::mem::take(&mut *self.after_commit_local_sets.lock());
        for (code, pairs) in sets {
            self.local_cache(&code)?.mset(pairs);
        }
        let flusher = self.after_commit_stream_flusher.lock().take();
        if let Some(mut flusher) = flusher {
            flusher.flush().await?;
        }
        Ok(())
    }

    /// Discard everything parked by an aborted transaction.
    pub(crate) fn discard_after_commit(&self) {
        self.after_commit_local_sets.lock().clear();
        self.after_commit_local_deletes.lock().clear();
        *self.after_commit_stream_flusher.lock() = None;
    }

    // ------------------------------------------------------------------
    // Read paths
    // ------------------------------------------------------------------

    fn select_sql(schema: &EntitySchema) -> String {
        let columns: Vec<String> =
            schema.columns.iter().map(|c| format!("`{}`", c.name)).collect();
        format!("SELECT {} FROM `{}`", columns.join(","), schema.table_name)
    }

    pub(crate) fn entity_from_row(
        &self,
        schema: &Arc<EntitySchema>,
        row: Vec<DbValue>,
    ) -> Result<EntityRef, OrmError> {
        let entity = Entity::new(schema.clone());
        entity.write().apply_row(row)?;
        Ok(entity)
    }

    /// Load one row by primary key, bypassing caches.
    pub(crate) async fn load_row(
        &self,
        schema: &EntitySchema,
        id: u64,
    ) -> Result<Option<Vec<DbValue>>, OrmError> {
        let db = self.registry.db(&schema.pool_name)?;
        let sql = format!("{} WHERE `ID` = ?", Self::select_sql(schema));
        let mut rows = db.query(&sql, &[DbValue::U64(id)]).await?;
        Ok(if rows.is_empty() { None } else { Some(rows.swap_remove(0)) })
    }

    /// Fetch an entity by id: local cache → remote cache → database, with
    /// every tier refilled on the way back.
    pub async fn get_by_id(
        self: &Arc<Self>,
        entity_name: &str,
        id: u64,
    ) -> Result<Option<EntityRef>, OrmError> {
        let schema = self.registry.schema(entity_name)?;
        let row_key = schema.cache_key(id);

        let local = self.schema_local_cache(&schema);
        if let Some(cache) = &local {
            match cache.get(&row_key) {
                Some(CacheValue::Nil) => return Ok(None),
                Some(CacheValue::Row(data)) => {
                    return Ok(Some(self.entity_from_row(&schema, data.to_vec())?));
                }
                _ => {}
            }
        }

        if let Some(pool) = &schema.redis_cache {
            let kv = self.registry.kv(pool)?;
            if let Some(raw) = kv.get(&row_key).await? {
                return match decode_remote_row(&raw) {
                    Some(row) => {
                        if let Some(cache) = &local {
                            cache.set(&row_key, build_local_cache_value(&row));
                        }
                        Ok(Some(self.entity_from_row(&schema, row)?))
                    }
                    None => {
                        if let Some(cache) = &local {
                            cache.set(&row_key, CacheValue::Nil);
                        }
                        Ok(None)
                    }
                };
            }
        }

        match self.load_row(&schema, id).await? {
            Some(row) => {
                if let Some(cache) = &local {
                    cache.set(&row_key, build_local_cache_value(&row));
                }
                if let Some(pool) = &schema.redis_cache {
                    self.registry.kv(pool)?.set(&row_key, &encode_remote_row(&row), None).await?;
                }
                Ok(Some(self.entity_from_row(&schema, row)?))
            }
            None => {
                debug!(entity = entity_name, id, "row not found, caching tombstone");
                if let Some(cache) = &local {
                    cache.set(&row_key, CacheValue::Nil);
                }
                if let Some(pool) = &schema.redis_cache {
                    self.registry.kv(pool)?.set(&row_key, REMOTE_NIL, None).await?;
                }
                Ok(None)
            }
        }
    }

    /// All rows of a schema. With `cache_all`, ids come from the synthetic
    /// index key and rows resolve through the cache tiers; deleted rows are
    /// filtered out by their tombstones.
    pub async fn get_all(self: &Arc<Self>, entity_name: &str) -> Result<Vec<EntityRef>, OrmError> {
        let schema = self.registry.schema(entity_name)?;
        if !schema.cache_all {
            let mut where_sql = String::from("1");
            if schema.has_fake_delete {
                where_sql = format!("`{FAKE_DELETE_COLUMN}` = 0");
            }
            let rows = self.search_rows(&schema, &where_sql, &[], None).await?;
            return rows
                .into_iter()
                .map(|row| self.entity_from_row(&schema, row))
                .collect();
        }

        let ids = self.cached_all_ids(&schema).await?;
        let mut entities = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(entity) = self.get_by_id(entity_name, id).await? {
                entities.push(entity);
            }
        }
        Ok(entities)
    }

    async fn cached_all_ids(&self, schema: &Arc<EntitySchema>) -> Result<Vec<u64>, OrmError> {
        let all_key = schema.cache_key_search(crate::schema::CACHE_ALL_INDEX, &[]);
        let local = self.schema_local_cache(schema);
        if let Some(cache) = &local {
            if let Some(CacheValue::Ids(ids)) = cache.get(&all_key) {
                return Ok(ids.to_vec());
            }
        }
        if let Some(pool) = &schema.redis_cache {
            let kv = self.registry.kv(pool)?;
            if let Some(raw) = kv.get(&all_key).await? {
                if let Ok(ids) = serde_json::from_str::<Vec<u64>>(&raw) {
                    if let Some(cache) = &local {
                        cache.set(&all_key, CacheValue::Ids(Arc::new(ids.clone())));
                    }
                    return Ok(ids);
                }
            }
        }

        let db = self.registry.db(&schema.pool_name)?;
        let mut sql = format!("SELECT `ID` FROM `{}`", schema.table_name);
        if schema.has_fake_delete {
            sql.push_str(&format!(" WHERE `{FAKE_DELETE_COLUMN}` = 0"));
        }
        let rows = db.query(&sql, &[]).await?;
        let ids: Vec<u64> = rows
            .iter()
            .filter_map(|row| match row.first() {
                Some(DbValue::U64(id)) => Some(*id),
                Some(DbValue::I64(id)) => Some(*id as u64),
                Some(DbValue::Str(s)) => s.parse().ok(),
                _ => None,
            })
            .collect();
        if let Some(cache) = &local {
            cache.set(&all_key, CacheValue::Ids(Arc::new(ids.clone())));
        }
        if let Some(pool) = &schema.redis_cache {
            let raw = serde_json::to_string(&ids).unwrap_or_default();
            self.registry.kv(pool)?.set(&all_key, &raw, None).await?;
        }
        Ok(ids)
    }

    /// SELECT full rows matching a WHERE clause.
    pub(crate) async fn search_rows(
        &self,
        schema: &EntitySchema,
        where_sql: &str,
        args: &[DbValue],
        limit: Option<usize>,
    ) -> Result<Vec<Vec<DbValue>>, OrmError> {
        let db = self.registry.db(&schema.pool_name)?;
        let mut sql = format!("{} WHERE {}", Self::select_sql(schema), where_sql);
        if let Some(limit) = limit {
            sql.push_str(&format!(" LIMIT {limit}"));
        }
        db.query(&sql, args).await
    }

    /// First entity matching a WHERE clause, hydrated but not cached.
    pub(crate) async fn search_one(
        &self,
        schema: &Arc<EntitySchema>,
        where_sql: &str,
        args: &[DbValue],
    ) -> Result<Option<EntityRef>, OrmError> {
        let mut rows = self.search_rows(schema, where_sql, args, Some(1)).await?;
        if rows.is_empty() {
            return Ok(None);
        }
        Ok(Some(self.entity_from_row(schema, rows.swap_remove(0))?))
    }
}
