// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! The flush engine.
//!
//! A [`Flusher`] collects tracked entities and applies them to the
//! database in batches: compound INSERTs per entity type, concatenated
//! UPDATEs per pool (wrapped in a forced transaction once a pool holds
//! three or more), `DELETE … WHERE ID IN` per type. Unsaved references are
//! flushed first; cascade deletes page through referencing rows. Every
//! mutation fans out to the cache tiers and to the audit-log and dirty
//! streams.
//!
//! Invocation modes: [`Flusher::flush`] (synchronous),
//! [`Flusher::flush_in_transaction`], [`Flusher::flush_lazy`] (everything
//! serialized into one envelope on the lazy stream), and the checked
//! variants which clear the tracked set and hand back recoverable errors.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;

use tokio::sync::Mutex;
use tracing::debug;

use crate::engine::Engine;
use crate::entity::EntityRef;
use crate::error::OrmError;
use crate::schema::{EntitySchema, CACHE_ALL_INDEX, FAKE_DELETE_COLUMN};
use crate::streams::flusher::StreamFlusher;
use crate::streams::{
    bind_to_json, DirtyEvent, DirtyQueueValue, LazyEnvelope, LazyQuery, LogQueueValue,
    LAZY_CHANNEL, LOG_CHANNEL,
};
use crate::value::{build_local_cache_value, Bind, CacheValue, DbValue};

/// Hard cap on entities tracked per flush.
pub const TRACK_LIMIT: usize = 10_000;

/// Referencing rows are deleted in pages of this size during cascades.
const CASCADE_PAGE: usize = 1000;

/// Pools with at least this many buffered updates and no open transaction
/// get a forced transaction around the multi-statement execution.
const FORCED_TX_THRESHOLD: usize = 3;

/// How a mutation affects cached query-index keys.
#[derive(Clone, Copy, PartialEq, Eq)]
enum CacheEvent {
    Insert,
    Update,
    Delete,
}

#[derive(Default)]
struct FlushState {
    tracked: Vec<EntityRef>,
    update_sqls: HashMap<String, Vec<String>>,
    delete_binds: HashMap<usize, BTreeMap<u64, EntityRef>>,
    local_cache_sets: HashMap<String, Vec<(String, CacheValue)>>,
    local_cache_deletes: HashMap<String, Vec<String>>,
    stream_flusher: Option<StreamFlusher>,
    lazy: LazyEnvelope,
}

impl FlushState {
    fn reset_accumulators(&mut self) {
        self.update_sqls.clear();
        self.delete_binds.clear();
        self.local_cache_sets.clear();
        self.local_cache_deletes.clear();
        self.stream_flusher = None;
        self.lazy = LazyEnvelope::default();
    }

    fn add_local_set(&mut self, code: &str, key: String, value: CacheValue) {
        self.local_cache_sets.entry(code.to_string()).or_default().push((key, value));
    }

    fn add_local_deletes(&mut self, code: &str, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        self.local_cache_deletes.entry(code.to_string()).or_default().extend(keys);
    }

    fn add_lazy_local_deletes(&mut self, code: &str, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        self.lazy.local_cache_deletes.entry(code.to_string()).or_default().extend(keys);
    }

    fn add_lazy_remote_deletes(&mut self, pool: &str, keys: Vec<String>) {
        if keys.is_empty() {
            return;
        }
        self.lazy.remote_cache_deletes.entry(pool.to_string()).or_default().extend(keys);
    }
}

pub struct Flusher {
    engine: Arc<Engine>,
    state: Mutex<FlushState>,
}

impl Flusher {
    #[must_use]
    pub fn new(engine: Arc<Engine>) -> Self {
        Self { engine, state: Mutex::new(FlushState::default()) }
    }

    /// Add entities to the tracked set.
    pub async fn track(&self, entities: &[EntityRef]) -> Result<(), OrmError> {
        let mut st = self.state.lock().await;
        for entity in entities {
            if st.tracked.len() >= TRACK_LIMIT {
                return Err(OrmError::TrackLimitExceeded(TRACK_LIMIT));
            }
            st.tracked.push(entity.clone());
        }
        Ok(())
    }

    /// Track entities marked for deletion (soft delete when the schema
    /// supports it).
    pub async fn delete(&self, entities: &[EntityRef]) -> Result<(), OrmError> {
        for entity in entities {
            entity.write().mark_to_delete();
        }
        self.track(entities).await
    }

    /// Track entities for hard deletion, bypassing soft delete.
    pub async fn force_delete(&self, entities: &[EntityRef]) -> Result<(), OrmError> {
        for entity in entities {
            entity.write().force_mark_to_delete();
        }
        self.track(entities).await
    }

    /// Drop the tracked set and all accumulated work.
    pub async fn clear(&self) {
        let mut st = self.state.lock().await;
        for entity in &st.tracked {
            entity.write().reset_delete_marks();
        }
        st.tracked.clear();
        st.reset_accumulators();
    }

    pub async fn flush(&self) -> Result<(), OrmError> {
        self.flush_tracked(false, false).await
    }

    pub async fn flush_lazy(&self) -> Result<(), OrmError> {
        self.flush_tracked(true, false).await
    }

    pub async fn flush_in_transaction(&self) -> Result<(), OrmError> {
        self.flush_tracked(false, true).await
    }

    /// Flush and report recoverable errors (duplicate key, foreign key);
    /// the tracked set is cleared on any failure.
    pub async fn flush_with_check(&self) -> Result<(), OrmError> {
        self.flush_checked(false).await
    }

    pub async fn flush_in_transaction_with_check(&self) -> Result<(), OrmError> {
        self.flush_checked(true).await
    }

    /// Flush and capture any fault, clearing tracked state first.
    pub async fn flush_with_full_check(&self) -> Result<(), OrmError> {
        match self.flush_tracked(false, false).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.clear().await;
                Err(err)
            }
        }
    }

    async fn flush_checked(&self, transaction: bool) -> Result<(), OrmError> {
        match self.flush_tracked(false, transaction).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.clear().await;
                debug!(error = %err, recoverable = err.is_recoverable(), "checked flush failed");
                Err(err)
            }
        }
    }

    async fn flush_tracked(&self, lazy: bool, transaction: bool) -> Result<(), OrmError> {
        let mut st = self.state.lock().await;

        // Materialise pending field edits into the tracked set.
        let edited: Vec<EntityRef> = {
            let keys: Vec<(usize, u64)> =
                self.engine.edited.iter().map(|e| *e.key()).collect();
            keys.into_iter()
                .filter_map(|key| self.engine.edited.remove(&key).map(|(_, v)| v))
                .collect()
        };
        for entity in edited {
            if !st.tracked.iter().any(|t| Arc::ptr_eq(t, &entity)) {
                st.tracked.push(entity);
            }
        }
        if st.tracked.is_empty() {
            return Ok(());
        }

        let start = Instant::now();
        let count = st.tracked.len();
        let registry = self.engine.registry().clone();

        let mut tx_pools: Vec<String> = Vec::new();
        if transaction {
            for entity in &st.tracked {
                let pool = entity.read().schema().pool_name.clone();
                if !tx_pools.contains(&pool) {
                    tx_pools.push(pool);
                }
            }
            for pool in &tx_pools {
                registry.db(pool)?.begin().await?;
            }
        }

        let entities = st.tracked.clone();
        let result = self
            .flush_internal(&mut st, true, lazy, transaction, entities)
            .await;

        match result {
            Ok(()) => {
                if transaction {
                    for pool in &tx_pools {
                        registry.db(pool)?.commit().await?;
                    }
                    self.engine.apply_after_commit().await?;
                }
                st.tracked.clear();
                st.reset_accumulators();
                crate::metrics::record_flush(count, start.elapsed(), lazy);
                Ok(())
            }
            Err(err) => {
                for pool in &tx_pools {
                    let _ = registry.db(pool)?.rollback().await;
                }
                if transaction {
                    self.engine.discard_after_commit();
                }
                st.reset_accumulators();
                Err(err)
            }
        }
    }

    fn flush_internal<'a>(
        &'a self,
        st: &'a mut FlushState,
        root: bool,
        lazy: bool,
        transaction: bool,
        entities: Vec<EntityRef>,
    ) -> Pin<Box<dyn Future<Output = Result<(), OrmError>> + Send + 'a>> {
        Box::pin(async move {
            let registry = self.engine.registry().clone();

            // Step 1: reference closure. Unsaved referenced entities flush
            // first, then the originals minus the references.
            let mut references: Vec<EntityRef> = Vec::new();
            for entity in &entities {
                for unsaved in entity.read().unsaved_references() {
                    if !references.iter().any(|r| Arc::ptr_eq(r, &unsaved)) {
                        references.push(unsaved);
                    }
                }
            }
            if !references.is_empty() {
                if lazy {
                    return Err(OrmError::LazyNotSupported("unsaved references".into()));
                }
                self.flush_internal(st, false, false, transaction, references.clone())
                    .await?;
                let rest: Vec<EntityRef> = entities
                    .iter()
                    .filter(|e| !references.iter().any(|r| Arc::ptr_eq(r, e)))
                    .cloned()
                    .collect();
                if !rest.is_empty() {
                    self.flush_internal(st, true, false, transaction, rest).await?;
                }
                return Ok(());
            }

            let mut transaction = transaction;
            let mut insert_keys: HashMap<usize, Vec<String>> = HashMap::new();
            let mut insert_args: HashMap<usize, Vec<DbValue>> = HashMap::new();
            let mut insert_binds: HashMap<usize, Vec<Bind>> = HashMap::new();
            let mut insert_entities: HashMap<usize, Vec<EntityRef>> = HashMap::new();
            let mut insert_order: Vec<usize> = Vec::new();

            // Step 2: classification.
            for entity in &entities {
                let schema = entity.read().schema().clone();
                if !transaction && registry.db(&schema.pool_name)?.in_transaction() {
                    transaction = true;
                }
                entity.write().promote_fake_delete();

                let (id, in_db, force_delete) = {
                    let guard = entity.read();
                    (guard.id(), guard.is_in_db(), guard.is_force_delete())
                };
                if force_delete {
                    st.delete_binds
                        .entry(schema.index)
                        .or_default()
                        .insert(id, entity.clone());
                    continue;
                }

                let Some(dirty) = entity.read().dirty_bind()? else { continue };
                let mut bind = dirty.new_bind;

                if !in_db {
                    let on_duplicate = entity.read().on_duplicate_key_update().cloned();
                    if let Some(on_duplicate) = on_duplicate {
                        if lazy {
                            return Err(OrmError::LazyNotSupported(
                                "on duplicate key update".into(),
                            ));
                        }
                        self.insert_on_duplicate(st, &schema, entity, bind, &on_duplicate)
                            .await?;
                        continue;
                    }
                    if id > 0 {
                        bind.insert("ID".to_string(), DbValue::U64(id));
                    }
                    let keys = insert_keys
                        .entry(schema.index)
                        .or_insert_with(|| bind.keys().cloned().collect());
                    let args = insert_args.entry(schema.index).or_default();
                    for key in keys.iter() {
                        args.push(bind.get(key).cloned().unwrap_or(DbValue::Null));
                    }
                    if !insert_order.contains(&schema.index) {
                        insert_order.push(schema.index);
                    }
                    insert_entities.entry(schema.index).or_default().push(entity.clone());
                    insert_binds.entry(schema.index).or_default().push(bind);
                } else {
                    if !entity.read().is_loaded() {
                        return Err(OrmError::NotLoaded {
                            entity: schema.entity_name.clone(),
                            id,
                        });
                    }
                    let assignments: Vec<String> = bind
                        .iter()
                        .map(|(column, value)| {
                            format!("`{}`={}", column, value.to_sql_literal())
                        })
                        .collect();
                    let sql = format!(
                        "UPDATE {} SET {} WHERE `ID` = {}",
                        schema.table_name,
                        assignments.join(","),
                        id
                    );
                    let old_data =
                        entity.read().db_data().map(<[DbValue]>::to_vec).unwrap_or_default();
                    if lazy {
                        let (log_event, dirty_event) = self
                            .update_cache_after_update(st, &schema, entity, &bind, old_data, id, true)?;
                        let db = registry.db(&schema.pool_name)?;
                        st.lazy.queries.push(LazyQuery(db.code().to_string(), sql, None));
                        st.lazy.logs.extend(log_event);
                        st.lazy.dirty.extend(dirty_event);
                    } else {
                        st.update_sqls
                            .entry(schema.pool_name.clone())
                            .or_default()
                            .push(sql);
                        self.update_cache_after_update(st, &schema, entity, &bind, old_data, id, false)?;
                    }
                }
            }

            // Step 3: compound INSERT per entity type, ids stamped from
            // LastInsertId in pool-increment steps.
            for schema_index in insert_order {
                let schema = registry.schema_by_index(schema_index);
                let keys = &insert_keys[&schema_index];
                let columns: Vec<String> = keys.iter().map(|k| format!("`{k}`")).collect();
                let tuple = format!("({})", vec!["?"; keys.len()].join(","));
                let binds = insert_binds.remove(&schema_index).unwrap_or_default();
                let tuples = vec![tuple; binds.len()].join(",");
                let sql = format!(
                    "INSERT INTO {}({}) VALUES {}",
                    schema.table_name,
                    columns.join(","),
                    tuples
                );
                let args = insert_args.remove(&schema_index).unwrap_or_default();
                let entities = insert_entities.remove(&schema_index).unwrap_or_default();
                let db = registry.db(&schema.pool_name)?;

                if lazy {
                    for (entity, bind) in entities.iter().zip(binds.iter()) {
                        let (log_event, dirty_event) =
                            self.update_cache_for_inserted(st, &schema, entity, true, 0, bind)?;
                        st.lazy.logs.extend(log_event);
                        st.lazy.dirty.extend(dirty_event);
                    }
                    st.lazy
                        .queries
                        .push(LazyQuery(db.code().to_string(), sql, Some(args)));
                } else {
                    let result = db.exec(&sql, &args).await?;
                    let mut next_id = result.last_insert_id;
                    for (entity, bind) in entities.iter().zip(binds.iter()) {
                        let inserted = {
                            let mut guard = entity.write();
                            guard.inject_bind(bind);
                            let mut inserted = guard.id();
                            if inserted == 0 {
                                guard.set_id(next_id);
                                inserted = next_id;
                                next_id += db.autoincrement();
                            }
                            inserted
                        };
                        self.update_cache_for_inserted(st, &schema, entity, false, inserted, bind)?;
                    }
                }
            }

            if root {
                self.execute_updates(st, lazy).await?;
                self.execute_deletes(st, lazy, transaction).await?;
                self.apply_local_caches(st, lazy, transaction)?;
            }

            if lazy && !st.lazy.is_empty() {
                let envelope = std::mem::take(&mut st.lazy);
                self.stream_flusher(st).publish(LAZY_CHANNEL, &envelope)?;
            }
            if transaction {
                if let Some(flusher) = st.stream_flusher.take() {
                    self.engine.park_stream_flusher(flusher);
                }
            } else if root {
                if let Some(mut flusher) = st.stream_flusher.take() {
                    flusher.flush().await?;
                }
            }
            Ok(())
        })
    }

    /// Per-pool UPDATE execution: one statement goes alone; several are
    /// joined into one multi-statement round-trip, under a forced
    /// transaction once the pool holds [`FORCED_TX_THRESHOLD`].
    async fn execute_updates(&self, st: &mut FlushState, lazy: bool) -> Result<(), OrmError> {
        if lazy {
            return Ok(());
        }
        let registry = self.engine.registry().clone();
        let update_sqls = std::mem::take(&mut st.update_sqls);
        for (pool, queries) in update_sqls {
            let db = registry.db(&pool)?;
            if queries.len() == 1 {
                db.exec(&queries[0], &[]).await?;
                continue;
            }
            let forced = queries.len() >= FORCED_TX_THRESHOLD && !db.in_transaction();
            if forced {
                db.begin().await?;
            }
            let joined = format!("{};", queries.join(";"));
            match db.query(&joined, &[]).await {
                Ok(_) => {
                    if forced {
                        db.commit().await?;
                    }
                }
                Err(err) => {
                    if forced {
                        let _ = db.rollback().await;
                    }
                    return Err(err);
                }
            }
        }
        Ok(())
    }

    async fn execute_deletes(
        &self,
        st: &mut FlushState,
        lazy: bool,
        transaction: bool,
    ) -> Result<(), OrmError> {
        let registry = self.engine.registry().clone();
        let delete_binds = std::mem::take(&mut st.delete_binds);
        for (schema_index, entities) in delete_binds {
            let schema = registry.schema_by_index(schema_index);
            let db = registry.db(&schema.pool_name)?;
            let ids: Vec<u64> = entities.keys().copied().collect();
            let id_args: Vec<DbValue> = ids.iter().map(|id| DbValue::U64(*id)).collect();
            let placeholders = vec!["?"; ids.len()].join(",");
            let sql = format!(
                "DELETE FROM `{}` WHERE `ID` IN ({})",
                schema.table_name, placeholders
            );

            if lazy {
                for (id, entity) in &entities {
                    let data =
                        entity.read().db_data().map(<[DbValue]>::to_vec).unwrap_or_default();
                    let bind = schema.row_to_bind(&data);
                    let meta = entity.read().log_meta().clone();
                    let log_event =
                        self.add_to_log_queue(st, &schema, *id, Some(&bind), None, meta, true)?;
                    let dirty_event = self.add_dirty_queues(st, &bind, &schema, *id, "d", true)?;
                    st.lazy.logs.extend(log_event);
                    st.lazy.dirty.extend(dirty_event);
                }
                st.lazy
                    .queries
                    .push(LazyQuery(db.code().to_string(), sql, Some(id_args.clone())));
            } else {
                // Step 4: cascade deletes page through referencing rows.
                for usage in registry.usage(&schema.entity_name) {
                    if !usage.cascade {
                        continue;
                    }
                    let ref_schema = registry.schema_by_index(usage.schema_index);
                    let where_sql =
                        format!("`{}` IN ({})", usage.column, placeholders);
                    loop {
                        let rows = self
                            .engine
                            .search_rows(&ref_schema, &where_sql, &id_args, Some(CASCADE_PAGE))
                            .await?;
                        if rows.is_empty() {
                            break;
                        }
                        let page_full = rows.len() == CASCADE_PAGE;
                        let mut children = Vec::with_capacity(rows.len());
                        for row in rows {
                            let child = self.engine.entity_from_row(&ref_schema, row)?;
                            child.write().mark_to_delete();
                            children.push(child);
                        }
                        self.flush_internal(st, true, lazy, transaction, children).await?;
                        if !page_full {
                            break;
                        }
                    }
                }
                db.exec(&sql, &id_args).await?;
            }

            // Step 6: cache fan-out per deleted entity.
            for (id, entity) in &entities {
                let data = entity.read().db_data().map(<[DbValue]>::to_vec).unwrap_or_default();
                let bind = schema.row_to_bind(&data);
                if !lazy {
                    self.add_dirty_queues(st, &bind, &schema, *id, "d", false)?;
                    let meta = entity.read().log_meta().clone();
                    self.add_to_log_queue(st, &schema, *id, Some(&bind), None, meta, false)?;
                }
                let row_key = schema.cache_key(*id);
                let keys = self.cache_queries_keys(&schema, &bind, &data, CacheEvent::Delete);
                if let Some(cache) = self.engine.schema_local_cache(&schema) {
                    if lazy {
                        st.add_lazy_local_deletes(cache.code(), vec![row_key.clone()]);
                    } else {
                        st.add_local_set(cache.code(), row_key.clone(), CacheValue::Nil);
                    }
                    if lazy {
                        st.add_lazy_local_deletes(cache.code(), keys.clone());
                    } else {
                        st.add_local_deletes(cache.code(), keys.clone());
                    }
                }
                if let Some(pool) = schema.redis_cache.clone() {
                    let mut remote = vec![row_key];
                    remote.extend(keys);
                    if lazy {
                        st.add_lazy_remote_deletes(&pool, remote);
                    } else {
                        let registry = self.engine.registry().clone();
                        self.stream_flusher_with(st, &registry).del(&pool, &remote);
                    }
                }
                if let Some(index) = schema.search_index.clone() {
                    if !lazy {
                        let registry = self.engine.registry().clone();
                        self.stream_flusher_with(st, &registry)
                            .del(&index.pool, &[index.document_key(*id)]);
                    }
                }
            }
        }
        Ok(())
    }

    /// Apply (or defer, under a transaction) accumulated local-cache work.
    fn apply_local_caches(
        &self,
        st: &mut FlushState,
        lazy: bool,
        transaction: bool,
    ) -> Result<(), OrmError> {
        let deletes = std::mem::take(&mut st.local_cache_deletes);
        if lazy {
            for (code, keys) in deletes {
                st.add_lazy_local_deletes(&code, keys);
            }
        } else {
            for (code, keys) in deletes {
                if transaction {
                    self.engine.park_local_deletes(&code, keys);
                } else {
                    self.engine.local_cache(&code)?.remove(&keys);
                }
            }
        }
        let sets = std::mem::take(&mut st.local_cache_sets);
        for (code, pairs) in sets {
            if transaction {
                self.engine.park_local_sets(&code, pairs);
            } else {
                self.engine.local_cache(&code)?.mset(pairs);
            }
        }
        Ok(())
    }

    async fn insert_on_duplicate(
        &self,
        st: &mut FlushState,
        schema: &Arc<EntitySchema>,
        entity: &EntityRef,
        mut bind: Bind,
        on_duplicate: &Bind,
    ) -> Result<(), OrmError> {
        let registry = self.engine.registry().clone();
        let db = registry.db(&schema.pool_name)?;
        let id = entity.read().id();
        if id > 0 {
            bind.insert("ID".to_string(), DbValue::U64(id));
        }
        let columns: Vec<String> = bind.keys().map(|k| format!("`{k}`")).collect();
        let mut args: Vec<DbValue> = bind.values().cloned().collect();
        let mut sql = format!(
            "INSERT INTO {}({}) VALUES ({}) ON DUPLICATE KEY UPDATE ",
            schema.table_name,
            columns.join(","),
            vec!["?"; bind.len()].join(",")
        );
        if on_duplicate.is_empty() {
            sql.push_str("`ID` = `ID`");
        } else {
            let assignments: Vec<String> =
                on_duplicate.keys().map(|k| format!("`{k}` = ?")).collect();
            sql.push_str(&assignments.join(", "));
            args.extend(on_duplicate.values().cloned());
        }

        let result = db.exec(&sql, &args).await?;
        if result.rows_affected > 0 {
            let last_id = result.last_insert_id;
            let old_data = {
                let mut guard = entity.write();
                guard.inject_bind(&bind);
                guard.set_id(last_id);
                guard.db_data().map(<[DbValue]>::to_vec).unwrap_or_default()
            };
            if result.rows_affected == 1 {
                self.update_cache_for_inserted(st, schema, entity, false, last_id, &bind)?;
            } else {
                // Conflicting row was updated in place: apply the update
                // columns, reload the authoritative row, then run the
                // update-cache path.
                {
                    let mut guard = entity.write();
                    for (column_name, value) in on_duplicate {
                        if let Some(column) = schema.column(column_name) {
                            guard.set_raw(column_name, column.field_from_db(value)?);
                        }
                    }
                }
                if let Some(row) = self.engine.load_row(schema, last_id).await? {
                    entity.write().apply_row(row)?;
                }
                self.update_cache_after_update(
                    st,
                    schema,
                    entity,
                    on_duplicate,
                    old_data,
                    last_id,
                    false,
                )?;
            }
        } else {
            // Nothing inserted or updated: locate the conflicting row via
            // the first unique index fully present in the bind.
            'indexes: for columns in schema.unique_indexes.values() {
                let mut fields = Vec::with_capacity(columns.len());
                let mut where_args = Vec::with_capacity(columns.len());
                for column in columns {
                    match bind.get(column) {
                        Some(value) if !value.is_null() => {
                            fields.push(format!("`{column}` = ?"));
                            where_args.push(value.clone());
                        }
                        _ => continue 'indexes,
                    }
                }
                if let Some(found) = self
                    .engine
                    .search_one(schema, &fields.join(" AND "), &where_args)
                    .await?
                {
                    let row = found.read().db_data().map(<[DbValue]>::to_vec).unwrap_or_default();
                    entity.write().apply_row(row)?;
                }
                break;
            }
        }
        Ok(())
    }

    /// Cache fan-out for a freshly inserted row.
    fn update_cache_for_inserted(
        &self,
        st: &mut FlushState,
        schema: &Arc<EntitySchema>,
        entity: &EntityRef,
        lazy: bool,
        id: u64,
        bind: &Bind,
    ) -> Result<(Option<LogQueueValue>, Option<DirtyQueueValue>), OrmError> {
        let registry = self.engine.registry().clone();
        let data = entity
            .read()
            .db_data()
            .map(<[DbValue]>::to_vec)
            .unwrap_or_else(|| vec![DbValue::Null; schema.columns.len()]);
        let row_key = schema.cache_key(id);
        let keys = self.cache_queries_keys(schema, bind, &data, CacheEvent::Insert);

        if let Some(cache) = self.engine.schema_local_cache(schema) {
            if lazy {
                st.add_lazy_local_deletes(cache.code(), vec![row_key.clone()]);
                st.add_lazy_local_deletes(cache.code(), keys.clone());
            } else {
                st.add_local_set(cache.code(), row_key.clone(), build_local_cache_value(&data));
                st.add_local_deletes(cache.code(), keys.clone());
            }
        }
        if let Some(pool) = schema.redis_cache.clone() {
            let mut remote = vec![row_key];
            remote.extend(keys);
            if lazy {
                st.add_lazy_remote_deletes(&pool, remote);
            } else {
                self.stream_flusher_with(st, &registry).del(&pool, &remote);
            }
        }
        if !lazy {
            self.fill_search_from_bind(st, schema, bind, id)?;
        }
        let meta = entity.read().log_meta().clone();
        let log_event = self.add_to_log_queue(st, schema, id, None, Some(bind), meta, lazy)?;
        let dirty_event = self.add_dirty_queues(st, bind, schema, id, "i", lazy)?;
        Ok((log_event, dirty_event))
    }

    /// Cache fan-out for an updated row: both the old and new query-index
    /// positions are purged.
    #[allow(clippy::too_many_arguments)]
    fn update_cache_after_update(
        &self,
        st: &mut FlushState,
        schema: &Arc<EntitySchema>,
        entity: &EntityRef,
        bind: &Bind,
        old_data: Vec<DbValue>,
        id: u64,
        lazy: bool,
    ) -> Result<(Option<LogQueueValue>, Option<DirtyQueueValue>), OrmError> {
        let registry = self.engine.registry().clone();
        entity.write().inject_bind(bind);
        let new_data = entity
            .read()
            .db_data()
            .map(<[DbValue]>::to_vec)
            .unwrap_or_default();
        let row_key = schema.cache_key(id);
        let mut keys = self.cache_queries_keys(schema, bind, &new_data, CacheEvent::Update);
        keys.extend(self.cache_queries_keys(schema, bind, &old_data, CacheEvent::Update));

        if let Some(cache) = self.engine.schema_local_cache(schema) {
            if lazy {
                st.add_lazy_local_deletes(cache.code(), vec![row_key.clone()]);
                st.add_lazy_local_deletes(cache.code(), keys.clone());
            } else {
                st.add_local_set(cache.code(), row_key.clone(), build_local_cache_value(&new_data));
                st.add_local_deletes(cache.code(), keys.clone());
            }
        }
        if let Some(pool) = schema.redis_cache.clone() {
            let mut remote = vec![row_key];
            remote.extend(keys);
            if lazy {
                st.add_lazy_remote_deletes(&pool, remote);
            } else {
                self.stream_flusher_with(st, &registry).del(&pool, &remote);
            }
        }
        if !lazy {
            self.fill_search_from_bind(st, schema, bind, id)?;
        }
        let dirty_event = self.add_dirty_queues(st, bind, schema, id, "u", lazy)?;
        let log_event = if schema.log_enabled {
            let before = schema.row_to_bind(&old_data);
            let meta = entity.read().log_meta().clone();
            self.add_to_log_queue(st, schema, id, Some(&before), Some(bind), meta, lazy)?
        } else {
            None
        };
        Ok((log_event, dirty_event))
    }

    /// Candidate query-index keys to invalidate for one mutation.
    fn cache_queries_keys(
        &self,
        schema: &EntitySchema,
        bind: &Bind,
        data: &[DbValue],
        event: CacheEvent,
    ) -> Vec<String> {
        let mut keys = Vec::new();
        for (index_name, definition) in &schema.cached_indexes {
            let mut added_deleted = matches!(event, CacheEvent::Insert | CacheEvent::Delete);
            if !added_deleted && schema.has_fake_delete {
                added_deleted = bind.contains_key(FAKE_DELETE_COLUMN);
            }
            if added_deleted && definition.tracked_fields.is_empty() {
                // The synthetic cache-all index survives hard deletes: the
                // row tombstone filters the id out of reads.
                let tombstoned_all = event == CacheEvent::Delete
                    && schema.cache_all
                    && index_name == CACHE_ALL_INDEX;
                if !tombstoned_all {
                    keys.push(schema.cache_key_search(index_name, &[]));
                }
            }
            for tracked in &definition.tracked_fields {
                if !bind.contains_key(tracked) {
                    continue;
                }
                let attrs: Vec<String> = definition
                    .query_fields
                    .iter()
                    .filter(|field| {
                        !(schema.has_fake_delete && field.as_str() == FAKE_DELETE_COLUMN)
                    })
                    .filter_map(|field| {
                        schema
                            .column_mapping
                            .get(field)
                            .and_then(|idx| data.get(*idx))
                            .map(DbValue::to_attr_string)
                    })
                    .collect();
                keys.push(schema.cache_key_search(index_name, &attrs));
                break;
            }
        }
        keys
    }

    /// Mirror changed mapped columns into the search hash; a positive
    /// fake-delete drops the document instead.
    fn fill_search_from_bind(
        &self,
        st: &mut FlushState,
        schema: &EntitySchema,
        bind: &Bind,
        id: u64,
    ) -> Result<(), OrmError> {
        let Some(index) = schema.search_index.clone() else {
            return Ok(());
        };
        let registry = self.engine.registry().clone();
        if schema.has_fake_delete {
            if let Some(DbValue::U64(v)) = bind.get(FAKE_DELETE_COLUMN) {
                if *v > 0 {
                    self.stream_flusher_with(st, &registry)
                        .del(&index.pool, &[index.document_key(id)]);
                    return Ok(());
                }
            }
        }
        let mut fields = vec![("ID".to_string(), id.to_string())];
        let mut changed = false;
        for column in &index.mapped_columns {
            if let Some(value) = bind.get(column) {
                fields.push((column.clone(), value.to_attr_string()));
                changed = true;
            }
        }
        if changed {
            self.stream_flusher_with(st, &registry)
                .hset(&index.pool, &index.document_key(id), fields);
        }
        Ok(())
    }

    fn add_dirty_queues(
        &self,
        st: &mut FlushState,
        bind: &Bind,
        schema: &EntitySchema,
        id: u64,
        action: &str,
        lazy: bool,
    ) -> Result<Option<DirtyQueueValue>, OrmError> {
        let registry = self.engine.registry().clone();
        let mut event: Option<DirtyEvent> = None;
        let mut streams = Vec::new();
        for (stream, columns) in &schema.dirty_streams {
            let dirty = columns
                .iter()
                .any(|column| column == "ORM" || bind.contains_key(column));
            if !dirty {
                continue;
            }
            let payload = event.get_or_insert_with(|| DirtyEvent {
                entity: schema.entity_name.clone(),
                id,
                action: action.to_string(),
            });
            if lazy {
                streams.push(stream.clone());
            } else {
                let payload = payload.clone();
                self.stream_flusher_with(st, &registry).publish(stream, &payload)?;
            }
        }
        if lazy {
            Ok(event.map(|event| DirtyQueueValue { event, streams }))
        } else {
            Ok(None)
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn add_to_log_queue(
        &self,
        st: &mut FlushState,
        schema: &EntitySchema,
        id: u64,
        before: Option<&Bind>,
        changes: Option<&Bind>,
        entity_meta: serde_json::Map<String, serde_json::Value>,
        lazy: bool,
    ) -> Result<Option<LogQueueValue>, OrmError> {
        if !schema.log_enabled {
            return Ok(None);
        }
        if let Some(changes) = changes {
            if !schema.skip_log_columns.is_empty()
                && changes.keys().all(|key| schema.skip_log_columns.contains(key))
            {
                return Ok(None);
            }
        }
        // Entity meta merged with the engine-wide meta; engine wins.
        let mut meta = entity_meta;
        for (key, value) in self.engine.log_meta() {
            meta.insert(key, value);
        }
        let value = LogQueueValue {
            pool_name: schema.log_pool_name.clone(),
            table_name: schema.log_table_name.clone(),
            id,
            log_id: 0,
            meta: if meta.is_empty() { None } else { Some(serde_json::Value::Object(meta)) },
            before: before.map(bind_to_json),
            changes: changes.map(bind_to_json),
            updated: chrono::Utc::now(),
        };
        if !lazy {
            let registry = self.engine.registry().clone();
            self.stream_flusher_with(st, &registry).publish(LOG_CHANNEL, &value)?;
        }
        Ok(Some(value))
    }

    fn stream_flusher<'a>(&self, st: &'a mut FlushState) -> &'a mut StreamFlusher {
        let registry = self.engine.registry().clone();
        self.stream_flusher_with(st, &registry)
    }

    /// Lazily create the per-flush stream flusher, resuming a parked
    /// after-commit flusher when one exists.
    fn stream_flusher_with<'a>(
        &self,
        st: &'a mut FlushState,
        registry: &Arc<crate::schema::ValidatedRegistry>,
    ) -> &'a mut StreamFlusher {
        if st.stream_flusher.is_none() {
            let parked = self.engine.after_commit_stream_flusher.lock().take();
            st.stream_flusher = Some(parked.unwrap_or_else(|| StreamFlusher::new(registry.clone())));
        }
        st.stream_flusher.as_mut().expect("just initialised")
    }
}
