// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! In-memory backends.
//!
//! [`MemorySql`] journals every statement and synthesizes MySQL-style
//! results (auto-increment ids for batch inserts, scripted rows for
//! SELECTs). [`MemoryKv`] is a process-local KV/stream store. Both exist so
//! the flush engine and consumer can be exercised without real servers.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::backend::{ExecResult, Kv, KvOp, Row, SqlExec, StreamEvent};
use crate::error::OrmError;
use crate::value::DbValue;

/// Count `(…)` tuples in the VALUES section of a batch INSERT.
fn values_rows(sql: &str) -> u64 {
    match sql.find(" VALUES ") {
        Some(pos) => sql[pos..].matches("),(").count() as u64 + 1,
        None => 1,
    }
}

#[derive(Default)]
pub struct MemorySql {
    autoincrement: u64,
    next_insert_id: AtomicU64,
    statements: Mutex<Vec<(String, Vec<DbValue>)>>,
    scripted_exec: Mutex<VecDeque<ExecResult>>,
    scripted_rows: Mutex<VecDeque<Vec<Row>>>,
    fail_next: Mutex<Option<String>>,
    in_tx: AtomicBool,
    tx_log: Mutex<Vec<String>>,
}

impl MemorySql {
    #[must_use]
    pub fn new() -> Self {
        Self::with_autoincrement(1)
    }

    #[must_use]
    pub fn with_autoincrement(autoincrement: u64) -> Self {
        Self {
            autoincrement,
            next_insert_id: AtomicU64::new(1),
            ..Default::default()
        }
    }

    /// Fail the next statement with a raw driver message.
    pub fn fail_next(&self, message: &str) {
        *self.fail_next.lock() = Some(message.to_string());
    }

    /// Queue an explicit result for the next mutating statement.
    pub fn script_exec(&self, result: ExecResult) {
        self.scripted_exec.lock().push_back(result);
    }

    /// Queue rows for the next SELECT.
    pub fn script_rows(&self, rows: Vec<Row>) {
        self.scripted_rows.lock().push_back(rows);
    }

    pub fn set_next_insert_id(&self, id: u64) {
        self.next_insert_id.store(id, Ordering::SeqCst);
    }

    #[must_use]
    pub fn statements(&self) -> Vec<String> {
        self.statements.lock().iter().map(|(sql, _)| sql.clone()).collect()
    }

    #[must_use]
    pub fn statement_args(&self, index: usize) -> Vec<DbValue> {
        self.statements.lock().get(index).map(|(_, args)| args.clone()).unwrap_or_default()
    }

    #[must_use]
    pub fn tx_log(&self) -> Vec<String> {
        self.tx_log.lock().clone()
    }

    fn record(&self, sql: &str, args: &[DbValue]) {
        self.statements.lock().push((sql.to_string(), args.to_vec()));
    }

    fn take_failure(&self) -> Option<OrmError> {
        self.fail_next.lock().take().map(OrmError::Db)
    }
}

#[async_trait]
impl SqlExec for MemorySql {
    async fn exec(&self, sql: &str, args: &[DbValue]) -> Result<ExecResult, OrmError> {
        self.record(sql, args);
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        if let Some(result) = self.scripted_exec.lock().pop_front() {
            return Ok(result);
        }
        if sql.starts_with("INSERT INTO") {
            let rows = values_rows(sql);
            let last = self
                .next_insert_id
                .fetch_add(rows * self.autoincrement, Ordering::SeqCst);
            return Ok(ExecResult { last_insert_id: last, rows_affected: rows });
        }
        Ok(ExecResult { last_insert_id: 0, rows_affected: 1 })
    }

    async fn query(&self, sql: &str, args: &[DbValue]) -> Result<Vec<Row>, OrmError> {
        self.record(sql, args);
        if let Some(err) = self.take_failure() {
            return Err(err);
        }
        if sql == "SHOW VARIABLES LIKE 'auto_increment_increment'" {
            return Ok(vec![vec![
                DbValue::Str("auto_increment_increment".into()),
                DbValue::U64(self.autoincrement),
            ]]);
        }
        Ok(self.scripted_rows.lock().pop_front().unwrap_or_default())
    }

    async fn begin(&self) -> Result<(), OrmError> {
        self.in_tx.store(true, Ordering::SeqCst);
        self.tx_log.lock().push("BEGIN".to_string());
        Ok(())
    }

    async fn commit(&self) -> Result<(), OrmError> {
        self.in_tx.store(false, Ordering::SeqCst);
        self.tx_log.lock().push("COMMIT".to_string());
        Ok(())
    }

    async fn rollback(&self) -> Result<(), OrmError> {
        self.in_tx.store(false, Ordering::SeqCst);
        self.tx_log.lock().push("ROLLBACK".to_string());
        Ok(())
    }

    fn in_transaction(&self) -> bool {
        self.in_tx.load(Ordering::SeqCst)
    }
}

#[derive(Default)]
struct GroupState {
    delivered: usize,
    acked: HashSet<String>,
}

#[derive(Default)]
struct StreamState {
    entries: Vec<(String, String)>,
    next_seq: u64,
    groups: HashMap<String, GroupState>,
}

#[derive(Default)]
pub struct MemoryKv {
    kv: DashMap<String, String>,
    hashes: DashMap<String, BTreeMap<String, String>>,
    streams: Mutex<HashMap<String, StreamState>>,
    pipelines: AtomicUsize,
    deleted: Mutex<Vec<String>>,
    ft_indices: Mutex<Vec<String>>,
    ft_dropped: Mutex<Vec<String>>,
}

impl MemoryKv {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn pipeline_count(&self) -> usize {
        self.pipelines.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn deleted_keys(&self) -> Vec<String> {
        self.deleted.lock().clone()
    }

    #[must_use]
    pub fn value(&self, key: &str) -> Option<String> {
        self.kv.get(key).map(|v| v.clone())
    }

    #[must_use]
    pub fn hash_field(&self, key: &str, field: &str) -> Option<String> {
        self.hashes.get(key).and_then(|h| h.get(field).cloned())
    }

    #[must_use]
    pub fn hash_exists(&self, key: &str) -> bool {
        self.hashes.contains_key(key)
    }

    #[must_use]
    pub fn stream_len(&self, stream: &str) -> usize {
        self.streams.lock().get(stream).map(|s| s.entries.len()).unwrap_or(0)
    }

    #[must_use]
    pub fn stream_payloads(&self, stream: &str) -> Vec<String> {
        self.streams
            .lock()
            .get(stream)
            .map(|s| s.entries.iter().map(|(_, p)| p.clone()).collect())
            .unwrap_or_default()
    }

    pub fn seed_ft_indices(&self, names: &[&str]) {
        *self.ft_indices.lock() = names.iter().map(|n| n.to_string()).collect();
    }

    #[must_use]
    pub fn dropped_ft_indices(&self) -> Vec<String> {
        self.ft_dropped.lock().clone()
    }

    fn apply(&self, op: &KvOp) {
        match op {
            KvOp::Set { key, value, .. } => {
                self.kv.insert(key.clone(), value.clone());
            }
            KvOp::Del { keys } => {
                for key in keys {
                    self.kv.remove(key);
                    self.hashes.remove(key);
                    self.deleted.lock().push(key.clone());
                }
            }
            KvOp::HSet { key, fields } => {
                let mut hash = self.hashes.entry(key.clone()).or_default();
                for (field, value) in fields {
                    hash.insert(field.clone(), value.clone());
                }
            }
            KvOp::HDel { key, fields } => {
                if let Some(mut hash) = self.hashes.get_mut(key) {
                    for field in fields {
                        hash.remove(field);
                    }
                }
            }
            KvOp::Expire { .. } => {}
            KvOp::XAdd { stream, payload } => {
                let mut streams = self.streams.lock();
                let state = streams.entry(stream.clone()).or_default();
                state.next_seq += 1;
                let id = format!("{}-0", state.next_seq);
                state.entries.push((id, payload.clone()));
            }
        }
    }
}

#[async_trait]
impl Kv for MemoryKv {
    async fn get(&self, key: &str) -> Result<Option<String>, OrmError> {
        Ok(self.kv.get(key).map(|v| v.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), OrmError> {
        self.apply(&KvOp::Set {
            key: key.to_string(),
            value: value.to_string(),
            ttl_secs,
        });
        Ok(())
    }

    async fn del(&self, keys: &[String]) -> Result<(), OrmError> {
        self.apply(&KvOp::Del { keys: keys.to_vec() });
        Ok(())
    }

    async fn pipeline(&self, ops: &[KvOp]) -> Result<(), OrmError> {
        self.pipelines.fetch_add(1, Ordering::SeqCst);
        for op in ops {
            self.apply(op);
        }
        Ok(())
    }

    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<(), OrmError> {
        let mut streams = self.streams.lock();
        let state = streams.entry(stream.to_string()).or_default();
        state.groups.entry(group.to_string()).or_default();
        Ok(())
    }

    async fn xread_group(
        &self,
        group: &str,
        _consumer: &str,
        streams: &[String],
        count: usize,
        _block_ms: u64,
    ) -> Result<Vec<StreamEvent>, OrmError> {
        let mut state_map = self.streams.lock();
        let mut events = Vec::new();
        for stream in streams {
            let Some(state) = state_map.get_mut(stream) else { continue };
            let group_state = state.groups.entry(group.to_string()).or_default();
            while group_state.delivered < state.entries.len() && events.len() < count {
                let (id, payload) = &state.entries[group_state.delivered];
                group_state.delivered += 1;
                events.push(StreamEvent {
                    stream: stream.clone(),
                    id: id.clone(),
                    payload: payload.clone(),
                });
            }
            if events.len() >= count {
                break;
            }
        }
        Ok(events)
    }

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), OrmError> {
        let mut streams = self.streams.lock();
        if let Some(state) = streams.get_mut(stream) {
            if let Some(group_state) = state.groups.get_mut(group) {
                group_state.acked.insert(id.to_string());
            }
        }
        Ok(())
    }

    async fn ft_list(&self) -> Result<Vec<String>, OrmError> {
        Ok(self.ft_indices.lock().clone())
    }

    async fn ft_drop_index(&self, index: &str) -> Result<(), OrmError> {
        self.ft_indices.lock().retain(|i| i != index);
        self.ft_dropped.lock().push(index.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_batch_insert_assigns_contiguous_ids() {
        let sql = MemorySql::new();
        let res = sql
            .exec("INSERT INTO users(`Name`) VALUES (?),(?),(?)", &[])
            .await
            .unwrap();
        assert_eq!(res.last_insert_id, 1);
        assert_eq!(res.rows_affected, 3);
        let res = sql.exec("INSERT INTO users(`Name`) VALUES (?)", &[]).await.unwrap();
        assert_eq!(res.last_insert_id, 4);
    }

    #[tokio::test]
    async fn test_autoincrement_step() {
        let sql = MemorySql::with_autoincrement(5);
        let res = sql.exec("INSERT INTO t(`A`) VALUES (?),(?)", &[]).await.unwrap();
        assert_eq!(res.last_insert_id, 1);
        let res = sql.exec("INSERT INTO t(`A`) VALUES (?)", &[]).await.unwrap();
        assert_eq!(res.last_insert_id, 11);
    }

    #[tokio::test]
    async fn test_fail_next_surfaces_once() {
        let sql = MemorySql::new();
        sql.fail_next("boom");
        assert!(sql.exec("DELETE FROM t", &[]).await.is_err());
        assert!(sql.exec("DELETE FROM t", &[]).await.is_ok());
    }

    #[tokio::test]
    async fn test_kv_pipeline_applies_all_ops() {
        let kv = MemoryKv::new();
        kv.pipeline(&[
            KvOp::Set { key: "a".into(), value: "1".into(), ttl_secs: None },
            KvOp::HSet { key: "h".into(), fields: vec![("f".into(), "v".into())] },
            KvOp::Del { keys: vec!["a".into()] },
        ])
        .await
        .unwrap();
        assert!(kv.value("a").is_none());
        assert_eq!(kv.hash_field("h", "f").as_deref(), Some("v"));
        assert_eq!(kv.pipeline_count(), 1);
    }

    #[tokio::test]
    async fn test_stream_read_cursor_advances() {
        let kv = MemoryKv::new();
        kv.pipeline(&[KvOp::XAdd { stream: "s".into(), payload: "p1".into() }]).await.unwrap();
        kv.pipeline(&[KvOp::XAdd { stream: "s".into(), payload: "p2".into() }]).await.unwrap();
        let events = kv
            .xread_group("g", "c", &["s".to_string()], 10, 0)
            .await
            .unwrap();
        assert_eq!(events.len(), 2);
        let events = kv
            .xread_group("g", "c", &["s".to_string()], 10, 0)
            .await
            .unwrap();
        assert!(events.is_empty());
    }
}
