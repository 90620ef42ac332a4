// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Abstract backend capabilities.
//!
//! The core depends on these traits only; protocol clients are injected.
//! [`SqlExec`] is a MySQL-family statement executor with transaction state,
//! [`Kv`] a Redis-family key-value/stream store with pipelining. RediSearch
//! index management goes through the `ft_*` passthrough methods, which
//! default to unsupported so plain KV backends keep working.

use async_trait::async_trait;

use crate::error::OrmError;
use crate::value::DbValue;

/// Result of a mutating SQL statement.
#[derive(Debug, Clone, Copy, Default)]
pub struct ExecResult {
    pub last_insert_id: u64,
    pub rows_affected: u64,
}

pub type Row = Vec<DbValue>;

#[async_trait]
pub trait SqlExec: Send + Sync {
    async fn exec(&self, sql: &str, args: &[DbValue]) -> Result<ExecResult, OrmError>;

    async fn query(&self, sql: &str, args: &[DbValue]) -> Result<Vec<Row>, OrmError>;

    async fn begin(&self) -> Result<(), OrmError>;

    async fn commit(&self) -> Result<(), OrmError>;

    async fn rollback(&self) -> Result<(), OrmError>;

    fn in_transaction(&self) -> bool;
}

/// One buffered remote-cache or stream operation; executed in batches via
/// [`Kv::pipeline`].
#[derive(Debug, Clone, PartialEq)]
pub enum KvOp {
    Set { key: String, value: String, ttl_secs: Option<u64> },
    Del { keys: Vec<String> },
    HSet { key: String, fields: Vec<(String, String)> },
    HDel { key: String, fields: Vec<String> },
    Expire { key: String, ttl_secs: u64 },
    XAdd { stream: String, payload: String },
}

/// An event read from a consumer group.
#[derive(Debug, Clone)]
pub struct StreamEvent {
    pub stream: String,
    pub id: String,
    pub payload: String,
}

#[async_trait]
pub trait Kv: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>, OrmError>;

    async fn set(&self, key: &str, value: &str, ttl_secs: Option<u64>) -> Result<(), OrmError>;

    async fn del(&self, keys: &[String]) -> Result<(), OrmError>;

    /// Execute a batch of operations as one pipeline round-trip.
    async fn pipeline(&self, ops: &[KvOp]) -> Result<(), OrmError>;

    /// `XGROUP CREATE … MKSTREAM`; succeeds when the group already exists.
    async fn xgroup_create(&self, stream: &str, group: &str) -> Result<(), OrmError>;

    /// `XREADGROUP` over several streams, blocking up to `block_ms`.
    async fn xread_group(
        &self,
        group: &str,
        consumer: &str,
        streams: &[String],
        count: usize,
        block_ms: u64,
    ) -> Result<Vec<StreamEvent>, OrmError>;

    async fn xack(&self, stream: &str, group: &str, id: &str) -> Result<(), OrmError>;

    /// List RediSearch indices (`FT._LIST`).
    async fn ft_list(&self) -> Result<Vec<String>, OrmError> {
        Ok(Vec::new())
    }

    /// Drop a RediSearch index (`FT.DROPINDEX`).
    async fn ft_drop_index(&self, index: &str) -> Result<(), OrmError> {
        let _ = index;
        Err(OrmError::Cache("FT.DROPINDEX not supported".into()))
    }
}
