// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Search-index metadata and the pusher pipeline.
//!
//! The core mirrors mapped columns of search-indexed schemas into remote
//! hashes (`prefix + id`) on every flush, and the background consumer
//! rebuilds whole indices on demand by driving a schema-supplied
//! [`SearchIndexer`] in id-cursor chunks. Index lifecycle commands are
//! opaque to the core and reach the search module through the `ft_*`
//! passthrough on [`Kv`].

use std::sync::Arc;

use async_trait::async_trait;

use crate::backend::{Kv, KvOp};
use crate::error::OrmError;

/// Search-index description attached to an entity schema.
pub struct SearchIndex {
    pub name: String,
    /// Redis pool holding the hashes and the index.
    pub pool: String,
    /// Hash key prefix; document key is `prefix + id`.
    pub prefix: String,
    /// Columns mirrored into the hash on flush.
    pub mapped_columns: Vec<String>,
    /// Optional full-rebuild driver.
    pub indexer: Option<Arc<dyn SearchIndexer>>,
}

impl std::fmt::Debug for SearchIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchIndex")
            .field("name", &self.name)
            .field("pool", &self.pool)
            .field("prefix", &self.prefix)
            .field("mapped_columns", &self.mapped_columns)
            .field("has_indexer", &self.indexer.is_some())
            .finish()
    }
}

impl SearchIndex {
    #[must_use]
    pub fn new(name: &str, pool: &str, prefix: &str, mapped_columns: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            pool: pool.to_string(),
            prefix: prefix.to_string(),
            mapped_columns: mapped_columns.iter().map(|c| c.to_string()).collect(),
            indexer: None,
        }
    }

    #[must_use]
    pub fn with_indexer(mut self, indexer: Arc<dyn SearchIndexer>) -> Self {
        self.indexer = Some(indexer);
        self
    }

    #[must_use]
    pub fn document_key(&self, id: u64) -> String {
        format!("{}{}", self.prefix, id)
    }
}

/// Chunked index rebuild: called with the last processed id, pushes
/// documents for the next chunk and reports `(next_id, has_more)`.
#[async_trait]
pub trait SearchIndexer: Send + Sync {
    async fn index(&self, last_id: u64, pusher: &mut SearchIndexPusher) -> Result<(u64, bool), OrmError>;
}

/// Buffered hash writes flushed between indexer chunks.
pub struct SearchIndexPusher {
    kv: Arc<dyn Kv>,
    ops: Vec<KvOp>,
}

impl SearchIndexPusher {
    #[must_use]
    pub fn new(kv: Arc<dyn Kv>) -> Self {
        Self { kv, ops: Vec::new() }
    }

    pub fn hset(&mut self, key: &str, fields: Vec<(String, String)>) {
        self.ops.push(KvOp::HSet { key: key.to_string(), fields });
    }

    pub fn del(&mut self, key: &str) {
        self.ops.push(KvOp::Del { keys: vec![key.to_string()] });
    }

    #[must_use]
    pub fn pending(&self) -> usize {
        self.ops.len()
    }

    pub async fn flush(&mut self) -> Result<(), OrmError> {
        if self.ops.is_empty() {
            return Ok(());
        }
        let ops = std::mem::take(&mut self.ops);
        self.kv.pipeline(&ops).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::MemoryKv;

    #[test]
    fn test_document_key() {
        let index = SearchIndex::new("users_idx", "default", "usr_search:", &["Name"]);
        assert_eq!(index.document_key(12), "usr_search:12");
    }

    #[tokio::test]
    async fn test_pusher_flush_drains() {
        let kv = Arc::new(MemoryKv::new());
        let mut pusher = SearchIndexPusher::new(kv.clone());
        pusher.hset("usr_search:1", vec![("Name".into(), "a".into())]);
        assert_eq!(pusher.pending(), 1);
        pusher.flush().await.unwrap();
        assert_eq!(pusher.pending(), 0);
        assert_eq!(kv.hash_field("usr_search:1", "Name").as_deref(), Some("a"));
    }
}
