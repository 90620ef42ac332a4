// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Value types flowing through the bind pipeline and caches.
//!
//! [`DbValue`] is the canonical DB scalar every bind setter produces: the
//! exact form used for SQL parameters, cache-key attributes, and the
//! serialized remote-cache row. [`FieldValue`] is the heterogeneous
//! application-side value an entity field holds before binding.
//! [`CacheValue`] is what the local cache stores, with [`CacheValue::Nil`]
//! as the delete tombstone.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, FixedOffset};
use serde::{Deserialize, Serialize};

use crate::entity::EntityRef;

/// Canonical DB scalar. Floats canonicalise to fixed-format strings in the
/// bind pipeline; `F64` exists for attribute conversion intermediates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum DbValue {
    Null,
    U64(u64),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    Bool(bool),
}

impl DbValue {
    #[must_use]
    pub fn is_null(&self) -> bool {
        matches!(self, DbValue::Null)
    }

    /// Render as a SQL literal for statements that embed values directly
    /// (the per-pool UPDATE concatenation and the lazy envelope).
    #[must_use]
    pub fn to_sql_literal(&self) -> String {
        match self {
            DbValue::Null => "NULL".to_string(),
            DbValue::U64(v) => v.to_string(),
            DbValue::I64(v) => v.to_string(),
            DbValue::F64(v) => v.to_string(),
            DbValue::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            DbValue::Str(s) => quote_sql(s),
            DbValue::Bytes(b) => quote_sql(&String::from_utf8_lossy(b)),
        }
    }

    /// String form used in cache-key attribute tuples. Must be stable:
    /// identical scalars always render identically.
    #[must_use]
    pub fn to_attr_string(&self) -> String {
        match self {
            DbValue::Null => String::new(),
            DbValue::U64(v) => v.to_string(),
            DbValue::I64(v) => v.to_string(),
            DbValue::F64(v) => v.to_string(),
            DbValue::Bool(v) => if *v { "1" } else { "0" }.to_string(),
            DbValue::Str(s) => s.clone(),
            DbValue::Bytes(b) => String::from_utf8_lossy(b).into_owned(),
        }
    }

    /// Convert to a JSON value for log rows and dirty events.
    #[must_use]
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            DbValue::Null => serde_json::Value::Null,
            DbValue::U64(v) => serde_json::json!(v),
            DbValue::I64(v) => serde_json::json!(v),
            DbValue::F64(v) => serde_json::json!(v),
            DbValue::Bool(v) => serde_json::json!(v),
            DbValue::Str(s) => serde_json::json!(s),
            DbValue::Bytes(b) => serde_json::json!(String::from_utf8_lossy(b)),
        }
    }
}

fn quote_sql(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('\'');
    for c in s.chars() {
        match c {
            '\'' => out.push_str("''"),
            '\\' => out.push_str("\\\\"),
            _ => out.push(c),
        }
    }
    out.push('\'');
    out
}

/// Reference field payload: an id once persisted, a shared entity handle
/// while the target is still unsaved (resolved by the flush closure).
#[derive(Debug, Clone)]
pub enum RefValue {
    Id(u64),
    Entity(EntityRef),
}

impl RefValue {
    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            RefValue::Id(id) => *id,
            RefValue::Entity(e) => e.read().id(),
        }
    }
}

/// Application-side field value, replacing the source's untyped `any`.
#[derive(Debug, Clone)]
pub enum FieldValue {
    Null,
    Bool(bool),
    U64(u64),
    I64(i64),
    F64(f64),
    Str(String),
    Bytes(Vec<u8>),
    /// Offset-carrying so non-UTC inputs can be rejected at bind time.
    Time(DateTime<FixedOffset>),
    /// SET column members.
    List(Vec<String>),
    Ref(RefValue),
    /// Many-reference columns; stored as a JSON id array.
    RefList(Vec<RefValue>),
}

impl From<&str> for FieldValue {
    fn from(v: &str) -> Self {
        FieldValue::Str(v.to_string())
    }
}

impl From<String> for FieldValue {
    fn from(v: String) -> Self {
        FieldValue::Str(v)
    }
}

impl From<u64> for FieldValue {
    fn from(v: u64) -> Self {
        FieldValue::U64(v)
    }
}

impl From<i64> for FieldValue {
    fn from(v: i64) -> Self {
        FieldValue::I64(v)
    }
}

impl From<f64> for FieldValue {
    fn from(v: f64) -> Self {
        FieldValue::F64(v)
    }
}

impl From<bool> for FieldValue {
    fn from(v: bool) -> Self {
        FieldValue::Bool(v)
    }
}

/// Column → canonical scalar map: the unit of work for SQL parameters,
/// log rows, dirty events and cache-key computation. Ordered so generated
/// SQL is deterministic.
pub type Bind = BTreeMap<String, DbValue>;

/// Local-cache entry.
#[derive(Debug, Clone)]
pub enum CacheValue {
    /// Tombstone for a deleted or known-missing row.
    Nil,
    /// Full row vector as last known from the DB.
    Row(Arc<Vec<DbValue>>),
    /// Id list for a cached query index.
    Ids(Arc<Vec<u64>>),
}

impl CacheValue {
    #[must_use]
    pub fn is_nil(&self) -> bool {
        matches!(self, CacheValue::Nil)
    }
}

/// Build the local-cache value for a row from its `DbData` vector.
#[must_use]
pub fn build_local_cache_value(db_data: &[DbValue]) -> CacheValue {
    CacheValue::Row(Arc::new(db_data.to_vec()))
}

/// Remote caches store the row vector as compact JSON; the tombstone is the
/// literal string `nil`.
pub const REMOTE_NIL: &str = "nil";

pub fn encode_remote_row(db_data: &[DbValue]) -> String {
    serde_json::to_string(db_data).unwrap_or_else(|_| REMOTE_NIL.to_string())
}

pub fn decode_remote_row(raw: &str) -> Option<Vec<DbValue>> {
    if raw == REMOTE_NIL {
        return None;
    }
    serde_json::from_str(raw).ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sql_literal_escaping() {
        assert_eq!(DbValue::Str("it's".into()).to_sql_literal(), "'it''s'");
        assert_eq!(DbValue::Str("a\\b".into()).to_sql_literal(), "'a\\\\b'");
        assert_eq!(DbValue::Null.to_sql_literal(), "NULL");
        assert_eq!(DbValue::U64(7).to_sql_literal(), "7");
        assert_eq!(DbValue::Bool(true).to_sql_literal(), "1");
    }

    #[test]
    fn test_attr_string_forms() {
        assert_eq!(DbValue::Bool(false).to_attr_string(), "0");
        assert_eq!(DbValue::Null.to_attr_string(), "");
        assert_eq!(DbValue::I64(-3).to_attr_string(), "-3");
        assert_eq!(DbValue::Str("x".into()).to_attr_string(), "x");
    }

    #[test]
    fn test_remote_row_round_trip() {
        let row = vec![DbValue::U64(1), DbValue::Str("a".into()), DbValue::Null];
        let encoded = encode_remote_row(&row);
        let decoded = decode_remote_row(&encoded).unwrap();
        assert_eq!(decoded, row);
    }

    #[test]
    fn test_remote_nil_decodes_to_none() {
        assert!(decode_remote_row(REMOTE_NIL).is_none());
    }

    #[test]
    fn test_cache_value_nil() {
        assert!(CacheValue::Nil.is_nil());
        assert!(!build_local_cache_value(&[DbValue::U64(1)]).is_nil());
    }
}
