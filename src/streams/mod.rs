// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Stream names and event envelopes.
//!
//! Three reserved streams carry the core's asynchronous work, all consumed
//! by the `orm-async-consumer` group:
//!
//! | Stream | Purpose |
//! |---|---|
//! | `orm-lazy-channel` | Lazy-flush envelopes |
//! | `orm-log-channel` | Per-row audit log envelopes |
//! | `orm-redis-search-channel` | Search-indexer trigger events |
//!
//! Events are serialized as compact JSON maps. Consumers ack individually;
//! a payload that fails to deserialize is logged and acked (the streams are
//! best-effort replay channels for work already accepted).

pub mod consumer;
pub mod flusher;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::value::{Bind, DbValue};

pub const LAZY_CHANNEL: &str = "orm-lazy-channel";
pub const LOG_CHANNEL: &str = "orm-log-channel";
pub const SEARCH_INDEXER_CHANNEL: &str = "orm-redis-search-channel";
pub const ASYNC_CONSUMER_GROUP: &str = "orm-async-consumer";

/// Cursor key prefix for resumable search indexing.
pub const SEARCH_FORCE_INDEX_LAST_ID_PREFIX: &str = "_orm_force_index";

/// A dirty event: entity type, id, action (`i`/`u`/`d`).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct DirtyEvent {
    #[serde(rename = "E")]
    pub entity: String,
    #[serde(rename = "I")]
    pub id: u64,
    #[serde(rename = "A")]
    pub action: String,
}

/// A dirty event captured in a lazy envelope together with its target
/// streams.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirtyQueueValue {
    #[serde(rename = "Event")]
    pub event: DirtyEvent,
    #[serde(rename = "Streams")]
    pub streams: Vec<String>,
}

/// One audit-log row on its way to `LogTableName`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogQueueValue {
    #[serde(rename = "PoolName")]
    pub pool_name: String,
    #[serde(rename = "TableName")]
    pub table_name: String,
    #[serde(rename = "ID")]
    pub id: u64,
    #[serde(rename = "LogID", default)]
    pub log_id: u64,
    #[serde(rename = "Meta", default, skip_serializing_if = "Option::is_none")]
    pub meta: Option<serde_json::Value>,
    #[serde(rename = "Before", default, skip_serializing_if = "Option::is_none")]
    pub before: Option<serde_json::Value>,
    #[serde(rename = "Changes", default, skip_serializing_if = "Option::is_none")]
    pub changes: Option<serde_json::Value>,
    #[serde(rename = "Updated")]
    pub updated: DateTime<Utc>,
}

/// Search-indexer trigger event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexerEvent {
    #[serde(rename = "Index")]
    pub index: String,
    #[serde(rename = "IndexID")]
    pub index_id: u64,
}

/// `[poolCode, sql, argsOrNil]` triple replayed by the lazy consumer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LazyQuery(pub String, pub String, pub Option<Vec<DbValue>>);

/// The lazy-flush envelope: everything one deferred flush needs to replay.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LazyEnvelope {
    #[serde(rename = "q", default, skip_serializing_if = "Vec::is_empty")]
    pub queries: Vec<LazyQuery>,
    #[serde(rename = "l", default, skip_serializing_if = "Vec::is_empty")]
    pub logs: Vec<LogQueueValue>,
    #[serde(rename = "d", default, skip_serializing_if = "Vec::is_empty")]
    pub dirty: Vec<DirtyQueueValue>,
    #[serde(rename = "cr", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub remote_cache_deletes: BTreeMap<String, Vec<String>>,
    #[serde(rename = "cl", default, skip_serializing_if = "BTreeMap::is_empty")]
    pub local_cache_deletes: BTreeMap<String, Vec<String>>,
}

impl LazyEnvelope {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.queries.is_empty()
            && self.logs.is_empty()
            && self.dirty.is_empty()
            && self.remote_cache_deletes.is_empty()
            && self.local_cache_deletes.is_empty()
    }
}

/// Render a bind as a JSON object for log rows and dirty payloads.
#[must_use]
pub fn bind_to_json(bind: &Bind) -> serde_json::Value {
    let mut map = serde_json::Map::new();
    for (key, value) in bind {
        map.insert(key.clone(), value.to_json());
    }
    serde_json::Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dirty_event_wire_names() {
        let event = DirtyEvent { entity: "User".into(), id: 3, action: "u".into() };
        let json = serde_json::to_string(&event).unwrap();
        assert_eq!(json, r#"{"E":"User","I":3,"A":"u"}"#);
    }

    #[test]
    fn test_envelope_round_trip() {
        let mut envelope = LazyEnvelope::default();
        envelope.queries.push(LazyQuery(
            "default".into(),
            "INSERT INTO users(`Name`) VALUES (?)".into(),
            Some(vec![DbValue::Str("a".into())]),
        ));
        envelope
            .local_cache_deletes
            .entry("default".into())
            .or_default()
            .push("users:0".into());

        let raw = serde_json::to_string(&envelope).unwrap();
        let parsed: LazyEnvelope = serde_json::from_str(&raw).unwrap();
        assert_eq!(parsed.queries.len(), 1);
        assert_eq!(parsed.queries[0].0, "default");
        assert_eq!(parsed.local_cache_deletes["default"], vec!["users:0".to_string()]);
        assert!(parsed.logs.is_empty());
    }

    #[test]
    fn test_empty_envelope_serialises_compact() {
        let raw = serde_json::to_string(&LazyEnvelope::default()).unwrap();
        assert_eq!(raw, "{}");
        assert!(LazyEnvelope::default().is_empty());
    }

    #[test]
    fn test_bind_to_json_shapes() {
        let mut bind = Bind::new();
        bind.insert("Name".into(), DbValue::Str("a".into()));
        bind.insert("Age".into(), DbValue::U64(4));
        bind.insert("Gone".into(), DbValue::Null);
        let json = bind_to_json(&bind);
        assert_eq!(json["Name"], serde_json::json!("a"));
        assert_eq!(json["Age"], serde_json::json!(4));
        assert!(json["Gone"].is_null());
    }
}
