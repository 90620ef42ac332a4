// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Entity schema descriptors and the registry.
//!
//! A [`Registry`] collects entity schemas, enum definitions, pool handles
//! and stream registrations, then [`Registry::validate`] freezes everything
//! into an immutable [`ValidatedRegistry`]: cache prefixes are checked for
//! uniqueness, the core streams are auto-registered, and each MySQL pool's
//! `auto_increment_increment` is probed so batch-insert id assignment can
//! stamp `L + k·increment`.
//!
//! Column kinds are tagged variants ([`ColumnKind`]) instead of reflective
//! dispatch: every column knows how to bind an application value to its
//! canonical DB scalar and back.

pub mod bind;
pub mod field;

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tracing::info;

use crate::backend::{Kv, SqlExec};
use crate::db::Db;
use crate::error::{BindError, OrmError};
use crate::search::SearchIndex;
use crate::streams::{
    ASYNC_CONSUMER_GROUP, LAZY_CHANNEL, LOG_CHANNEL, SEARCH_INDEXER_CHANNEL,
};
use crate::value::{Bind, DbValue, FieldValue};

pub const DATE_LAYOUT: &str = "%Y-%m-%d";
pub const DATETIME_LAYOUT: &str = "%Y-%m-%d %H:%M:%S";

/// Synthetic cached-index name holding every row id when `cache_all` is on.
pub const CACHE_ALL_INDEX: &str = "all";

/// Soft-delete column name; presence switches deletes to updates.
pub const FAKE_DELETE_COLUMN: &str = "FakeDelete";

/// Enum/SET member definitions, shared between columns.
#[derive(Debug, Clone)]
pub struct EnumDefinition {
    pub values: Vec<String>,
    pub default: String,
}

impl EnumDefinition {
    pub fn new(values: &[&str]) -> Arc<Self> {
        Arc::new(Self {
            values: values.iter().map(|v| v.to_string()).collect(),
            default: values.first().map(|v| v.to_string()).unwrap_or_default(),
        })
    }

    #[must_use]
    pub fn has(&self, value: &str) -> bool {
        self.values.iter().any(|v| v == value)
    }
}

/// Tagged column kind; replaces the source's reflective type dispatch.
#[derive(Debug, Clone)]
pub enum ColumnKind {
    /// Primary key, always column 0. Unsigned 64-bit, auto-increment.
    Id,
    Uint { max: u64 },
    Int { min: i64, max: u64 },
    Float { unsigned: bool, precision: usize, decimal_size: i32 },
    String { length: usize, required: bool },
    Bytes,
    Bool,
    Enum { def: Arc<EnumDefinition>, required: bool },
    Set { def: Arc<EnumDefinition>, required: bool },
    Date,
    DateTime,
    Reference { entity: String, cascade: bool },
    ReferenceMany { entity: String },
}

#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub kind: ColumnKind,
    pub nullable: bool,
}

impl Column {
    fn new(name: &str, kind: ColumnKind) -> Self {
        Self { name: name.to_string(), kind, nullable: false }
    }

    pub fn uint(name: &str, max: u64) -> Self {
        Self::new(name, ColumnKind::Uint { max })
    }

    pub fn int(name: &str, min: i64, max: u64) -> Self {
        Self::new(name, ColumnKind::Int { min, max })
    }

    pub fn float(name: &str, precision: usize) -> Self {
        Self::new(name, ColumnKind::Float { unsigned: false, precision, decimal_size: -1 })
    }

    pub fn float_unsigned(name: &str, precision: usize) -> Self {
        Self::new(name, ColumnKind::Float { unsigned: true, precision, decimal_size: -1 })
    }

    pub fn decimal(name: &str, precision: usize, decimal_size: i32) -> Self {
        Self::new(name, ColumnKind::Float { unsigned: false, precision, decimal_size })
    }

    pub fn string(name: &str, length: usize) -> Self {
        Self::new(name, ColumnKind::String { length, required: false })
    }

    pub fn bytes(name: &str) -> Self {
        let mut c = Self::new(name, ColumnKind::Bytes);
        c.nullable = true;
        c
    }

    pub fn boolean(name: &str) -> Self {
        Self::new(name, ColumnKind::Bool)
    }

    pub fn enumeration(name: &str, def: Arc<EnumDefinition>) -> Self {
        Self::new(name, ColumnKind::Enum { def, required: false })
    }

    pub fn set(name: &str, def: Arc<EnumDefinition>) -> Self {
        Self::new(name, ColumnKind::Set { def, required: false })
    }

    pub fn date(name: &str) -> Self {
        Self::new(name, ColumnKind::Date)
    }

    pub fn datetime(name: &str) -> Self {
        Self::new(name, ColumnKind::DateTime)
    }

    pub fn reference(name: &str, entity: &str) -> Self {
        let mut c = Self::new(name, ColumnKind::Reference { entity: entity.to_string(), cascade: false });
        c.nullable = true;
        c
    }

    pub fn reference_many(name: &str, entity: &str) -> Self {
        let mut c = Self::new(name, ColumnKind::ReferenceMany { entity: entity.to_string() });
        c.nullable = true;
        c
    }

    #[must_use]
    pub fn nullable(mut self) -> Self {
        self.nullable = true;
        self
    }

    #[must_use]
    pub fn required(mut self) -> Self {
        match &mut self.kind {
            ColumnKind::String { required, .. }
            | ColumnKind::Enum { required, .. }
            | ColumnKind::Set { required, .. } => *required = true,
            _ => {}
        }
        self.nullable = false;
        self
    }

    /// Delete of the referenced entity cascades to rows holding it.
    #[must_use]
    pub fn cascade(mut self) -> Self {
        if let ColumnKind::Reference { cascade, .. } = &mut self.kind {
            *cascade = true;
        }
        self
    }

    /// Bind an application value to this column's canonical DB scalar.
    pub fn bind(&self, v: &FieldValue) -> Result<DbValue, BindError> {
        bind::bind_value(self, v)
    }

    /// Cache-comparable string form of an application value.
    pub fn attr_to_string(&self, v: &FieldValue) -> Result<String, BindError> {
        bind::attr_to_string(self, v)
    }

    /// Hydrate an application value back from a DB scalar.
    pub fn field_from_db(&self, v: &DbValue) -> Result<FieldValue, BindError> {
        field::field_from_db(self, v)
    }

    /// Application-side zero value used when a field was never set.
    #[must_use]
    pub fn default_value(&self) -> FieldValue {
        match &self.kind {
            ColumnKind::Id | ColumnKind::Uint { .. } => FieldValue::U64(0),
            ColumnKind::Int { .. } => FieldValue::I64(0),
            ColumnKind::Float { .. } => FieldValue::F64(0.0),
            ColumnKind::String { .. } => FieldValue::Str(String::new()),
            ColumnKind::Bool => FieldValue::Bool(false),
            _ => FieldValue::Null,
        }
    }
}

/// A cached query index: result ids keyed by a tuple of query-field values,
/// invalidated whenever a tracked field changes.
#[derive(Debug, Clone)]
pub struct CachedIndex {
    pub tracked_fields: Vec<String>,
    pub query_fields: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct StreamDefinition {
    pub name: String,
    pub pool: String,
    pub groups: Vec<String>,
}

/// Build-time description of one entity type.
#[derive(Debug, Clone)]
pub struct EntitySchema {
    pub entity_name: String,
    pub table_name: String,
    pub pool_name: String,
    pub cache_prefix: String,
    pub columns: Vec<Column>,
    pub column_mapping: HashMap<String, usize>,
    pub unique_indexes: BTreeMap<String, Vec<String>>,
    pub cached_indexes: BTreeMap<String, CachedIndex>,
    pub dirty_streams: BTreeMap<String, Vec<String>>,
    pub log_enabled: bool,
    pub log_table_name: String,
    pub log_pool_name: String,
    pub skip_log_columns: Vec<String>,
    pub local_cache: Option<String>,
    pub redis_cache: Option<String>,
    pub cache_all: bool,
    pub has_fake_delete: bool,
    pub search_index: Option<Arc<SearchIndex>>,
    /// Position in the validated registry; key shard for field edits.
    pub index: usize,
}

impl EntitySchema {
    pub fn new(entity_name: &str, table_name: &str) -> Self {
        let id = Column::new("ID", ColumnKind::Id);
        let mut mapping = HashMap::new();
        mapping.insert("ID".to_string(), 0);
        Self {
            entity_name: entity_name.to_string(),
            table_name: table_name.to_string(),
            pool_name: "default".to_string(),
            cache_prefix: table_name.to_string(),
            columns: vec![id],
            column_mapping: mapping,
            unique_indexes: BTreeMap::new(),
            cached_indexes: BTreeMap::new(),
            dirty_streams: BTreeMap::new(),
            log_enabled: false,
            log_table_name: String::new(),
            log_pool_name: String::new(),
            skip_log_columns: Vec::new(),
            local_cache: None,
            redis_cache: None,
            cache_all: false,
            has_fake_delete: false,
            search_index: None,
            index: 0,
        }
    }

    #[must_use]
    pub fn on_pool(mut self, pool: &str) -> Self {
        self.pool_name = pool.to_string();
        self
    }

    #[must_use]
    pub fn with_cache_prefix(mut self, prefix: &str) -> Self {
        self.cache_prefix = prefix.to_string();
        self
    }

    #[must_use]
    pub fn with_column(mut self, column: Column) -> Self {
        self.column_mapping.insert(column.name.clone(), self.columns.len());
        if column.name == FAKE_DELETE_COLUMN {
            self.has_fake_delete = true;
        }
        self.columns.push(column);
        self
    }

    /// Adds the soft-delete column; deletes become updates setting it.
    #[must_use]
    pub fn with_fake_delete(self) -> Self {
        self.with_column(Column::uint(FAKE_DELETE_COLUMN, u64::MAX))
    }

    #[must_use]
    pub fn with_unique_index(mut self, name: &str, columns: &[&str]) -> Self {
        self.unique_indexes
            .insert(name.to_string(), columns.iter().map(|c| c.to_string()).collect());
        self
    }

    #[must_use]
    pub fn with_cached_index(mut self, name: &str, tracked: &[&str], query: &[&str]) -> Self {
        self.cached_indexes.insert(
            name.to_string(),
            CachedIndex {
                tracked_fields: tracked.iter().map(|c| c.to_string()).collect(),
                query_fields: query.iter().map(|c| c.to_string()).collect(),
            },
        );
        self
    }

    #[must_use]
    pub fn with_dirty_stream(mut self, stream: &str, columns: &[&str]) -> Self {
        self.dirty_streams
            .insert(stream.to_string(), columns.iter().map(|c| c.to_string()).collect());
        self
    }

    /// Enable the audit log. Table and pool default to
    /// `_log_{pool}_{table}` on the entity's own pool.
    #[must_use]
    pub fn with_log(mut self) -> Self {
        self.log_enabled = true;
        self
    }

    #[must_use]
    pub fn with_log_pool(mut self, pool: &str, table: &str) -> Self {
        self.log_enabled = true;
        self.log_pool_name = pool.to_string();
        self.log_table_name = table.to_string();
        self
    }

    #[must_use]
    pub fn with_skip_log_columns(mut self, columns: &[&str]) -> Self {
        self.skip_log_columns = columns.iter().map(|c| c.to_string()).collect();
        self
    }

    #[must_use]
    pub fn with_local_cache(mut self, pool: &str) -> Self {
        self.local_cache = Some(pool.to_string());
        self
    }

    #[must_use]
    pub fn with_redis_cache(mut self, pool: &str) -> Self {
        self.redis_cache = Some(pool.to_string());
        self
    }

    /// One synthetic cached index holds every row id.
    #[must_use]
    pub fn with_cache_all(mut self) -> Self {
        self.cache_all = true;
        self.cached_indexes.insert(
            CACHE_ALL_INDEX.to_string(),
            CachedIndex { tracked_fields: Vec::new(), query_fields: Vec::new() },
        );
        self
    }

    #[must_use]
    pub fn with_search_index(mut self, index: Arc<SearchIndex>) -> Self {
        self.search_index = Some(index);
        self
    }

    #[must_use]
    pub fn column(&self, name: &str) -> Option<&Column> {
        self.column_mapping.get(name).map(|idx| &self.columns[*idx])
    }

    #[must_use]
    pub fn column_names(&self) -> Vec<&str> {
        self.columns.iter().map(|c| c.name.as_str()).collect()
    }

    /// Row cache key: `prefix:id`.
    #[must_use]
    pub fn cache_key(&self, id: u64) -> String {
        format!("{}:{}", self.cache_prefix, id)
    }

    /// Query-index cache key. Deterministic in (prefix, index, attrs); the
    /// attr tuple is digested so keys can never end in the `:0` insert
    /// placeholder the lazy consumer resolves.
    #[must_use]
    pub fn cache_key_search(&self, index_name: &str, attrs: &[String]) -> String {
        if attrs.is_empty() {
            return format!("{}:{}", self.cache_prefix, index_name);
        }
        let mut hasher = Sha256::new();
        for attr in attrs {
            hasher.update(attr.as_bytes());
            hasher.update([0x1f]);
        }
        let digest = hasher.finalize();
        format!("{}:{}:{}", self.cache_prefix, index_name, hex::encode(&digest[..8]))
    }

    /// Convert a row vector to a column → scalar map (primary key excluded).
    #[must_use]
    pub fn row_to_bind(&self, data: &[DbValue]) -> Bind {
        let mut bind = Bind::new();
        for column in self.columns.iter().skip(1) {
            let idx = self.column_mapping[&column.name];
            bind.insert(column.name.clone(), data[idx].clone());
        }
        bind
    }

    fn check(&self) -> Result<(), OrmError> {
        for (name, index) in &self.cached_indexes {
            for field in index.tracked_fields.iter().chain(index.query_fields.iter()) {
                if !self.column_mapping.contains_key(field) {
                    return Err(OrmError::Registry(format!(
                        "cached index {} of {} references unknown column {}",
                        name, self.entity_name, field
                    )));
                }
            }
        }
        for (name, columns) in &self.unique_indexes {
            for field in columns {
                if !self.column_mapping.contains_key(field) {
                    return Err(OrmError::Registry(format!(
                        "unique index {} of {} references unknown column {}",
                        name, self.entity_name, field
                    )));
                }
            }
        }
        Ok(())
    }
}

/// A reference column of another schema pointing at a given entity.
#[derive(Debug, Clone)]
pub struct ReferenceUsage {
    pub schema_index: usize,
    pub column: String,
    pub cascade: bool,
}

#[derive(Default)]
pub struct Registry {
    entities: Vec<EntitySchema>,
    mysql_pools: HashMap<String, Arc<dyn SqlExec>>,
    redis_pools: HashMap<String, Arc<dyn Kv>>,
    local_cache_pools: HashMap<String, usize>,
    streams: Vec<StreamDefinition>,
    request_cache_size: Option<usize>,
}

impl Registry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_entity(&mut self, schema: EntitySchema) {
        self.entities.push(schema);
    }

    pub fn register_mysql_pool(&mut self, code: &str, exec: Arc<dyn SqlExec>) {
        self.mysql_pools.insert(code.to_string(), exec);
    }

    pub fn register_redis_pool(&mut self, code: &str, kv: Arc<dyn Kv>) {
        self.redis_pools.insert(code.to_string(), kv);
    }

    pub fn register_local_cache(&mut self, code: &str, capacity: usize) {
        self.local_cache_pools.insert(code.to_string(), capacity);
    }

    /// Engine-wide request cache used as the local tier for schemas without
    /// their own local cache pool.
    pub fn enable_request_cache(&mut self, capacity: usize) {
        self.request_cache_size = Some(capacity);
    }

    pub fn register_redis_stream(&mut self, name: &str, pool: &str, groups: &[&str]) {
        self.streams.push(StreamDefinition {
            name: name.to_string(),
            pool: pool.to_string(),
            groups: groups.iter().map(|g| g.to_string()).collect(),
        });
    }

    /// Freeze the registry. Probes each MySQL pool's
    /// `auto_increment_increment`, verifies cache-prefix and stream-name
    /// uniqueness, and auto-registers the core streams.
    pub async fn validate(mut self) -> Result<ValidatedRegistry, OrmError> {
        let mut prefixes: HashMap<String, String> = HashMap::new();
        let mut by_name = HashMap::new();
        let mut has_log = false;
        let mut has_search = false;
        let mut search_indexes: HashMap<String, HashMap<String, Arc<SearchIndex>>> = HashMap::new();

        for (idx, schema) in self.entities.iter_mut().enumerate() {
            schema.index = idx;
            schema.check()?;
            if schema.log_enabled {
                has_log = true;
                if schema.log_table_name.is_empty() {
                    schema.log_table_name = format!("_log_{}_{}", schema.pool_name, schema.table_name);
                }
                if schema.log_pool_name.is_empty() {
                    schema.log_pool_name = schema.pool_name.clone();
                }
            }
            if let Some(duplicate) = prefixes.insert(schema.cache_prefix.clone(), schema.table_name.clone()) {
                return Err(OrmError::Registry(format!(
                    "duplicated table cache prefix {} and {}",
                    schema.table_name, duplicate
                )));
            }
            if by_name.insert(schema.entity_name.clone(), idx).is_some() {
                return Err(OrmError::Registry(format!(
                    "entity {} registered twice",
                    schema.entity_name
                )));
            }
            if let Some(index) = &schema.search_index {
                has_search = true;
                search_indexes
                    .entry(index.pool.clone())
                    .or_default()
                    .insert(index.name.clone(), index.clone());
            }
        }

        let mut stream_names = HashSet::new();
        for def in &self.streams {
            if !stream_names.insert(def.name.clone()) {
                return Err(OrmError::Registry(format!("stream with name {} already exists", def.name)));
            }
        }
        let mut streams: HashMap<String, StreamDefinition> =
            self.streams.into_iter().map(|d| (d.name.clone(), d)).collect();
        let mut ensure_stream = |name: &str| {
            streams.entry(name.to_string()).or_insert_with(|| StreamDefinition {
                name: name.to_string(),
                pool: "default".to_string(),
                groups: vec![ASYNC_CONSUMER_GROUP.to_string()],
            });
        };
        ensure_stream(LAZY_CHANNEL);
        if has_log {
            ensure_stream(LOG_CHANNEL);
        }
        if has_search {
            ensure_stream(SEARCH_INDEXER_CHANNEL);
        }

        // Usage map: who references whom, for cascade deletes.
        let mut usage: HashMap<String, Vec<ReferenceUsage>> = HashMap::new();
        for schema in &self.entities {
            for column in &schema.columns {
                if let ColumnKind::Reference { entity, cascade } = &column.kind {
                    usage.entry(entity.clone()).or_default().push(ReferenceUsage {
                        schema_index: schema.index,
                        column: column.name.clone(),
                        cascade: *cascade,
                    });
                }
            }
        }

        let mut dbs = HashMap::new();
        for (code, exec) in self.mysql_pools {
            let rows = exec
                .query("SHOW VARIABLES LIKE 'auto_increment_increment'", &[])
                .await?;
            let autoincrement = rows
                .first()
                .and_then(|row| row.get(1))
                .map(|v| match v {
                    DbValue::U64(v) => *v,
                    DbValue::I64(v) => *v as u64,
                    DbValue::Str(s) => s.parse().unwrap_or(1),
                    _ => 1,
                })
                .unwrap_or(1);
            info!(pool = %code, autoincrement, "MySQL pool validated");
            dbs.insert(code.clone(), Db::new(&code, autoincrement, exec));
        }

        Ok(ValidatedRegistry {
            schemas: self.entities.into_iter().map(Arc::new).collect(),
            by_name,
            dbs,
            redis_pools: self.redis_pools,
            local_cache_pools: self.local_cache_pools,
            request_cache_size: self.request_cache_size,
            streams,
            search_indexes,
            usage,
        })
    }
}

/// Immutable, validated registry: read-only after [`Registry::validate`].
pub struct ValidatedRegistry {
    pub schemas: Vec<Arc<EntitySchema>>,
    by_name: HashMap<String, usize>,
    dbs: HashMap<String, Db>,
    redis_pools: HashMap<String, Arc<dyn Kv>>,
    pub local_cache_pools: HashMap<String, usize>,
    pub request_cache_size: Option<usize>,
    pub streams: HashMap<String, StreamDefinition>,
    pub search_indexes: HashMap<String, HashMap<String, Arc<SearchIndex>>>,
    usage: HashMap<String, Vec<ReferenceUsage>>,
}

impl std::fmt::Debug for ValidatedRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValidatedRegistry").finish_non_exhaustive()
    }
}

impl ValidatedRegistry {
    pub fn schema(&self, entity_name: &str) -> Result<Arc<EntitySchema>, OrmError> {
        self.by_name
            .get(entity_name)
            .map(|idx| self.schemas[*idx].clone())
            .ok_or_else(|| OrmError::UnknownEntity(entity_name.to_string()))
    }

    #[must_use]
    pub fn schema_by_index(&self, index: usize) -> Arc<EntitySchema> {
        self.schemas[index].clone()
    }

    pub fn db(&self, pool: &str) -> Result<&Db, OrmError> {
        self.dbs
            .get(pool)
            .ok_or_else(|| OrmError::Registry(format!("unknown mysql pool {pool}")))
    }

    pub fn kv(&self, pool: &str) -> Result<Arc<dyn Kv>, OrmError> {
        self.redis_pools
            .get(pool)
            .cloned()
            .ok_or_else(|| OrmError::Registry(format!("unknown redis pool {pool}")))
    }

    pub fn stream(&self, name: &str) -> Result<&StreamDefinition, OrmError> {
        self.streams
            .get(name)
            .ok_or_else(|| OrmError::Stream(format!("stream {name} is not registered")))
    }

    /// Reference columns of other schemas pointing at `entity_name`.
    #[must_use]
    pub fn usage(&self, entity_name: &str) -> &[ReferenceUsage] {
        self.usage.get(entity_name).map(Vec::as_slice).unwrap_or(&[])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backends::memory::{MemoryKv, MemorySql};

    fn schema(name: &str, table: &str) -> EntitySchema {
        EntitySchema::new(name, table).with_column(Column::string("Name", 255))
    }

    fn base_registry() -> Registry {
        let mut registry = Registry::new();
        registry.register_mysql_pool("default", Arc::new(MemorySql::new()));
        registry.register_redis_pool("default", Arc::new(MemoryKv::new()));
        registry
    }

    #[tokio::test]
    async fn test_validate_assigns_indexes_and_autoincrement() {
        let mut registry = base_registry();
        registry.register_entity(schema("User", "users"));
        registry.register_entity(schema("Order", "orders"));
        let validated = registry.validate().await.unwrap();

        assert_eq!(validated.schema("User").unwrap().index, 0);
        assert_eq!(validated.schema("Order").unwrap().index, 1);
        assert_eq!(validated.db("default").unwrap().autoincrement(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_cache_prefix_is_fatal() {
        let mut registry = base_registry();
        registry.register_entity(schema("User", "users").with_cache_prefix("u"));
        registry.register_entity(schema("Order", "orders").with_cache_prefix("u"));
        let err = registry.validate().await.unwrap_err();
        assert!(matches!(err, OrmError::Registry(_)), "{err}");
    }

    #[tokio::test]
    async fn test_duplicate_stream_is_fatal() {
        let mut registry = base_registry();
        registry.register_redis_stream("events", "default", &["g"]);
        registry.register_redis_stream("events", "default", &["g2"]);
        let err = registry.validate().await.unwrap_err();
        assert!(matches!(err, OrmError::Registry(_)));
    }

    #[tokio::test]
    async fn test_core_streams_auto_registered() {
        let mut registry = base_registry();
        registry.register_entity(schema("User", "users").with_log());
        let validated = registry.validate().await.unwrap();
        assert!(validated.streams.contains_key(LAZY_CHANNEL));
        assert!(validated.streams.contains_key(LOG_CHANNEL));
        // No search index registered, so no search stream.
        assert!(!validated.streams.contains_key(SEARCH_INDEXER_CHANNEL));
        let lazy = validated.stream(LAZY_CHANNEL).unwrap();
        assert_eq!(lazy.groups, vec![ASYNC_CONSUMER_GROUP.to_string()]);
    }

    #[tokio::test]
    async fn test_usage_map_tracks_cascade_references() {
        let mut registry = base_registry();
        registry.register_entity(schema("User", "users"));
        registry.register_entity(
            EntitySchema::new("Order", "orders")
                .with_column(Column::reference("Buyer", "User").cascade()),
        );
        let validated = registry.validate().await.unwrap();
        let usage = validated.usage("User");
        assert_eq!(usage.len(), 1);
        assert_eq!(usage[0].column, "Buyer");
        assert!(usage[0].cascade);
    }

    #[test]
    fn test_cache_keys_are_deterministic() {
        let schema = schema("User", "users").with_cache_prefix("usr");
        assert_eq!(schema.cache_key(7), "usr:7");
        assert_eq!(schema.cache_key_search("all", &[]), "usr:all");
        let a = schema.cache_key_search("by_name", &["a".into(), "b".into()]);
        let b = schema.cache_key_search("by_name", &["a".into(), "b".into()]);
        assert_eq!(a, b);
        let c = schema.cache_key_search("by_name", &["ab".into()]);
        assert_ne!(a, c);
        assert!(!a.ends_with(":0"));
    }

    #[test]
    fn test_fake_delete_column_detection() {
        let schema = schema("User", "users").with_fake_delete();
        assert!(schema.has_fake_delete);
        assert!(schema.column(FAKE_DELETE_COLUMN).is_some());
    }
}
