//! # tierorm
//!
//! A cache-aware, write-batching object-relational mapper core for
//! MySQL-family databases. Tracked entities flush in batched statements
//! while two cache tiers (in-process LRU and a Redis-family remote store)
//! stay coherent with the authoritative rows, and deferred work replays
//! through Redis streams.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                     Entity Schema Layer                     │
//! │  • Tagged column kinds, validated registry                  │
//! │  • Bind setters: application value → canonical DB scalar    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                       Flush Engine                          │
//! │  • Compound INSERTs, concatenated UPDATEs, IN-list DELETEs  │
//! │  • Reference closure, cascade deletes, ON DUPLICATE KEY    │
//! │  • Sync, transactional, lazy and checked modes             │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!              ┌───────────────┼───────────────┐
//!              ▼               ▼               ▼
//! ┌──────────────────┐ ┌──────────────┐ ┌──────────────────────┐
//! │  Local LRU tier  │ │ Redis tier   │ │   Redis streams      │
//! │  row values +    │ │ row keys +   │ │ lazy / audit-log /   │
//! │  tombstones      │ │ query keys   │ │ search-index events  │
//! └──────────────────┘ └──────────────┘ └──────────────────────┘
//!                                                │
//!                                                ▼
//!                                  ┌──────────────────────────┐
//!                                  │   Background consumer    │
//!                                  │ replays SQL, writes audit│
//!                                  │ rows, rebuilds indexes   │
//!                                  └──────────────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use tierorm::backends::memory::{MemoryKv, MemorySql};
//! use tierorm::schema::{Column, EntitySchema, Registry};
//! use tierorm::Engine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), tierorm::OrmError> {
//!     let mut registry = Registry::new();
//!     registry.register_mysql_pool("default", Arc::new(MemorySql::new()));
//!     registry.register_redis_pool("default", Arc::new(MemoryKv::new()));
//!     registry.register_local_cache("default", 10_000);
//!     registry.register_entity(
//!         EntitySchema::new("User", "users")
//!             .with_column(Column::string("Name", 255).required())
//!             .with_local_cache("default")
//!             .with_redis_cache("default"),
//!     );
//!     let engine = Engine::new(Arc::new(registry.validate().await?));
//!
//!     let user = engine.new_entity("User")?;
//!     user.write().set("Name", "alice")?;
//!     let flusher = engine.flusher();
//!     flusher.track(&[user.clone()]).await?;
//!     flusher.flush().await?;
//!     assert!(user.read().id() > 0);
//!     Ok(())
//! }
//! ```
//!
//! ## Modules
//!
//! - [`schema`]: entity descriptors, bind/field setters, the registry
//! - [`flush`]: the batched flush engine and cache coherence fan-out
//! - [`engine`]: pools, read paths, after-commit deferral
//! - [`consumer`]: the long-lived stream consumer
//! - [`streams`]: stream names, envelopes, pipelined writer, group reader
//! - [`cache`]: the local LRU tier
//! - [`backends`]: sqlx / redis / in-memory capability implementations

pub mod backend;
pub mod backends;
pub mod cache;
pub mod config;
pub mod consumer;
pub mod db;
pub mod edit_field;
pub mod engine;
pub mod entity;
pub mod error;
pub mod flush;
pub mod metrics;
pub mod resilience;
pub mod schema;
pub mod search;
pub mod streams;
pub mod value;

pub use backend::{ExecResult, Kv, KvOp, SqlExec, StreamEvent};
pub use cache::LocalCache;
pub use config::OrmConfig;
pub use consumer::BackgroundConsumer;
pub use edit_field::edit_entity_field;
pub use engine::Engine;
pub use entity::{DirtyBind, Entity, EntityRef};
pub use error::{BindError, OrmError};
pub use flush::{Flusher, TRACK_LIMIT};
pub use schema::{Column, ColumnKind, EntitySchema, EnumDefinition, Registry, ValidatedRegistry};
pub use search::{SearchIndex, SearchIndexPusher, SearchIndexer};
pub use streams::{DirtyEvent, LazyEnvelope, LogQueueValue};
pub use value::{Bind, CacheValue, DbValue, FieldValue, RefValue};
