//! Backend adapters implementing the abstract capabilities.
//!
//! - [`sql`]: sqlx `AnyPool` implementation of [`crate::backend::SqlExec`]
//! - [`redis`]: redis `ConnectionManager` implementation of [`crate::backend::Kv`]
//! - [`memory`]: in-process implementations used by tests

pub mod memory;
pub mod redis;
pub mod sql;
