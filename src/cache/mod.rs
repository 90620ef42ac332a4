//! Cache tiers: the in-process LRU lives here; the remote tier is reached
//! through the [`crate::backend::Kv`] capability.

pub mod local;

pub use local::LocalCache;
