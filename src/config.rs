//! Engine configuration.
//!
//! Declarative pool and cache settings with serde defaults; parsing the
//! file format is the embedder's concern. [`OrmConfig::configure`] opens
//! the configured backends and registers them on a [`Registry`].
//!
//! # Example
//!
//! ```
//! use tierorm::config::OrmConfig;
//!
//! let config = OrmConfig::default();
//! assert_eq!(config.consumer_block_ms, 30_000);
//! assert_eq!(config.consumer_limit, 100);
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use serde::Deserialize;

use crate::backends::redis::RedisKv;
use crate::backends::sql::SqlxExec;
use crate::error::OrmError;
use crate::schema::Registry;

#[derive(Debug, Clone, Deserialize)]
pub struct OrmConfig {
    /// MySQL pools: code → connection string.
    #[serde(default)]
    pub mysql: HashMap<String, String>,

    /// Redis pools: code → connection string.
    #[serde(default)]
    pub redis: HashMap<String, String>,

    /// Local cache pools: code → entry capacity.
    #[serde(default)]
    pub local_cache: HashMap<String, usize>,

    /// Engine-wide request cache capacity (None = disabled).
    #[serde(default)]
    pub request_cache: Option<usize>,

    /// Background consumer poll block time.
    #[serde(default = "default_consumer_block_ms")]
    pub consumer_block_ms: u64,

    /// Background consumer batch limit.
    #[serde(default = "default_consumer_limit")]
    pub consumer_limit: usize,
}

fn default_consumer_block_ms() -> u64 {
    30_000
}

fn default_consumer_limit() -> usize {
    100
}

impl Default for OrmConfig {
    fn default() -> Self {
        Self {
            mysql: HashMap::new(),
            redis: HashMap::new(),
            local_cache: HashMap::new(),
            request_cache: None,
            consumer_block_ms: default_consumer_block_ms(),
            consumer_limit: default_consumer_limit(),
        }
    }
}

impl OrmConfig {
    /// Connect every configured backend and register it.
    pub async fn configure(&self, registry: &mut Registry) -> Result<(), OrmError> {
        for (code, url) in &self.mysql {
            registry.register_mysql_pool(code, Arc::new(SqlxExec::connect(url).await?));
        }
        for (code, url) in &self.redis {
            registry.register_redis_pool(code, Arc::new(RedisKv::connect(url).await?));
        }
        for (code, capacity) in &self.local_cache {
            registry.register_local_cache(code, *capacity);
        }
        if let Some(capacity) = self.request_cache {
            registry.enable_request_cache(capacity);
        }
        Ok(())
    }
}
