//! Remote tile-cache interface.
//!
//! The production deployment fronts renders with a remote KV cluster; that
//! client lives behind [`Cacher`]. [`MemoryCacher`] is the in-process
//! implementation used when a `cacher` section is configured without an
//! external backend wired in.

use async_trait::async_trait;
use log::info;
use moka::future::Cache;
use serde::{Deserialize, Serialize};

use crate::TileData;

pub const DEFAULT_CACHER_WORKERS: u32 = 2;

/// The `cacher` configuration section.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacherConfig {
    #[serde(default)]
    pub hosts: Vec<String>,
    #[serde(default)]
    pub user: String,
    #[serde(default)]
    pub password: String,
    #[serde(default = "default_workers")]
    pub workers: u32,
}

fn default_workers() -> u32 {
    DEFAULT_CACHER_WORKERS
}

impl Default for CacherConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            user: String::new(),
            password: String::new(),
            workers: DEFAULT_CACHER_WORKERS,
        }
    }
}

/// Keyed tile cache consulted before dispatching a render.
#[async_trait]
pub trait Cacher: Send + Sync {
    async fn get(&self, key: &str) -> Option<TileData>;
    async fn put(&self, key: String, data: TileData);
}

/// Bounded in-process cacher.
pub struct MemoryCacher {
    cache: Cache<String, TileData>,
}

impl MemoryCacher {
    /// Creates a cacher bounded by total payload bytes.
    #[must_use]
    pub fn new(max_capacity: u64) -> Self {
        info!("Initializing in-memory tile cacher with maximum size {max_capacity}B");
        Self {
            cache: Cache::builder()
                .weigher(|key: &String, data: &TileData| {
                    (key.len() + data.len()).try_into().unwrap_or(u32::MAX)
                })
                .max_capacity(max_capacity)
                .build(),
        }
    }
}

#[async_trait]
impl Cacher for MemoryCacher {
    async fn get(&self, key: &str) -> Option<TileData> {
        self.cache.get(key).await
    }

    async fn put(&self, key: String, data: TileData) {
        self.cache.insert(key, data).await;
    }
}
