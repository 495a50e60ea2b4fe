//! Configuration source interface.
//!
//! Configuration is an immutable JSON tree addressed by dotted paths
//! (`render.styles`, `server.endpoints`). Sources hand out `Arc` snapshots of
//! subtrees and may push fresh snapshots to registered observers at any time,
//! from any thread. Observers are held weakly so a source never keeps a
//! consumer alive.

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde_json::Value;

mod json;
mod memory;

pub use json::JsonConfig;
pub use memory::MemoryConfig;

#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    #[error("Unable to load config file {1}: {0}")]
    Load(io::Error, PathBuf),

    #[error("Unable to parse config file {1}: {0}")]
    Parse(serde_json::Error, PathBuf),
}

/// Receives fresh snapshots for a watched path.
///
/// `on_update` may be invoked from any thread at any time after registration
/// and must not block the caller for long.
pub trait ConfigObserver: Send + Sync {
    fn on_update(&self, value: Arc<Value>);
}

/// A provider of immutable configuration snapshots.
pub trait ConfigSource: Send + Sync {
    /// Returns the value at a dotted path, if present.
    fn get(&self, path: &str) -> Option<Arc<Value>>;

    /// As [`get`](Self::get), and registers `observer` for future updates at
    /// that path. The source keeps only a weak reference.
    fn get_watched(&self, path: &str, observer: &Arc<dyn ConfigObserver>) -> Option<Arc<Value>>;

    /// True when the initial load succeeded.
    fn is_valid(&self) -> bool;
}

/// Resolves a dotted path against a JSON tree.
#[must_use]
pub fn lookup<'v>(root: &'v Value, path: &str) -> Option<&'v Value> {
    let mut node = root;
    for segment in path.split('.').filter(|s| !s.is_empty()) {
        node = node.get(segment)?;
    }
    Some(node)
}
