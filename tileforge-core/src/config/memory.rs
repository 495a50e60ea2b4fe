use std::sync::{Arc, Mutex, PoisonError, RwLock, Weak};

use serde_json::{Map, Value};

use super::{lookup, ConfigObserver, ConfigSource};

/// In-memory configuration tree that can push updates.
///
/// Stands in for a cluster-backed watcher: `set` replaces a subtree and
/// notifies every observer whose watched path overlaps the updated one, each
/// with the fresh value at its own watched path. Used by tests and embedders.
pub struct MemoryConfig {
    root: RwLock<Value>,
    observers: Mutex<Vec<(String, Weak<dyn ConfigObserver>)>>,
}

impl MemoryConfig {
    #[must_use]
    pub fn new(root: Value) -> Self {
        Self {
            root: RwLock::new(root),
            observers: Mutex::new(Vec::new()),
        }
    }

    /// Replaces the subtree at `path` and notifies overlapping observers.
    ///
    /// Missing intermediate objects are created; a non-object intermediate is
    /// replaced by one.
    pub fn set(&self, path: &str, value: Value) {
        {
            let mut root = self.root.write().unwrap_or_else(PoisonError::into_inner);
            let mut node = &mut *root;
            for segment in path.split('.').filter(|s| !s.is_empty()) {
                if !node.is_object() {
                    *node = Value::Object(Map::new());
                }
                match node {
                    Value::Object(map) => {
                        node = map.entry(segment.to_string()).or_insert(Value::Null);
                    }
                    _ => break,
                }
            }
            *node = value;
        }
        self.notify(path);
    }

    fn notify(&self, updated: &str) {
        let mut targets = Vec::new();
        {
            let mut observers = self.observers.lock().unwrap_or_else(PoisonError::into_inner);
            observers.retain(|(watched, observer)| match observer.upgrade() {
                Some(observer) => {
                    if paths_overlap(watched, updated) {
                        targets.push((watched.clone(), observer));
                    }
                    true
                }
                None => false,
            });
        }
        for (watched, observer) in targets {
            let value = self.get(&watched).unwrap_or_else(|| Arc::new(Value::Null));
            observer.on_update(value);
        }
    }
}

impl ConfigSource for MemoryConfig {
    fn get(&self, path: &str) -> Option<Arc<Value>> {
        let root = self.root.read().unwrap_or_else(PoisonError::into_inner);
        lookup(&root, path).map(|v| Arc::new(v.clone()))
    }

    fn get_watched(&self, path: &str, observer: &Arc<dyn ConfigObserver>) -> Option<Arc<Value>> {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push((path.to_string(), Arc::downgrade(observer)));
        self.get(path)
    }

    fn is_valid(&self) -> bool {
        true
    }
}

/// Two dotted paths overlap when one is a segment-wise prefix of the other.
fn paths_overlap(a: &str, b: &str) -> bool {
    let mut a = a.split('.').filter(|s| !s.is_empty());
    let mut b = b.split('.').filter(|s| !s.is_empty());
    loop {
        match (a.next(), b.next()) {
            (Some(x), Some(y)) if x == y => {}
            (Some(_), Some(_)) => return false,
            _ => return true,
        }
    }
}
