use std::fs;
use std::path::Path;
use std::sync::Arc;

use log::error;
use serde_json::Value;

use super::{lookup, ConfigError, ConfigObserver, ConfigSource};

/// File-backed configuration snapshot, static after load.
///
/// Observer registration is accepted for interface parity but never fires.
pub struct JsonConfig {
    root: Option<Arc<Value>>,
}

impl JsonConfig {
    /// Loads the file; a failure leaves the source invalid rather than
    /// panicking so the caller can decide how fatal that is.
    #[must_use]
    pub fn new(path: &Path) -> Self {
        match Self::load(path) {
            Ok(root) => Self { root: Some(root) },
            Err(e) => {
                error!("{e}");
                Self { root: None }
            }
        }
    }

    pub fn load(path: &Path) -> Result<Arc<Value>, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::Load(e, path.into()))?;
        let root = serde_json::from_str(&contents)
            .map_err(|e| ConfigError::Parse(e, path.into()))?;
        Ok(Arc::new(root))
    }
}

impl ConfigSource for JsonConfig {
    fn get(&self, path: &str) -> Option<Arc<Value>> {
        let root = self.root.as_ref()?;
        lookup(root, path).map(|v| Arc::new(v.clone()))
    }

    fn get_watched(&self, path: &str, _observer: &Arc<dyn ConfigObserver>) -> Option<Arc<Value>> {
        self.get(path)
    }

    fn is_valid(&self) -> bool {
        self.root.is_some()
    }
}
