use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde_json::Value;

#[derive(thiserror::Error, Debug)]
pub enum FilterError {
    #[error("Unable to read filter map {1}: {0}")]
    Read(io::Error, PathBuf),

    #[error("Unable to parse filter map {1}: {0}")]
    Parse(serde_json::Error, PathBuf),

    #[error("Filter map {0} must be an object of layer -> maxzoom|bool")]
    Shape(PathBuf),
}

/// Per-layer visibility limits for MVT post-filtering.
///
/// Loaded from disk once, during endpoint parsing, and immutable afterwards;
/// the request path only ever reads it. A layer is visible up to its own max
/// zoom, clamped by the endpoint's `maxzoom`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilterTable {
    layers: HashMap<String, u8>,
}

impl FilterTable {
    /// Loads a `{"layer": maxzoom | true, ...}` document.
    pub fn load(path: &Path, maxzoom: u8) -> Result<Self, FilterError> {
        let contents = fs::read_to_string(path).map_err(|e| FilterError::Read(e, path.into()))?;
        let doc: Value =
            serde_json::from_str(&contents).map_err(|e| FilterError::Parse(e, path.into()))?;
        let object = doc.as_object().ok_or_else(|| FilterError::Shape(path.into()))?;

        let mut layers = HashMap::with_capacity(object.len());
        for (layer, limit) in object {
            let limit = match limit {
                Value::Bool(true) => maxzoom,
                Value::Bool(false) => continue,
                Value::Number(n) => n
                    .as_u64()
                    .and_then(|n| u8::try_from(n).ok())
                    .map(|n| n.min(maxzoom))
                    .ok_or_else(|| FilterError::Shape(path.into()))?,
                _ => return Err(FilterError::Shape(path.into())),
            };
            layers.insert(layer.clone(), limit);
        }
        Ok(Self { layers })
    }

    /// True when `layer` stays visible at `zoom`.
    #[must_use]
    pub fn allows(&self, layer: &str, zoom: u8) -> bool {
        self.layers.get(layer).is_some_and(|&limit| zoom <= limit)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.layers.is_empty()
    }
}
