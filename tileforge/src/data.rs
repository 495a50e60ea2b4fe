//! Data-provider interface.
//!
//! Providers back the `static` and `mvt` endpoint kinds and feed metatile
//! hints to `auto`-sized render endpoints. Concrete providers are external
//! collaborators; the registry is assembled at startup and immutable after.

use std::collections::HashMap;
use std::sync::Arc;

use tileforge_core::{Metatile, TileData, TileId};

use crate::endpoints::DEFAULT_MAXZOOM;
use crate::filters::FilterTable;

#[derive(thiserror::Error, Debug)]
pub enum ProviderError {
    #[error("No tile data for {0}")]
    NoTile(TileId),

    #[error("Provider failure: {0}")]
    Failed(String),
}

/// A named source of stored tile data.
pub trait DataProvider: Send + Sync {
    /// Fetches the blob for one tile, optionally pre-filtered.
    fn fetch(&self, tile: TileId, filter: Option<&FilterTable>) -> Result<TileData, ProviderError>;

    /// Content type of the blobs this provider serves.
    fn content_type(&self) -> &'static str {
        "application/octet-stream"
    }

    /// Deepest zoom the provider holds data for; deeper requests overzoom.
    fn data_maxzoom(&self) -> u8 {
        DEFAULT_MAXZOOM
    }

    /// Preferred metatile dimensions for `auto`-sized endpoints.
    fn metatile_hint(&self) -> Metatile {
        Metatile::default()
    }
}

/// Named registry of data providers.
#[derive(Default)]
pub struct DataManager {
    providers: HashMap<String, Arc<dyn DataProvider>>,
}

impl DataManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, provider: Arc<dyn DataProvider>) {
        self.providers.insert(name.into(), provider);
    }

    #[must_use]
    pub fn get(&self, name: &str) -> Option<Arc<dyn DataProvider>> {
        self.providers.get(name).cloned()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }
}
