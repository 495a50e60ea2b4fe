use std::io;
use std::path::PathBuf;

use crate::TileId;

#[derive(thiserror::Error, Debug)]
pub enum StyleError {
    #[error("Unable to read style {name} from {path}: {source}")]
    Read {
        name: String,
        path: PathBuf,
        source: io::Error,
    },

    #[error("Style {name} at {path} is not a valid style document: {source}")]
    Parse {
        name: String,
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Style {name} is invalid: {message}")]
    Invalid { name: String, message: String },
}

#[derive(thiserror::Error, Debug)]
pub enum RenderError {
    #[error("Style {0} is not loaded")]
    UnknownStyle(String),

    #[error("Invalid tile id {0}")]
    InvalidTileId(TileId),

    #[error("Tile {target} is not a subtile of {parent}")]
    NotSubtile { parent: TileId, target: TileId },

    #[error("Unable to encode tile image: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Synchronous rendering is not available")]
    SyncRenderUnavailable,

    #[error("Render failed: {0}")]
    Backend(String),
}
