//! Render orchestration: style-bound workers, the bounded pool, and the
//! manager driving the cross-worker style-update protocol.

mod backend;
mod error;
mod manager;
mod pool;
mod style;
mod task;
mod worker;

pub use backend::{FlatBackend, FlatStyle, RenderBackend, DEFAULT_TILE_SIZE};
pub use error::{RenderError, StyleError};
pub use manager::RenderManager;
pub use pool::{RenderPool, WorkerId};
pub use style::StyleInfo;
pub use task::{
    OutputFormat, RenderOutput, RenderRequest, RenderTask, SubtileRequest, TileWork, TileWorkTask,
};
pub use worker::{RenderWorker, UpdateId};
