use std::sync::{Arc, Mutex, PoisonError};

use crate::{Metatile, MvtTile, TileData, TileId};

/// What a completed task produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    Png,
    Mvt,
    UtfGrid,
}

impl OutputFormat {
    #[must_use]
    pub fn content_type(self) -> &'static str {
        match self {
            OutputFormat::Png => "image/png",
            OutputFormat::Mvt => "application/x-protobuf",
            OutputFormat::UtfGrid => "application/json",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RenderOutput {
    pub data: TileData,
    pub format: OutputFormat,
}

/// Descriptor for rendering one tile (or metatile) of a named style.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    pub style_name: String,
    pub tile: TileId,
    pub metatile: Metatile,
    /// Layer subset requested by the client, when the endpoint allows it.
    pub layers: Option<String>,
    pub render_grid: bool,
    pub utfgrid_key: Option<String>,
}

/// Descriptor for deriving a deeper-zoom tile from a parent vector tile.
#[derive(Debug, Clone)]
pub struct SubtileRequest {
    pub mvt_tile: MvtTile,
    pub target: TileId,
}

#[derive(Debug, Clone)]
pub enum TileWork {
    Render(RenderRequest),
    Subtile(SubtileRequest),
}

/// A queued unit of tile work together with its completion handle.
pub struct TileWorkTask {
    pub task: Arc<RenderTask>,
    pub work: TileWork,
}

type SuccessFn = Box<dyn FnOnce(RenderOutput) + Send>;
type ErrorFn = Box<dyn FnOnce() + Send>;

struct Callbacks {
    on_success: SuccessFn,
    on_error: ErrorFn,
}

/// Shared completion handle for one posted task.
///
/// Exactly one of the two callbacks fires, exactly once. A task dropped
/// before anyone completed it fires `on_error`, so callers always hear back.
pub struct RenderTask {
    callbacks: Mutex<Option<Callbacks>>,
}

impl RenderTask {
    pub fn new(
        on_success: impl FnOnce(RenderOutput) + Send + 'static,
        on_error: impl FnOnce() + Send + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            callbacks: Mutex::new(Some(Callbacks {
                on_success: Box::new(on_success),
                on_error: Box::new(on_error),
            })),
        })
    }

    pub fn notify_success(&self, output: RenderOutput) {
        if let Some(callbacks) = self.take() {
            (callbacks.on_success)(output);
        }
    }

    pub fn notify_error(&self) {
        if let Some(callbacks) = self.take() {
            (callbacks.on_error)();
        }
    }

    /// True once either callback has fired.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .is_none()
    }

    fn take(&self) -> Option<Callbacks> {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
    }
}

impl Drop for RenderTask {
    fn drop(&mut self) {
        let callbacks = self
            .callbacks
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(callbacks) = callbacks {
            (callbacks.on_error)();
        }
    }
}
