use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error};

use super::backend::RenderBackend;
use super::style::StyleInfo;
use super::task::{TileWork, TileWorkTask};

/// Identifies one staged style set across the pool for the lifetime of a
/// style update.
pub type UpdateId = u64;

/// Owns the compiled styles of one pool member and executes its tile work.
///
/// Only ever touched from its own worker thread; the pool delivers tile tasks
/// and control actions through that thread's mailbox, so no locking is needed
/// here and the live style set is consistent between any two tasks.
pub struct RenderWorker<B: RenderBackend> {
    backend: Arc<B>,
    live: HashMap<String, Arc<B::Style>>,
    staged: HashMap<UpdateId, HashMap<String, Arc<B::Style>>>,
}

impl<B: RenderBackend> RenderWorker<B> {
    /// Compiles the initial style set. Individual failures are logged and
    /// skipped; requests for such styles fail per task.
    pub(crate) fn new(backend: Arc<B>, initial_styles: &[StyleInfo]) -> Self {
        let mut live = HashMap::with_capacity(initial_styles.len());
        for info in initial_styles {
            match backend.compile(info) {
                Ok(style) => {
                    live.insert(info.name.clone(), Arc::new(style));
                }
                Err(e) => error!("{e}"),
            }
        }
        Self {
            backend,
            live,
            staged: HashMap::new(),
        }
    }

    /// Executes one tile task; exactly one of the task's callbacks fires.
    pub fn execute(&mut self, task: TileWorkTask) {
        match &task.work {
            TileWork::Render(request) => match self.live.get(&request.style_name) {
                Some(style) => match self.backend.render(style, request) {
                    Ok(output) => task.task.notify_success(output),
                    Err(e) => {
                        error!("Failed to render {}: {e}", request.tile);
                        task.task.notify_error();
                    }
                },
                None => {
                    error!("Style {} is not loaded", request.style_name);
                    task.task.notify_error();
                }
            },
            TileWork::Subtile(request) => match self.backend.make_subtile(request) {
                Ok(output) => task.task.notify_success(output),
                Err(e) => {
                    error!("Failed to make subtile {}: {e}", request.target);
                    task.task.notify_error();
                }
            },
        }
    }

    /// Builds every pending style into the staging area for `update_id`.
    ///
    /// Returns false on the first compile failure; partial staging is
    /// retained until a later `cancel_update` or `commit_update` drops it.
    pub fn prepare_update(&mut self, update_id: UpdateId, pending: &[StyleInfo]) -> bool {
        let staging = self.staged.entry(update_id).or_default();
        for info in pending {
            match self.backend.compile(info) {
                Ok(style) => {
                    staging.insert(info.name.clone(), Arc::new(style));
                }
                Err(e) => {
                    error!("{e}");
                    return false;
                }
            }
        }
        true
    }

    /// Replaces the live style set with the staging for `update_id`, then
    /// drops every other staging.
    pub fn commit_update(&mut self, update_id: UpdateId) {
        if let Some(staging) = self.staged.remove(&update_id) {
            self.live = staging;
        } else {
            debug!("No staged styles for update {update_id}");
        }
        self.staged.clear();
    }

    /// Drops the staging for `update_id`, if any.
    pub fn cancel_update(&mut self, update_id: UpdateId) {
        self.staged.remove(&update_id);
    }

    /// Names of the currently live styles, for tests and diagnostics.
    #[must_use]
    pub fn live_style_names(&self) -> Vec<&str> {
        self.live.keys().map(String::as_str).collect()
    }

    #[cfg(test)]
    pub(crate) fn staged_update_count(&self) -> usize {
        self.staged.len()
    }
}
