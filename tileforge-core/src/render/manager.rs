use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};

use arc_swap::{ArcSwap, ArcSwapOption};
use log::{debug, error, warn};
use serde_json::Value;

use crate::config::{ConfigObserver, ConfigSource};

use super::backend::RenderBackend;
use super::error::RenderError;
use super::pool::{RenderPool, WorkerId};
use super::style::{parse_style_info, parse_styles, StyleInfo};
use super::task::{
    RenderOutput, RenderRequest, RenderTask, SubtileRequest, TileWork, TileWorkTask,
};
use super::worker::UpdateId;

pub const DEFAULT_QUEUE_LIMIT: usize = 1000;

/// Owns the worker pool and drives the cross-worker style-update protocol.
///
/// Styles are replaced pool-wide in two phases: every worker stages the new
/// set (`prepare`), and only when all of them succeeded does the manager fan
/// out `commit` and publish the new style-name set; any failure rolls the
/// prepared workers back with `cancel`. Workers are walked serially to bound
/// peak memory while styles compile.
pub struct RenderManager<B: RenderBackend> {
    inner: Arc<ManagerInner<B>>,
}

impl<B: RenderBackend> Clone for RenderManager<B> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

struct ManagerInner<B: RenderBackend> {
    pool: RenderPool<B>,
    style_names: ArcSwap<HashSet<String>>,
    committed_styles: Mutex<Arc<Vec<StyleInfo>>>,
    observer: Arc<StyleUpdateObserver<B>>,
    updating: AtomicBool,
    inited: AtomicBool,
    update: Mutex<Option<UpdateState>>,
    next_update_id: AtomicU64,
}

struct UpdateState {
    id: UpdateId,
    styles: Arc<Vec<StyleInfo>>,
    remaining: Vec<WorkerId>,
    updated: Vec<WorkerId>,
}

/// Bridges `render.styles` config pushes into the manager. Registered weakly
/// with the config source; parks the newest snapshot until a drain picks it
/// up, so updates arriving during construction are not lost.
struct StyleUpdateObserver<B: RenderBackend> {
    pending: ArcSwapOption<Value>,
    manager: RwLock<Weak<ManagerInner<B>>>,
}

impl<B: RenderBackend> ConfigObserver for StyleUpdateObserver<B> {
    fn on_update(&self, value: Arc<Value>) {
        self.pending.store(Some(value));
        let manager = self
            .manager
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .upgrade();
        if let Some(manager) = manager {
            manager.try_process_style_update();
        }
    }
}

impl<B: RenderBackend> RenderManager<B> {
    /// Builds the pool from the `render` config section and registers for
    /// `render.styles` updates.
    pub fn new(config: &dyn ConfigSource, backend: Arc<B>) -> Self {
        let queue_limit = config
            .get("render.queue_limit")
            .and_then(|v| v.as_u64())
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or(DEFAULT_QUEUE_LIMIT);
        let num_workers = config
            .get("render.workers")
            .and_then(|v| v.as_u64())
            .and_then(|v| usize::try_from(v).ok())
            .unwrap_or_else(num_cpus::get);

        let observer = Arc::new(StyleUpdateObserver {
            pending: ArcSwapOption::empty(),
            manager: RwLock::new(Weak::new()),
        });
        let watcher: Arc<dyn ConfigObserver> = Arc::<StyleUpdateObserver<B>>::clone(&observer);
        let jstyles = config.get_watched("render.styles", &watcher);

        let mut styles = Vec::new();
        let mut names = HashSet::new();
        match jstyles.as_deref().and_then(Value::as_object) {
            Some(object) => {
                for (name, jstyle) in object {
                    let Some(info) = parse_style_info(name, jstyle) else {
                        continue;
                    };
                    if !names.insert(info.name.clone()) {
                        error!("Duplicate style name: {name}");
                        continue;
                    }
                    styles.push(info);
                }
            }
            None => warn!("No styles provided"),
        }

        let styles = Arc::new(styles);
        let pool = RenderPool::new(backend, num_workers, queue_limit, Arc::clone(&styles));
        let inner = Arc::new(ManagerInner {
            pool,
            style_names: ArcSwap::from_pointee(names),
            committed_styles: Mutex::new(styles),
            observer: Arc::clone(&observer),
            updating: AtomicBool::new(false),
            inited: AtomicBool::new(false),
            update: Mutex::new(None),
            next_update_id: AtomicU64::new(1),
        });
        *observer
            .manager
            .write()
            .unwrap_or_else(PoisonError::into_inner) = Arc::downgrade(&inner);

        // an update may already be parked from the watch registration
        inner.inited.store(true, Ordering::Release);
        inner.try_process_style_update();
        Self { inner }
    }

    /// Posts a render task. Admission checks run synchronously: an unknown
    /// style or invalid tile id errors the returned task before it is queued.
    pub fn render(
        &self,
        request: RenderRequest,
        on_success: impl FnOnce(RenderOutput) + Send + 'static,
        on_error: impl FnOnce() + Send + 'static,
    ) -> Arc<RenderTask> {
        let task = RenderTask::new(on_success, on_error);
        if !request.tile.is_valid() {
            error!("Invalid tile id {}", request.tile);
            task.notify_error();
            return task;
        }
        if !self.has_style(&request.style_name) {
            task.notify_error();
            return task;
        }
        self.inner.pool.post_task(TileWorkTask {
            task: Arc::clone(&task),
            work: TileWork::Render(request),
        });
        task
    }

    /// Posts a subtile derivation; both tile ids must be valid.
    pub fn make_subtile(
        &self,
        request: SubtileRequest,
        on_success: impl FnOnce(RenderOutput) + Send + 'static,
        on_error: impl FnOnce() + Send + 'static,
    ) -> Arc<RenderTask> {
        let task = RenderTask::new(on_success, on_error);
        if !(request.mvt_tile.id.is_valid() && request.target.is_valid()) {
            error!("Invalid tile id!");
            task.notify_error();
            return task;
        }
        self.inner.pool.post_task(TileWorkTask {
            task: Arc::clone(&task),
            work: TileWork::Subtile(request),
        });
        task
    }

    /// Reserved. Always reports failure.
    pub fn render_sync(&self, _request: RenderRequest) -> Result<RenderOutput, RenderError> {
        Err(RenderError::SyncRenderUnavailable)
    }

    /// The currently committed style names.
    #[must_use]
    pub fn style_names(&self) -> Arc<HashSet<String>> {
        self.inner.style_names.load_full()
    }

    #[must_use]
    pub fn has_style(&self, name: &str) -> bool {
        self.inner.style_names.load().contains(name)
    }
}

impl<B: RenderBackend> ManagerInner<B> {
    fn update_state(&self) -> MutexGuard<'_, Option<UpdateState>> {
        self.update.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Single-flight drain of the parked style snapshot.
    fn try_process_style_update(self: &Arc<Self>) {
        if !self.inited.load(Ordering::Acquire) || self.observer.pending.load().is_none() {
            return;
        }
        if self
            .updating
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            // the in-flight update re-drains on completion
            return;
        }
        let Some(snapshot) = self.observer.pending.swap(None) else {
            self.finish_update();
            return;
        };
        let Some(styles) = parse_styles(&snapshot) else {
            error!("Unable to parse style update");
            self.finish_update();
            return;
        };
        {
            let committed = self
                .committed_styles
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            if **committed == styles {
                debug!("Styles unchanged, skipping update");
                drop(committed);
                self.finish_update();
                return;
            }
        }

        let styles = Arc::new(styles);
        let remaining = self.pool.workers();
        if remaining.is_empty() {
            warn!("Render pool has no workers! Skipping update!");
            self.publish(&styles);
            self.finish_update();
            return;
        }
        let id = self.next_update_id.fetch_add(1, Ordering::Relaxed);
        let target = remaining[remaining.len() - 1];
        *self.update_state() = Some(UpdateState {
            id,
            styles: Arc::clone(&styles),
            remaining,
            updated: Vec::new(),
        });
        self.dispatch_prepare(target, id, styles);
    }

    fn dispatch_prepare(self: &Arc<Self>, target: WorkerId, id: UpdateId, styles: Arc<Vec<StyleInfo>>) {
        let manager = Arc::clone(self);
        let dispatched = self.pool.execute_on(target, move |worker| {
            let prepared = worker.prepare_update(id, &styles);
            manager.on_worker_prepared(target, prepared);
        });
        if !dispatched {
            self.on_worker_prepared(target, false);
        }
    }

    /// Continuation after one worker's `prepare_update`, invoked on that
    /// worker's thread.
    fn on_worker_prepared(self: &Arc<Self>, worker: WorkerId, prepared: bool) {
        if !prepared {
            if let Some(state) = self.update_state().take() {
                error!(
                    "Error updating render worker {worker} ({} left). Cancelling update!",
                    state.remaining.len()
                );
                let id = state.id;
                for updated in state.updated {
                    self.pool.execute_on(updated, move |w| w.cancel_update(id));
                }
            }
            self.finish_update();
            return;
        }

        let next = {
            let mut guard = self.update_state();
            match guard.as_mut() {
                Some(state) => {
                    state.remaining.pop();
                    state.updated.push(worker);
                    state
                        .remaining
                        .last()
                        .map(|&next| (next, state.id, Arc::clone(&state.styles)))
                }
                None => {
                    drop(guard);
                    self.finish_update();
                    return;
                }
            }
        };
        match next {
            Some((target, id, styles)) => self.dispatch_prepare(target, id, styles),
            None => {
                // every worker staged the new set
                if let Some(state) = self.update_state().take() {
                    let id = state.id;
                    for updated in &state.updated {
                        self.pool.execute_on(*updated, move |w| w.commit_update(id));
                    }
                    self.publish(&state.styles);
                }
                self.finish_update();
            }
        }
    }

    fn publish(&self, styles: &Arc<Vec<StyleInfo>>) {
        let names: HashSet<String> = styles.iter().map(|info| info.name.clone()).collect();
        self.style_names.store(Arc::new(names));
        *self
            .committed_styles
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Arc::clone(styles);
    }

    fn finish_update(self: &Arc<Self>) {
        *self.update_state() = None;
        self.updating.store(false, Ordering::Release);
        // a newer snapshot may have arrived while this update ran
        self.try_process_style_update();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::mpsc;
    use std::time::{Duration, Instant};

    use serde_json::json;

    use crate::config::MemoryConfig;
    use crate::render::test_backend::TestBackend;
    use crate::{Metatile, MvtTile, TileId};

    use super::*;

    fn wait_until(what: &str, condition: impl Fn() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !condition() {
            assert!(Instant::now() < deadline, "timed out waiting for {what}");
            std::thread::sleep(Duration::from_millis(5));
        }
    }

    fn names(manager: &RenderManager<TestBackend>) -> Vec<String> {
        let mut names: Vec<String> = manager.style_names().iter().cloned().collect();
        names.sort();
        names
    }

    fn settled(manager: &RenderManager<TestBackend>, expected: &[&str]) -> bool {
        names(manager) == expected && !manager.inner.updating.load(Ordering::Acquire)
    }

    fn render_request(style_name: &str, tile: TileId) -> RenderRequest {
        RenderRequest {
            style_name: style_name.to_string(),
            tile,
            metatile: Metatile::default(),
            layers: None,
            render_grid: false,
            utfgrid_key: None,
        }
    }

    fn config_with_styles(styles: serde_json::Value, workers: u64) -> MemoryConfig {
        MemoryConfig::new(json!({
            "render": {"queue_limit": 64, "workers": workers, "styles": styles}
        }))
    }

    /// Parks every pool worker until the returned senders drop.
    fn block_workers(manager: &RenderManager<TestBackend>) -> Vec<mpsc::Sender<()>> {
        manager
            .inner
            .pool
            .workers()
            .into_iter()
            .map(|id| {
                let (release, wait) = mpsc::channel::<()>();
                manager.inner.pool.execute_on(id, move |_| {
                    let _ = wait.recv_timeout(Duration::from_secs(10));
                });
                release
            })
            .collect()
    }

    #[test]
    fn construction_parses_styles_and_admits_renders() {
        let config = config_with_styles(
            json!({
                "s1": {"map": "/maps/s1.json"},
                "bad": {},
                "s2": {"map": "/maps/s2.json", "version": 2},
            }),
            2,
        );
        let manager = RenderManager::new(&config, Arc::new(TestBackend::default()));
        assert_eq!(names(&manager), vec!["s1", "s2"]);

        let (sender, receiver) = mpsc::channel();
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_in_task = Arc::clone(&errors);
        manager.render(
            render_request("s2", TileId::new(2, 1, 1)),
            move |output| {
                let _ = sender.send(output.data);
            },
            move || {
                errors_in_task.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(
            receiver.recv_timeout(Duration::from_secs(5)).unwrap(),
            b"s2@v2".to_vec()
        );
        assert_eq!(errors.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn admission_rejects_unknown_style_and_invalid_ids() {
        let config = config_with_styles(json!({"s1": {"map": "/maps/s1.json"}}), 1);
        let manager = RenderManager::new(&config, Arc::new(TestBackend::default()));

        let errors = Arc::new(AtomicUsize::new(0));

        let errors_in_task = Arc::clone(&errors);
        let task = manager.render(
            render_request("nope", TileId::new(1, 0, 0)),
            |_| panic!("unexpected success"),
            move || {
                errors_in_task.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert!(task.is_finished());

        let errors_in_task = Arc::clone(&errors);
        manager.render(
            render_request("s1", TileId::new(1, 5, 0)),
            |_| panic!("unexpected success"),
            move || {
                errors_in_task.fetch_add(1, Ordering::SeqCst);
            },
        );

        let errors_in_task = Arc::clone(&errors);
        manager.make_subtile(
            SubtileRequest {
                mvt_tile: MvtTile {
                    id: TileId::new(2, 9, 0),
                    data: vec![],
                },
                target: TileId::new(4, 0, 0),
            },
            |_| panic!("unexpected success"),
            move || {
                errors_in_task.fetch_add(1, Ordering::SeqCst);
            },
        );

        assert_eq!(errors.load(Ordering::SeqCst), 3);
        assert!(matches!(
            manager.render_sync(render_request("s1", TileId::new(1, 0, 0))),
            Err(RenderError::SyncRenderUnavailable)
        ));
    }

    #[test]
    fn subtile_overzooms_through_the_pool() {
        let config = config_with_styles(json!({}), 1);
        let manager = RenderManager::new(&config, Arc::new(TestBackend::default()));

        let (sender, receiver) = mpsc::channel();
        manager.make_subtile(
            SubtileRequest {
                mvt_tile: MvtTile {
                    id: TileId::new(3, 1, 2),
                    data: vec![7, 7],
                },
                target: TileId::new(5, 4, 8),
            },
            move |output| {
                let _ = sender.send(output);
            },
            || panic!("unexpected error"),
        );
        let output = receiver.recv_timeout(Duration::from_secs(5)).unwrap();
        assert_eq!(output.data, vec![7, 7]);
    }

    #[test]
    fn update_replaces_the_committed_set() {
        let config = config_with_styles(json!({"s1": {"map": "/maps/s1.json"}}), 2);
        let manager = RenderManager::new(&config, Arc::new(TestBackend::default()));
        assert!(manager.has_style("s1"));

        config.set("render.styles", json!({"s2": {"map": "/maps/s2.json"}}));
        wait_until("s2 to be committed", || settled(&manager, &["s2"]));

        // requests admitted after publication reject the old style
        let errors = Arc::new(AtomicUsize::new(0));
        let errors_in_task = Arc::clone(&errors);
        manager.render(
            render_request("s1", TileId::new(1, 0, 0)),
            |_| panic!("unexpected success"),
            move || {
                errors_in_task.fetch_add(1, Ordering::SeqCst);
            },
        );
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn failed_prepare_rolls_back_every_worker() {
        let config = config_with_styles(json!({"s1": {"map": "/maps/s1.json"}}), 3);
        // the second compile of "broken" fails: that is the second worker in
        // the serial walk (ids 2, then 1, then 0)
        let backend = Arc::new(TestBackend::failing_on_attempt("broken", 2));
        let manager = RenderManager::new(&config, Arc::clone(&backend));

        config.set(
            "render.styles",
            json!({"broken": {"map": "/maps/broken.json"}}),
        );
        wait_until("the update to be cancelled", || {
            !manager.inner.updating.load(Ordering::Acquire)
        });
        assert_eq!(names(&manager), vec!["s1"]);

        // no worker kept staging behind: commit of a later update swaps
        // cleanly and the earlier staged set is gone
        let staged: Vec<usize> = {
            let (sender, receiver) = mpsc::channel();
            for id in manager.inner.pool.workers() {
                let sender = sender.clone();
                manager.inner.pool.execute_on(id, move |worker| {
                    let _ = sender.send(worker.staged_update_count());
                });
            }
            drop(sender);
            receiver.iter().take(3).collect()
        };
        // worker 1 failed mid-prepare and keeps its partial staging until the
        // next commit; worker 2 was cancelled; worker 0 never prepared
        assert_eq!(staged.iter().sum::<usize>(), 1);

        // a subsequent valid update proceeds normally
        config.set("render.styles", json!({"s3": {"map": "/maps/s3.json"}}));
        wait_until("s3 to be committed", || settled(&manager, &["s3"]));
    }

    #[test]
    fn queued_snapshots_coalesce_to_the_latest() {
        let config = config_with_styles(json!({"s1": {"map": "/maps/s1.json"}}), 2);
        let backend = Arc::new(TestBackend::default());
        let manager = RenderManager::new(&config, Arc::clone(&backend));
        wait_until("startup to settle", || settled(&manager, &["s1"]));

        let gates = block_workers(&manager);
        // drain starts for "a" and parks on the blocked workers; "b" and "c"
        // pile up behind it and must collapse into one drain of "c"
        config.set("render.styles", json!({"a": {"map": "/maps/a.json"}}));
        config.set("render.styles", json!({"b": {"map": "/maps/b.json"}}));
        config.set("render.styles", json!({"c": {"map": "/maps/c.json"}}));
        drop(gates);

        wait_until("c to be committed", || settled(&manager, &["c"]));
        let attempts_for = |name: &str| {
            let attempts = backend.attempts.lock().unwrap();
            attempts.get(name).copied().unwrap_or(0)
        };
        assert_eq!(attempts_for("a"), 2);
        assert_eq!(attempts_for("b"), 0);
        assert_eq!(attempts_for("c"), 2);
    }

    #[test]
    fn identical_snapshot_is_not_reapplied() {
        let config = config_with_styles(json!({"s1": {"map": "/maps/s1.json"}}), 2);
        let backend = Arc::new(TestBackend::default());
        let manager = RenderManager::new(&config, Arc::clone(&backend));

        config.set(
            "render.styles",
            json!({"s2": {"map": "/maps/s2.json", "version": 1}}),
        );
        wait_until("s2 to be committed", || settled(&manager, &["s2"]));
        let compiled = backend.compiled.load(Ordering::SeqCst);

        // same snapshot again: parses, compares equal, no worker touched
        config.set(
            "render.styles",
            json!({"s2": {"map": "/maps/s2.json", "version": 1}}),
        );
        assert!(settled(&manager, &["s2"]));
        assert_eq!(backend.compiled.load(Ordering::SeqCst), compiled);

        // a version bump is a real change
        config.set(
            "render.styles",
            json!({"s2": {"map": "/maps/s2.json", "version": 2}}),
        );
        wait_until("the recompile to finish", || {
            backend.compiled.load(Ordering::SeqCst) > compiled
        });
    }

    #[test]
    fn unparsable_update_leaves_the_set_intact() {
        let config = config_with_styles(json!({"s1": {"map": "/maps/s1.json"}}), 1);
        let manager = RenderManager::new(&config, Arc::new(TestBackend::default()));

        config.set("render.styles", json!({"s2": {}}));
        assert!(settled(&manager, &["s1"]));

        config.set("render.styles", json!({"s2": {"map": "/maps/s2.json"}}));
        wait_until("s2 to be committed", || settled(&manager, &["s2"]));
    }
}
