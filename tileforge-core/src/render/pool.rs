use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::thread::JoinHandle;

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{error, info, warn};

use super::backend::RenderBackend;
use super::style::StyleInfo;
use super::task::TileWorkTask;
use super::worker::RenderWorker;

/// Pool-local worker identifier, stable for the pool's lifetime.
pub type WorkerId = usize;

type ControlFn<B> = Box<dyn FnOnce(&mut RenderWorker<B>) + Send>;

enum WorkerMessage<B: RenderBackend> {
    Tile(TileWorkTask),
    Control(ControlFn<B>),
}

struct WorkerHandle<B: RenderBackend> {
    sender: Sender<WorkerMessage<B>>,
    thread: Option<JoinHandle<()>>,
}

/// Fixed-size pool of render workers behind one bounded tile queue.
///
/// Each worker runs its own OS thread and drains its own mailbox, so tasks on
/// a worker are serialized. Tile tasks are load-balanced round-robin and
/// counted against `queue_limit` across all mailboxes combined; control
/// actions target one worker, share its FIFO, and are never rejected.
pub struct RenderPool<B: RenderBackend> {
    workers: Vec<WorkerHandle<B>>,
    queue_depth: Arc<AtomicUsize>,
    queue_limit: usize,
    next_worker: AtomicUsize,
}

impl<B: RenderBackend> RenderPool<B> {
    pub fn new(
        backend: Arc<B>,
        num_workers: usize,
        queue_limit: usize,
        initial_styles: Arc<Vec<StyleInfo>>,
    ) -> Self {
        let queue_depth = Arc::new(AtomicUsize::new(0));
        let workers = (0..num_workers)
            .filter_map(|id| {
                let backend = Arc::clone(&backend);
                let styles = Arc::clone(&initial_styles);
                let depth = Arc::clone(&queue_depth);
                let (sender, receiver) = unbounded();
                let spawned = thread::Builder::new()
                    .name(format!("render-worker-{id}"))
                    .spawn(move || worker_loop(id, &backend, &styles, &depth, &receiver));
                match spawned {
                    Ok(thread) => Some(WorkerHandle {
                        sender,
                        thread: Some(thread),
                    }),
                    Err(e) => {
                        error!("Unable to spawn render worker {id}: {e}");
                        None
                    }
                }
            })
            .collect();
        info!("Started render pool with {num_workers} workers, queue limit {queue_limit}");
        Self {
            workers,
            queue_depth,
            queue_limit,
            next_worker: AtomicUsize::new(0),
        }
    }

    /// Enqueues a tile task on the least recently used mailbox.
    ///
    /// Rejection (full queue, no workers) fires the task's `on_error` before
    /// returning false.
    pub fn post_task(&self, task: TileWorkTask) -> bool {
        if self.workers.is_empty() {
            warn!("Render pool has no workers");
            task.task.notify_error();
            return false;
        }
        let admitted = self
            .queue_depth
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |depth| {
                (depth < self.queue_limit).then_some(depth + 1)
            })
            .is_ok();
        if !admitted {
            warn!("Render queue is full ({} tasks)", self.queue_limit);
            task.task.notify_error();
            return false;
        }
        let target = self.next_worker.fetch_add(1, Ordering::Relaxed) % self.workers.len();
        if let Err(rejected) = self.workers[target].sender.send(WorkerMessage::Tile(task)) {
            self.queue_depth.fetch_sub(1, Ordering::SeqCst);
            if let WorkerMessage::Tile(task) = rejected.0 {
                task.task.notify_error();
            }
            return false;
        }
        true
    }

    /// Enqueues a control action on one worker, FIFO with its tile tasks.
    pub fn execute_on(
        &self,
        worker: WorkerId,
        action: impl FnOnce(&mut RenderWorker<B>) + Send + 'static,
    ) -> bool {
        let Some(handle) = self.workers.get(worker) else {
            error!("No render worker {worker}");
            return false;
        };
        handle
            .sender
            .send(WorkerMessage::Control(Box::new(action)))
            .is_ok()
    }

    /// Snapshot of worker ids for targeted dispatch.
    #[must_use]
    pub fn workers(&self) -> Vec<WorkerId> {
        (0..self.workers.len()).collect()
    }

    #[must_use]
    pub fn queue_limit(&self) -> usize {
        self.queue_limit
    }
}

impl<B: RenderBackend> Drop for RenderPool<B> {
    fn drop(&mut self) {
        for handle in &mut self.workers {
            // disconnect the mailbox so the worker drains and exits
            let (closed, _) = unbounded();
            handle.sender = closed;
        }
        let current = thread::current().id();
        for handle in &mut self.workers {
            if let Some(thread) = handle.thread.take() {
                if thread.thread().id() == current {
                    // the last owner was a queued control action running on
                    // this very worker; it cannot join itself
                    continue;
                }
                if thread.join().is_err() {
                    error!("Render worker thread panicked");
                }
            }
        }
    }
}

fn worker_loop<B: RenderBackend>(
    id: WorkerId,
    backend: &Arc<B>,
    initial_styles: &[StyleInfo],
    queue_depth: &AtomicUsize,
    receiver: &Receiver<WorkerMessage<B>>,
) {
    let mut worker = RenderWorker::new(Arc::clone(backend), initial_styles);
    while let Ok(message) = receiver.recv() {
        match message {
            WorkerMessage::Tile(task) => {
                queue_depth.fetch_sub(1, Ordering::SeqCst);
                worker.execute(task);
            }
            WorkerMessage::Control(action) => action(&mut worker),
        }
    }
    log::debug!("Render worker {id} stopped");
}
