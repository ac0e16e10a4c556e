use log::{debug, error, info, warn};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::task::Task;
use super::task_queue::TaskQueue;

const POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Called by a worker after each task it ran, whatever the outcome.
pub type CompletionCallback = Arc<dyn Fn(&Task) + Send + Sync>;

/// A fixed size set of worker threads executing tasks from a queue.
pub struct WorkerPool {
    on_complete: CompletionCallback,
    poll_interval: Duration,
    stop: Arc<AtomicBool>,
    workers: Vec<JoinHandle<()>>,
    live: Arc<AtomicUsize>,
}

fn worker_loop(
    worker: usize,
    queue: Arc<TaskQueue>,
    stop: Arc<AtomicBool>,
    on_complete: CompletionCallback,
    poll_interval: Duration,
    live: Arc<AtomicUsize>,
) {
    debug!("Worker {} started", worker);
    while !stop.load(Ordering::SeqCst) {
        if let Some(task) = queue.pop(poll_interval) {
            task.execute();
            queue.task_done();
            on_complete(&task);
        }
    }
    live.fetch_sub(1, Ordering::SeqCst);
    debug!("Worker {} exited", worker);
}

impl WorkerPool {
    pub fn new(on_complete: CompletionCallback) -> Self {
        WorkerPool {
            on_complete,
            poll_interval: POLL_INTERVAL,
            stop: Arc::new(AtomicBool::new(false)),
            workers: Vec::new(),
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn is_running(&self) -> bool {
        !self.workers.is_empty()
    }

    /// Number of worker threads that have not exited yet.
    pub fn live_workers(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    pub fn start(&mut self, queue: Arc<TaskQueue>, count: usize) {
        if self.is_running() {
            warn!("Worker pool already running");
            return;
        }

        info!("Starting {} workers", count);
        // Every start gets its own stop flag
        self.stop = Arc::new(AtomicBool::new(false));

        for worker in 0..count {
            let queue = queue.clone();
            let stop = self.stop.clone();
            let on_complete = self.on_complete.clone();
            let poll_interval = self.poll_interval;
            let live = self.live.clone();

            live.fetch_add(1, Ordering::SeqCst);
            match thread::Builder::new()
                .name(format!("worker-{}", worker))
                .spawn(move || worker_loop(worker, queue, stop, on_complete, poll_interval, live))
            {
                Ok(handle) => self.workers.push(handle),
                Err(e) => {
                    self.live.fetch_sub(1, Ordering::SeqCst);
                    error!("Failed to start worker {}: {}", worker, e);
                }
            }
        }
    }

    /// Signals every worker to stop and waits for them to exit. Running
    /// tasks are finished first.
    pub fn stop(&mut self) {
        if !self.is_running() {
            return;
        }

        info!("Stopping {} workers", self.workers.len());
        self.stop.store(true, Ordering::SeqCst);
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                error!("Worker thread panicked");
            }
        }
        info!("All workers stopped");
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        self.stop();
    }
}
