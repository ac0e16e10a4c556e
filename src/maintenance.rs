use log::{debug, error, info, warn};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crate::config::ImportConfig;
use crate::repolock::RepoLock;
use crate::repository::RepoOpener;
use crate::tasks::{lock, TaskQueue, WorkerPool};

#[derive(Debug, Clone, Copy)]
struct Activity {
    last_task: Instant,
    last_maintenance: Instant,
}

/// When a task last finished and when maintenance last ran. Updated from
/// the worker pool completion callback and read by the scheduler.
#[derive(Debug)]
pub struct ActivityTracker {
    activity: Mutex<Activity>,
}

impl ActivityTracker {
    pub fn new(now: Instant) -> Self {
        ActivityTracker {
            activity: Mutex::new(Activity {
                last_task: now,
                last_maintenance: now,
            }),
        }
    }

    pub fn task_completed(&self, now: Instant) {
        lock(&self.activity).last_task = now;
    }

    pub fn maintenance_completed(&self, now: Instant) {
        lock(&self.activity).last_maintenance = now;
    }

    /// Returns (time since last task, time since last maintenance).
    pub fn elapsed(&self, now: Instant) -> (Duration, Duration) {
        let activity = *lock(&self.activity);
        (
            now.saturating_duration_since(activity.last_task),
            now.saturating_duration_since(activity.last_maintenance),
        )
    }
}

/// Number of uploads currently being received.
#[derive(Debug, Default)]
pub struct UploadCounter {
    count: AtomicUsize,
}

pub struct UploadGuard<'a> {
    counter: &'a UploadCounter,
}

impl UploadCounter {
    pub fn start(&self) -> UploadGuard<'_> {
        let count = self.count.fetch_add(1, Ordering::SeqCst) + 1;
        debug!("Active uploads now {}", count);
        UploadGuard { counter: self }
    }

    pub fn count(&self) -> usize {
        self.count.load(Ordering::SeqCst)
    }
}

impl Drop for UploadGuard<'_> {
    fn drop(&mut self) {
        let count = self.counter.count.fetch_sub(1, Ordering::SeqCst) - 1;
        debug!("Active uploads now {}", count);
    }
}

/// Runs repository maintenance once the server has gone quiet.
///
/// Maintenance is due when a task finished since the last pass and nothing
/// finished for the quiet period. The worker pool is stopped for the
/// duration of the pass and every repository is locked exclusively while
/// it is maintained.
pub struct MaintenanceScheduler {
    pub activity: Arc<ActivityTracker>,
    pub queue: Arc<TaskQueue>,
    pub pool: Arc<Mutex<WorkerPool>>,
    pub workers: usize,
    pub repos: Vec<PathBuf>,
    pub opener: Arc<dyn RepoOpener>,
    pub config: ImportConfig,
    pub quiet_period: Duration,
    pub lock_timeout: Option<Duration>,
    pub uploads: Arc<UploadCounter>,
}

impl MaintenanceScheduler {
    pub fn maintenance_due(&self, now: Instant) -> bool {
        let (since_task, since_maintenance) = self.activity.elapsed(now);
        debug!(
            "{:.1}s since last task, {:.1}s/{}s since last maintenance",
            since_task.as_secs_f64(),
            since_maintenance.as_secs_f64(),
            self.quiet_period.as_secs()
        );
        since_maintenance > since_task && since_task >= self.quiet_period
    }

    /// Runs maintenance if it is due. Returns whether it ran.
    pub fn tick(&self, now: Instant) -> bool {
        if !self.maintenance_due(now) {
            return false;
        }
        debug!("Idle, performing maintenance");
        self.perform_maintenance()
    }

    /// Waits for queued tasks to finish, then maintains every repository
    /// with the worker pool stopped. Returns false without doing anything
    /// if the queue does not drain within the lock timeout.
    pub fn perform_maintenance(&self) -> bool {
        if !self.queue.join(self.lock_timeout) {
            info!("Tasks still queued, postponing maintenance");
            return false;
        }

        let mut pool = lock(&self.pool);
        pool.stop();

        info!("Performing maintenance on repos: {:?}", self.repos);
        for repo_path in self.repos.iter() {
            if !self.opener.exists(repo_path) {
                warn!("Repo {:?} doesn't exist, skipping maintenance", repo_path);
                continue;
            }

            let _lock = match RepoLock::exclusive(repo_path, self.lock_timeout) {
                Ok(lock) => lock,
                Err(e) => {
                    error!("Maintenance of {:?} failed: {}", repo_path, e);
                    continue;
                }
            };

            info!("Performing maintenance on {:?}", repo_path);
            match self
                .opener
                .open(repo_path)
                .and_then(|repo| repo.run_maintenance(&self.config))
            {
                Ok(()) => info!("Completed maintenance on {:?}", repo_path),
                Err(e) => error!("Maintenance of {:?} failed: {}", repo_path, e),
            }
        }

        self.activity.maintenance_completed(Instant::now());
        pool.start(self.queue.clone(), self.workers);
        true
    }

    /// Starts polling for idle periods on a background thread.
    pub fn start(self, poll_interval: Duration) -> std::io::Result<MaintenanceHandle> {
        let (stop_tx, stop_rx) = mpsc::channel();

        let thread = thread::Builder::new()
            .name("maintenance".to_string())
            .spawn(move || loop {
                match stop_rx.recv_timeout(poll_interval) {
                    Err(RecvTimeoutError::Timeout) => (),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }

                // Keep checking for stop requests while waiting for the queue
                if !self.queue.join(Some(poll_interval)) {
                    continue;
                }
                debug!(
                    "Task queue empty, {} uploads ongoing",
                    self.uploads.count()
                );
                self.tick(Instant::now());
            })?;

        Ok(MaintenanceHandle {
            stop_tx,
            thread: Some(thread),
        })
    }
}

pub struct MaintenanceHandle {
    stop_tx: mpsc::Sender<()>,
    thread: Option<JoinHandle<()>>,
}

impl MaintenanceHandle {
    /// Stops the polling thread, waiting for a running pass to finish.
    pub fn stop(&mut self) {
        if let Some(thread) = self.thread.take() {
            info!("Stopping maintenance");
            let _ = self.stop_tx.send(());
            if thread.join().is_err() {
                error!("Maintenance thread panicked");
            }
        }
    }
}

impl Drop for MaintenanceHandle {
    fn drop(&mut self) {
        self.stop();
    }
}
