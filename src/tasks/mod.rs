/**************************************************************************
 * Task handling - theory of operations.
 *
 * Every upload and push request becomes a task, which is added to the
 * in-memory task queue and handed back to the client as a task id. The
 * queue keeps every task it has ever seen so clients can poll their state
 * for the life of the process.
 *
 * All tasks have a state which is:
 *   Pending - queued but not started
 *   Processing - a worker is running it
 *   Completed - it ran to the end
 *   Failed - it returned an error (or panicked)
 *
 * A fixed pool of worker threads pulls tasks from the queue. Workers only
 * check for a stop request between tasks, so stopping the pool waits for
 * the running tasks to finish.
 *
 * Imports and exports take a shared lock on the repository they work on,
 * while maintenance takes an exclusive one. Maintenance is only started
 * when the queue is idle, and it stops the worker pool while it runs so
 * no new task can start until it is done.
 *
 ************************************************************************/

macro_rules! task_log_and_info {
    ( $task_id:expr, $($arg:tt)+ ) => {{
        log::info!("#{}: {}", $task_id, format!($($arg)+));
    }};
}

macro_rules! task_log_and_error {
    ( $task_id:expr, $($arg:tt)+ ) => {{
        log::error!("#{}: {}", $task_id, format!($($arg)+));
    }};
}

mod export_task;
mod import_task;
mod task;
mod task_queue;
mod worker_pool;

pub use export_task::ExportTask;
pub use import_task::ImportTask;
pub use task::{Task, TaskId, TaskKind, TaskRunner, TaskState};
pub use task_queue::{IdSequence, TaskQueue};
pub use worker_pool::{CompletionCallback, WorkerPool};

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Locks a mutex, carrying on with the data if a panicking holder poisoned it.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
