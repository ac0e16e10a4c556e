use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use super::lock;
use super::task::{Task, TaskId, TaskRunner};

/// Hands out task ids, starting at 1 and never repeating.
#[derive(Debug)]
pub struct IdSequence {
    next: AtomicU64,
}

impl IdSequence {
    pub fn starting_at(first: TaskId) -> Self {
        IdSequence {
            next: AtomicU64::new(first),
        }
    }

    pub fn next_id(&self) -> TaskId {
        self.next.fetch_add(1, Ordering::SeqCst)
    }
}

impl Default for IdSequence {
    fn default() -> Self {
        IdSequence::starting_at(1)
    }
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Arc<Task>>,
    /// Tasks added but not yet marked done.
    unfinished: usize,
}

/// FIFO of tasks waiting for a worker, plus a table of every task ever
/// added.
///
/// Every task taken with `pop` must be followed by a `task_done` call once
/// the task has run, which is what `join` waits for.
#[derive(Default)]
pub struct TaskQueue {
    ids: IdSequence,
    state: Mutex<QueueState>,
    available: Condvar,
    all_done: Condvar,
    tasks: RwLock<HashMap<TaskId, Arc<Task>>>,
}

impl TaskQueue {
    pub fn new() -> Self {
        TaskQueue::default()
    }

    pub fn with_sequence(ids: IdSequence) -> Self {
        TaskQueue {
            ids,
            ..Default::default()
        }
    }

    /// Creates a task with the next id and adds it.
    pub fn submit(&self, name: &str, runner: Box<dyn TaskRunner>) -> Arc<Task> {
        let task = Arc::new(Task::new(self.ids.next_id(), name, runner));
        self.add(task.clone());
        task
    }

    pub fn add(&self, task: Arc<Task>) {
        self.tasks
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task.id(), task.clone());

        let mut state = lock(&self.state);
        state.pending.push_back(task);
        state.unfinished += 1;
        self.available.notify_one();
    }

    pub fn get(&self, id: TaskId) -> Option<Arc<Task>> {
        self.tasks
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .cloned()
    }

    /// Takes the oldest pending task, waiting at most `timeout` for one.
    pub fn pop(&self, timeout: Duration) -> Option<Arc<Task>> {
        let deadline = Instant::now() + timeout;
        let mut state = lock(&self.state);
        loop {
            if let Some(task) = state.pending.pop_front() {
                return Some(task);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            state = self
                .available
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    pub fn task_done(&self) {
        let mut state = lock(&self.state);
        state.unfinished = state.unfinished.saturating_sub(1);
        if state.unfinished == 0 {
            self.all_done.notify_all();
        }
    }

    /// Blocks until every added task has been marked done. Returns false if
    /// `timeout` passed first.
    pub fn join(&self, timeout: Option<Duration>) -> bool {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = lock(&self.state);
        while state.unfinished > 0 {
            state = match deadline {
                None => self
                    .all_done
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    self.all_done
                        .wait_timeout(state, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        true
    }

    #[cfg(test)]
    pub fn pending(&self) -> usize {
        lock(&self.state).pending.len()
    }

    #[cfg(test)]
    pub fn unfinished(&self) -> usize {
        lock(&self.state).unfinished
    }
}
