use log::{debug, error, warn};
use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Condvar, Mutex};
#[cfg(test)]
use std::sync::PoisonError;
#[cfg(test)]
use std::time::{Duration, Instant};

use crate::errors::JobResult;

use super::lock;

pub type TaskId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TaskState {
    pub fn name(&self) -> &'static str {
        match self {
            TaskState::Pending => "PENDING",
            TaskState::Processing => "PROCESSING",
            TaskState::Completed => "COMPLETED",
            TaskState::Failed => "FAILED",
        }
    }

    pub fn is_finished(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }

    pub fn can_transition_to(&self, next: TaskState) -> bool {
        matches!(
            (self, next),
            (TaskState::Pending, TaskState::Processing)
                | (TaskState::Processing, TaskState::Completed)
                | (TaskState::Processing, TaskState::Failed)
        )
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskKind {
    Import,
    Export,
}

impl TaskKind {
    /// The endpoint tasks of this kind are created and polled through.
    pub fn endpoint(&self) -> &'static str {
        match self {
            TaskKind::Import => "/upload",
            TaskKind::Export => "/push",
        }
    }
}

/// The work a task does. Runners hold the task specific parameters.
pub trait TaskRunner: Send + Sync {
    fn kind(&self) -> TaskKind;
    fn run(&self, task_id: TaskId) -> JobResult<()>;
}

#[derive(Debug)]
struct TaskStatus {
    state: TaskState,
    message: Option<String>,
}

pub struct Task {
    id: TaskId,
    name: String,
    runner: Box<dyn TaskRunner>,
    status: Mutex<TaskStatus>,
    changed: Condvar,
}

impl fmt::Debug for Task {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Task")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("kind", &self.kind())
            .field("state", &self.state())
            .finish()
    }
}

impl Task {
    pub fn new(id: TaskId, name: &str, runner: Box<dyn TaskRunner>) -> Task {
        Task {
            id,
            name: name.to_string(),
            runner,
            status: Mutex::new(TaskStatus {
                state: TaskState::Pending,
                message: None,
            }),
            changed: Condvar::new(),
        }
    }

    pub fn id(&self) -> TaskId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> TaskKind {
        self.runner.kind()
    }

    pub fn state(&self) -> TaskState {
        lock(&self.status).state
    }

    /// A description of why the task failed, if it did.
    pub fn message(&self) -> Option<String> {
        lock(&self.status).message.clone()
    }

    fn set_state(&self, state: TaskState, message: Option<String>) -> bool {
        let mut status = lock(&self.status);
        if !status.state.can_transition_to(state) {
            warn!(
                "#{}: Ignoring invalid state change {} -> {}",
                self.id, status.state, state
            );
            return false;
        }
        debug!("#{}: {} -> {}", self.id, status.state, state);
        status.state = state;
        status.message = message;
        self.changed.notify_all();
        true
    }

    /// Runs the task to completion on the calling thread. Errors and panics
    /// in the runner mark the task as failed.
    pub fn execute(&self) {
        if !self.set_state(TaskState::Processing, None) {
            return;
        }
        task_log_and_info!(self.id, "Processing task {}", self.name);

        let res = panic::catch_unwind(AssertUnwindSafe(|| self.runner.run(self.id)));
        match res {
            Ok(Ok(())) => {
                self.set_state(TaskState::Completed, None);
                task_log_and_info!(self.id, "Completed task {}", self.name);
            }
            Ok(Err(e)) => {
                task_log_and_error!(self.id, "Failed task {}: {}", self.name, e);
                self.set_state(TaskState::Failed, Some(e.to_string()));
            }
            Err(_) => {
                error!("#{}: Task {} panicked", self.id, self.name);
                self.set_state(TaskState::Failed, Some("Internal error".to_string()));
            }
        }
    }

    /// Blocks until the task has finished or `timeout` passed, returning the
    /// state at that point.
    #[cfg(test)]
    pub fn wait_until_finished(&self, timeout: Duration) -> TaskState {
        let deadline = Instant::now() + timeout;
        let mut status = lock(&self.status);
        while !status.state.is_finished() {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            status = self
                .changed
                .wait_timeout(status, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        status.state
    }
}
