use actix_multipart::Field;
use actix_web::http::StatusCode;
use actix_web::HttpResponse;
use futures::TryStreamExt;
use log::error;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::TryFrom;
use std::io::Write;
use std::path::Path;
use tempfile::NamedTempFile;

use crate::app::AppState;
use crate::errors::ApiError;
use crate::tasks::{TaskId, TaskKind};

/// The JSON envelope every endpoint answers with.
#[derive(Serialize, Debug, Default)]
pub struct TaskResponse {
    pub success: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task: Option<TaskId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl TaskResponse {
    pub fn ok(message: String) -> Self {
        TaskResponse {
            success: true,
            message,
            ..Default::default()
        }
    }

    pub fn with_task(mut self, task: TaskId) -> Self {
        self.task = Some(task);
        self
    }

    pub fn with_state(mut self, state: &'static str) -> Self {
        self.state = Some(state);
        self
    }

    pub fn with_error(mut self, error: Option<String>) -> Self {
        self.error = error;
        self
    }

    pub fn respond(self) -> HttpResponse {
        HttpResponse::build(StatusCode::OK).json(self)
    }
}

pub fn bad_request(message: &str) -> ApiError {
    error!("{}", message);
    ApiError::BadRequest(message.to_string())
}

/// Answers a `GET` on a task endpoint with the state of the task named by
/// the `task` query argument, which must be a task of `kind`.
pub fn task_status(
    state: &AppState,
    kind: TaskKind,
    params: &HashMap<String, String>,
) -> Result<HttpResponse, ApiError> {
    let arg = params
        .get("task")
        .ok_or_else(|| bad_request("Task argument required"))?;
    let requested: i64 = arg
        .parse()
        .map_err(|_| bad_request("Task argument must be integer"))?;

    let task = TaskId::try_from(requested)
        .ok()
        .and_then(|id| state.queue.get(id))
        .ok_or_else(|| ApiError::NotFound(format!("Task {} does not exist", requested)))?;

    if task.kind() != kind {
        return Err(ApiError::WrongTaskType(format!(
            "Task {} is not a {} task",
            requested,
            kind.endpoint()
        )));
    }

    let state_name = task.state().name();
    Ok(
        TaskResponse::ok(format!("Task {} state is {}", task.id(), state_name))
            .with_state(state_name)
            .with_error(task.message())
            .respond(),
    )
}

/// Streams a multipart field into a new temporary file in `dir`.
pub async fn save_field(field: &mut Field, dir: &Path) -> Result<NamedTempFile, ApiError> {
    let mut file = tempfile::Builder::new()
        .prefix("upload-")
        .tempfile_in(dir)?;
    while let Some(chunk) = field.try_next().await? {
        file.write_all(&chunk)?;
    }
    file.flush()?;
    Ok(file)
}

/// Reads a small multipart form value as text.
pub async fn read_text_field(field: &mut Field) -> Result<String, ApiError> {
    let mut data = Vec::new();
    while let Some(chunk) = field.try_next().await? {
        data.extend_from_slice(&chunk);
    }
    String::from_utf8(data)
        .map_err(|_| bad_request(&format!("Form field {} is not valid UTF-8", field.name())))
}
