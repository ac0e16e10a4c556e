use actix_web::http::StatusCode;
use actix_web::{HttpResponse, ResponseError};
use log::error;
use serde_json::json;
use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::ostree::OstreeError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum JobError {
    #[error("Could not lock {path:?} in {timeout_secs} seconds")]
    LockTimeout { path: PathBuf, timeout_secs: u64 },

    #[error("Unrecognized bundle: {0}")]
    UnrecognizedBundle(String),

    #[error("Bundle does not have valid signature: {0}")]
    SignatureInvalid(String),

    #[error("Committed metadata does not match the bundle header: {0}")]
    MetadataMismatch(String),

    #[error("External tool failed: {0}")]
    ExternalToolFailure(String),

    #[error("Repository error: {0}")]
    RepoError(OstreeError),

    #[error("InternalError: {0}")]
    InternalError(String),
}

impl JobError {
    pub fn new(s: &str) -> Self {
        JobError::InternalError(s.to_string())
    }
}

pub type JobResult<T> = Result<T, JobError>;

impl From<OstreeError> for JobError {
    fn from(e: OstreeError) -> Self {
        match e {
            OstreeError::ExecFailed(_, _) | OstreeError::CommandFailed(_, _) => {
                JobError::ExternalToolFailure(e.to_string())
            }
            _ => JobError::RepoError(e),
        }
    }
}

impl From<io::Error> for JobError {
    fn from(e: io::Error) -> Self {
        JobError::InternalError(e.to_string())
    }
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Internal Server Error ({0})")]
    InternalServerError(String),

    #[error("NotFound: {0}")]
    NotFound(String),

    #[error("BadRequest: {0}")]
    BadRequest(String),

    #[error("WrongTaskType: {0}")]
    WrongTaskType(String),
}

impl ApiError {
    fn message(&self) -> String {
        match self {
            // Never leak paths or tool output to clients
            ApiError::InternalServerError(_) => "Internal Server Error".to_string(),
            ApiError::NotFound(message)
            | ApiError::BadRequest(message)
            | ApiError::WrongTaskType(message) => message.clone(),
        }
    }
}

impl From<io::Error> for ApiError {
    fn from(e: io::Error) -> Self {
        ApiError::InternalServerError(e.to_string())
    }
}

impl From<actix_multipart::MultipartError> for ApiError {
    fn from(e: actix_multipart::MultipartError) -> Self {
        ApiError::BadRequest(format!("Invalid multipart upload: {}", e))
    }
}

impl ResponseError for ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InternalServerError(_) => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::BadRequest(_) | ApiError::WrongTaskType(_) => StatusCode::BAD_REQUEST,
        }
    }

    fn error_response(&self) -> HttpResponse {
        if let ApiError::InternalServerError(internal_message) = self {
            error!("Responding with internal error: {}", internal_message);
        }
        HttpResponse::build(self.status_code()).json(json!({
            "success": false,
            "message": self.message(),
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_failures_are_external_tool_failures() {
        let e: JobError =
            OstreeError::CommandFailed("ostree prune".to_string(), "boom".to_string()).into();
        assert!(matches!(e, JobError::ExternalToolFailure(_)));

        let e: JobError = OstreeError::NoSuchRef("app/foo".to_string()).into();
        assert_eq!(
            e,
            JobError::RepoError(OstreeError::NoSuchRef("app/foo".to_string()))
        );
    }

    #[test]
    fn test_internal_errors_hide_details() {
        let e = ApiError::InternalServerError("/var/tmp/secret path".to_string());
        assert_eq!(e.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(e.message(), "Internal Server Error");

        let e = ApiError::WrongTaskType("Task 3 is not a /push task".to_string());
        assert_eq!(e.status_code(), StatusCode::BAD_REQUEST);
    }
}
