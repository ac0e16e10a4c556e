use actix_multipart::Multipart;
use actix_web::web::{Data, Query};
use actix_web::HttpResponse;
use futures::TryStreamExt;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::fs;
use tempfile::NamedTempFile;

use crate::app::AppState;
use crate::errors::ApiError;
use crate::tasks::{ImportTask, TaskKind};

use super::utils::{bad_request, read_text_field, save_field, task_status, TaskResponse};

/// Receives a bundle and queues its import into the repository named by the
/// `repo` form field.
pub async fn upload(mut multipart: Multipart, state: Data<AppState>) -> Result<HttpResponse, ApiError> {
    debug!("/upload: POST request start");
    let _active = state.uploads.start();

    let mut upload: Option<(Option<String>, NamedTempFile)> = None;
    let mut repo_name: Option<String> = None;

    while let Some(mut field) = multipart.try_next().await? {
        let name = field.name().to_string();
        match name.as_str() {
            "file" => {
                let filename = field
                    .content_disposition()
                    .get_filename()
                    .map(|s| s.to_string());
                let file = save_field(&mut field, &state.scratch_dir).await?;
                upload = Some((filename, file));
            }
            "repo" => repo_name = Some(read_text_field(&mut field).await?),
            other => debug!("/upload: ignoring form field {}", other),
        }
    }

    let (filename, file) = upload.ok_or_else(|| bad_request("No file in request"))?;
    let filename = match filename {
        Some(filename) if !filename.is_empty() => filename,
        _ => return Err(bad_request("No filename in request")),
    };

    info!("Target repo: {:?}", repo_name);
    let repo_name = match repo_name {
        Some(repo_name) if !repo_name.is_empty() => repo_name,
        _ => return Err(bad_request("ERROR! 'repo' parameter not set!")),
    };
    let repoconfig = state.config.repos.get(&repo_name).ok_or_else(|| {
        bad_request(&format!("ERROR! Target repo '{}' is invalid!", repo_name))
    })?;

    if !repoconfig.path.exists() {
        warn!("Directory {:?} not present. Creating it...", repoconfig.path);
        fs::create_dir_all(&repoconfig.path)?;
    }

    // From here on the task owns the file and removes it
    let (_, upload_path) = file
        .keep()
        .map_err(|e| ApiError::InternalServerError(e.to_string()))?;

    let task = state.queue.submit(
        &filename,
        Box::new(ImportTask {
            upload: upload_path,
            repo_path: repoconfig.path.clone(),
            opener: state.opener.clone(),
            config: state.config.import_config(),
            scratch_dir: state.scratch_dir.clone(),
            lock_timeout: Some(state.config.lock_timeout()),
        }),
    );
    info!(
        "Queued import of {} into {} as task {}",
        filename,
        repo_name,
        task.id()
    );

    Ok(TaskResponse::ok("Importing bundle".to_string())
        .with_task(task.id())
        .respond())
}

pub async fn get_upload_task(
    params: Query<HashMap<String, String>>,
    state: Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    debug!("/upload: GET request {:?}", params);
    task_status(&state, TaskKind::Import, &params)
}

pub async fn unsupported_upload_method() -> Result<HttpResponse, ApiError> {
    Err(bad_request("Only GET and POST methods supported"))
}
