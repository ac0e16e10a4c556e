use actix_web::web::{Data, Query};
use actix_web::HttpResponse;
use log::{debug, info};
use std::collections::HashMap;

use crate::app::AppState;
use crate::errors::ApiError;
use crate::tasks::{ExportTask, TaskKind};

use super::utils::{bad_request, task_status, TaskResponse};

/// Queues the export of `ref` and its push to `remote`.
pub async fn push(
    params: Query<HashMap<String, String>>,
    state: Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    debug!("/push: PUT request {:?}", params);

    let (ref_name, remote) = match (params.get("ref"), params.get("remote")) {
        (Some(ref_name), Some(remote)) => (ref_name, remote),
        _ => return Err(bad_request("ref and remote arguments required")),
    };

    debug!("/push: {} to {}", ref_name, remote);
    let adapter = state
        .adapters
        .get(remote)
        .ok_or_else(|| bad_request("Remote is not in the whitelist"))?;

    let repoconfig = match params.get("repo") {
        Some(repo_name) => state.config.get_repoconfig(repo_name)?,
        None => state.config.default_repoconfig()?,
    };

    let task = state.queue.submit(
        ref_name,
        Box::new(ExportTask {
            ref_name: ref_name.clone(),
            repo_path: repoconfig.path.clone(),
            opener: state.opener.clone(),
            adapter: adapter.clone(),
            scratch_dir: state.scratch_dir.clone(),
            lock_timeout: Some(state.config.lock_timeout()),
        }),
    );
    info!(
        "Queued push of {} from {} to {} as task {}",
        ref_name,
        repoconfig.name,
        remote,
        task.id()
    );

    Ok(TaskResponse::ok(format!("Pushing {} to {}", ref_name, remote))
        .with_task(task.id())
        .respond())
}

pub async fn get_push_task(
    params: Query<HashMap<String, String>>,
    state: Data<AppState>,
) -> Result<HttpResponse, ApiError> {
    debug!("/push: GET request {:?}", params);
    task_status(&state, TaskKind::Export, &params)
}

pub async fn unsupported_push_method() -> Result<HttpResponse, ApiError> {
    Err(bad_request("Only GET and PUT methods supported"))
}
