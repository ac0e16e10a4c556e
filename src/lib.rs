mod api;
mod app;
pub mod bundle;
pub mod config;
pub mod errors;
pub mod maintenance;
pub mod ostree;
pub mod push_adapters;
pub mod repolock;
pub mod repository;
pub mod tasks;

#[cfg(test)]
mod testutil;

use actix_web::web::Data;
use log::{debug, info};
use std::fs;
use std::io;
use std::path;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use app::AppState;
use config::Config;
use maintenance::{ActivityTracker, MaintenanceScheduler, UploadCounter};
use repository::{OstreeRepoOpener, RepoOpener};
use tasks::{Task, TaskQueue, WorkerPool};

pub fn load_config(path: &path::Path) -> Arc<Config> {
    let config_data = config::load_config(path)
        .unwrap_or_else(|e| panic!("Failed to read config file {:?}: {}", path, e));
    Arc::new(config_data)
}

/// Runs the server until it is told to exit, then stops maintenance and the
/// worker pool, letting running tasks finish.
pub async fn run(config: Arc<Config>) -> io::Result<()> {
    fs::create_dir_all(&config.upload_dir)?;
    // Removed again when dropped at exit
    let scratch = tempfile::Builder::new()
        .prefix("ostree-upload-server-")
        .tempdir_in(&config.upload_dir)?;
    info!("Using {:?} for uploads", scratch.path());

    let opener: Arc<dyn RepoOpener> = Arc::new(OstreeRepoOpener::default());
    let queue = Arc::new(TaskQueue::new());
    let uploads = Arc::new(UploadCounter::default());
    let activity = Arc::new(ActivityTracker::new(Instant::now()));

    let a = activity.clone();
    let mut pool = WorkerPool::new(Arc::new(move |task: &Task| {
        debug!("#{}: {} finished as {}", task.id(), task.name(), task.state());
        a.task_completed(Instant::now());
    }));
    pool.start(queue.clone(), config.workers);
    let pool = Arc::new(Mutex::new(pool));

    let mut maintenance = if config.maintenance {
        let scheduler = MaintenanceScheduler {
            activity,
            queue: queue.clone(),
            pool: pool.clone(),
            workers: config.workers,
            repos: config.repos.values().map(|r| r.path.clone()).collect(),
            opener: opener.clone(),
            config: config.import_config(),
            quiet_period: config.maintenance_quiet_period(),
            lock_timeout: Some(config.lock_timeout()),
            uploads: uploads.clone(),
        };
        Some(scheduler.start(config.maintenance_poll_interval())?)
    } else {
        info!("Repository maintenance disabled");
        None
    };

    let state = Data::new(AppState::new(
        config.clone(),
        queue,
        opener,
        uploads,
        scratch.path().to_path_buf(),
    ));
    let result = app::create_server(state)?.await;

    info!("Http server stopped");
    if let Some(maintenance) = maintenance.as_mut() {
        maintenance.stop();
    }
    tasks::lock(&pool).stop();
    info!("Exiting...");

    result
}
