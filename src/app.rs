use actix_web::dev::Server;
use actix_web::web::{self, Data};
use actix_web::{middleware, App, HttpServer};
use log::info;
use std::collections::HashMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use crate::api;
use crate::config::Config;
use crate::maintenance::UploadCounter;
use crate::push_adapters::{new_push_adapter, PushAdapter};
use crate::repository::RepoOpener;
use crate::tasks::TaskQueue;

pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<TaskQueue>,
    pub opener: Arc<dyn RepoOpener>,
    pub adapters: HashMap<String, Arc<dyn PushAdapter>>,
    pub uploads: Arc<UploadCounter>,
    /// Uploads and exported bundles are written here.
    pub scratch_dir: PathBuf,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        queue: Arc<TaskQueue>,
        opener: Arc<dyn RepoOpener>,
        uploads: Arc<UploadCounter>,
        scratch_dir: PathBuf,
    ) -> Self {
        let adapters = config
            .remotes
            .iter()
            .map(|(name, remote)| {
                let adapter: Arc<dyn PushAdapter> = Arc::from(new_push_adapter(name, remote));
                info!("Remote {} using {}", name, adapter);
                (name.clone(), adapter)
            })
            .collect();

        AppState {
            config,
            queue,
            opener,
            adapters,
            uploads,
            scratch_dir,
        }
    }
}

pub fn configure(cfg: &mut web::ServiceConfig) {
    cfg.route("/", web::get().to(api::index))
        .service(
            web::resource("/upload")
                .route(web::post().to(api::upload))
                .route(web::get().to(api::get_upload_task))
                .default_service(web::to(api::unsupported_upload_method)),
        )
        .service(
            web::resource("/push")
                .route(web::put().to(api::push))
                .route(web::get().to(api::get_push_task))
                .default_service(web::to(api::unsupported_push_method)),
        );
}

pub fn create_server(state: Data<AppState>) -> io::Result<Server> {
    let config = state.config.clone();

    let server = HttpServer::new(move || {
        App::new()
            .app_data(state.clone())
            .wrap(middleware::Logger::default())
            .configure(configure)
    })
    .bind((config.host.as_str(), config.port))?
    .run();

    info!("Started http server: {}:{}", config.host, config.port);
    Ok(server)
}
