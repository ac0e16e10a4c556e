use dotenv::dotenv;
use log::error;
use std::env;
use std::path::PathBuf;
use std::process;

#[actix_web::main]
async fn main() {
    if env::var("RUST_LOG").is_err() {
        env::set_var("RUST_LOG", "info");
    }
    env_logger::init();

    dotenv().ok();

    let config_path =
        PathBuf::from(env::var("REPO_CONFIG").unwrap_or_else(|_| "config.json".to_string()));

    let config = uploadserver::load_config(&config_path);

    if let Err(e) = uploadserver::run(config).await {
        error!("Server failed: {}", e);
        process::exit(1);
    }
}
