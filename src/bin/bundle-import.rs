use clap::Parser;
use log::{error, info, LevelFilter};
use std::path::PathBuf;
use std::process;
use std::sync::Arc;

use uploadserver::config::{ImportConfig, DEFAULT_LOCK_TIMEOUT};
use uploadserver::repository::OstreeRepoOpener;
use uploadserver::tasks::ImportTask;

/// Imports a flatpak bundle or ostree archive into a repository, the same
/// way the upload server does.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Repository to import into, created if missing
    repo: PathBuf,

    /// Bundle or archive to import
    bundle: PathBuf,

    /// GPG home directory holding the signing and trusted keys
    #[arg(short, long)]
    gpg_homedir: Option<PathBuf>,

    /// Keyring the bundle signature is verified against
    #[arg(short, long)]
    keyring: Option<PathBuf>,

    /// GPG key id to sign imported commits with
    #[arg(short, long)]
    sign_key: Option<String>,

    /// Log progress
    #[arg(short, long)]
    verbose: bool,

    /// Log debug details
    #[arg(short, long)]
    debug: bool,
}

fn main() {
    let args = Args::parse();

    let level = if args.debug {
        LevelFilter::Debug
    } else if args.verbose {
        LevelFilter::Info
    } else {
        LevelFilter::Warn
    };
    env_logger::Builder::new().filter_level(level).init();

    let scratch = match tempfile::Builder::new().prefix("bundle-import-").tempdir() {
        Ok(scratch) => scratch,
        Err(e) => {
            error!("Failed to create scratch directory: {}", e);
            process::exit(1);
        }
    };

    let task = ImportTask {
        upload: args.bundle.clone(),
        repo_path: args.repo.clone(),
        opener: Arc::new(OstreeRepoOpener::default()),
        config: ImportConfig {
            gpg_homedir: args.gpg_homedir,
            keyring: args.keyring,
            sign_key: args.sign_key,
        },
        scratch_dir: scratch.path().to_path_buf(),
        lock_timeout: Some(DEFAULT_LOCK_TIMEOUT),
    };

    if let Err(e) = task.import(0) {
        error!("Failed to import {:?} into {:?}: {}", args.bundle, args.repo, e);
        process::exit(1);
    }
    info!("Imported {:?} into {:?}", args.bundle, args.repo);
}
