use serde::Deserialize;
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::errors::ApiError;

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct RepoConfig {
    #[serde(skip)]
    pub name: String,
    pub path: PathBuf,
}

/// Where exported bundles get pushed to. The `type` key selects the adapter.
#[derive(Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "kebab-case", deny_unknown_fields)]
pub enum RemoteConfig {
    Dummy,
    Http {
        url: String,
        username: Option<String>,
        password: Option<String>,
    },
    Scp {
        url: String,
    },
}

/// The signing and trust settings every import runs with.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ImportConfig {
    pub gpg_homedir: Option<PathBuf>,
    pub keyring: Option<PathBuf>,
    pub sign_key: Option<String>,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    5000
}

fn default_workers() -> usize {
    4
}

fn default_upload_dir() -> PathBuf {
    PathBuf::from("/var/tmp")
}

fn default_true() -> bool {
    true
}

fn default_quiet_secs() -> u64 {
    10
}

fn default_poll_secs() -> u64 {
    5
}

/// How long an import or maintenance pass waits for a repository lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

fn default_lock_timeout_secs() -> u64 {
    DEFAULT_LOCK_TIMEOUT.as_secs()
}

#[derive(Deserialize, Debug, Clone)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_upload_dir")]
    pub upload_dir: PathBuf,
    pub gpg_homedir: Option<PathBuf>,
    pub keyring: Option<PathBuf>,
    pub sign_key: Option<String>,
    #[serde(default = "default_true")]
    pub maintenance: bool,
    #[serde(default = "default_quiet_secs")]
    pub maintenance_quiet_secs: u64,
    #[serde(default = "default_poll_secs")]
    pub maintenance_poll_secs: u64,
    #[serde(default = "default_lock_timeout_secs")]
    pub lock_timeout_secs: u64,
    pub repos: HashMap<String, RepoConfig>,
    #[serde(default)]
    pub remotes: HashMap<String, RemoteConfig>,
}

impl Config {
    pub fn get_repoconfig(&self, name: &str) -> Result<&RepoConfig, ApiError> {
        self.repos
            .get(name)
            .ok_or_else(|| ApiError::BadRequest(format!("Repository {} is not configured", name)))
    }

    /// The repository exports come from when the request doesn't name one.
    pub fn default_repoconfig(&self) -> Result<&RepoConfig, ApiError> {
        let mut repos = self.repos.values();
        match (repos.next(), repos.next()) {
            (Some(repoconfig), None) => Ok(repoconfig),
            _ => Err(ApiError::BadRequest("repo argument required".to_string())),
        }
    }

    pub fn get_remote(&self, name: &str) -> Result<&RemoteConfig, ApiError> {
        self.remotes
            .get(name)
            .ok_or_else(|| ApiError::BadRequest("Remote is not in the whitelist".to_string()))
    }

    pub fn import_config(&self) -> ImportConfig {
        ImportConfig {
            gpg_homedir: self.gpg_homedir.clone(),
            keyring: self.keyring.clone(),
            sign_key: self.sign_key.clone(),
        }
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_secs(self.lock_timeout_secs)
    }

    pub fn maintenance_quiet_period(&self) -> Duration {
        Duration::from_secs(self.maintenance_quiet_secs)
    }

    pub fn maintenance_poll_interval(&self) -> Duration {
        Duration::from_secs(self.maintenance_poll_secs)
    }
}

pub fn parse_config(data: &str) -> io::Result<Config> {
    let mut config: Config = serde_json::from_str(data)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;

    if config.repos.is_empty() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "No repositories configured",
        ));
    }

    if config.workers == 0 {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "At least one worker is required",
        ));
    }

    for (name, repoconfig) in config.repos.iter_mut() {
        repoconfig.name = name.clone();
    }

    Ok(config)
}

pub fn load_config(path: &Path) -> io::Result<Config> {
    let config_contents = fs::read_to_string(path)?;
    parse_config(&config_contents)
}
