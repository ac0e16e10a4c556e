use log::{debug, error, info};
use std::fmt;
use std::path::Path;
use std::process::Command;

use crate::config::RemoteConfig;
use crate::ostree;

/// Forwards an exported bundle to a remote destination.
pub trait PushAdapter: Send + Sync + fmt::Display {
    /// Returns whether the remote accepted the bundle.
    fn push(&self, bundle: &Path) -> bool;
}

pub struct DummyPushAdapter {
    name: String,
}

impl fmt::Display for DummyPushAdapter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PushAdapter({})", self.name)
    }
}

impl PushAdapter for DummyPushAdapter {
    fn push(&self, bundle: &Path) -> bool {
        info!("Dummy push of {:?} to {}", bundle, self);
        true
    }
}

pub struct HttpPushAdapter {
    name: String,
    url: String,
    auth: Option<(String, String)>,
}

impl fmt::Display for HttpPushAdapter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PushAdapter({})", self.name)
    }
}

impl HttpPushAdapter {
    fn try_push(&self, bundle: &Path) -> Result<reqwest::StatusCode, Box<dyn std::error::Error>> {
        let form = reqwest::blocking::multipart::Form::new().file("file", bundle)?;
        let mut request = reqwest::blocking::Client::new()
            .post(&self.url)
            .multipart(form);
        if let Some((username, password)) = &self.auth {
            request = request.basic_auth(username, Some(password));
        }
        let response = request.send()?;
        let status = response.status();
        debug!(
            "Http push of {:?} response: {}",
            bundle,
            response.text().unwrap_or_default()
        );
        Ok(status)
    }
}

impl PushAdapter for HttpPushAdapter {
    fn push(&self, bundle: &Path) -> bool {
        debug!("Http push of {:?} to {}", bundle, self.url);
        match self.try_push(bundle) {
            Ok(status) if status == reqwest::StatusCode::OK => true,
            Ok(status) => {
                error!("Http push of {:?} to {} failed: {}", bundle, self.url, status);
                false
            }
            Err(e) => {
                error!("Http push of {:?} to {} failed: {}", bundle, self.url, e);
                false
            }
        }
    }
}

pub struct ScpPushAdapter {
    name: String,
    url: String,
}

impl fmt::Display for ScpPushAdapter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "PushAdapter({})", self.name)
    }
}

impl ScpPushAdapter {
    fn command(&self, bundle: &Path) -> Command {
        let mut cmd = Command::new("scp");
        cmd.arg("-B").arg("-q").arg(bundle).arg(&self.url);
        cmd
    }
}

impl PushAdapter for ScpPushAdapter {
    fn push(&self, bundle: &Path) -> bool {
        debug!("Scp push of {:?} to {}", bundle, self.url);
        match ostree::run_command(&mut self.command(bundle)) {
            Ok(_) => true,
            Err(e) => {
                error!("Scp push of {:?} to {} failed: {}", bundle, self.url, e);
                false
            }
        }
    }
}

pub fn new_push_adapter(name: &str, config: &RemoteConfig) -> Box<dyn PushAdapter> {
    let name = name.to_string();
    match config {
        RemoteConfig::Dummy => Box::new(DummyPushAdapter { name }),
        RemoteConfig::Http {
            url,
            username,
            password,
        } => Box::new(HttpPushAdapter {
            name,
            url: url.clone(),
            auth: match (username, password) {
                (Some(username), Some(password)) => Some((username.clone(), password.clone())),
                _ => None,
            },
        }),
        RemoteConfig::Scp { url } => Box::new(ScpPushAdapter {
            name,
            url: url.clone(),
        }),
    }
}
