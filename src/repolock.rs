use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crate::errors::{JobError, JobResult};

pub const LOCK_FILE: &str = ".eoslock";
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(30 * 60);

const POLL_INTERVAL: Duration = Duration::from_secs(1);
const REPORT_INTERVAL: Duration = Duration::from_secs(30);

/// An advisory lock on a repository, held until dropped.
///
/// The lock is an `flock` on a file inside the repository, so it also
/// excludes other processes using the same convention. Any number of shared
/// holders can coexist, an exclusive holder excludes everyone else.
#[derive(Debug)]
pub struct RepoLock {
    file: File,
    path: PathBuf,
    exclusive: bool,
}

fn try_flock(file: &File, exclusive: bool) -> io::Result<bool> {
    let operation = if exclusive {
        libc::LOCK_EX
    } else {
        libc::LOCK_SH
    };
    let res = unsafe { libc::flock(file.as_raw_fd(), operation | libc::LOCK_NB) };
    if res == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    match err.raw_os_error() {
        Some(libc::EWOULDBLOCK) | Some(libc::EINTR) => Ok(false),
        _ => Err(err),
    }
}

impl RepoLock {
    /// Waits for the lock for at most `timeout`, or forever if `None`.
    pub fn acquire(repo_path: &Path, exclusive: bool, timeout: Option<Duration>) -> JobResult<RepoLock> {
        let path = repo_path.join(LOCK_FILE);
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let kind = if exclusive { "exclusive" } else { "shared" };
        let start = Instant::now();
        let mut last_report = start;

        loop {
            if try_flock(&file, exclusive)? {
                debug!("Took {} lock on {:?}", kind, repo_path);
                return Ok(RepoLock {
                    file,
                    path,
                    exclusive,
                });
            }

            let waited = start.elapsed();
            if let Some(timeout) = timeout {
                if waited >= timeout {
                    return Err(JobError::LockTimeout {
                        path: repo_path.to_path_buf(),
                        timeout_secs: timeout.as_secs(),
                    });
                }
            }

            if last_report.elapsed() >= REPORT_INTERVAL {
                last_report = Instant::now();
                match timeout {
                    Some(timeout) => debug!(
                        "Waiting for {} lock on {:?}, {}s remaining",
                        kind,
                        repo_path,
                        timeout.saturating_sub(waited).as_secs()
                    ),
                    None => debug!("Waiting for {} lock on {:?}", kind, repo_path),
                }
            }

            let sleep = match timeout {
                Some(timeout) => POLL_INTERVAL.min(timeout.saturating_sub(waited)),
                None => POLL_INTERVAL,
            };
            thread::sleep(sleep);
        }
    }

    pub fn shared(repo_path: &Path, timeout: Option<Duration>) -> JobResult<RepoLock> {
        RepoLock::acquire(repo_path, false, timeout)
    }

    pub fn exclusive(repo_path: &Path, timeout: Option<Duration>) -> JobResult<RepoLock> {
        RepoLock::acquire(repo_path, true, timeout)
    }

    #[cfg(test)]
    pub fn is_exclusive(&self) -> bool {
        self.exclusive
    }
}

impl Drop for RepoLock {
    fn drop(&mut self) {
        let res = unsafe { libc::flock(self.file.as_raw_fd(), libc::LOCK_UN) };
        if res != 0 {
            warn!(
                "Failed to unlock {:?}: {}",
                self.path,
                io::Error::last_os_error()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc;

    #[test]
    fn test_shared_locks_coexist() {
        let dir = tempfile::tempdir().unwrap();
        let locks: Vec<RepoLock> = (0..5)
            .map(|_| RepoLock::shared(dir.path(), Some(Duration::from_secs(1))).unwrap())
            .collect();
        assert!(locks.iter().all(|l| !l.is_exclusive()));
        assert!(dir.path().join(LOCK_FILE).exists());

        match RepoLock::exclusive(dir.path(), Some(Duration::from_secs(1))) {
            Err(JobError::LockTimeout { path, timeout_secs }) => {
                assert_eq!(path, dir.path());
                assert_eq!(timeout_secs, 1);
            }
            res => panic!("Unexpected result {:?}", res),
        }

        drop(locks);
        assert!(RepoLock::exclusive(dir.path(), Some(Duration::from_secs(1))).is_ok());
    }

    #[test]
    fn test_exclusive_blocks_everyone() {
        let dir = tempfile::tempdir().unwrap();
        let lock = RepoLock::exclusive(dir.path(), None).unwrap();

        assert!(RepoLock::shared(dir.path(), Some(Duration::from_secs(1))).is_err());
        assert!(RepoLock::exclusive(dir.path(), Some(Duration::from_secs(1))).is_err());

        drop(lock);
        let _shared = RepoLock::shared(dir.path(), Some(Duration::from_secs(1))).unwrap();
    }

    #[test]
    fn test_exclusive_waits_for_shared_holders() {
        let dir = tempfile::tempdir().unwrap();
        let repo_path = dir.path().to_path_buf();
        let shared = RepoLock::shared(&repo_path, None).unwrap();

        let (tx, rx) = mpsc::channel();
        let waiter = thread::spawn(move || {
            let lock = RepoLock::exclusive(&repo_path, Some(Duration::from_secs(10)));
            tx.send(Instant::now()).unwrap();
            lock.map(|l| l.is_exclusive())
        });

        thread::sleep(Duration::from_millis(1500));
        assert!(rx.try_recv().is_err());
        let released = Instant::now();
        drop(shared);

        let acquired = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(acquired >= released);
        assert_eq!(waiter.join().unwrap(), Ok(true));
    }
}
