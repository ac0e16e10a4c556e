use log::{debug, warn};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use crate::errors::{JobError, JobResult};
use crate::push_adapters::PushAdapter;
use crate::repolock::RepoLock;
use crate::repository::RepoOpener;

use super::task::{TaskId, TaskKind, TaskRunner};

/// Exports a ref from a repository as a single-file bundle and pushes it
/// to a remote.
pub struct ExportTask {
    pub ref_name: String,
    pub repo_path: PathBuf,
    pub opener: Arc<dyn RepoOpener>,
    pub adapter: Arc<dyn PushAdapter>,
    /// The bundle is written to a temporary file in here.
    pub scratch_dir: PathBuf,
    pub lock_timeout: Option<Duration>,
}

impl TaskRunner for ExportTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Export
    }

    fn run(&self, task_id: TaskId) -> JobResult<()> {
        task_log_and_info!(task_id, "Pushing {} to {}", self.ref_name, self.adapter);

        // Removed when dropped, on every path out of here
        let scratch = tempfile::Builder::new()
            .prefix("export-")
            .suffix(".flatpak")
            .tempfile_in(&self.scratch_dir)?;

        {
            let repo = self.opener.open(&self.repo_path)?;
            let _lock = RepoLock::shared(repo.path(), self.lock_timeout)?;
            repo.export_bundle(&self.ref_name, scratch.path())?;
        }
        task_log_and_info!(
            task_id,
            "Extracted {} as {:?}",
            self.ref_name,
            scratch.path()
        );

        if !self.adapter.push(scratch.path()) {
            return Err(JobError::ExternalToolFailure(format!(
                "Failed to push {} to {}",
                self.ref_name, self.adapter
            )));
        }
        debug!("#{}: Pushed {:?}", task_id, scratch.path());

        if let Err(e) = scratch.close() {
            warn!("#{}: Failed to remove export bundle: {}", task_id, e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::push_adapters::new_push_adapter;
    use crate::config::RemoteConfig;
    use crate::testutil::{test_checksum, FailPoint, MemoryOpener};
    use std::fmt;
    use std::fs;
    use std::path::Path;
    use std::sync::Mutex;

    const REF: &str = "app/org.test.Hello/x86_64/stable";

    /// Records what it was asked to push, then answers with `result`.
    struct RecordingAdapter {
        result: bool,
        pushed: Mutex<Vec<(PathBuf, String)>>,
    }

    impl fmt::Display for RecordingAdapter {
        fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
            write!(f, "PushAdapter(recording)")
        }
    }

    impl PushAdapter for RecordingAdapter {
        fn push(&self, bundle: &Path) -> bool {
            let contents = fs::read_to_string(bundle).unwrap();
            self.pushed
                .lock()
                .unwrap()
                .push((bundle.to_path_buf(), contents));
            self.result
        }
    }

    fn setup() -> (tempfile::TempDir, PathBuf, PathBuf, MemoryOpener) {
        let dir = tempfile::tempdir().unwrap();
        let repo_path = dir.path().join("repo");
        let scratch_dir = dir.path().join("scratch");
        fs::create_dir_all(&scratch_dir).unwrap();
        let opener = MemoryOpener::new();
        opener.set_ref(&repo_path, REF, &test_checksum(1));
        (dir, repo_path, scratch_dir, opener)
    }

    fn export_task(
        repo_path: &Path,
        scratch_dir: &Path,
        opener: &MemoryOpener,
        adapter: Arc<dyn PushAdapter>,
    ) -> ExportTask {
        ExportTask {
            ref_name: REF.to_string(),
            repo_path: repo_path.to_path_buf(),
            opener: Arc::new(opener.clone()),
            adapter,
            scratch_dir: scratch_dir.to_path_buf(),
            lock_timeout: Some(Duration::from_secs(5)),
        }
    }

    fn scratch_is_empty(scratch_dir: &Path) -> bool {
        fs::read_dir(scratch_dir).unwrap().next().is_none()
    }

    #[test]
    fn test_export_with_dummy_adapter() {
        let (_dir, repo_path, scratch_dir, opener) = setup();
        let adapter: Arc<dyn PushAdapter> = Arc::from(new_push_adapter("null", &RemoteConfig::Dummy));
        let task = export_task(&repo_path, &scratch_dir, &opener, adapter);

        task.run(1).unwrap();
        assert_eq!(opener.state(&repo_path).exports, 1);
        assert!(scratch_is_empty(&scratch_dir));
    }

    #[test]
    fn test_export_pushes_bundle() {
        let (_dir, repo_path, scratch_dir, opener) = setup();
        let adapter = Arc::new(RecordingAdapter {
            result: true,
            pushed: Mutex::new(Vec::new()),
        });
        let task = export_task(&repo_path, &scratch_dir, &opener, adapter.clone());

        task.run(2).unwrap();

        let pushed = adapter.pushed.lock().unwrap();
        assert_eq!(pushed.len(), 1);
        assert!(pushed[0].0.starts_with(&scratch_dir));
        assert_eq!(
            pushed[0].1,
            format!("bundle of {} at {}", REF, test_checksum(1))
        );
        assert!(scratch_is_empty(&scratch_dir));
    }

    #[test]
    fn test_failed_push_removes_bundle() {
        let (_dir, repo_path, scratch_dir, opener) = setup();
        let adapter = Arc::new(RecordingAdapter {
            result: false,
            pushed: Mutex::new(Vec::new()),
        });
        let task = export_task(&repo_path, &scratch_dir, &opener, adapter.clone());

        let res = task.run(3);
        assert!(matches!(res, Err(JobError::ExternalToolFailure(_))));
        assert_eq!(adapter.pushed.lock().unwrap().len(), 1);
        assert!(scratch_is_empty(&scratch_dir));
    }

    #[test]
    fn test_failed_extraction() {
        let (_dir, repo_path, scratch_dir, opener) = setup();
        opener.fail_at(FailPoint::Export);
        let adapter = Arc::new(RecordingAdapter {
            result: true,
            pushed: Mutex::new(Vec::new()),
        });
        let task = export_task(&repo_path, &scratch_dir, &opener, adapter.clone());

        assert!(task.run(4).is_err());
        assert!(adapter.pushed.lock().unwrap().is_empty());
        assert!(scratch_is_empty(&scratch_dir));

        opener.clear_failpoints();
        let mut task = export_task(&repo_path, &scratch_dir, &opener, adapter.clone());
        task.ref_name = "app/org.test.Missing/x86_64/stable".to_string();
        assert!(task.run(5).is_err());
        assert!(scratch_is_empty(&scratch_dir));
    }
}
