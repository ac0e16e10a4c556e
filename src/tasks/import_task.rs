use log::{debug, info, warn};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

use crate::bundle::{self, BundleKind};
use crate::config::ImportConfig;
use crate::errors::{JobError, JobResult};
use crate::ostree::{self, DeltaHeader, OstreeError};
use crate::repolock::RepoLock;
use crate::repository::{with_transaction, RepoOpener, Repository};

use super::task::{TaskId, TaskKind, TaskRunner};

/// Where the commit of an uploaded bundle comes from.
enum BundleImport {
    /// A flatpak bundle, applied as an offline static delta.
    Delta { path: PathBuf, header: DeltaHeader },
    /// A tar archive of a repository holding a single ref, pulled from
    /// where it was extracted.
    Archive {
        _extracted: TempDir,
        repo_path: PathBuf,
        ref_name: String,
        commit: String,
    },
}

impl BundleImport {
    fn open(upload: &Path, scratch_dir: &Path) -> JobResult<BundleImport> {
        let kind = bundle::detect(upload)?;
        match kind {
            BundleKind::Delta => {
                let header = ostree::read_delta_superblock(upload)
                    .map_err(|e| JobError::UnrecognizedBundle(e.to_string()))?;
                Ok(BundleImport::Delta {
                    path: upload.to_path_buf(),
                    header,
                })
            }
            BundleKind::Tar | BundleKind::TarGz => {
                let extracted = tempfile::Builder::new()
                    .prefix("import-")
                    .tempdir_in(scratch_dir)?;
                bundle::extract_archive(upload, kind, extracted.path())?;

                let repo_path = ostree::find_repo(extracted.path())
                    .map_err(|e| JobError::UnrecognizedBundle(e.to_string()))?;
                let mut refs = ostree::list_refs(&repo_path, "");
                debug!("Refs in archive: {:?}", refs);
                let ref_name = match refs.len() {
                    0 => {
                        return Err(JobError::UnrecognizedBundle(
                            "Missing refs in archive repository".to_string(),
                        ))
                    }
                    1 => refs.remove(0),
                    _ => {
                        refs.sort();
                        return Err(JobError::UnrecognizedBundle(format!(
                            "Multiple refs ({}) found in archive",
                            refs.join(", ")
                        )));
                    }
                };
                let commit = ostree::parse_ref(&repo_path, &ref_name)?;

                Ok(BundleImport::Archive {
                    _extracted: extracted,
                    repo_path,
                    ref_name,
                    commit,
                })
            }
        }
    }

    fn ref_name(&self) -> &str {
        match self {
            BundleImport::Delta { header, .. } => &header.ref_name,
            BundleImport::Archive { ref_name, .. } => ref_name,
        }
    }

    fn commit(&self) -> &str {
        match self {
            BundleImport::Delta { header, .. } => &header.commit,
            BundleImport::Archive { commit, .. } => commit,
        }
    }

    /// Brings the bundle commit into `repo`. Must run inside a transaction.
    fn import_commit(&self, repo: &mut dyn Repository) -> JobResult<()> {
        match self {
            BundleImport::Delta { path, .. } => repo.apply_delta(path)?,
            BundleImport::Archive {
                repo_path, commit, ..
            } => repo.pull_ref_from_local_path(repo_path, commit)?,
        }
        Ok(())
    }

    /// Checks the commit carries the application metadata its header
    /// declared. Archives have no header, so there is nothing to compare.
    fn verify_metadata(&self, repo: &dyn Repository) -> JobResult<()> {
        if let BundleImport::Delta { header, .. } = self {
            let committed = repo.read_commit_metadata_file(&header.commit, "/metadata")?;
            if committed != header.app_metadata().as_bytes() {
                return Err(JobError::MetadataMismatch(format!(
                    "commit {} does not match the bundle header",
                    header.commit
                )));
            }
            debug!("Committed metadata matches the bundle header");
        }
        Ok(())
    }
}

/// Imports an uploaded bundle into a repository.
///
/// The uploaded file is owned by the task and is deleted once the task has
/// run, whatever the outcome.
pub struct ImportTask {
    pub upload: PathBuf,
    pub repo_path: PathBuf,
    pub opener: Arc<dyn RepoOpener>,
    pub config: ImportConfig,
    /// Archives are extracted below this directory.
    pub scratch_dir: PathBuf,
    pub lock_timeout: Option<Duration>,
}

impl ImportTask {
    /// Imports the bundle, leaving the uploaded file in place.
    pub fn import(&self, task_id: TaskId) -> JobResult<()> {
        let mut repo = self.opener.open_or_create(&self.repo_path)?;
        let bundle = BundleImport::open(&self.upload, &self.scratch_dir)?;
        let ref_name = bundle.ref_name().to_string();
        let commit = bundle.commit().to_string();

        let _lock = RepoLock::shared(repo.path(), self.lock_timeout)?;
        task_log_and_info!(
            task_id,
            "Importing {} ({}) into {:?}",
            ref_name,
            commit,
            repo.path()
        );

        let current = repo.resolve_ref(&ref_name)?;
        debug!("#{}: Current {} commit: {:?}", task_id, ref_name, current);
        if current.as_deref() == Some(commit.as_str()) {
            task_log_and_info!(
                task_id,
                "Ref {} already at commit {}, skipping",
                ref_name,
                commit
            );
            return Ok(());
        }

        let new_commit = with_transaction(repo.as_mut(), |repo| {
            self.apply_commit(task_id, &bundle, repo)
        })?;
        task_log_and_info!(task_id, "Ref {} now at {}", ref_name, new_commit);

        info!("#{}: Updating repository metadata", task_id);
        if let Err(e) = repo.update_metadata(&self.config) {
            task_log_and_error!(task_id, "Failed to update repository metadata: {}", e);
        }

        Ok(())
    }

    fn apply_commit(
        &self,
        task_id: TaskId,
        bundle: &BundleImport,
        repo: &mut dyn Repository,
    ) -> JobResult<String> {
        let ref_name = bundle.ref_name();
        let commit = bundle.commit();

        bundle.import_commit(repo)?;

        let valid = repo.verify_commit_signature(
            commit,
            self.config.gpg_homedir.as_deref(),
            self.config.keyring.as_deref(),
        )?;
        if valid == 0 {
            return Err(JobError::SignatureInvalid(format!(
                "no valid signature on commit {}",
                commit
            )));
        }
        debug!("#{}: Found {} valid signatures", task_id, valid);

        bundle.verify_metadata(repo)?;

        let new_commit = repo.copy_commit_with_new_bindings(commit, ref_name)?;
        debug!("#{}: Copied {} to {}", task_id, commit, new_commit);

        if let Some(key) = &self.config.sign_key {
            info!("#{}: Signing {} with key {}", task_id, new_commit, key);
            match repo.sign_commit(&new_commit, key, self.config.gpg_homedir.as_deref()) {
                Ok(()) => (),
                Err(OstreeError::AlreadySigned(_)) => {
                    debug!("#{}: Already signed with key {}", task_id, key)
                }
                Err(e) => return Err(e.into()),
            }
        }

        repo.set_ref(ref_name, &new_commit)?;
        Ok(new_commit)
    }
}

impl TaskRunner for ImportTask {
    fn kind(&self) -> TaskKind {
        TaskKind::Import
    }

    fn run(&self, task_id: TaskId) -> JobResult<()> {
        let res = self.import(task_id);
        if let Err(e) = fs::remove_file(&self.upload) {
            warn!("#{}: Failed to remove upload {:?}: {}", task_id, self.upload, e);
        }
        res
    }
}
