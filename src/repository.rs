use log::{debug, info, warn};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::ffi::OsString;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Command;
use tempfile::{NamedTempFile, TempDir};

use crate::config::ImportConfig;
use crate::ostree::{self, MetadataValue, OstreeCommit, OstreeError, OstreeResult};

pub const COLLECTION_BINDING_KEY: &str = "ostree.collection-binding";
pub const REF_BINDING_KEY: &str = "ostree.ref-binding";

/// The repository operations the import, export and maintenance pipelines
/// need. Object storage, delta application and signature checks all live
/// behind this trait.
pub trait Repository: Send {
    fn path(&self) -> &Path;

    /// The commit `ref_name` points at, as visible to readers. Ref updates
    /// made inside an open transaction are not visible until it commits.
    fn resolve_ref(&self, ref_name: &str) -> OstreeResult<Option<String>>;

    /// Starts collecting objects and ref updates. Nothing written until the
    /// transaction ends reaches the repository unless it commits.
    fn begin_transaction(&mut self) -> OstreeResult<()>;
    fn set_ref(&mut self, ref_name: &str, checksum: &str) -> OstreeResult<()>;
    fn commit_transaction(&mut self) -> OstreeResult<()>;
    fn abort_transaction(&mut self) -> OstreeResult<()>;

    /// Must be called inside a transaction.
    fn apply_delta(&mut self, delta_file: &Path) -> OstreeResult<()>;
    /// Must be called inside a transaction.
    fn pull_ref_from_local_path(&mut self, src_repo: &Path, rev: &str) -> OstreeResult<()>;

    fn read_commit_metadata_file(&self, checksum: &str, rel_path: &str) -> OstreeResult<Vec<u8>>;

    /// Returns the number of valid signatures on the commit.
    fn verify_commit_signature(
        &self,
        checksum: &str,
        gpg_homedir: Option<&Path>,
        keyring: Option<&Path>,
    ) -> OstreeResult<u32>;

    /// Fails with `AlreadySigned` if the commit carries a signature by
    /// `key_id`. Must be called inside a transaction.
    fn sign_commit(
        &mut self,
        checksum: &str,
        key_id: &str,
        gpg_homedir: Option<&Path>,
    ) -> OstreeResult<()>;

    /// Writes a copy of `checksum` bound to `new_ref` and this repository's
    /// collection, parented on the current target of `new_ref`. All other
    /// commit metadata is kept. Returns the checksum of the new commit.
    /// Must be called inside a transaction.
    fn copy_commit_with_new_bindings(&mut self, checksum: &str, new_ref: &str)
        -> OstreeResult<String>;

    fn export_bundle(&self, ref_name: &str, dest: &Path) -> OstreeResult<()>;

    /// Regenerates the summary file.
    fn update_metadata(&self, config: &ImportConfig) -> OstreeResult<()>;

    /// Regenerates static deltas and the summary, and prunes unreachable objects.
    fn run_maintenance(&self, config: &ImportConfig) -> OstreeResult<()>;
}

pub trait RepoOpener: Send + Sync {
    fn exists(&self, path: &Path) -> bool;
    fn open(&self, path: &Path) -> OstreeResult<Box<dyn Repository>>;
    fn create(&self, path: &Path) -> OstreeResult<Box<dyn Repository>>;

    fn open_or_create(&self, path: &Path) -> OstreeResult<Box<dyn Repository>> {
        if self.exists(path) {
            self.open(path)
        } else {
            info!("Creating repository {:?}", path);
            self.create(path)
        }
    }
}

/// Runs `f` inside a repository transaction. The transaction is committed
/// if `f` succeeds and aborted otherwise, including when the commit itself
/// fails.
pub fn with_transaction<T, E, F>(repo: &mut dyn Repository, f: F) -> Result<T, E>
where
    F: FnOnce(&mut dyn Repository) -> Result<T, E>,
    E: From<OstreeError>,
{
    repo.begin_transaction()?;

    let res = f(&mut *repo).and_then(|v| repo.commit_transaction().map(|_| v).map_err(E::from));

    if res.is_err() {
        match repo.abort_transaction() {
            // A failed commit has already ended the transaction
            Ok(()) | Err(OstreeError::NoTransaction) => (),
            Err(e) => warn!("Failed to abort transaction in {:?}: {}", repo.path(), e),
        }
    }
    res
}

pub fn add_gpg_args(cmd: &mut Command, maybe_gpg_key: &Option<String>, maybe_gpg_homedir: &Option<PathBuf>) {
    if let Some(gpg_homedir) = maybe_gpg_homedir {
        cmd.arg(format!("--gpg-homedir={}", gpg_homedir.display()));
    };

    if let Some(key) = maybe_gpg_key {
        cmd.arg(format!("--gpg-sign={}", key));
    };
}

/// The metadata of a commit copied from `source` to `new_ref`.
///
/// Everything is carried over, except that the collection binding is set
/// to `collection_id` (or dropped without one) and `new_ref` is added to the
/// ref bindings.
pub fn rebind_metadata(
    metadata: &HashMap<String, MetadataValue>,
    source: &str,
    new_ref: &str,
    collection_id: Option<&str>,
) -> BTreeMap<String, MetadataValue> {
    let mut rebound: BTreeMap<String, MetadataValue> = metadata
        .iter()
        .map(|(key, value)| (key.clone(), value.clone()))
        .collect();

    match collection_id {
        Some(collection_id) => {
            rebound.insert(
                COLLECTION_BINDING_KEY.to_string(),
                MetadataValue::String(collection_id.to_string()),
            );
        }
        None => {
            rebound.remove(COLLECTION_BINDING_KEY);
        }
    }

    let mut ref_bindings: BTreeSet<String> = rebound
        .get(REF_BINDING_KEY)
        .and_then(|bindings| bindings.as_strings())
        .unwrap_or_default()
        .into_iter()
        .collect();
    ref_bindings.insert(new_ref.to_string());
    rebound.insert(
        REF_BINDING_KEY.to_string(),
        MetadataValue::Array(
            "s".to_string(),
            ref_bindings.into_iter().map(MetadataValue::String).collect(),
        ),
    );

    // xa.ref is deprecated but older flatpak clients still read it
    rebound.insert("xa.ref".to_string(), MetadataValue::String(new_ref.to_string()));
    rebound.insert(
        "xa.from_commit".to_string(),
        MetadataValue::String(source.to_string()),
    );
    rebound
}

fn metadata_args(metadata: &BTreeMap<String, MetadataValue>) -> Vec<String> {
    metadata
        .iter()
        .map(|(key, value)| match value {
            MetadataValue::String(s) => format!("--add-metadata-string={}={}", key, s),
            other => format!("--add-metadata={}={}", key, other.to_variant_text()),
        })
        .collect()
}

/// How one of the external tools is started.
#[derive(Debug, Clone)]
pub struct Tool {
    program: OsString,
    args: Vec<OsString>,
}

impl Tool {
    pub fn new(program: &str) -> Self {
        Tool {
            program: program.into(),
            args: Vec::new(),
        }
    }

    /// Runs a shell script in place of the tool.
    #[cfg(test)]
    pub fn script(script: &Path) -> Self {
        Tool {
            program: "sh".into(),
            args: vec![script.into()],
        }
    }

    fn command(&self) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd
    }
}

#[derive(Debug, Clone)]
pub struct Tools {
    pub ostree: Tool,
    pub flatpak: Tool,
}

impl Default for Tools {
    fn default() -> Self {
        Tools {
            ostree: Tool::new("ostree"),
            flatpak: Tool::new("flatpak"),
        }
    }
}

/// Where temporary repositories for open transactions are created, inside
/// the repository so objects can be moved without copying.
const STAGING_DIR: &str = "tmp/import-repos";

/// Creates an empty archive repository that finds the objects it lacks in
/// `parent_repo_path`.
fn init_staging_repo(repo_path: &Path, parent_repo_path: &Path) -> OstreeResult<()> {
    let parent_repo_absolute_path = fs::canonicalize(parent_repo_path)?;

    for &d in [
        "extensions",
        "objects",
        "refs/heads",
        "refs/mirrors",
        "refs/remotes",
        "state",
        "tmp/cache",
    ]
    .iter()
    {
        fs::create_dir_all(repo_path.join(d))?;
    }

    fs::write(
        repo_path.join("config"),
        format!(
            "[core]\nrepo_version=1\nmode=archive-z2\nparent={}\n",
            parent_repo_absolute_path.display()
        ),
    )?;
    Ok(())
}

struct Staging {
    repo: TempDir,
    refs: HashMap<String, String>,
}

/// Repository access through the `ostree` and `flatpak` command line tools.
///
/// A transaction stages everything in a temporary repository whose parent
/// is this one. Committing pulls the new ref targets from there and then
/// writes the refs, aborting just deletes the temporary repository.
pub struct OstreeRepository {
    path: PathBuf,
    tools: Tools,
    staging: Option<Staging>,
}

impl OstreeRepository {
    fn ostree_at(&self, repo_path: &Path, subcommand: &str) -> Command {
        let mut cmd = self.tools.ostree.command();
        cmd.arg(subcommand).arg(format!("--repo={}", repo_path.display()));
        cmd
    }

    fn ostree(&self, subcommand: &str) -> Command {
        self.ostree_at(&self.path, subcommand)
    }

    fn staging_path(&self) -> OstreeResult<&Path> {
        self.staging
            .as_ref()
            .map(|s| s.repo.path())
            .ok_or(OstreeError::NoTransaction)
    }

    /// The repository objects are read from, including staged ones.
    fn work_path(&self) -> &Path {
        self.staging_path().unwrap_or(self.path.as_path())
    }

    fn load_commit(&self, checksum: &str) -> OstreeResult<OstreeCommit> {
        match ostree::get_commit(self.work_path(), checksum) {
            Err(OstreeError::NoSuchCommit(_)) if self.staging.is_some() => {
                ostree::get_commit(&self.path, checksum)
            }
            res => res,
        }
    }

    /// The `core.collection-id` of the repository, if set.
    pub fn collection_id(&self) -> OstreeResult<Option<String>> {
        let mut cmd = self.ostree("config");
        cmd.arg("get").arg("core.collection-id");
        match ostree::run_command(&mut cmd) {
            Ok(output) => {
                let collection_id = String::from_utf8_lossy(&output.stdout).trim().to_string();
                Ok(Some(collection_id).filter(|id| !id.is_empty()))
            }
            Err(OstreeError::CommandFailed(_, stderr)) if stderr.contains("does not have key") => {
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    fn write_ref(&self, ref_name: &str, checksum: &str) -> OstreeResult<()> {
        let ref_path = self.path.join("refs/heads").join(ref_name);
        let ref_dir = ref_path
            .parent()
            .ok_or_else(|| OstreeError::InternalError(format!("Invalid ref {}", ref_name)))?;
        fs::create_dir_all(ref_dir)?;

        let tmp_dir = self.path.join("tmp");
        fs::create_dir_all(&tmp_dir)?;
        let mut tmp = NamedTempFile::new_in(&tmp_dir)?;
        writeln!(tmp, "{}", checksum)?;
        tmp.persist(&ref_path)
            .map_err(|e| OstreeError::InternalError(e.to_string()))?;
        Ok(())
    }

    /// Creates a temporary gpg home containing the configured keyrings, as
    /// ostree picks up every `*.gpg` file in the home it is given.
    fn trusted_keyring_dir(
        gpg_homedir: Option<&Path>,
        keyring: Option<&Path>,
    ) -> OstreeResult<TempDir> {
        let dir = tempfile::tempdir()?;
        if let Some(homedir) = gpg_homedir {
            for entry in fs::read_dir(homedir)? {
                let entry = entry?;
                let path = entry.path();
                if path.extension().map(|e| e == "gpg").unwrap_or(false) {
                    fs::copy(&path, dir.path().join(entry.file_name()))?;
                }
            }
        }
        if let Some(keyring) = keyring {
            fs::copy(keyring, dir.path().join("trusted.gpg"))?;
        }
        Ok(dir)
    }
}

impl Repository for OstreeRepository {
    fn path(&self) -> &Path {
        &self.path
    }

    fn resolve_ref(&self, ref_name: &str) -> OstreeResult<Option<String>> {
        match ostree::parse_ref(&self.path, ref_name) {
            Ok(commit) => Ok(Some(commit)),
            Err(OstreeError::NoSuchRef(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn begin_transaction(&mut self) -> OstreeResult<()> {
        if self.staging.is_some() {
            return Err(OstreeError::TransactionInProgress);
        }
        let staging_dir = self.path.join(STAGING_DIR);
        fs::create_dir_all(&staging_dir)?;
        let repo = tempfile::Builder::new()
            .prefix("repo-")
            .tempdir_in(&staging_dir)?;
        init_staging_repo(repo.path(), &self.path)?;
        debug!("Staging transaction for {:?} in {:?}", self.path, repo.path());

        self.staging = Some(Staging {
            repo,
            refs: HashMap::new(),
        });
        Ok(())
    }

    fn set_ref(&mut self, ref_name: &str, checksum: &str) -> OstreeResult<()> {
        self.staging
            .as_mut()
            .ok_or(OstreeError::NoTransaction)?
            .refs
            .insert(ref_name.to_string(), checksum.to_string());
        Ok(())
    }

    fn commit_transaction(&mut self) -> OstreeResult<()> {
        let staging = self.staging.take().ok_or(OstreeError::NoTransaction)?;

        let mut commits: Vec<&String> = staging.refs.values().collect();
        commits.sort();
        commits.dedup();
        if !commits.is_empty() {
            debug!("Pulling {:?} from {:?}", commits, staging.repo.path());
            let mut cmd = self.ostree("pull-local");
            cmd.arg(staging.repo.path()).args(commits);
            ostree::run_command(&mut cmd)?;
        }

        let mut refs: Vec<(&String, &String)> = staging.refs.iter().collect();
        refs.sort();
        for (ref_name, checksum) in refs {
            debug!("Setting ref {} to {}", ref_name, checksum);
            self.write_ref(ref_name, checksum)?;
        }

        if let Err(e) = staging.repo.close() {
            warn!("Failed to remove staging repository: {}", e);
        }
        Ok(())
    }

    fn abort_transaction(&mut self) -> OstreeResult<()> {
        let staging = self.staging.take().ok_or(OstreeError::NoTransaction)?;
        debug!("Discarding staged transaction for {:?}", self.path);
        staging.repo.close()?;
        Ok(())
    }

    fn apply_delta(&mut self, delta_file: &Path) -> OstreeResult<()> {
        let mut cmd = self.ostree_at(self.staging_path()?, "static-delta");
        cmd.arg("apply-offline").arg(delta_file);
        ostree::run_command(&mut cmd)?;
        Ok(())
    }

    fn pull_ref_from_local_path(&mut self, src_repo: &Path, rev: &str) -> OstreeResult<()> {
        let mut cmd = self.ostree_at(self.staging_path()?, "pull-local");
        cmd.arg("--untrusted").arg(src_repo).arg(rev);
        ostree::run_command(&mut cmd)?;
        Ok(())
    }

    fn read_commit_metadata_file(&self, checksum: &str, rel_path: &str) -> OstreeResult<Vec<u8>> {
        let mut cmd = self.ostree_at(self.work_path(), "cat");
        cmd.arg(checksum).arg(rel_path);
        Ok(ostree::run_command(&mut cmd)?.stdout)
    }

    fn verify_commit_signature(
        &self,
        checksum: &str,
        gpg_homedir: Option<&Path>,
        keyring: Option<&Path>,
    ) -> OstreeResult<u32> {
        let keyring_dir = OstreeRepository::trusted_keyring_dir(gpg_homedir, keyring)?;
        let mut cmd = self.ostree_at(self.work_path(), "show");
        cmd.arg(format!("--gpg-homedir={}", keyring_dir.path().display()))
            .arg(checksum);
        let output = ostree::run_command(&mut cmd)?;
        let valid = String::from_utf8_lossy(&output.stdout)
            .lines()
            .filter(|l| l.trim_start().starts_with("Good signature"))
            .count();
        Ok(valid as u32)
    }

    fn sign_commit(
        &mut self,
        checksum: &str,
        key_id: &str,
        gpg_homedir: Option<&Path>,
    ) -> OstreeResult<()> {
        let mut cmd = self.ostree_at(self.staging_path()?, "gpg-sign");
        if let Some(homedir) = gpg_homedir {
            cmd.arg(format!("--gpg-homedir={}", homedir.display()));
        }
        cmd.arg(checksum).arg(key_id);

        match ostree::run_command(&mut cmd) {
            Ok(_) => Ok(()),
            Err(OstreeError::CommandFailed(_, stderr)) if stderr.contains("already signed") => {
                Err(OstreeError::AlreadySigned(key_id.to_string()))
            }
            Err(e) => Err(e),
        }
    }

    fn copy_commit_with_new_bindings(
        &mut self,
        checksum: &str,
        new_ref: &str,
    ) -> OstreeResult<String> {
        let staging_path = self.staging_path()?.to_path_buf();
        let commit = self.load_commit(checksum)?;
        let collection_id = self.collection_id()?;
        let metadata = rebind_metadata(&commit.metadata, checksum, new_ref, collection_id.as_deref());

        let mut cmd = self.ostree_at(&staging_path, "commit");
        cmd.arg("--orphan")
            .arg("--no-bindings")
            .arg(format!("--tree=ref={}", checksum))
            .arg(format!("--subject={}", commit.subject))
            .arg(format!("--body={}", commit.body))
            .arg(format!("--timestamp=@{}", commit.timestamp));

        if let Some(parent) = self.resolve_ref(new_ref)? {
            debug!("Using {} as parent of the copy", parent);
            cmd.arg(format!("--parent={}", parent));
        }
        cmd.args(metadata_args(&metadata));

        let output = ostree::run_command(&mut cmd)?;
        let new_checksum = String::from_utf8_lossy(&output.stdout).trim().to_string();
        if !ostree::is_checksum(&new_checksum) {
            return Err(OstreeError::InternalError(format!(
                "Unexpected commit output: {}",
                new_checksum
            )));
        }
        Ok(new_checksum)
    }

    fn export_bundle(&self, ref_name: &str, dest: &Path) -> OstreeResult<()> {
        let mut cmd = self.tools.flatpak.command();
        cmd.arg("build-bundle");

        let parts: Vec<&str> = ref_name.split('/').collect();
        if parts.len() == 4 && (parts[0] == "app" || parts[0] == "runtime") {
            if parts[0] == "runtime" {
                cmd.arg("--runtime");
            }
            cmd.arg(format!("--arch={}", parts[2]))
                .arg(&self.path)
                .arg(dest)
                .arg(parts[1])
                .arg(parts[3]);
        } else {
            cmd.arg(&self.path).arg(dest).arg(ref_name);
        }

        ostree::run_command(&mut cmd)?;
        Ok(())
    }

    fn update_metadata(&self, config: &ImportConfig) -> OstreeResult<()> {
        let mut cmd = self.tools.flatpak.command();
        cmd.arg("build-update-repo");
        add_gpg_args(&mut cmd, &config.sign_key, &config.gpg_homedir);
        cmd.arg(&self.path);

        ostree::run_command(&mut cmd)?;
        Ok(())
    }

    fn run_maintenance(&self, config: &ImportConfig) -> OstreeResult<()> {
        let mut cmd = self.tools.flatpak.command();
        cmd.arg("build-update-repo")
            .arg("--generate-static-deltas")
            .arg("--prune");
        add_gpg_args(&mut cmd, &config.sign_key, &config.gpg_homedir);
        cmd.arg(&self.path);

        ostree::run_command(&mut cmd)?;
        Ok(())
    }
}

#[derive(Default)]
pub struct OstreeRepoOpener {
    tools: Tools,
}

impl OstreeRepoOpener {
    #[cfg(test)]
    pub fn with_tools(tools: Tools) -> Self {
        OstreeRepoOpener { tools }
    }

    fn open_repo(&self, path: &Path) -> OstreeResult<OstreeRepository> {
        if !self.exists(path) {
            return Err(OstreeError::NoSuchRepo(path.to_path_buf()));
        }
        Ok(OstreeRepository {
            path: path.to_path_buf(),
            tools: self.tools.clone(),
            staging: None,
        })
    }
}

impl RepoOpener for OstreeRepoOpener {
    fn exists(&self, path: &Path) -> bool {
        path.join("config").is_file() && path.join("objects").is_dir()
    }

    fn open(&self, path: &Path) -> OstreeResult<Box<dyn Repository>> {
        Ok(Box::new(self.open_repo(path)?))
    }

    fn create(&self, path: &Path) -> OstreeResult<Box<dyn Repository>> {
        fs::create_dir_all(path)?;
        let mut cmd = self.tools.ostree.command();
        cmd.arg("init")
            .arg(format!("--repo={}", path.display()))
            .arg("--mode=archive-z2");
        ostree::run_command(&mut cmd)?;
        self.open(path)
    }
}
