use std::collections::hash_map::DefaultHasher;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::config::ImportConfig;
use crate::ostree::{self, MetadataValue, OstreeError, OstreeResult};
use crate::repository::{RepoOpener, Repository};

/* Minimal GVariant serializer, enough to produce the headers the parsers in
 * ostree.rs read. Containers are built relative to their own start and are
 * always placed at 8 byte aligned offsets by their parent. */

fn align(data: &mut Vec<u8>, alignment: usize) {
    while alignment > 1 && data.len() % alignment != 0 {
        data.push(0);
    }
}

fn append_framing(mut body: Vec<u8>, offsets: &[usize]) -> Vec<u8> {
    if offsets.is_empty() {
        return body;
    }
    let size = [1usize, 2, 4, 8]
        .iter()
        .copied()
        .find(|size| {
            let total = (body.len() + offsets.len() * size) as u64;
            *size == 8 || total < (1u64 << (8 * size))
        })
        .unwrap_or(8);
    for offset in offsets {
        body.extend_from_slice(&(*offset as u64).to_le_bytes()[..size]);
    }
    body
}

pub struct Field {
    data: Vec<u8>,
    alignment: usize,
    variable: bool,
}

impl Field {
    pub fn variable(data: Vec<u8>, alignment: usize) -> Self {
        Field {
            data,
            alignment,
            variable: true,
        }
    }

    pub fn fixed(data: Vec<u8>, alignment: usize) -> Self {
        Field {
            data,
            alignment,
            variable: false,
        }
    }
}

pub fn tuple(fields: Vec<Field>) -> Vec<u8> {
    let mut body = Vec::new();
    let mut offsets = Vec::new();
    let n_fields = fields.len();
    for (i, field) in fields.into_iter().enumerate() {
        align(&mut body, field.alignment);
        body.extend_from_slice(&field.data);
        if field.variable && i != n_fields - 1 {
            offsets.push(body.len());
        }
    }
    offsets.reverse();
    append_framing(body, &offsets)
}

pub fn variable_array(elements: Vec<Vec<u8>>, alignment: usize) -> Vec<u8> {
    let mut body = Vec::new();
    let mut offsets = Vec::new();
    for element in elements {
        align(&mut body, alignment);
        body.extend_from_slice(&element);
        offsets.push(body.len());
    }
    append_framing(body, &offsets)
}

pub fn string(s: &str) -> Vec<u8> {
    let mut data = s.as_bytes().to_vec();
    data.push(0);
    data
}

fn field(value: &MetadataValue) -> Field {
    let (alignment, size) = ostree::type_info(&value.type_string()).unwrap();
    match size {
        Some(_) => Field::fixed(serialize(value), alignment),
        None => Field::variable(serialize(value), alignment),
    }
}

/// Serializes a value of any type in native byte order.
pub fn serialize(value: &MetadataValue) -> Vec<u8> {
    match value {
        MetadataValue::Bool(v) => vec![*v as u8],
        MetadataValue::Byte(v) => vec![*v],
        MetadataValue::Int16(v) => v.to_ne_bytes().to_vec(),
        MetadataValue::Uint16(v) => v.to_ne_bytes().to_vec(),
        MetadataValue::Int32(v) | MetadataValue::Handle(v) => v.to_ne_bytes().to_vec(),
        MetadataValue::Uint32(v) => v.to_ne_bytes().to_vec(),
        MetadataValue::Int64(v) => v.to_ne_bytes().to_vec(),
        MetadataValue::Uint64(v) => v.to_ne_bytes().to_vec(),
        MetadataValue::Double(v) => v.to_ne_bytes().to_vec(),
        MetadataValue::String(s) | MetadataValue::ObjectPath(s) | MetadataValue::Signature(s) => {
            string(s)
        }
        MetadataValue::Variant(inner) => variant(inner),
        MetadataValue::Maybe(_, None) => Vec::new(),
        MetadataValue::Maybe(element, Some(inner)) => {
            let mut data = serialize(inner);
            if ostree::type_info(element).unwrap().1.is_none() {
                data.push(0);
            }
            data
        }
        MetadataValue::Array(element, elements) => {
            let (alignment, size) = ostree::type_info(element).unwrap();
            let children: Vec<Vec<u8>> = elements.iter().map(serialize).collect();
            match size {
                Some(_) => children.concat(),
                None => variable_array(children, alignment),
            }
        }
        MetadataValue::Tuple(members) => {
            let mut data = tuple(members.iter().map(field).collect());
            if let Some(size) = ostree::type_info(&value.type_string()).unwrap().1 {
                data.resize(size, 0);
            }
            data
        }
        MetadataValue::DictEntry(key, value) => tuple(vec![field(key), field(value)]),
    }
}

pub fn variant(value: &MetadataValue) -> Vec<u8> {
    let mut data = serialize(value);
    data.push(0);
    data.extend_from_slice(value.type_string().as_bytes());
    data
}

pub fn metadata_dict(entries: &[(&str, MetadataValue)]) -> Vec<u8> {
    variable_array(
        entries
            .iter()
            .map(|(key, value)| {
                tuple(vec![
                    Field::variable(string(key), 1),
                    Field::variable(variant(value), 8),
                ])
            })
            .collect(),
        8,
    )
}

pub fn string_dict(entries: &[(&str, &str)]) -> Vec<u8> {
    let entries: Vec<(&str, MetadataValue)> = entries
        .iter()
        .map(|(k, v)| (*k, MetadataValue::String(v.to_string())))
        .collect();
    metadata_dict(&entries)
}

/// Serializes an ostree commit object `(a{sv}aya(say)sstayay)`.
pub fn build_commit(
    metadata: &[(&str, MetadataValue)],
    parent: Option<&str>,
    subject: &str,
    body: &str,
    timestamp: u64,
) -> Vec<u8> {
    let parent = parent
        .map(|p| hex::decode(p).unwrap())
        .unwrap_or_default();
    tuple(vec![
        Field::variable(metadata_dict(metadata), 8),
        Field::variable(parent, 1),
        Field::variable(Vec::new(), 1),
        Field::variable(string(subject), 1),
        Field::variable(string(body), 1),
        Field::fixed(timestamp.to_be_bytes().to_vec(), 8),
        Field::variable(vec![0x11; 32], 1),
        Field::variable(vec![0x22; 32], 1),
    ])
}

/// Serializes a static delta superblock, which is also the on-disk format
/// of a flatpak single-file bundle.
pub fn build_delta_superblock(commit: &str, metadata: &[(&str, &str)]) -> Vec<u8> {
    tuple(vec![
        Field::variable(string_dict(metadata), 8),
        Field::fixed(1_500_000_000u64.to_be_bytes().to_vec(), 8),
        Field::variable(Vec::new(), 1),
        Field::variable(hex::decode(commit).unwrap(), 1),
        Field::variable(build_commit(&[], None, "Test commit", "", 1_500_000_000), 8),
        Field::variable(Vec::new(), 1),
        Field::variable(Vec::new(), 8),
        Field::variable(Vec::new(), 8),
    ])
}

/// Writes a bundle for `commit` declaring `ref_name` and `app_metadata`.
pub fn write_bundle(dir: &Path, name: &str, ref_name: &str, commit: &str, app_metadata: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(
        &path,
        build_delta_superblock(commit, &[("ref", ref_name), ("metadata", app_metadata)]),
    )
    .unwrap();
    path
}

pub fn test_checksum(n: u64) -> String {
    format!("{:064x}", n)
}

/// Operations of `MemoryRepository` that can be made to fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailPoint {
    ApplyDelta,
    Pull,
    ReadMetadata,
    Verify,
    CopyCommit,
    Sign,
    SetRef,
    Commit,
    Export,
    UpdateMetadata,
    Maintenance,
}

/// A commit a bundle can deliver, with its signing keys and the contents of
/// its `/metadata` file.
#[derive(Debug, Clone, Default)]
pub struct AvailableCommit {
    pub app_metadata: String,
    pub signed_by: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct RepoState {
    pub refs: HashMap<String, String>,
    pub objects: HashSet<String>,
    pub signatures: HashMap<String, Vec<String>>,
    pub bindings: HashMap<String, (String, String)>,
    pub metadata_updates: usize,
    pub maintenance_runs: usize,
    pub exports: usize,
}

#[derive(Default)]
pub struct MemoryStore {
    pub repos: HashMap<PathBuf, RepoState>,
    pub available: HashMap<String, AvailableCommit>,
    pub failpoints: HashSet<FailPoint>,
}

impl MemoryStore {
    fn check(&self, failpoint: FailPoint) -> OstreeResult<()> {
        if self.failpoints.contains(&failpoint) {
            Err(OstreeError::InternalError(format!(
                "Injected failure at {:?}",
                failpoint
            )))
        } else {
            Ok(())
        }
    }
}

/// An open transaction: a copy of the repository state that objects are
/// written to, and the ref updates to apply when it commits.
struct Staged {
    state: RepoState,
    refs: HashMap<String, String>,
}

/// Repository collaborator keeping all state in memory, shared between
/// every handle opened from the same `MemoryOpener`.
pub struct MemoryRepository {
    path: PathBuf,
    store: Arc<Mutex<MemoryStore>>,
    staged: Option<Staged>,
}

impl MemoryRepository {
    /// Runs `f` on the committed state of the repository.
    fn with_state<T>(&self, f: impl FnOnce(&mut MemoryStore, &mut RepoState) -> OstreeResult<T>) -> OstreeResult<T> {
        let mut store = self.store.lock().unwrap();
        let mut state = store
            .repos
            .remove(&self.path)
            .ok_or_else(|| OstreeError::NoSuchRepo(self.path.clone()))?;
        let res = f(&mut *store, &mut state);
        store.repos.insert(self.path.clone(), state);
        res
    }

    /// Runs `f` on the state objects are read from, the staged copy while a
    /// transaction is open.
    fn with_view<T>(&self, f: impl FnOnce(&MemoryStore, &RepoState) -> OstreeResult<T>) -> OstreeResult<T> {
        match &self.staged {
            Some(staged) => f(&*self.store.lock().unwrap(), &staged.state),
            None => self.with_state(|store, state| f(&*store, &*state)),
        }
    }

    /// Runs `f` on the staged state. Objects are only written inside a
    /// transaction.
    fn with_staged<T>(&mut self, f: impl FnOnce(&MemoryStore, &mut RepoState) -> OstreeResult<T>) -> OstreeResult<T> {
        let store = self.store.lock().unwrap();
        let staged = self.staged.as_mut().ok_or(OstreeError::NoTransaction)?;
        f(&*store, &mut staged.state)
    }

    fn add_commit(&mut self, failpoint: FailPoint, checksum: &str) -> OstreeResult<()> {
        self.with_staged(|store, state| {
            store.check(failpoint)?;
            let available = store
                .available
                .get(checksum)
                .ok_or_else(|| OstreeError::NoSuchCommit(checksum.to_string()))?;
            state.objects.insert(checksum.to_string());
            state
                .signatures
                .insert(checksum.to_string(), available.signed_by.clone());
            Ok(())
        })
    }
}

impl Repository for MemoryRepository {
    fn path(&self) -> &Path {
        &self.path
    }

    fn resolve_ref(&self, ref_name: &str) -> OstreeResult<Option<String>> {
        self.with_state(|_store, state| Ok(state.refs.get(ref_name).cloned()))
    }

    fn begin_transaction(&mut self) -> OstreeResult<()> {
        if self.staged.is_some() {
            return Err(OstreeError::TransactionInProgress);
        }
        let state = self.with_state(|_store, state| Ok(state.clone()))?;
        self.staged = Some(Staged {
            state,
            refs: HashMap::new(),
        });
        Ok(())
    }

    fn set_ref(&mut self, ref_name: &str, checksum: &str) -> OstreeResult<()> {
        self.store.lock().unwrap().check(FailPoint::SetRef)?;
        self.staged
            .as_mut()
            .ok_or(OstreeError::NoTransaction)?
            .refs
            .insert(ref_name.to_string(), checksum.to_string());
        Ok(())
    }

    fn commit_transaction(&mut self) -> OstreeResult<()> {
        let staged = self.staged.take().ok_or(OstreeError::NoTransaction)?;
        self.with_state(|store, state| {
            store.check(FailPoint::Commit)?;
            state.objects.extend(staged.state.objects);
            state.signatures.extend(staged.state.signatures);
            state.bindings.extend(staged.state.bindings);
            state.refs.extend(staged.refs);
            Ok(())
        })
    }

    fn abort_transaction(&mut self) -> OstreeResult<()> {
        self.staged.take().ok_or(OstreeError::NoTransaction)?;
        Ok(())
    }

    fn apply_delta(&mut self, delta_file: &Path) -> OstreeResult<()> {
        let header = ostree::read_delta_superblock(delta_file)?;
        self.add_commit(FailPoint::ApplyDelta, &header.commit)
    }

    fn pull_ref_from_local_path(&mut self, _src_repo: &Path, rev: &str) -> OstreeResult<()> {
        self.add_commit(FailPoint::Pull, rev)
    }

    fn read_commit_metadata_file(&self, checksum: &str, rel_path: &str) -> OstreeResult<Vec<u8>> {
        assert_eq!(rel_path, "/metadata");
        self.with_view(|store, state| {
            store.check(FailPoint::ReadMetadata)?;
            if !state.objects.contains(checksum) {
                return Err(OstreeError::NoSuchCommit(checksum.to_string()));
            }
            let source = state
                .bindings
                .get(checksum)
                .map(|(_, from)| from.clone())
                .unwrap_or_else(|| checksum.to_string());
            store
                .available
                .get(&source)
                .map(|c| c.app_metadata.as_bytes().to_vec())
                .ok_or(OstreeError::NoSuchCommit(source))
        })
    }

    fn verify_commit_signature(
        &self,
        checksum: &str,
        _gpg_homedir: Option<&Path>,
        _keyring: Option<&Path>,
    ) -> OstreeResult<u32> {
        self.with_view(|store, state| {
            store.check(FailPoint::Verify)?;
            Ok(state
                .signatures
                .get(checksum)
                .map(|keys| keys.len() as u32)
                .unwrap_or(0))
        })
    }

    fn sign_commit(
        &mut self,
        checksum: &str,
        key_id: &str,
        _gpg_homedir: Option<&Path>,
    ) -> OstreeResult<()> {
        self.with_staged(|store, state| {
            store.check(FailPoint::Sign)?;
            let keys = state.signatures.entry(checksum.to_string()).or_default();
            if keys.iter().any(|k| k == key_id) {
                return Err(OstreeError::AlreadySigned(key_id.to_string()));
            }
            keys.push(key_id.to_string());
            Ok(())
        })
    }

    fn copy_commit_with_new_bindings(
        &mut self,
        checksum: &str,
        new_ref: &str,
    ) -> OstreeResult<String> {
        let parent = self.resolve_ref(new_ref)?;
        self.with_staged(|store, state| {
            store.check(FailPoint::CopyCommit)?;
            if !state.objects.contains(checksum) {
                return Err(OstreeError::NoSuchCommit(checksum.to_string()));
            }
            // Same input and parent give the same commit, like a real repository
            let mut hasher = DefaultHasher::new();
            (checksum, new_ref, parent).hash(&mut hasher);
            let new_checksum = format!("{:016x}{}", hasher.finish(), "0".repeat(48));
            state.objects.insert(new_checksum.clone());
            state
                .bindings
                .insert(new_checksum.clone(), (new_ref.to_string(), checksum.to_string()));
            Ok(new_checksum)
        })
    }

    fn export_bundle(&self, ref_name: &str, dest: &Path) -> OstreeResult<()> {
        self.with_state(|store, state| {
            store.check(FailPoint::Export)?;
            let commit = state
                .refs
                .get(ref_name)
                .ok_or_else(|| OstreeError::NoSuchRef(ref_name.to_string()))?;
            fs::write(dest, format!("bundle of {} at {}", ref_name, commit))?;
            state.exports += 1;
            Ok(())
        })
    }

    fn update_metadata(&self, _config: &ImportConfig) -> OstreeResult<()> {
        self.with_state(|store, state| {
            store.check(FailPoint::UpdateMetadata)?;
            state.metadata_updates += 1;
            Ok(())
        })
    }

    fn run_maintenance(&self, _config: &ImportConfig) -> OstreeResult<()> {
        self.with_state(|store, state| {
            store.check(FailPoint::Maintenance)?;
            state.maintenance_runs += 1;
            Ok(())
        })
    }
}

#[derive(Clone, Default)]
pub struct MemoryOpener {
    pub store: Arc<Mutex<MemoryStore>>,
}

impl MemoryOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_available_commit(&self, checksum: &str, app_metadata: &str, signed_by: &[&str]) {
        self.store.lock().unwrap().available.insert(
            checksum.to_string(),
            AvailableCommit {
                app_metadata: app_metadata.to_string(),
                signed_by: signed_by.iter().map(|s| s.to_string()).collect(),
            },
        );
    }

    pub fn fail_at(&self, failpoint: FailPoint) {
        self.store.lock().unwrap().failpoints.insert(failpoint);
    }

    pub fn clear_failpoints(&self) {
        self.store.lock().unwrap().failpoints.clear();
    }

    pub fn state(&self, path: &Path) -> RepoState {
        self.store
            .lock()
            .unwrap()
            .repos
            .get(path)
            .cloned()
            .unwrap_or_default()
    }

    pub fn set_ref(&self, path: &Path, ref_name: &str, checksum: &str) {
        fs::create_dir_all(path).unwrap();
        let mut store = self.store.lock().unwrap();
        let state = store.repos.entry(path.to_path_buf()).or_default();
        state.refs.insert(ref_name.to_string(), checksum.to_string());
        state.objects.insert(checksum.to_string());
    }

    pub fn remove_ref(&self, path: &Path, ref_name: &str) {
        if let Some(state) = self.store.lock().unwrap().repos.get_mut(path) {
            state.refs.remove(ref_name);
        }
    }
}

impl RepoOpener for MemoryOpener {
    fn exists(&self, path: &Path) -> bool {
        self.store.lock().unwrap().repos.contains_key(path)
    }

    fn open(&self, path: &Path) -> OstreeResult<Box<dyn Repository>> {
        if !self.exists(path) {
            return Err(OstreeError::NoSuchRepo(path.to_path_buf()));
        }
        Ok(Box::new(MemoryRepository {
            path: path.to_path_buf(),
            store: self.store.clone(),
            staged: None,
        }))
    }

    fn create(&self, path: &Path) -> OstreeResult<Box<dyn Repository>> {
        fs::create_dir_all(path)?;
        self.store
            .lock()
            .unwrap()
            .repos
            .entry(path.to_path_buf())
            .or_default();
        self.open(path)
    }
}
