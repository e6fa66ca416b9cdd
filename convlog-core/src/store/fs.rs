/// Directory-backed object store.
///
/// One directory per conversation:
///
/// ```text
/// <data_dir>/<conversation>/objects/commits/<id>   bincode CommitEnvelope
/// <data_dir>/<conversation>/objects/trees/<id>     bincode Tree
/// <data_dir>/<conversation>/refs/<name>            hex commit id
/// ```
///
/// Every file is written to a `.lock` sibling and renamed into place, so
/// readers see either the old or the new content. Decoded commits are kept
/// in an LRU cache.

use lru::LruCache;
use std::collections::HashMap;
use std::ffi::OsString;
use std::fs;
use std::io::ErrorKind;
use std::num::NonZeroUsize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use convlog_protocol::conversation::{Commit, CommitEnvelope, CommitId, ConversationId, Tree, TreeId};

use super::{check_ref_name, ObjectStore, Result, StoreError, StoreFactory};
use crate::config::ConvlogConfig;

const LOCK_SUFFIX: &str = ".lock";

pub struct FsStore {
    root: PathBuf,
    /// Serializes ref compare-and-swap within this process.
    refs_lock: Mutex<()>,
    cache: Mutex<LruCache<CommitId, Commit>>,
}

impl FsStore {
    pub fn open(root: &Path, cache_size: usize) -> Result<Self> {
        fs::create_dir_all(root.join("objects").join("commits"))?;
        fs::create_dir_all(root.join("objects").join("trees"))?;
        fs::create_dir_all(root.join("refs"))?;
        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);

        Ok(FsStore {
            root: root.to_path_buf(),
            refs_lock: Mutex::new(()),
            cache: Mutex::new(LruCache::new(capacity)),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn commit_path(&self, id: &CommitId) -> PathBuf {
        self.root.join("objects").join("commits").join(id.to_hex())
    }

    fn tree_path(&self, id: &TreeId) -> PathBuf {
        self.root.join("objects").join("trees").join(id.to_hex())
    }

    fn ref_path(&self, name: &str) -> PathBuf {
        name.split('/')
            .fold(self.root.join("refs"), |path, part| path.join(part))
    }

    fn cache(&self) -> MutexGuard<'_, LruCache<CommitId, Commit>> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut tmp = OsString::from(path.as_os_str());
    tmp.push(LOCK_SUFFIX);
    let tmp = PathBuf::from(tmp);
    fs::write(&tmp, bytes)?;
    fs::rename(&tmp, path)?;
    Ok(())
}

/// File contents, or `None` if the file does not exist.
fn read_optional(path: &Path) -> Result<Option<Vec<u8>>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(bytes)),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
        Err(e) => Err(StoreError::Io(e)),
    }
}

fn parse_ref(name: &str, bytes: &[u8]) -> Result<CommitId> {
    let text = String::from_utf8_lossy(bytes);
    CommitId::from_hex(text.trim()).map_err(|_| StoreError::Corrupt(format!("ref {}", name)))
}

impl ObjectStore for FsStore {
    fn put_commit(&self, envelope: &CommitEnvelope) -> Result<CommitId> {
        let id = envelope.id();
        let path = self.commit_path(&id);
        if !path.exists() {
            write_atomic(&path, &envelope.to_bytes()?)?;
        }
        Ok(id)
    }

    fn get_commit(&self, id: &CommitId) -> Result<Option<Commit>> {
        if let Some(commit) = self.cache().get(id) {
            return Ok(Some(commit.clone()));
        }
        let bytes = match read_optional(&self.commit_path(id))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let envelope = CommitEnvelope::from_bytes(&bytes)?;
        if envelope.id() != *id {
            return Err(StoreError::Corrupt(format!("commit {}", id)));
        }
        let commit = Commit::decode(&envelope)?;
        self.cache().put(*id, commit.clone());
        Ok(Some(commit))
    }

    fn has_commit(&self, id: &CommitId) -> Result<bool> {
        Ok(self.cache().contains(id) || self.commit_path(id).exists())
    }

    fn put_tree(&self, tree: &Tree) -> Result<TreeId> {
        let id = tree.id();
        let path = self.tree_path(&id);
        if !path.exists() {
            write_atomic(&path, &tree.to_bytes()?)?;
        }
        Ok(id)
    }

    fn get_tree(&self, id: &TreeId) -> Result<Option<Tree>> {
        let bytes = match read_optional(&self.tree_path(id))? {
            Some(bytes) => bytes,
            None => return Ok(None),
        };
        let tree = Tree::from_bytes(&bytes)?;
        if tree.id() != *id {
            return Err(StoreError::Corrupt(format!("tree {}", id)));
        }
        Ok(Some(tree))
    }

    fn read_ref(&self, name: &str) -> Result<Option<CommitId>> {
        check_ref_name(name)?;
        read_optional(&self.ref_path(name))?
            .map(|bytes| parse_ref(name, &bytes))
            .transpose()
    }

    fn compare_and_swap_ref(
        &self,
        name: &str,
        expected: Option<CommitId>,
        new: Option<CommitId>,
    ) -> Result<bool> {
        check_ref_name(name)?;
        let _guard = self.refs_lock.lock().unwrap_or_else(PoisonError::into_inner);
        if self.read_ref(name)? != expected {
            return Ok(false);
        }
        let path = self.ref_path(name);
        match new {
            Some(id) => write_atomic(&path, id.to_hex().as_bytes())?,
            None => match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::Io(e)),
            },
        }
        Ok(true)
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<(String, CommitId)>> {
        let mut refs = Vec::new();
        let mut pending = vec![(self.root.join("refs"), String::new())];
        while let Some((dir, base)) = pending.pop() {
            let entries = match fs::read_dir(&dir) {
                Ok(entries) => entries,
                Err(e) if e.kind() == ErrorKind::NotFound => continue,
                Err(e) => return Err(StoreError::Io(e)),
            };
            for entry in entries {
                let entry = entry?;
                let file_name = entry.file_name().to_string_lossy().into_owned();
                if file_name.ends_with(LOCK_SUFFIX) {
                    continue;
                }
                let name = if base.is_empty() {
                    file_name
                } else {
                    format!("{}/{}", base, file_name)
                };
                if entry.file_type()?.is_dir() {
                    pending.push((entry.path(), name));
                } else if name.starts_with(prefix) {
                    let id = parse_ref(&name, &fs::read(entry.path())?)?;
                    refs.push((name, id));
                }
            }
        }
        refs.sort();
        Ok(refs)
    }

    fn erase(&self) -> Result<()> {
        let _guard = self.refs_lock.lock().unwrap_or_else(PoisonError::into_inner);
        self.cache().clear();
        match fs::remove_dir_all(&self.root) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::Io(e)),
        }
        log::info!("Erased conversation store at {}", self.root.display());
        Ok(())
    }
}

/// Opens `FsStore`s under one data directory, one shared instance per
/// conversation so ref swaps are serialized in-process.
pub struct FsStoreFactory {
    root: PathBuf,
    cache_size: usize,
    stores: Mutex<HashMap<ConversationId, Arc<FsStore>>>,
}

impl FsStoreFactory {
    pub fn new(root: &Path, cache_size: usize) -> Self {
        FsStoreFactory {
            root: root.to_path_buf(),
            cache_size,
            stores: Mutex::new(HashMap::new()),
        }
    }

    pub fn from_config(config: &ConvlogConfig) -> Self {
        FsStoreFactory::new(&config.data_dir, config.commit_cache_size)
    }
}

impl StoreFactory for FsStoreFactory {
    fn open(&self, conversation: &ConversationId) -> Result<Arc<dyn ObjectStore>> {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(store) = stores.get(conversation) {
            let store: Arc<dyn ObjectStore> = store.clone();
            return Ok(store);
        }
        let store = Arc::new(FsStore::open(
            &self.root.join(conversation.to_hex()),
            self.cache_size,
        )?);
        stores.insert(*conversation, store.clone());
        let store: Arc<dyn ObjectStore> = store;
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{conformance, MAIN_REF};

    fn store() -> (tempfile::TempDir, FsStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsStore::open(&dir.path().join("conv"), 4).unwrap();
        (dir, store)
    }

    #[test]
    fn test_objects() {
        let (_dir, store) = store();
        conformance::objects_roundtrip(&store);
    }

    #[test]
    fn test_refs() {
        let (_dir, store) = store();
        conformance::refs_compare_and_swap(&store);
        assert!(store.root().join("refs").join("remotes").is_dir());
    }

    #[test]
    fn test_erase() {
        let (_dir, store) = store();
        conformance::erase_removes_everything(&store);
        assert!(!store.root().exists());
    }

    #[test]
    fn test_refs_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let conversation = ConversationId::from_bytes([5; 32]);
        let head = CommitId::from_bytes([6; 32]);

        let first = FsStoreFactory::new(dir.path(), 8);
        first
            .open(&conversation)
            .unwrap()
            .compare_and_swap_ref(MAIN_REF, None, Some(head))
            .unwrap();

        let second = FsStoreFactory::new(dir.path(), 8);
        let reopened = second.open(&conversation).unwrap();
        assert_eq!(reopened.read_ref(MAIN_REF).unwrap(), Some(head));
    }

    #[test]
    fn test_corrupt_commit_detected() {
        let (_dir, store) = store();
        let id = CommitId::from_bytes([3; 32]);
        fs::write(store.commit_path(&id), b"garbage").unwrap();
        assert!(store.get_commit(&id).is_err());
    }
}
