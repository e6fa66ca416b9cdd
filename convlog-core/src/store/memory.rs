/// In-memory object store, for tests and short-lived replicas.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use convlog_protocol::conversation::{Commit, CommitEnvelope, CommitId, ConversationId, Tree, TreeId};

use super::{check_ref_name, ObjectStore, Result, StoreFactory};

#[derive(Default)]
struct Inner {
    commits: HashMap<CommitId, CommitEnvelope>,
    trees: HashMap<TreeId, Tree>,
    refs: BTreeMap<String, CommitId>,
}

#[derive(Default)]
pub struct MemoryStore {
    inner: Mutex<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        MemoryStore::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn commit_count(&self) -> usize {
        self.lock().commits.len()
    }
}

impl ObjectStore for MemoryStore {
    fn put_commit(&self, envelope: &CommitEnvelope) -> Result<CommitId> {
        let id = envelope.id();
        self.lock()
            .commits
            .entry(id)
            .or_insert_with(|| envelope.clone());
        Ok(id)
    }

    fn get_commit(&self, id: &CommitId) -> Result<Option<Commit>> {
        let envelope = match self.lock().commits.get(id) {
            Some(envelope) => envelope.clone(),
            None => return Ok(None),
        };
        Ok(Some(Commit::decode(&envelope)?))
    }

    fn has_commit(&self, id: &CommitId) -> Result<bool> {
        Ok(self.lock().commits.contains_key(id))
    }

    fn put_tree(&self, tree: &Tree) -> Result<TreeId> {
        let id = tree.id();
        self.lock().trees.entry(id).or_insert_with(|| tree.clone());
        Ok(id)
    }

    fn get_tree(&self, id: &TreeId) -> Result<Option<Tree>> {
        Ok(self.lock().trees.get(id).cloned())
    }

    fn read_ref(&self, name: &str) -> Result<Option<CommitId>> {
        check_ref_name(name)?;
        Ok(self.lock().refs.get(name).copied())
    }

    fn compare_and_swap_ref(
        &self,
        name: &str,
        expected: Option<CommitId>,
        new: Option<CommitId>,
    ) -> Result<bool> {
        check_ref_name(name)?;
        let mut inner = self.lock();
        if inner.refs.get(name).copied() != expected {
            return Ok(false);
        }
        match new {
            Some(id) => inner.refs.insert(name.to_string(), id),
            None => inner.refs.remove(name),
        };
        Ok(true)
    }

    fn list_refs(&self, prefix: &str) -> Result<Vec<(String, CommitId)>> {
        Ok(self
            .lock()
            .refs
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, id)| (name.clone(), *id))
            .collect())
    }

    fn erase(&self) -> Result<()> {
        *self.lock() = Inner::default();
        Ok(())
    }
}

/// Hands out one shared `MemoryStore` per conversation.
#[derive(Default)]
pub struct MemoryStoreFactory {
    stores: Mutex<HashMap<ConversationId, Arc<MemoryStore>>>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        MemoryStoreFactory::default()
    }
}

impl StoreFactory for MemoryStoreFactory {
    fn open(&self, conversation: &ConversationId) -> Result<Arc<dyn ObjectStore>> {
        let mut stores = self.stores.lock().unwrap_or_else(PoisonError::into_inner);
        let store: Arc<dyn ObjectStore> = stores
            .entry(*conversation)
            .or_insert_with(|| Arc::new(MemoryStore::new()))
            .clone();
        Ok(store)
    }
}
