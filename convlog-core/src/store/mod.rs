/// Content-addressed object store for one conversation.
///
/// Holds commit envelopes, membership trees and named refs. Objects are keyed
/// by the id recomputed from their bytes, so a store never trusts an id handed
/// to it. The only mutable state is the ref table, and the only way to move a
/// ref is `compare_and_swap_ref`: that swap is the single point at which a new
/// head becomes visible.
///
/// # Ref names
/// - `main`: the local head
/// - `remotes/<device>/<branch>`: last fetched head of a peer device
pub mod fs;
pub mod memory;

pub use fs::{FsStore, FsStoreFactory};
pub use memory::{MemoryStore, MemoryStoreFactory};

use std::sync::Arc;
use thiserror::Error;

use convlog_protocol::conversation::{
    Commit, CommitEnvelope, CommitError, CommitId, ConversationId, Tree, TreeId,
};

/// Local head ref.
pub const MAIN_REF: &str = "main";

/// Tracking ref for a peer device's branch.
pub fn remote_ref(device_hex: &str, branch: &str) -> String {
    format!("remotes/{}/{}", device_hex, branch)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(String),

    #[error("Corrupt object {0}")]
    Corrupt(String),

    #[error("Invalid ref name: {0}")]
    InvalidRef(String),
}

impl From<CommitError> for StoreError {
    fn from(e: CommitError) -> Self {
        StoreError::Codec(e.to_string())
    }
}

impl From<bincode::Error> for StoreError {
    fn from(e: bincode::Error) -> Self {
        StoreError::Codec(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Ref names are relative slash-separated paths of plain components.
pub fn check_ref_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.split('/').all(|part| {
            !part.is_empty()
                && part != "."
                && part != ".."
                && !part.ends_with(".lock")
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
        });
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidRef(name.to_string()))
    }
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

pub trait ObjectStore: Send + Sync {
    /// Store an envelope; returns the id recomputed from its bytes.
    fn put_commit(&self, envelope: &CommitEnvelope) -> Result<CommitId>;

    /// Decoded commit, or `None` if absent. Signatures are not checked here.
    fn get_commit(&self, id: &CommitId) -> Result<Option<Commit>>;

    fn has_commit(&self, id: &CommitId) -> Result<bool>;

    fn put_tree(&self, tree: &Tree) -> Result<TreeId>;

    fn get_tree(&self, id: &TreeId) -> Result<Option<Tree>>;

    fn read_ref(&self, name: &str) -> Result<Option<CommitId>>;

    /// Atomically move `name` from `expected` to `new` (`None` = absent).
    /// Returns `false`, changing nothing, if the ref no longer holds `expected`.
    fn compare_and_swap_ref(
        &self,
        name: &str,
        expected: Option<CommitId>,
        new: Option<CommitId>,
    ) -> Result<bool>;

    /// Refs whose name starts with `prefix`, sorted by name.
    fn list_refs(&self, prefix: &str) -> Result<Vec<(String, CommitId)>>;

    /// Remove every object and ref.
    fn erase(&self) -> Result<()>;
}

/// Opens (creating if needed) the store of a conversation.
pub trait StoreFactory: Send + Sync {
    fn open(&self, conversation: &ConversationId) -> Result<Arc<dyn ObjectStore>>;
}
