/// Peer synchronization.
///
/// A pull from one peer device runs in three steps, none of which touches
/// `main` until the last:
///
/// 1. `fetch` downloads the peer's head and the commits leading to it into
///    the object store and points `remotes/<device>/main` at it.
/// 2. `valid_fetch` admits every commit not yet validated, parents first,
///    each against the trees of its parents. One failure rejects the batch.
/// 3. `merge` fast-forwards `main`, or writes a two-parent merge commit
///    whose tree is the three-way merge of both sides.
///
/// `Synchronizer` tracks the per-device state of that sequence.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use convlog_protocol::conversation::limits::HARD_CAP_COMMITS;
use convlog_protocol::conversation::{
    policy, Author, Commit, CommitBody, CommitEnvelope, CommitError, CommitId, ConversationId,
    DeviceId, ParentState, Rejection, RejectionKind, Tree,
};
use convlog_protocol::crypto::LocalIdentity;

use crate::config::ConvlogConfig;
use crate::graph;
use crate::network::{Channel, TransportError};
use crate::repository::{genesis_mode, Repository, RepositoryError};
use crate::store::{remote_ref, ObjectStore, StoreError, StoreFactory, MAIN_REF};

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Peer did not answer in time")]
    Timeout,

    #[error("Peer has no head for this conversation")]
    EmptyRemote,

    #[error("Too many commits in one fetch: {count} (max {max})")]
    TooManyCommits { count: usize, max: usize },

    #[error("Fetched history lacks commit {0:?}")]
    MissingObject(CommitId),

    #[error("Fetched history has a foreign root {0:?}")]
    ForeignRoot(CommitId),

    #[error("Codec error: {0}")]
    Codec(#[from] CommitError),

    #[error("Commit {commit:?} rejected: {reason}")]
    Rejected { commit: CommitId, reason: Rejection },

    #[error("Validation cancelled")]
    Cancelled,

    #[error("No fetched head for {0:?}")]
    NoRemoteHead(DeviceId),

    #[error("Repository error: {0}")]
    Repository(#[from] RepositoryError),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

impl SyncError {
    /// Whether the peer sent history this replica refuses.
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            SyncError::Rejected { .. } | SyncError::ForeignRoot(_) | SyncError::MissingObject(_)
        )
    }
}

/// What `merge` did to `main`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// `main` already contained the commit.
    UpToDate(CommitId),
    FastForward(CommitId),
    /// A merge commit was written.
    Merged(CommitId),
}

impl MergeOutcome {
    /// `main` after the merge.
    pub fn head(&self) -> CommitId {
        match self {
            MergeOutcome::UpToDate(id) | MergeOutcome::FastForward(id) | MergeOutcome::Merged(id) => *id,
        }
    }
}

// ---------------------------------------------------------------------------
// Download
// ---------------------------------------------------------------------------

/// Fetch the peer's head and the commits we lack into `store`, and record
/// it under `remotes/<device>/main`. Every commit reachable from the head
/// must either be fetched or already stored, and every root must be the
/// conversation's genesis.
///
/// History arrives in rounds of at most `max_commits_per_fetch` commits,
/// oldest first. Each round tells the peer what the previous ones brought,
/// until the head is in hand or a round brings nothing new.
async fn download(
    store: &dyn ObjectStore,
    conversation: &ConversationId,
    config: &ConvlogConfig,
    channel: &dyn Channel,
    have: Vec<CommitId>,
) -> Result<CommitId, SyncError> {
    let device = channel.remote_device();
    let timeout = config.fetch_timeout();
    let limit = config.max_commits_per_fetch;

    let head = tokio::time::timeout(timeout, channel.fetch_head(MAIN_REF))
        .await
        .map_err(|_| SyncError::Timeout)??
        .ok_or(SyncError::EmptyRemote)?;

    if !store.has_commit(&head)? {
        // Keyed by the id recomputed from the bytes
        let mut pack: HashMap<CommitId, Commit> = HashMap::new();
        let mut tips: HashSet<CommitId> = HashSet::new();
        let mut rounds = 0usize;

        while !pack.contains_key(&head) {
            let mut ask = have.clone();
            ask.extend(tips.iter().copied());
            let envelopes = tokio::time::timeout(timeout, channel.fetch_pack(head, ask, limit))
                .await
                .map_err(|_| SyncError::Timeout)??;
            if envelopes.len() > limit {
                return Err(SyncError::TooManyCommits {
                    count: envelopes.len(),
                    max: limit,
                });
            }

            let mut fresh = 0usize;
            for envelope in envelopes {
                let commit = Commit::decode(&envelope)?;
                if pack.contains_key(&commit.id) || store.has_commit(&commit.id)? {
                    continue;
                }
                for parent in &commit.parents {
                    tips.remove(parent);
                }
                tips.insert(commit.id);
                pack.insert(commit.id, commit);
                fresh += 1;
            }
            if fresh == 0 {
                return Err(SyncError::MissingObject(head));
            }
            if pack.len() > HARD_CAP_COMMITS {
                return Err(SyncError::TooManyCommits {
                    count: pack.len(),
                    max: HARD_CAP_COMMITS,
                });
            }
            rounds += 1;
        }

        let mut needed = Vec::new();
        let mut seen = HashSet::new();
        let mut queue = vec![head];
        while let Some(id) = queue.pop() {
            if !seen.insert(id) || store.has_commit(&id)? {
                continue;
            }
            let commit = pack.remove(&id).ok_or(SyncError::MissingObject(id))?;
            if commit.is_genesis() && commit.id != *conversation {
                return Err(SyncError::ForeignRoot(commit.id));
            }
            queue.extend(commit.parents.iter().copied());
            needed.push(commit);
        }
        if !pack.is_empty() {
            log::debug!("Ignoring {} unrelated commits from {}", pack.len(), device.short());
        }
        for commit in &needed {
            store.put_commit(&commit.envelope())?;
        }
        log::info!(
            "Fetched {} commits of {} from {} in {} rounds",
            needed.len(),
            conversation.short(),
            device.short(),
            rounds
        );
    }

    let name = remote_ref(&device.to_hex(), MAIN_REF);
    let current = store.read_ref(&name)?;
    if !store.compare_and_swap_ref(&name, current, Some(head))? {
        return Err(RepositoryError::ConcurrencyConflict.into());
    }
    Ok(head)
}

/// Clone a conversation from a peer. The whole history is validated before
/// `main` is created; on any failure the local copy is erased.
pub async fn clone_conversation(
    factory: &dyn StoreFactory,
    identity: Arc<LocalIdentity>,
    config: ConvlogConfig,
    id: &ConversationId,
    channel: &dyn Channel,
) -> Result<Repository, SyncError> {
    let store = factory.open(id)?;
    if store.read_ref(MAIN_REF)?.is_some() {
        return Err(RepositoryError::AlreadyExists(*id).into());
    }

    let result = clone_into(store.clone(), identity, config, id, channel).await;
    if let Err(e) = &result {
        log::warn!("Clone of {} failed: {}", id.short(), e);
        if let Err(erase) = store.erase() {
            log::error!("Cannot erase failed clone of {}: {}", id.short(), erase);
        }
    }
    result
}

async fn clone_into(
    store: Arc<dyn ObjectStore>,
    identity: Arc<LocalIdentity>,
    config: ConvlogConfig,
    id: &ConversationId,
    channel: &dyn Channel,
) -> Result<Repository, SyncError> {
    let head = download(store.as_ref(), id, &config, channel, Vec::new()).await?;
    let root = store
        .get_commit(id)?
        .ok_or(SyncError::MissingObject(*id))?;
    let mode = genesis_mode(root)?;

    let repo = Repository::assemble(*id, mode, identity, store, config, HashSet::new());
    repo.try_valid_fetch_cancellable(&channel.remote_device(), None)?;
    if !repo.store.compare_and_swap_ref(MAIN_REF, None, Some(head))? {
        return Err(RepositoryError::AlreadyExists(*id).into());
    }
    log::info!("Cloned {} at {}", id.short(), head.short());
    Ok(repo)
}

// ---------------------------------------------------------------------------
// Repository sync operations
// ---------------------------------------------------------------------------

impl Repository {
    /// Download the peer's head into `remotes/<device>/main`.
    pub async fn try_fetch(&self, channel: &dyn Channel) -> Result<CommitId, SyncError> {
        let have: Vec<CommitId> = self.head().into_iter().collect();
        download(self.store.as_ref(), &self.id(), &self.config, channel, have).await
    }

    pub async fn fetch(&self, channel: &dyn Channel) -> bool {
        match self.try_fetch(channel).await {
            Ok(_) => true,
            Err(e) => {
                log::warn!(
                    "Fetch of {} from {} failed: {}",
                    self.id().short(),
                    channel.remote_device().short(),
                    e
                );
                false
            }
        }
    }

    /// Last fetched head of `branch` on `device`.
    pub fn remote_head(&self, device: &DeviceId, branch: &str) -> Option<CommitId> {
        self.store
            .read_ref(&remote_ref(&device.to_hex(), branch))
            .ok()
            .flatten()
    }

    /// Parent tree for admission: admitted earlier in this batch, or
    /// (when `trust_validated`) validated before.
    fn parent_tree(
        &self,
        id: &CommitId,
        admitted: &HashMap<CommitId, Tree>,
        trust_validated: bool,
    ) -> Result<Option<Tree>, SyncError> {
        if let Some(tree) = admitted.get(id) {
            return Ok(Some(tree.clone()));
        }
        if trust_validated && self.is_validated(id) {
            return Ok(Some(self.tree_at(id)?));
        }
        Ok(None)
    }

    /// Admit `commits` (parents first) and return their trees. Nothing is
    /// persisted here.
    fn admit_batch(
        &self,
        commits: &[Commit],
        trust_validated: bool,
        cancel: Option<&CancellationToken>,
    ) -> Result<HashMap<CommitId, Tree>, SyncError> {
        let ctx = self.policy();
        let mut admitted: HashMap<CommitId, Tree> = HashMap::new();

        for commit in commits {
            if cancel.map(CancellationToken::is_cancelled).unwrap_or(false) {
                log::info!("Validation of {} cancelled", self.id().short());
                return Err(SyncError::Cancelled);
            }
            let reject = |reason: Rejection| {
                let kind = match reason.kind() {
                    RejectionKind::Integrity => "integrity",
                    RejectionKind::Policy => "policy",
                };
                log::warn!(
                    "Rejected commit {} by {} ({}): {}",
                    commit.id.short(),
                    commit.author.uri,
                    kind,
                    reason
                );
                SyncError::Rejected {
                    commit: commit.id,
                    reason,
                }
            };

            let mut parents = Vec::with_capacity(commit.parents.len());
            for parent in &commit.parents {
                match self.parent_tree(parent, &admitted, trust_validated)? {
                    Some(tree) => parents.push(tree),
                    None => return Err(reject(Rejection::MissingParent(*parent))),
                }
            }
            if commit.is_genesis() && commit.id != self.id() {
                return Err(reject(Rejection::GenesisMismatch));
            }

            let base = match commit.parents.as_slice() {
                [ours, theirs] => match graph::merge_base(self.store.as_ref(), ours, theirs)? {
                    Some(base) => self
                        .parent_tree(&base, &admitted, trust_validated)?
                        .ok_or_else(|| reject(Rejection::MissingParent(base)))?,
                    None => Tree::new(),
                },
                _ => Tree::new(),
            };
            let state = match parents.as_slice() {
                [] => ParentState::Genesis,
                [parent] => ParentState::Single(parent),
                [ours, theirs] => ParentState::Merge {
                    ours,
                    theirs,
                    base: &base,
                },
                _ => return Err(reject(Rejection::WrongParentCount)),
            };

            let tree = policy::admit(commit, &ctx, state).map_err(reject)?;
            admitted.insert(commit.id, tree);
        }
        Ok(admitted)
    }

    fn persist_admitted(&self, admitted: HashMap<CommitId, Tree>) -> Result<(), SyncError> {
        for tree in admitted.values() {
            self.store.put_tree(tree)?;
        }
        self.mark_validated(admitted.into_keys());
        Ok(())
    }

    /// Validate what `fetch` brought from `device`. Returns the newly
    /// admitted commits, parents first.
    pub fn try_valid_fetch_cancellable(
        &self,
        device: &DeviceId,
        cancel: Option<&CancellationToken>,
    ) -> Result<Vec<Commit>, SyncError> {
        let remote = self
            .remote_head(device, MAIN_REF)
            .ok_or(SyncError::NoRemoteHead(*device))?;
        let pending = graph::collect(self.store.as_ref(), &[remote], |id| self.is_validated(id))
            .map_err(SyncError::Repository)?;
        let ordered = graph::oldest_first(pending);

        let admitted = self.admit_batch(&ordered, true, cancel)?;
        self.persist_admitted(admitted)?;
        if !ordered.is_empty() {
            log::info!(
                "Validated {} commits of {} from {}",
                ordered.len(),
                self.id().short(),
                device.short()
            );
        }
        Ok(ordered)
    }

    /// Empty when anything in the batch fails.
    pub fn valid_fetch(&self, device: &DeviceId) -> Vec<Commit> {
        self.valid_fetch_cancellable(device, None)
    }

    pub fn valid_fetch_cancellable(
        &self,
        device: &DeviceId,
        cancel: Option<&CancellationToken>,
    ) -> Vec<Commit> {
        self.try_valid_fetch_cancellable(device, cancel)
            .unwrap_or_else(|e| {
                log::warn!("Validation from {} failed: {}", device.short(), e);
                Vec::new()
            })
    }

    /// Revalidate the whole history of `main` from genesis, trusting
    /// nothing validated before.
    pub fn try_valid_clone(&self) -> Result<usize, SyncError> {
        let head = self.head_id()?;
        let all = graph::collect(self.store.as_ref(), &[head], |_| false)?;
        let ordered = graph::oldest_first(all);
        match ordered.first() {
            Some(root) if root.id == self.id() => {}
            Some(root) => return Err(SyncError::ForeignRoot(root.id)),
            None => return Err(SyncError::MissingObject(head)),
        }
        let admitted = self.admit_batch(&ordered, false, None)?;
        let count = admitted.len();
        self.persist_admitted(admitted)?;
        Ok(count)
    }

    pub fn valid_clone(&self) -> bool {
        self.try_valid_clone()
            .map_err(|e| log::warn!("History of {} is invalid: {}", self.id().short(), e))
            .is_ok()
    }

    /// Bring a validated commit into `main`.
    pub fn try_merge(&self, theirs: &CommitId) -> Result<MergeOutcome, SyncError> {
        if !self.is_validated(theirs) {
            return Err(RepositoryError::NotValidated(*theirs).into());
        }
        let _guard = self.write_guard();
        let store = self.store.as_ref();
        let head = self.head_id()?;

        if graph::is_ancestor(store, theirs, &head)? {
            return Ok(MergeOutcome::UpToDate(head));
        }
        if graph::is_ancestor(store, &head, theirs)? {
            self.advance_head(head, *theirs)?;
            log::info!("Fast-forwarded {} to {}", self.id().short(), theirs.short());
            return Ok(MergeOutcome::FastForward(*theirs));
        }

        let base = match graph::merge_base(store, &head, theirs)? {
            Some(base) => self.tree_at(&base)?,
            None => Tree::new(),
        };
        let ours_tree = self.tree_at(&head)?;
        let theirs_tree = self.tree_at(theirs)?;
        let author = Author::from_identity(&self.identity);
        let tree = policy::merge_tree(&base, &ours_tree, &theirs_tree, &author).map_err(|reason| {
            SyncError::Rejected {
                commit: *theirs,
                reason,
            }
        })?;
        let commit = Commit::create_signed(
            vec![head, *theirs],
            CommitBody::Merge,
            None,
            tree.id(),
            &self.identity,
        )?;

        store.put_tree(&tree)?;
        store.put_commit(&commit.envelope())?;
        self.advance_head(head, commit.id)?;
        self.mark_validated([commit.id]);
        log::info!(
            "Merged {} into {} as {}",
            theirs.short(),
            self.id().short(),
            commit.id.short()
        );
        Ok(MergeOutcome::Merged(commit.id))
    }

    /// `main` after merging, or `None` on failure.
    pub fn merge(&self, theirs: &CommitId) -> Option<CommitId> {
        match self.try_merge(theirs) {
            Ok(outcome) => Some(outcome.head()),
            Err(e) => {
                log::warn!("Merge of {} failed: {}", theirs.short(), e);
                None
            }
        }
    }

    // -----------------------------------------------------------------------
    // Serving side
    // -----------------------------------------------------------------------

    pub fn serve_head(&self) -> Option<CommitId> {
        self.head()
    }

    /// Envelopes leading to `want`, minus what `have` already implies,
    /// parents first. Only validated history is served, and at most `limit`
    /// commits (capped by `max_commits_per_fetch`) per call: the oldest ones,
    /// so that every commit's parents are known once it arrives.
    pub fn serve_pack(
        &self,
        want: &CommitId,
        have: &[CommitId],
        limit: usize,
    ) -> Result<Vec<CommitEnvelope>, RepositoryError> {
        if !self.is_validated(want) {
            return Err(RepositoryError::NotValidated(*want));
        }
        let store = self.store.as_ref();
        let mut known = HashSet::new();
        for id in have {
            if self.is_validated(id) {
                known.extend(graph::ancestor_ids(store, id)?);
            }
        }
        let pending = graph::collect(store, &[*want], |id| known.contains(id))?;
        Ok(graph::oldest_first(pending)
            .iter()
            .take(limit.min(self.config.max_commits_per_fetch))
            .map(Commit::envelope)
            .collect())
    }
}

// ---------------------------------------------------------------------------
// Synchronizer
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SyncState {
    #[default]
    Idle,
    Fetching,
    Validating,
    Merging,
    /// The last pull was refused; cleared by the next one.
    Rejected,
}

/// Drives fetch → validate → merge per remote device.
pub struct Synchronizer {
    repo: Arc<Repository>,
    states: Mutex<HashMap<DeviceId, SyncState>>,
}

impl Synchronizer {
    pub fn new(repo: Arc<Repository>) -> Self {
        Synchronizer {
            repo,
            states: Mutex::new(HashMap::new()),
        }
    }

    pub fn repository(&self) -> &Arc<Repository> {
        &self.repo
    }

    fn states(&self) -> MutexGuard<'_, HashMap<DeviceId, SyncState>> {
        self.states.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn state(&self, device: &DeviceId) -> SyncState {
        self.states().get(device).copied().unwrap_or_default()
    }

    fn set_state(&self, device: &DeviceId, state: SyncState) {
        let previous = self.states().insert(*device, state).unwrap_or_default();
        if previous != state {
            log::debug!(
                "Sync {} with {}: {:?} -> {:?}",
                self.repo.id().short(),
                device.short(),
                previous,
                state
            );
        }
    }

    fn fail(&self, device: &DeviceId, error: SyncError) -> SyncError {
        let state = if error.is_rejection() {
            SyncState::Rejected
        } else {
            SyncState::Idle
        };
        self.set_state(device, state);
        error
    }

    pub async fn try_pull(
        &self,
        channel: &dyn Channel,
        cancel: Option<&CancellationToken>,
    ) -> Result<MergeOutcome, SyncError> {
        let device = channel.remote_device();

        self.set_state(&device, SyncState::Fetching);
        let remote = match self.repo.try_fetch(channel).await {
            Ok(remote) => remote,
            Err(e) => return Err(self.fail(&device, e)),
        };

        self.set_state(&device, SyncState::Validating);
        if let Err(e) = self.repo.try_valid_fetch_cancellable(&device, cancel) {
            return Err(self.fail(&device, e));
        }

        self.set_state(&device, SyncState::Merging);
        let outcome = match self.repo.try_merge(&remote) {
            Ok(outcome) => outcome,
            Err(e) => return Err(self.fail(&device, e)),
        };
        self.set_state(&device, SyncState::Idle);
        Ok(outcome)
    }

    pub async fn pull_cancellable(&self, channel: &dyn Channel, cancel: &CancellationToken) -> bool {
        self.log_pull(channel, self.try_pull(channel, Some(cancel)).await)
    }

    /// Fetch, validate and merge from the peer behind `channel`.
    pub async fn pull(&self, channel: &dyn Channel) -> bool {
        self.log_pull(channel, self.try_pull(channel, None).await)
    }

    fn log_pull(&self, channel: &dyn Channel, result: Result<MergeOutcome, SyncError>) -> bool {
        match result {
            Ok(_) => true,
            Err(e) => {
                log::warn!(
                    "Pull of {} from {} failed: {}",
                    self.repo.id().short(),
                    channel.remote_device().short(),
                    e
                );
                false
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
