/// Conversation log engine.
///
/// A `Repository` owns one conversation: its store, the local signing
/// identity, and the `main` ref. Every local mutation runs the same policy
/// the validator runs on remote commits, so a commit this replica writes is
/// one every peer will admit.
///
/// Mutations are serialized by `write_lock` and become visible through a
/// single compare-and-swap of `main`. Public entry points return
/// `Option`/`bool` and log the failure; the `try_*` variants expose it.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use thiserror::Error;

use convlog_protocol::conversation::{
    check_history_limits, policy, Author, Commit, CommitBody, CommitError, CommitId,
    ConversationId, ConversationMode, DeviceId, HistoryStatus, Member, MemberAction,
    PolicyContext, Rejection, Role, TargetKind, Tree, TreeDiff, TreeId, VoteAction,
};
use convlog_protocol::crypto::LocalIdentity;

use crate::config::ConvlogConfig;
use crate::graph;
use crate::store::{ObjectStore, StoreError, StoreFactory, MAIN_REF};

const TEXT_MIME: &str = "text/plain";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum RepositoryError {
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Commit error: {0}")]
    Commit(#[from] CommitError),

    #[error("Rejected: {0}")]
    Rejected(#[from] Rejection),

    #[error("Conversation {0} already exists")]
    AlreadyExists(ConversationId),

    #[error("Conversation {0} not found")]
    NotFound(ConversationId),

    #[error("Missing commit {0:?}")]
    MissingCommit(CommitId),

    #[error("Missing tree {0:?}")]
    MissingTree(TreeId),

    #[error("Head moved during the operation")]
    ConcurrencyConflict,

    #[error("Cannot amend: {0}")]
    NotAmendable(String),

    #[error("Root commit is not a genesis")]
    NotGenesis,

    #[error("Commit {0:?} has not been validated")]
    NotValidated(CommitId),

    #[error("History is full")]
    HistoryFull,

    #[error("Invalid revision: {0}")]
    InvalidRevision(String),
}

pub type Result<T> = std::result::Result<T, RepositoryError>;

// ---------------------------------------------------------------------------
// Repository
// ---------------------------------------------------------------------------

pub struct Repository {
    id: ConversationId,
    mode: ConversationMode,
    pub(crate) identity: Arc<LocalIdentity>,
    pub(crate) store: Arc<dyn ObjectStore>,
    pub(crate) config: ConvlogConfig,
    write_lock: Mutex<()>,
    members_cache: Mutex<Option<(CommitId, Vec<Member>)>>,
    /// Commits that passed policy on this replica.
    validated: Mutex<HashSet<CommitId>>,
}

impl std::fmt::Debug for Repository {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Repository")
            .field("id", &self.id)
            .field("mode", &self.mode)
            .field("device", &self.identity.device_id())
            .finish()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Create a new conversation. The genesis commit id becomes the
/// conversation id.
pub fn create_conversation(
    factory: &dyn StoreFactory,
    identity: Arc<LocalIdentity>,
    config: ConvlogConfig,
    mode: ConversationMode,
    other_member: Option<&str>,
) -> Result<Repository> {
    let author = Author::from_identity(&identity);
    let tree = policy::genesis_tree(&author, mode, other_member)?;
    let genesis = Commit::create_signed(
        vec![],
        CommitBody::Initial {
            mode,
            other_member: other_member.map(str::to_string),
        },
        None,
        tree.id(),
        &identity,
    )?;

    let store = factory.open(&genesis.id)?;
    if store.read_ref(MAIN_REF)?.is_some() {
        return Err(RepositoryError::AlreadyExists(genesis.id));
    }
    store.put_tree(&tree)?;
    store.put_commit(&genesis.envelope())?;
    if !store.compare_and_swap_ref(MAIN_REF, None, Some(genesis.id))? {
        return Err(RepositoryError::AlreadyExists(genesis.id));
    }

    log::info!(
        "Created {:?} conversation {}",
        mode,
        genesis.id.short()
    );
    Ok(Repository::assemble(
        genesis.id,
        mode,
        identity,
        store,
        config,
        HashSet::from([genesis.id]),
    ))
}

/// Reopen a conversation already present in the store.
pub fn open(
    factory: &dyn StoreFactory,
    identity: Arc<LocalIdentity>,
    config: ConvlogConfig,
    id: &ConversationId,
) -> Result<Repository> {
    let store = factory.open(id)?;
    let head = store
        .read_ref(MAIN_REF)?
        .ok_or(RepositoryError::NotFound(*id))?;
    let mode = genesis_mode(graph::load(store.as_ref(), id)?)?;
    // Everything on main was admitted before it became the head
    let validated = graph::ancestor_ids(store.as_ref(), &head)?;

    log::debug!(
        "Opened conversation {} at {} ({} commits)",
        id.short(),
        head.short(),
        validated.len()
    );
    Ok(Repository::assemble(*id, mode, identity, store, config, validated))
}

pub(crate) fn genesis_mode(root: Commit) -> Result<ConversationMode> {
    match root.body {
        CommitBody::Initial { mode, .. } if root.is_genesis() => Ok(mode),
        _ => Err(RepositoryError::NotGenesis),
    }
}

impl Repository {
    pub(crate) fn assemble(
        id: ConversationId,
        mode: ConversationMode,
        identity: Arc<LocalIdentity>,
        store: Arc<dyn ObjectStore>,
        config: ConvlogConfig,
        validated: HashSet<CommitId>,
    ) -> Self {
        Repository {
            id,
            mode,
            identity,
            store,
            config,
            write_lock: Mutex::new(()),
            members_cache: Mutex::new(None),
            validated: Mutex::new(validated),
        }
    }

    pub fn id(&self) -> ConversationId {
        self.id
    }

    pub fn mode(&self) -> ConversationMode {
        self.mode
    }

    pub fn identity(&self) -> &LocalIdentity {
        &self.identity
    }

    pub fn config(&self) -> &ConvlogConfig {
        &self.config
    }

    /// Current `main`, or `None` once erased.
    pub fn head(&self) -> Option<CommitId> {
        match self.store.read_ref(MAIN_REF) {
            Ok(head) => head,
            Err(e) => {
                log::warn!("Cannot read head of {}: {}", self.id.short(), e);
                None
            }
        }
    }

    pub(crate) fn policy(&self) -> PolicyContext {
        PolicyContext::new(self.mode, self.config.quorum)
    }

    pub(crate) fn write_guard(&self) -> MutexGuard<'_, ()> {
        lock(&self.write_lock)
    }

    pub(crate) fn head_id(&self) -> Result<CommitId> {
        self.store
            .read_ref(MAIN_REF)?
            .ok_or(RepositoryError::NotFound(self.id))
    }

    pub(crate) fn load_tree(&self, id: &TreeId) -> Result<Tree> {
        self.store
            .get_tree(id)?
            .ok_or(RepositoryError::MissingTree(*id))
    }

    /// Membership after `commit`.
    pub(crate) fn tree_at(&self, commit: &CommitId) -> Result<Tree> {
        let commit = graph::load(self.store.as_ref(), commit)?;
        self.load_tree(&commit.tree)
    }

    pub(crate) fn is_validated(&self, id: &CommitId) -> bool {
        lock(&self.validated).contains(id)
    }

    pub(crate) fn mark_validated(&self, ids: impl IntoIterator<Item = CommitId>) {
        lock(&self.validated).extend(ids);
    }

    /// Move `main` from `expected` to `new`.
    pub(crate) fn advance_head(&self, expected: CommitId, new: CommitId) -> Result<()> {
        if !self
            .store
            .compare_and_swap_ref(MAIN_REF, Some(expected), Some(new))?
        {
            log::warn!(
                "Head of {} moved; {} not applied",
                self.id.short(),
                new.short()
            );
            return Err(RepositoryError::ConcurrencyConflict);
        }
        log::debug!("{}: main {} -> {}", self.id.short(), expected.short(), new.short());
        Ok(())
    }

    fn check_capacity(&self) -> Result<()> {
        let count = lock(&self.validated).len();
        match check_history_limits(count) {
            HistoryStatus::Ok => Ok(()),
            HistoryStatus::Large => {
                log::warn!("Conversation {} is large ({} commits)", self.id.short(), count);
                Ok(())
            }
            HistoryStatus::HardCapReached => Err(RepositoryError::HistoryFull),
        }
    }

    // -----------------------------------------------------------------------
    // Mutations
    // -----------------------------------------------------------------------

    /// Apply `body` on top of the head, sign it and advance `main`.
    fn try_commit_body(&self, body: CommitBody, commit_msg: Option<&str>) -> Result<CommitId> {
        let _guard = self.write_guard();
        self.check_capacity()?;

        let head = self.head_id()?;
        let parent = self.tree_at(&head)?;
        let author = Author::from_identity(&self.identity);
        let tree = policy::apply(&self.policy(), &parent, &author, &body)?;
        let commit = Commit::create_signed(vec![head], body, commit_msg, tree.id(), &self.identity)?;

        self.store.put_tree(&tree)?;
        self.store.put_commit(&commit.envelope())?;
        self.advance_head(head, commit.id)?;
        self.mark_validated([commit.id]);
        Ok(commit.id)
    }

    fn commit_or_log(&self, body: CommitBody, what: &str) -> Option<CommitId> {
        match self.try_commit_body(body, None) {
            Ok(id) => Some(id),
            Err(e) => {
                log::warn!("{} refused in {}: {}", what, self.id.short(), e);
                None
            }
        }
    }

    pub fn try_commit_message(&self, msg: &str) -> Result<CommitId> {
        self.try_commit_body(
            CommitBody::Text {
                mime: TEXT_MIME.to_string(),
                body: msg.to_string(),
            },
            None,
        )
    }

    pub fn commit_message(&self, msg: &str) -> Option<CommitId> {
        self.commit_or_log(
            CommitBody::Text {
                mime: TEXT_MIME.to_string(),
                body: msg.to_string(),
            },
            "Message",
        )
    }

    /// Replace the head, when it is a text commit written by this device,
    /// with one carrying `msg`. The replacement keeps the same parent.
    pub fn try_amend(&self, id: &CommitId, msg: &str) -> Result<CommitId> {
        let _guard = self.write_guard();
        let head = self.head_id()?;
        if head != *id {
            return Err(RepositoryError::NotAmendable("not the head".into()));
        }
        let old = graph::load(self.store.as_ref(), id)?;
        let mime = match &old.body {
            CommitBody::Text { mime, .. } => mime.clone(),
            _ => return Err(RepositoryError::NotAmendable("not a text commit".into())),
        };
        if old.author.device != self.identity.device_id() {
            return Err(RepositoryError::NotAmendable("authored elsewhere".into()));
        }
        let parent_id = match old.parents.as_slice() {
            [parent] => *parent,
            _ => return Err(RepositoryError::NotAmendable("unexpected parents".into())),
        };

        let parent = self.tree_at(&parent_id)?;
        let author = Author::from_identity(&self.identity);
        let body = CommitBody::Text {
            mime,
            body: msg.to_string(),
        };
        let tree = policy::apply(&self.policy(), &parent, &author, &body)?;
        let commit = Commit::create_signed(old.parents, body, None, tree.id(), &self.identity)?;

        self.store.put_tree(&tree)?;
        self.store.put_commit(&commit.envelope())?;
        self.advance_head(head, commit.id)?;
        self.mark_validated([commit.id]);
        log::info!("Amended {} as {}", id.short(), commit.id.short());
        Ok(commit.id)
    }

    pub fn amend(&self, id: &CommitId, msg: &str) -> Option<CommitId> {
        self.try_amend(id, msg)
            .map_err(|e| log::warn!("Amend of {} refused: {}", id.short(), e))
            .ok()
    }

    fn member_body(action: MemberAction, uri: &str) -> CommitBody {
        CommitBody::Member {
            action,
            uri: uri.to_string(),
        }
    }

    pub fn try_add_member(&self, uri: &str) -> Result<CommitId> {
        self.try_commit_body(Self::member_body(MemberAction::Add, uri), None)
    }

    /// Invite `uri`.
    pub fn add_member(&self, uri: &str) -> Option<CommitId> {
        self.commit_or_log(Self::member_body(MemberAction::Add, uri), "Invite")
    }

    pub fn try_join(&self) -> Result<CommitId> {
        let uri = self.identity.uri();
        self.try_commit_body(Self::member_body(MemberAction::Join, &uri), None)
    }

    pub fn join(&self) -> Option<CommitId> {
        let uri = self.identity.uri();
        self.commit_or_log(Self::member_body(MemberAction::Join, &uri), "Join")
    }

    pub fn try_leave(&self) -> Result<CommitId> {
        let uri = self.identity.uri();
        self.try_commit_body(Self::member_body(MemberAction::Leave, &uri), None)
    }

    pub fn leave(&self) -> Option<CommitId> {
        let uri = self.identity.uri();
        self.commit_or_log(Self::member_body(MemberAction::Leave, &uri), "Leave")
    }

    pub fn promote(&self, uri: &str) -> Option<CommitId> {
        self.commit_or_log(Self::member_body(MemberAction::Promote, uri), "Promote")
    }

    pub fn demote(&self, uri: &str) -> Option<CommitId> {
        self.commit_or_log(Self::member_body(MemberAction::Demote, uri), "Demote")
    }

    fn vote_body(resolve: bool, action: VoteAction, target: &str, is_device: bool) -> CommitBody {
        let kind = TargetKind::from_is_device(is_device);
        let target = target.to_string();
        if resolve {
            CommitBody::Resolution { action, kind, target }
        } else {
            CommitBody::Vote { action, kind, target }
        }
    }

    pub fn try_vote(&self, action: VoteAction, target: &str, is_device: bool) -> Result<CommitId> {
        self.try_commit_body(Self::vote_body(false, action, target, is_device), None)
    }

    pub fn try_resolve(&self, action: VoteAction, target: &str, is_device: bool) -> Result<CommitId> {
        self.try_commit_body(Self::vote_body(true, action, target, is_device), None)
    }

    /// Cast a ban ballot against a member uri or a device id (hex).
    pub fn vote_kick(&self, target: &str, is_device: bool) -> Option<CommitId> {
        self.commit_or_log(Self::vote_body(false, VoteAction::Ban, target, is_device), "Ban vote")
    }

    /// Ban `target` if enough admins voted for it.
    pub fn resolve_vote(&self, target: &str, is_device: bool) -> Option<CommitId> {
        self.commit_or_log(
            Self::vote_body(true, VoteAction::Ban, target, is_device),
            "Ban resolution",
        )
    }

    pub fn vote_unban(&self, target: &str, is_device: bool) -> Option<CommitId> {
        self.commit_or_log(
            Self::vote_body(false, VoteAction::Unban, target, is_device),
            "Unban vote",
        )
    }

    pub fn resolve_unban(&self, target: &str, is_device: bool) -> Option<CommitId> {
        self.commit_or_log(
            Self::vote_body(true, VoteAction::Unban, target, is_device),
            "Unban resolution",
        )
    }

    // -----------------------------------------------------------------------
    // Queries
    // -----------------------------------------------------------------------

    pub fn get_commit(&self, id: &CommitId) -> Option<Commit> {
        self.store.get_commit(id).ok().flatten()
    }

    /// Commits reachable from `from` (default: head), children first, down
    /// to `to` inclusive.
    pub fn try_log(&self, from: Option<&CommitId>, to: Option<&CommitId>) -> Result<Vec<Commit>> {
        let start = match from {
            Some(id) => *id,
            None => self.head_id()?,
        };
        let commits = graph::collect(self.store.as_ref(), &[start], |_| false)?;
        Ok(graph::newest_first(commits, to, 0))
    }

    pub fn log(&self, from: Option<&CommitId>, to: Option<&CommitId>) -> Vec<Commit> {
        self.try_log(from, to).unwrap_or_else(|e| {
            log::warn!("Log of {} failed: {}", self.id.short(), e);
            Vec::new()
        })
    }

    /// Up to `n` commits starting at `last` (default: head); `n == 0` means
    /// all of them.
    pub fn log_n(&self, last: Option<&CommitId>, n: usize) -> Vec<Commit> {
        let start = match last.copied().or_else(|| self.head()) {
            Some(id) => id,
            None => return Vec::new(),
        };
        match graph::collect(self.store.as_ref(), &[start], |_| false) {
            Ok(commits) => graph::newest_first(commits, None, n),
            Err(e) => {
                log::warn!("Log of {} failed: {}", self.id.short(), e);
                Vec::new()
            }
        }
    }

    fn resolve_revision(&self, rev: &str) -> Result<CommitId> {
        if rev == "HEAD" {
            return self.head_id();
        }
        CommitId::from_hex(rev).map_err(|_| RepositoryError::InvalidRevision(rev.to_string()))
    }

    /// `--stat` style summary of the membership change from `old` (empty:
    /// the empty tree) to `new` (`"HEAD"` accepted).
    pub fn try_diff_stats(&self, new: &str, old: &str) -> Result<String> {
        let new_tree = self.tree_at(&self.resolve_revision(new)?)?;
        let old_tree = if old.is_empty() {
            Tree::new()
        } else {
            self.tree_at(&self.resolve_revision(old)?)?
        };
        Ok(TreeDiff::between(&old_tree, &new_tree).to_string())
    }

    pub fn diff_stats(&self, new: &str, old: &str) -> String {
        self.try_diff_stats(new, old).unwrap_or_else(|e| {
            log::warn!("Diff {}..{} failed: {}", old, new, e);
            String::new()
        })
    }

    /// Paths named in `diff_stats` output.
    pub fn changed_files(stats: &str) -> Vec<String> {
        convlog_protocol::conversation::changed_files(stats)
    }

    /// Membership at the head. Cached until the head changes.
    pub fn members(&self) -> Vec<Member> {
        let head = match self.head() {
            Some(head) => head,
            None => return Vec::new(),
        };
        if let Some((cached_head, members)) = lock(&self.members_cache).as_ref() {
            if *cached_head == head {
                return members.clone();
            }
        }
        self.load_members(head)
    }

    /// Drop the cached view and recompute it from the head.
    pub fn refresh_members(&self) -> Vec<Member> {
        *lock(&self.members_cache) = None;
        self.members()
    }

    fn load_members(&self, head: CommitId) -> Vec<Member> {
        match self.tree_at(&head) {
            Ok(tree) => {
                let members = tree.members();
                *lock(&self.members_cache) = Some((head, members.clone()));
                members
            }
            Err(e) => {
                log::warn!("Cannot read members of {}: {}", self.id.short(), e);
                Vec::new()
            }
        }
    }

    /// Uris present at genesis.
    pub fn initial_members(&self) -> Vec<String> {
        match self.tree_at(&self.id) {
            Ok(tree) => tree.uris().into_iter().collect(),
            Err(e) => {
                log::warn!("Cannot read genesis of {}: {}", self.id.short(), e);
                Vec::new()
            }
        }
    }

    pub fn is_banned_member(&self, uri: &str) -> bool {
        self.members()
            .iter()
            .any(|m| m.uri == uri && m.role == Role::Banned)
    }

    pub fn is_banned_device(&self, device: &DeviceId) -> bool {
        self.head()
            .and_then(|head| self.tree_at(&head).ok())
            .map(|tree| tree.is_device_banned(device))
            .unwrap_or(false)
    }

    /// Delete every object and ref of this conversation.
    pub fn erase(&self) -> Result<()> {
        let _guard = self.write_guard();
        self.store.erase()?;
        lock(&self.validated).clear();
        *lock(&self.members_cache) = None;
        log::info!("Erased conversation {}", self.id.short());
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
