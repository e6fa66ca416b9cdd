/// Policy engine: decides whether a commit may extend a conversation.
///
/// Every commit, local or fetched, goes through the same two steps:
///
/// 1. `admit` checks integrity: signature, device certificate, parent count
///    and genesis shape.
/// 2. The body is applied to the parent tree (`apply`, `genesis_tree` or
///    `merge_tree`). Role, mode and ban rules are enforced here; the result is
///    the tree the commit must name.
///
/// Local mutations call step 2 to compute the tree before signing, so a
/// commit this replica creates is admitted by every other replica exactly
/// when it would be admitted locally.

use thiserror::Error;

use crate::conversation::commit::{Author, Commit, CommitBody, MemberAction};
use crate::conversation::ids::{is_valid_uri, CommitId, DeviceId};
use crate::conversation::membership::{ConversationMode, QuorumPolicy, Role, TargetKind, VoteAction};
use crate::conversation::merge::three_way;
use crate::conversation::tree::Tree;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum Rejection {
    #[error("Bad signature or certificate: {0}")]
    BadSignature(String),

    #[error("Wrong number of parents for commit type")]
    WrongParentCount,

    #[error("Missing parent {0:?}")]
    MissingParent(CommitId),

    #[error("Commit tree does not match the computed membership")]
    TreeMismatch,

    #[error("Genesis does not match the conversation")]
    GenesisMismatch,

    #[error("Author is banned")]
    AuthorBanned,

    #[error("Device is banned")]
    DeviceBanned,

    #[error("Device is registered to another member")]
    DeviceHijack,

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Conversation mode forbids this change")]
    ModeForbids,

    #[error("Target is banned")]
    TargetBanned,

    #[error("Target is already present")]
    AlreadyPresent,

    #[error("Not invited")]
    NotInvited,

    #[error("Invalid target: {0}")]
    InvalidTarget(String),

    #[error("Ballot already cast")]
    AlreadyVoted,

    #[error("Quorum not reached ({have}/{need})")]
    QuorumNotReached { have: usize, need: usize },

    #[error("Initial commit outside genesis")]
    UnexpectedInitial,
}

/// The two failure classes peers care about: an integrity failure aborts the
/// whole fetched batch, a policy rejection is a denied operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectionKind {
    Integrity,
    Policy,
}

impl Rejection {
    pub fn kind(&self) -> RejectionKind {
        match self {
            Rejection::BadSignature(_)
            | Rejection::WrongParentCount
            | Rejection::MissingParent(_)
            | Rejection::TreeMismatch
            | Rejection::GenesisMismatch
            | Rejection::UnexpectedInitial => RejectionKind::Integrity,
            _ => RejectionKind::Policy,
        }
    }
}

// ---------------------------------------------------------------------------
// Context
// ---------------------------------------------------------------------------

/// Conversation-wide inputs to every decision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct PolicyContext {
    pub mode: ConversationMode,
    pub quorum: QuorumPolicy,
}

impl PolicyContext {
    pub fn new(mode: ConversationMode, quorum: QuorumPolicy) -> Self {
        PolicyContext { mode, quorum }
    }
}

/// Trees of a commit's parents, resolved by the caller.
pub enum ParentState<'a> {
    Genesis,
    Single(&'a Tree),
    Merge {
        ours: &'a Tree,
        theirs: &'a Tree,
        base: &'a Tree,
    },
}

// ---------------------------------------------------------------------------
// Admission
// ---------------------------------------------------------------------------

/// Validate `commit` on top of its parents and return the tree it produces.
pub fn admit(commit: &Commit, ctx: &PolicyContext, parents: ParentState<'_>) -> Result<Tree, Rejection> {
    commit
        .verify()
        .map_err(|e| Rejection::BadSignature(e.to_string()))?;
    if commit.parents.len() != commit.body.expected_parents() {
        return Err(Rejection::WrongParentCount);
    }
    if commit.is_merge() && commit.parents[0] == commit.parents[1] {
        return Err(Rejection::WrongParentCount);
    }

    let tree = match (parents, &commit.body) {
        (ParentState::Genesis, CommitBody::Initial { mode, other_member }) => {
            if *mode != ctx.mode {
                return Err(Rejection::GenesisMismatch);
            }
            genesis_tree(&commit.author, *mode, other_member.as_deref())?
        }
        (ParentState::Single(parent), body) => apply(ctx, parent, &commit.author, body)?,
        (ParentState::Merge { ours, theirs, base }, CommitBody::Merge) => {
            merge_tree(base, ours, theirs, &commit.author)?
        }
        _ => return Err(Rejection::WrongParentCount),
    };

    if tree.id() != commit.tree {
        log::warn!(
            "Commit {} names tree {} but policy computed {}",
            commit.id.short(),
            commit.tree.short(),
            tree.id().short()
        );
        return Err(Rejection::TreeMismatch);
    }
    Ok(tree)
}

/// Membership right after creation: the creator is the only admin.
pub fn genesis_tree(
    author: &Author,
    mode: ConversationMode,
    other_member: Option<&str>,
) -> Result<Tree, Rejection> {
    let mut tree = Tree::new();
    tree.set_role(&author.uri, Some(Role::Admin));
    tree.register_device(&author.device, &author.uri);

    match (mode, other_member) {
        (ConversationMode::OneToOne, Some(other)) => {
            if !is_valid_uri(other) || other == author.uri {
                return Err(Rejection::InvalidTarget(other.to_string()));
            }
            tree.set_role(other, Some(Role::Invited));
        }
        (ConversationMode::OneToOne, None) => {
            return Err(Rejection::InvalidTarget("one-to-one needs a peer".into()));
        }
        (_, Some(other)) => return Err(Rejection::InvalidTarget(other.to_string())),
        (_, None) => {}
    }
    Ok(tree)
}

/// Apply a single-parent commit body to `parent`.
pub fn apply(
    ctx: &PolicyContext,
    parent: &Tree,
    author: &Author,
    body: &CommitBody,
) -> Result<Tree, Rejection> {
    let role = authorize(parent, author)?;
    let mut tree = parent.clone();

    match body {
        CommitBody::Initial { .. } => return Err(Rejection::UnexpectedInitial),
        CommitBody::Merge => return Err(Rejection::WrongParentCount),
        CommitBody::Text { .. } => require_active(role)?,
        CommitBody::Member { action, uri } => {
            apply_member(ctx, &mut tree, author, role, *action, uri)?
        }
        CommitBody::Vote {
            action,
            kind,
            target,
        } => {
            let target = canonical_target(*kind, target)?;
            apply_vote(&mut tree, author, role, *action, *kind, &target)?
        }
        CommitBody::Resolution {
            action,
            kind,
            target,
        } => {
            let target = canonical_target(*kind, target)?;
            apply_resolution(ctx, &mut tree, role, *action, *kind, &target)?
        }
    }

    register_author(&mut tree, author);
    tree.normalize();
    Ok(tree)
}

/// Tree of a merge commit authored by `author`.
pub fn merge_tree(base: &Tree, ours: &Tree, theirs: &Tree, author: &Author) -> Result<Tree, Rejection> {
    let mut tree = three_way(base, ours, theirs);
    let role = authorize(&tree, author)?;
    require_active(role)?;
    register_author(&mut tree, author);
    tree.normalize();
    Ok(tree)
}

// ---------------------------------------------------------------------------
// Rules
// ---------------------------------------------------------------------------

/// Ban and device checks shared by every commit. Returns the author's role.
fn authorize(tree: &Tree, author: &Author) -> Result<Option<Role>, Rejection> {
    let role = tree.role_of(&author.uri);
    if role == Some(Role::Banned) {
        return Err(Rejection::AuthorBanned);
    }
    if tree.is_device_banned(&author.device) {
        return Err(Rejection::DeviceBanned);
    }
    if let Some(owner) = tree.device_owner(&author.device) {
        if owner != author.uri {
            return Err(Rejection::DeviceHijack);
        }
    }
    Ok(role)
}

fn require_active(role: Option<Role>) -> Result<(), Rejection> {
    match role {
        Some(r) if r.is_active() => Ok(()),
        _ => Err(Rejection::Unauthorized("not an active member".into())),
    }
}

fn require_admin(role: Option<Role>) -> Result<(), Rejection> {
    if role == Some(Role::Admin) {
        Ok(())
    } else {
        Err(Rejection::Unauthorized("admin role required".into()))
    }
}

fn register_author(tree: &mut Tree, author: &Author) {
    let present = matches!(tree.role_of(&author.uri), Some(r) if r != Role::Banned);
    if present && !tree.is_device_banned(&author.device) {
        tree.register_device(&author.device, &author.uri);
    }
}

fn apply_member(
    ctx: &PolicyContext,
    tree: &mut Tree,
    author: &Author,
    role: Option<Role>,
    action: MemberAction,
    uri: &str,
) -> Result<(), Rejection> {
    if !is_valid_uri(uri) {
        return Err(Rejection::InvalidTarget(uri.to_string()));
    }
    let target = tree.role_of(uri);

    match action {
        MemberAction::Add => {
            if ctx.mode == ConversationMode::OneToOne {
                return Err(Rejection::ModeForbids);
            }
            if !ctx.mode.can_invite(role) {
                return Err(Rejection::Unauthorized("mode does not allow this inviter".into()));
            }
            match target {
                Some(Role::Banned) => return Err(Rejection::TargetBanned),
                Some(_) => return Err(Rejection::AlreadyPresent),
                None => tree.set_role(uri, Some(Role::Invited)),
            }
        }
        MemberAction::Join => {
            if uri != author.uri {
                return Err(Rejection::Unauthorized("join is for the author only".into()));
            }
            match target {
                Some(Role::Invited) => tree.set_role(uri, Some(Role::Member)),
                None if ctx.mode.allows_self_join() => tree.set_role(uri, Some(Role::Member)),
                None => return Err(Rejection::NotInvited),
                Some(_) => return Err(Rejection::AlreadyPresent),
            }
        }
        MemberAction::Leave => {
            if uri != author.uri {
                return Err(Rejection::Unauthorized("leave is for the author only".into()));
            }
            if target.is_none() {
                return Err(Rejection::Unauthorized("not a member".into()));
            }
            tree.set_role(uri, None);
            tree.remove_devices_of(uri);
        }
        MemberAction::Promote => {
            require_admin(role)?;
            match target {
                Some(Role::Member) => tree.set_role(uri, Some(Role::Admin)),
                Some(Role::Banned) => return Err(Rejection::TargetBanned),
                Some(Role::Admin) => return Err(Rejection::AlreadyPresent),
                _ => return Err(Rejection::InvalidTarget(uri.to_string())),
            }
        }
        MemberAction::Demote => {
            require_admin(role)?;
            if uri == author.uri || target != Some(Role::Admin) {
                return Err(Rejection::InvalidTarget(uri.to_string()));
            }
            tree.set_role(uri, Some(Role::Member));
        }
    }
    Ok(())
}

/// Ballot key for a target. Device ids are keyed by their lowercase hex so
/// that every spelling of one device lands on the same ballot.
fn canonical_target(kind: TargetKind, target: &str) -> Result<String, Rejection> {
    match kind {
        TargetKind::Member => Ok(target.to_string()),
        TargetKind::Device => DeviceId::from_hex(target)
            .map(|device| device.to_hex())
            .map_err(|_| Rejection::InvalidTarget(target.to_string())),
    }
}

/// Target of a device vote, with the uri that owns (or owned) it.
fn device_target(tree: &Tree, target: &str) -> Result<(DeviceId, Option<String>), Rejection> {
    let device =
        DeviceId::from_hex(target).map_err(|_| Rejection::InvalidTarget(target.to_string()))?;
    let owner = tree
        .device_owner(&device)
        .or_else(|| tree.banned_device_owner(&device));
    Ok((device, owner))
}

/// Check that (action, kind, target) names something the action applies to.
fn check_target(tree: &Tree, action: VoteAction, kind: TargetKind, target: &str) -> Result<(), Rejection> {
    match (action, kind) {
        (VoteAction::Ban, TargetKind::Member) => match tree.role_of(target) {
            Some(Role::Banned) => Err(Rejection::TargetBanned),
            Some(_) => Ok(()),
            None => Err(Rejection::InvalidTarget(target.to_string())),
        },
        (VoteAction::Unban, TargetKind::Member) => match tree.role_of(target) {
            Some(Role::Banned) => Ok(()),
            _ => Err(Rejection::InvalidTarget(target.to_string())),
        },
        (VoteAction::Ban, TargetKind::Device) => {
            let (device, _) = device_target(tree, target)?;
            if tree.is_device_banned(&device) {
                Err(Rejection::TargetBanned)
            } else if tree.device_owner(&device).is_none() {
                Err(Rejection::InvalidTarget(target.to_string()))
            } else {
                Ok(())
            }
        }
        (VoteAction::Unban, TargetKind::Device) => {
            let (device, _) = device_target(tree, target)?;
            if tree.is_device_banned(&device) {
                Ok(())
            } else {
                Err(Rejection::InvalidTarget(target.to_string()))
            }
        }
    }
}

/// The uri that must not vote on, or count towards, a vote on `target`.
fn target_uri(tree: &Tree, kind: TargetKind, target: &str) -> Result<Option<String>, Rejection> {
    match kind {
        TargetKind::Member => Ok(Some(target.to_string())),
        TargetKind::Device => Ok(device_target(tree, target)?.1),
    }
}

fn apply_vote(
    tree: &mut Tree,
    author: &Author,
    role: Option<Role>,
    action: VoteAction,
    kind: TargetKind,
    target: &str,
) -> Result<(), Rejection> {
    require_admin(role)?;
    check_target(tree, action, kind, target)?;
    if target_uri(tree, kind, target)?.as_deref() == Some(author.uri.as_str()) {
        return Err(Rejection::InvalidTarget("cannot vote on yourself".into()));
    }
    if tree.ballots(action, kind, target).contains(&author.uri) {
        return Err(Rejection::AlreadyVoted);
    }
    tree.cast_ballot(action, kind, target, &author.uri);
    Ok(())
}

/// Ballots that count now: cast by a current admin who is not the target.
pub fn tally(
    tree: &Tree,
    quorum: QuorumPolicy,
    action: VoteAction,
    kind: TargetKind,
    target: &str,
) -> Result<(usize, usize), Rejection> {
    let target = canonical_target(kind, target)?;
    let excluded = target_uri(tree, kind, &target)?;
    let have = tree
        .ballots(action, kind, &target)
        .iter()
        .filter(|voter| tree.role_of(voter) == Some(Role::Admin))
        .filter(|voter| Some(voter.as_str()) != excluded.as_deref())
        .count();
    let target_is_admin = excluded
        .as_deref()
        .map(|uri| tree.role_of(uri) == Some(Role::Admin))
        .unwrap_or(false);
    let need = quorum.required(tree.admin_count(), target_is_admin);
    Ok((have, need))
}

fn apply_resolution(
    ctx: &PolicyContext,
    tree: &mut Tree,
    role: Option<Role>,
    action: VoteAction,
    kind: TargetKind,
    target: &str,
) -> Result<(), Rejection> {
    require_admin(role)?;
    check_target(tree, action, kind, target)?;
    let (have, need) = tally(tree, ctx.quorum, action, kind, target)?;
    if have < need {
        return Err(Rejection::QuorumNotReached { have, need });
    }

    match (action, kind) {
        (VoteAction::Ban, TargetKind::Member) => {
            tree.set_role(target, Some(Role::Banned));
        }
        (VoteAction::Unban, TargetKind::Member) => {
            tree.set_role(target, Some(Role::Invited));
            for device in tree.banned_devices_of(target) {
                tree.unban_device(&device);
            }
            tree.clear_ballots(VoteAction::Unban, kind, target);
        }
        (VoteAction::Ban, TargetKind::Device) => {
            let (device, owner) = device_target(tree, target)?;
            tree.ban_device(&device, owner.as_deref().unwrap_or_default());
        }
        (VoteAction::Unban, TargetKind::Device) => {
            let (device, _) = device_target(tree, target)?;
            tree.unban_device(&device);
            tree.clear_ballots(VoteAction::Unban, kind, target);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::conversation::ids::TreeId;
    use crate::crypto::identity::LocalIdentity;

    fn identity(name: &str) -> LocalIdentity {
        LocalIdentity::generate(name).unwrap()
    }

    fn member(action: MemberAction, uri: &str) -> CommitBody {
        CommitBody::Member {
            action,
            uri: uri.to_string(),
        }
    }

    fn text() -> CommitBody {
        CommitBody::Text {
            mime: "text/plain".into(),
            body: "hi".into(),
        }
    }

    fn vote(action: VoteAction, kind: TargetKind, target: &str) -> CommitBody {
        CommitBody::Vote {
            action,
            kind,
            target: target.to_string(),
        }
    }

    fn resolve(action: VoteAction, kind: TargetKind, target: &str) -> CommitBody {
        CommitBody::Resolution {
            action,
            kind,
            target: target.to_string(),
        }
    }

    /// Applies bodies in sequence, keeping the tree of the last success.
    struct Fixture {
        ctx: PolicyContext,
        tree: Tree,
    }

    impl Fixture {
        fn new(creator: &LocalIdentity, mode: ConversationMode) -> Self {
            let tree = genesis_tree(&Author::from_identity(creator), mode, None).unwrap();
            Fixture {
                ctx: PolicyContext::new(mode, QuorumPolicy::default()),
                tree,
            }
        }

        fn act(&mut self, who: &LocalIdentity, body: CommitBody) -> Result<(), Rejection> {
            self.tree = apply(&self.ctx, &self.tree, &Author::from_identity(who), &body)?;
            Ok(())
        }

        fn admit_member(&mut self, admin: &LocalIdentity, who: &LocalIdentity) {
            self.act(admin, member(MemberAction::Add, &who.uri())).unwrap();
            self.act(who, member(MemberAction::Join, &who.uri())).unwrap();
        }

        fn admit_admin(&mut self, admin: &LocalIdentity, who: &LocalIdentity) {
            self.admit_member(admin, who);
            self.act(admin, member(MemberAction::Promote, &who.uri())).unwrap();
        }

        fn role(&self, who: &LocalIdentity) -> Option<Role> {
            self.tree.role_of(&who.uri())
        }
    }

    #[test]
    fn test_genesis_tree() {
        let alice = identity("alice");
        let author = Author::from_identity(&alice);

        let tree = genesis_tree(&author, ConversationMode::InvitesOnly, None).unwrap();
        assert_eq!(tree.role_of(&alice.uri()), Some(Role::Admin));
        assert_eq!(tree.device_owner(&alice.device_id()), Some(alice.uri()));

        let bob = identity("bob");
        let tree = genesis_tree(&author, ConversationMode::OneToOne, Some(bob.uri().as_str())).unwrap();
        assert_eq!(tree.role_of(&bob.uri()), Some(Role::Invited));

        assert!(genesis_tree(&author, ConversationMode::OneToOne, None).is_err());
        assert!(genesis_tree(&author, ConversationMode::OneToOne, Some(alice.uri().as_str())).is_err());
        assert!(genesis_tree(&author, ConversationMode::Public, Some(bob.uri().as_str())).is_err());
    }

    #[test]
    fn test_admin_invites_only_flow() {
        let (alice, bob, carol) = (identity("alice"), identity("bob"), identity("carol"));
        let mut fx = Fixture::new(&alice, ConversationMode::AdminInvitesOnly);

        fx.act(&alice, member(MemberAction::Add, &bob.uri())).unwrap();
        assert_eq!(fx.role(&bob), Some(Role::Invited));

        // Invited members can neither write nor invite
        assert!(matches!(fx.act(&bob, text()), Err(Rejection::Unauthorized(_))));

        fx.act(&bob, member(MemberAction::Join, &bob.uri())).unwrap();
        assert_eq!(fx.role(&bob), Some(Role::Member));
        assert_eq!(fx.tree.device_owner(&bob.device_id()), Some(bob.uri()));

        let denied = fx.act(&bob, member(MemberAction::Add, &carol.uri()));
        assert!(matches!(denied, Err(Rejection::Unauthorized(_))));
    }

    #[test]
    fn test_invites_only_lets_members_invite() {
        let (alice, bob, carol) = (identity("alice"), identity("bob"), identity("carol"));
        let mut fx = Fixture::new(&alice, ConversationMode::InvitesOnly);
        fx.admit_member(&alice, &bob);

        fx.act(&bob, member(MemberAction::Add, &carol.uri())).unwrap();
        assert_eq!(fx.role(&carol), Some(Role::Invited));
        assert_eq!(
            fx.act(&bob, member(MemberAction::Add, &carol.uri())),
            Err(Rejection::AlreadyPresent)
        );
    }

    #[test]
    fn test_self_join_only_in_public() {
        let (alice, carol) = (identity("alice"), identity("carol"));

        let mut public = Fixture::new(&alice, ConversationMode::Public);
        public.act(&carol, member(MemberAction::Join, &carol.uri())).unwrap();
        assert_eq!(public.role(&carol), Some(Role::Member));

        let mut closed = Fixture::new(&alice, ConversationMode::InvitesOnly);
        assert_eq!(
            closed.act(&carol, member(MemberAction::Join, &carol.uri())),
            Err(Rejection::NotInvited)
        );
    }

    #[test]
    fn test_join_on_behalf_of_someone_else_rejected() {
        let (alice, bob, carol) = (identity("alice"), identity("bob"), identity("carol"));
        let mut fx = Fixture::new(&alice, ConversationMode::Public);
        let denied = fx.act(&bob, member(MemberAction::Join, &carol.uri()));
        assert!(matches!(denied, Err(Rejection::Unauthorized(_))));
    }

    #[test]
    fn test_one_to_one_rejects_additions() {
        let (alice, bob, carol) = (identity("alice"), identity("bob"), identity("carol"));
        let author = Author::from_identity(&alice);
        let tree = genesis_tree(&author, ConversationMode::OneToOne, Some(bob.uri().as_str())).unwrap();
        let ctx = PolicyContext::new(ConversationMode::OneToOne, QuorumPolicy::default());

        let denied = apply(&ctx, &tree, &author, &member(MemberAction::Add, &carol.uri()));
        assert_eq!(denied, Err(Rejection::ModeForbids));

        let bob_author = Author::from_identity(&bob);
        let joined = apply(&ctx, &tree, &bob_author, &member(MemberAction::Join, &bob.uri())).unwrap();
        assert_eq!(joined.role_of(&bob.uri()), Some(Role::Member));
    }

    #[test]
    fn test_leave_removes_role_and_devices() {
        let (alice, bob) = (identity("alice"), identity("bob"));
        let mut fx = Fixture::new(&alice, ConversationMode::InvitesOnly);
        fx.admit_member(&alice, &bob);

        fx.act(&bob, member(MemberAction::Leave, &bob.uri())).unwrap();
        assert_eq!(fx.role(&bob), None);
        assert!(fx.tree.devices_of(&bob.uri()).is_empty());

        // Leaving is not a ban: bob can be invited again
        fx.act(&alice, member(MemberAction::Add, &bob.uri())).unwrap();
        assert_eq!(fx.role(&bob), Some(Role::Invited));
    }

    #[test]
    fn test_promote_and_demote() {
        let (alice, bob) = (identity("alice"), identity("bob"));
        let mut fx = Fixture::new(&alice, ConversationMode::InvitesOnly);
        fx.admit_member(&alice, &bob);

        let denied = fx.act(&bob, member(MemberAction::Promote, &bob.uri()));
        assert!(matches!(denied, Err(Rejection::Unauthorized(_))));

        fx.act(&alice, member(MemberAction::Promote, &bob.uri())).unwrap();
        assert_eq!(fx.role(&bob), Some(Role::Admin));

        let self_demote = fx.act(&bob, member(MemberAction::Demote, &bob.uri()));
        assert!(matches!(self_demote, Err(Rejection::InvalidTarget(_))));

        fx.act(&bob, member(MemberAction::Demote, &alice.uri())).unwrap();
        assert_eq!(fx.role(&alice), Some(Role::Member));
    }

    #[test]
    fn test_ban_vote_needs_quorum_once() {
        let (alice, carol, dave, bob) =
            (identity("alice"), identity("carol"), identity("dave"), identity("bob"));
        let mut fx = Fixture::new(&alice, ConversationMode::InvitesOnly);
        fx.admit_admin(&alice, &carol);
        fx.admit_admin(&alice, &dave);
        fx.admit_member(&alice, &bob);
        let target = bob.uri();
        let kind = TargetKind::Member;

        fx.act(&alice, vote(VoteAction::Ban, kind, &target)).unwrap();
        assert_eq!(
            fx.act(&alice, resolve(VoteAction::Ban, kind, &target)),
            Err(Rejection::QuorumNotReached { have: 1, need: 2 })
        );
        assert_eq!(fx.role(&bob), Some(Role::Member));

        assert_eq!(
            fx.act(&alice, vote(VoteAction::Ban, kind, &target)),
            Err(Rejection::AlreadyVoted)
        );
        fx.act(&carol, vote(VoteAction::Ban, kind, &target)).unwrap();
        fx.act(&dave, resolve(VoteAction::Ban, kind, &target)).unwrap();
        assert_eq!(fx.role(&bob), Some(Role::Banned));
        assert!(fx.tree.devices_of(&target).is_empty());
        assert!(fx.tree.ballots(VoteAction::Ban, kind, &target).is_empty());

        // Resolving again changes nothing
        assert_eq!(
            fx.act(&alice, resolve(VoteAction::Ban, kind, &target)),
            Err(Rejection::TargetBanned)
        );

        // The banned member can no longer author anything
        assert_eq!(fx.act(&bob, text()), Err(Rejection::AuthorBanned));
        assert_eq!(
            fx.act(&alice, member(MemberAction::Add, &target)),
            Err(Rejection::TargetBanned)
        );
    }

    #[test]
    fn test_ballots_of_former_admins_do_not_count() {
        let (alice, carol, dave, bob) =
            (identity("alice"), identity("carol"), identity("dave"), identity("bob"));
        let mut fx = Fixture::new(&alice, ConversationMode::InvitesOnly);
        fx.admit_admin(&alice, &carol);
        fx.admit_admin(&alice, &dave);
        fx.admit_member(&alice, &bob);
        let kind = TargetKind::Member;

        fx.act(&alice, vote(VoteAction::Ban, kind, &bob.uri())).unwrap();
        fx.act(&carol, vote(VoteAction::Ban, kind, &bob.uri())).unwrap();
        fx.act(&alice, member(MemberAction::Demote, &carol.uri())).unwrap();

        assert_eq!(
            fx.act(&alice, resolve(VoteAction::Ban, kind, &bob.uri())),
            Err(Rejection::QuorumNotReached { have: 1, need: 2 })
        );
    }

    #[test]
    fn test_vote_target_rules() {
        let (alice, bob, carol) = (identity("alice"), identity("bob"), identity("carol"));
        let mut fx = Fixture::new(&alice, ConversationMode::InvitesOnly);
        fx.admit_member(&alice, &bob);
        let kind = TargetKind::Member;

        assert!(matches!(
            fx.act(&alice, vote(VoteAction::Ban, kind, &alice.uri())),
            Err(Rejection::InvalidTarget(_))
        ));
        assert!(matches!(
            fx.act(&alice, vote(VoteAction::Ban, kind, &carol.uri())),
            Err(Rejection::InvalidTarget(_))
        ));
        assert!(matches!(
            fx.act(&alice, vote(VoteAction::Unban, kind, &bob.uri())),
            Err(Rejection::InvalidTarget(_))
        ));
        assert!(matches!(
            fx.act(&bob, vote(VoteAction::Ban, kind, &alice.uri())),
            Err(Rejection::Unauthorized(_))
        ));
    }

    #[test]
    fn test_single_admin_bans_alone() {
        let (alice, bob) = (identity("alice"), identity("bob"));
        let mut fx = Fixture::new(&alice, ConversationMode::InvitesOnly);
        fx.admit_member(&alice, &bob);

        fx.act(&alice, vote(VoteAction::Ban, TargetKind::Member, &bob.uri())).unwrap();
        fx.act(&alice, resolve(VoteAction::Ban, TargetKind::Member, &bob.uri())).unwrap();
        assert_eq!(fx.role(&bob), Some(Role::Banned));
    }

    #[test]
    fn test_unban_returns_to_invited() {
        let (alice, bob) = (identity("alice"), identity("bob"));
        let mut fx = Fixture::new(&alice, ConversationMode::InvitesOnly);
        fx.admit_member(&alice, &bob);
        let kind = TargetKind::Member;

        fx.act(&alice, vote(VoteAction::Ban, kind, &bob.uri())).unwrap();
        fx.act(&alice, resolve(VoteAction::Ban, kind, &bob.uri())).unwrap();
        assert!(fx.tree.is_device_banned(&bob.device_id()));
        assert_eq!(fx.act(&bob, text()), Err(Rejection::AuthorBanned));

        fx.act(&alice, vote(VoteAction::Unban, kind, &bob.uri())).unwrap();
        fx.act(&alice, resolve(VoteAction::Unban, kind, &bob.uri())).unwrap();

        assert_eq!(fx.role(&bob), Some(Role::Invited));
        assert!(!fx.tree.is_device_banned(&bob.device_id()));
        assert!(fx.tree.ballots(VoteAction::Unban, kind, &bob.uri()).is_empty());
        fx.act(&bob, member(MemberAction::Join, &bob.uri())).unwrap();
        assert_eq!(fx.role(&bob), Some(Role::Member));
    }

    #[test]
    fn test_device_ban_blocks_only_that_device() {
        let (alice, bob) = (identity("alice"), identity("bob"));
        let bob_phone = bob.add_device().unwrap();
        let mut fx = Fixture::new(&alice, ConversationMode::InvitesOnly);
        fx.admit_member(&alice, &bob);
        fx.act(&bob_phone, text()).unwrap();
        let phone = bob_phone.device_id().to_hex();
        let kind = TargetKind::Device;

        fx.act(&alice, vote(VoteAction::Ban, kind, &phone)).unwrap();
        fx.act(&alice, resolve(VoteAction::Ban, kind, &phone)).unwrap();

        assert!(fx.tree.is_device_banned(&bob_phone.device_id()));
        assert_eq!(fx.act(&bob_phone, text()), Err(Rejection::DeviceBanned));
        fx.act(&bob, text()).unwrap();
        assert_eq!(fx.role(&bob), Some(Role::Member));

        fx.act(&alice, vote(VoteAction::Unban, kind, &phone)).unwrap();
        fx.act(&alice, resolve(VoteAction::Unban, kind, &phone)).unwrap();
        fx.act(&bob_phone, text()).unwrap();
    }

    #[test]
    fn test_device_ballots_ignore_hex_case() {
        let (alice, bob, carol) = (identity("alice"), identity("bob"), identity("carol"));
        let mut fx = Fixture::new(&alice, ConversationMode::InvitesOnly);
        fx.admit_admin(&alice, &carol);
        fx.admit_member(&alice, &bob);
        let lower = bob.device_id().to_hex();
        let upper = lower.to_uppercase();
        let kind = TargetKind::Device;

        fx.act(&alice, vote(VoteAction::Ban, kind, &upper)).unwrap();
        assert_eq!(
            fx.act(&alice, vote(VoteAction::Ban, kind, &lower)),
            Err(Rejection::AlreadyVoted)
        );
        fx.act(&carol, vote(VoteAction::Ban, kind, &lower)).unwrap();
        assert_eq!(fx.tree.ballots(VoteAction::Ban, kind, &lower).len(), 2);
        assert_eq!(tally(&fx.tree, fx.ctx.quorum, VoteAction::Ban, kind, &upper), Ok((2, 2)));

        fx.act(&carol, resolve(VoteAction::Ban, kind, &upper)).unwrap();
        assert!(fx.tree.is_device_banned(&bob.device_id()));
    }

    #[test]
    fn test_merge_tree_rejects_banned_author() {
        let (alice, bob) = (identity("alice"), identity("bob"));
        let mut fx = Fixture::new(&alice, ConversationMode::InvitesOnly);
        fx.admit_member(&alice, &bob);
        let base = fx.tree.clone();

        fx.act(&alice, vote(VoteAction::Ban, TargetKind::Member, &bob.uri())).unwrap();
        fx.act(&alice, resolve(VoteAction::Ban, TargetKind::Member, &bob.uri())).unwrap();
        let banned = fx.tree.clone();

        let merged = merge_tree(&base, &banned, &base, &Author::from_identity(&bob));
        assert_eq!(merged, Err(Rejection::AuthorBanned));
        merge_tree(&base, &banned, &base, &Author::from_identity(&alice)).unwrap();
    }

    #[test]
    fn test_admit_checks_tree_and_shape() {
        let alice = identity("alice");
        let ctx = PolicyContext::new(ConversationMode::Public, QuorumPolicy::default());
        let initial = CommitBody::Initial {
            mode: ConversationMode::Public,
            other_member: None,
        };
        let tree = genesis_tree(&Author::from_identity(&alice), ConversationMode::Public, None).unwrap();

        let genesis = Commit::create_signed(vec![], initial.clone(), None, tree.id(), &alice).unwrap();
        assert_eq!(admit(&genesis, &ctx, ParentState::Genesis), Ok(tree.clone()));

        let wrong_tree =
            Commit::create_signed(vec![], initial, None, TreeId::from_bytes([7; 32]), &alice).unwrap();
        let rejected = admit(&wrong_tree, &ctx, ParentState::Genesis).unwrap_err();
        assert_eq!(rejected, Rejection::TreeMismatch);
        assert_eq!(rejected.kind(), RejectionKind::Integrity);

        let other_mode = PolicyContext::new(ConversationMode::InvitesOnly, QuorumPolicy::default());
        assert_eq!(
            admit(&genesis, &other_mode, ParentState::Genesis),
            Err(Rejection::GenesisMismatch)
        );

        let mut tampered = genesis.clone();
        tampered.signature[0] ^= 0xff;
        let rejected = admit(&tampered, &ctx, ParentState::Genesis).unwrap_err();
        assert!(matches!(rejected, Rejection::BadSignature(_)));
        assert_eq!(rejected.kind(), RejectionKind::Integrity);

        // A text commit without a parent is malformed
        let orphan = Commit::create_signed(vec![], text(), None, tree.id(), &alice).unwrap();
        assert_eq!(
            admit(&orphan, &ctx, ParentState::Genesis),
            Err(Rejection::WrongParentCount)
        );
    }

    #[test]
    fn test_admit_single_parent() {
        let (alice, bob) = (identity("alice"), identity("bob"));
        let ctx = PolicyContext::new(ConversationMode::Public, QuorumPolicy::default());
        let root = genesis_tree(&Author::from_identity(&alice), ConversationMode::Public, None).unwrap();
        let parent = CommitId::from_bytes([1; 32]);

        let body = member(MemberAction::Join, &bob.uri());
        let expected = apply(&ctx, &root, &Author::from_identity(&bob), &body).unwrap();
        let join = Commit::create_signed(vec![parent], body, None, expected.id(), &bob).unwrap();
        assert_eq!(admit(&join, &ctx, ParentState::Single(&root)), Ok(expected));

        // Same commit claiming a tree where bob became admin
        let mut forged_tree = root.clone();
        forged_tree.set_role(&bob.uri(), Some(Role::Admin));
        forged_tree.register_device(&bob.device_id(), &bob.uri());
        let forged = Commit::create_signed(
            vec![parent],
            member(MemberAction::Join, &bob.uri()),
            None,
            forged_tree.id(),
            &bob,
        )
        .unwrap();
        assert_eq!(
            admit(&forged, &ctx, ParentState::Single(&root)),
            Err(Rejection::TreeMismatch)
        );
    }

    #[test]
    fn test_rejection_kinds() {
        assert_eq!(Rejection::BadSignature("x".into()).kind(), RejectionKind::Integrity);
        assert_eq!(
            Rejection::MissingParent(CommitId::from_bytes([0; 32])).kind(),
            RejectionKind::Integrity
        );
        assert_eq!(Rejection::AuthorBanned.kind(), RejectionKind::Policy);
        assert_eq!(Rejection::QuorumNotReached { have: 0, need: 1 }.kind(), RejectionKind::Policy);
    }
}
