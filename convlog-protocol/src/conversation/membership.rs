/// Membership vocabulary: roles, conversation modes, members and the ban
/// quorum rule.
///
/// Membership is never stored as independent state: the current member list
/// is read out of the membership tree of a commit (see `tree`), which is the
/// fold of every membership-affecting commit from genesis up to that commit.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

// ---------------------------------------------------------------------------
// Role
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Role {
    Admin = 0,
    Member = 1,
    Invited = 2,
    Banned = 3,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Admin => "admin",
            Role::Member => "member",
            Role::Invited => "invited",
            Role::Banned => "banned",
        }
    }

    /// Whether this role may write messages, votes and merges.
    pub fn is_active(&self) -> bool {
        matches!(self, Role::Admin | Role::Member)
    }

    /// Rank used when two branches changed the same uri differently.
    ///
    /// A ban always wins; otherwise the stronger role wins and absence loses.
    pub fn merge_rank(role: Option<Role>) -> u8 {
        match role {
            Some(Role::Banned) => 4,
            Some(Role::Admin) => 3,
            Some(Role::Member) => 2,
            Some(Role::Invited) => 1,
            None => 0,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// ConversationMode
// ---------------------------------------------------------------------------

/// Fixed at genesis; governs who may invite and whether self-join is allowed.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum ConversationMode {
    OneToOne = 0,
    AdminInvitesOnly = 1,
    #[default]
    InvitesOnly = 2,
    Public = 3,
}

impl ConversationMode {
    /// Whether `inviter` may add new uris in this mode.
    pub fn can_invite(&self, inviter: Option<Role>) -> bool {
        match self {
            ConversationMode::OneToOne => false,
            ConversationMode::AdminInvitesOnly => inviter == Some(Role::Admin),
            ConversationMode::InvitesOnly | ConversationMode::Public => {
                inviter.map(|r| r.is_active()).unwrap_or(false)
            }
        }
    }

    /// Whether an uninvited uri may join directly.
    pub fn allows_self_join(&self) -> bool {
        matches!(self, ConversationMode::Public)
    }
}

// ---------------------------------------------------------------------------
// Member
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Member {
    pub uri: String,
    pub role: Role,
}

impl Member {
    /// `{"uri": .., "role": ..}` for the application layer.
    pub fn to_map(&self) -> BTreeMap<String, String> {
        let mut map = BTreeMap::new();
        map.insert("uri".to_string(), self.uri.clone());
        map.insert("role".to_string(), self.role.as_str().to_string());
        map
    }
}

// ---------------------------------------------------------------------------
// Votes and quorum
// ---------------------------------------------------------------------------

/// What a ballot asks for.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum VoteAction {
    Ban,
    Unban,
}

impl VoteAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            VoteAction::Ban => "ban",
            VoteAction::Unban => "unban",
        }
    }
}

/// Whether a vote targets a member uri or a single device.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum TargetKind {
    Member,
    Device,
}

impl TargetKind {
    pub fn from_is_device(is_device: bool) -> Self {
        if is_device {
            TargetKind::Device
        } else {
            TargetKind::Member
        }
    }

    /// Directory name used in the membership tree.
    pub fn dir(&self) -> &'static str {
        match self {
            TargetKind::Member => "members",
            TargetKind::Device => "devices",
        }
    }
}

/// How many admin ballots resolve a vote.
///
/// `eligible` is the number of current admins that may vote: the target itself
/// is never eligible, and `MajorityIncludingTarget` still counts it in the
/// denominator.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum QuorumPolicy {
    #[default]
    MajorityExcludingTarget,
    MajorityIncludingTarget,
    Unanimous,
    /// Fixed ballot count, clamped to the eligible admins.
    Fixed(usize),
}

impl QuorumPolicy {
    pub fn required(&self, admins: usize, target_is_admin: bool) -> usize {
        let eligible = admins.saturating_sub(target_is_admin as usize);
        let required = match self {
            QuorumPolicy::MajorityExcludingTarget => eligible / 2 + 1,
            QuorumPolicy::MajorityIncludingTarget => admins / 2 + 1,
            QuorumPolicy::Unanimous => eligible,
            QuorumPolicy::Fixed(n) => (*n).min(eligible),
        };
        required.max(1)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
