/// Membership tree: the materialized membership state after a commit.
///
/// A tree is a sorted map of logical paths to small blobs:
///
/// ```text
/// admins/<uri>                         role files (a uri lives in exactly one)
/// members/<uri>
/// invited/<uri>
/// banned/members/<uri>
/// devices/<device>                     blob = owning uri
/// banned/devices/<device>              blob = owning uri
/// votes/<ban|unban>/<members|devices>/<target>/<voter>
/// ```
///
/// Every commit names the tree it produces, so two replicas agree on
/// membership exactly when they agree on the head's tree id. Diffs between
/// trees are rendered in the familiar `--stat` layout.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::conversation::ids::{DeviceId, TreeId};
use crate::conversation::membership::{Member, Role, TargetKind, VoteAction};

const ADMINS: &str = "admins";
const MEMBERS: &str = "members";
const INVITED: &str = "invited";
const BANNED_MEMBERS: &str = "banned/members";
const BANNED_DEVICES: &str = "banned/devices";
const DEVICES: &str = "devices";
const VOTES: &str = "votes";

const ROLE_DIRS: [(Role, &str); 4] = [
    (Role::Admin, ADMINS),
    (Role::Member, MEMBERS),
    (Role::Invited, INVITED),
    (Role::Banned, BANNED_MEMBERS),
];

fn role_dir(role: Role) -> &'static str {
    match role {
        Role::Admin => ADMINS,
        Role::Member => MEMBERS,
        Role::Invited => INVITED,
        Role::Banned => BANNED_MEMBERS,
    }
}

fn ballot_dir(action: VoteAction, kind: TargetKind, target: &str) -> String {
    format!("{}/{}/{}/{}/", VOTES, action.as_str(), kind.dir(), target)
}

// ---------------------------------------------------------------------------
// Tree
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct Tree {
    entries: BTreeMap<String, Vec<u8>>,
}

impl Tree {
    pub fn new() -> Self {
        Tree::default()
    }

    /// Content address: BLAKE3 over length-prefixed (path, blob) pairs in
    /// path order.
    pub fn id(&self) -> TreeId {
        let mut hasher = blake3::Hasher::new();
        hasher.update(b"convlog/tree/v1");
        for (path, blob) in &self.entries {
            hasher.update(&(path.len() as u64).to_le_bytes());
            hasher.update(path.as_bytes());
            hasher.update(&(blob.len() as u64).to_le_bytes());
            hasher.update(blob);
        }
        TreeId(*hasher.finalize().as_bytes())
    }

    pub fn entries(&self) -> &BTreeMap<String, Vec<u8>> {
        &self.entries
    }

    pub fn get(&self, path: &str) -> Option<&Vec<u8>> {
        self.entries.get(path)
    }

    pub fn insert(&mut self, path: String, blob: Vec<u8>) {
        self.entries.insert(path, blob);
    }

    pub fn remove(&mut self, path: &str) -> Option<Vec<u8>> {
        self.entries.remove(path)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn remove_prefix(&mut self, prefix: &str) {
        self.entries.retain(|path, _| !path.starts_with(prefix));
    }

    // -----------------------------------------------------------------------
    // Roles
    // -----------------------------------------------------------------------

    pub fn role_of(&self, uri: &str) -> Option<Role> {
        ROLE_DIRS
            .iter()
            .find(|(_, dir)| self.entries.contains_key(&format!("{}/{}", dir, uri)))
            .map(|(role, _)| *role)
    }

    /// Move `uri` to `role` (or out of the conversation for `None`).
    pub fn set_role(&mut self, uri: &str, role: Option<Role>) {
        for (_, dir) in ROLE_DIRS {
            self.entries.remove(&format!("{}/{}", dir, uri));
        }
        if let Some(role) = role {
            self.entries
                .insert(format!("{}/{}", role_dir(role), uri), uri.as_bytes().to_vec());
        }
    }

    /// Every uri holding any role, banned included.
    pub fn uris(&self) -> BTreeSet<String> {
        let mut uris = BTreeSet::new();
        for (_, dir) in ROLE_DIRS {
            let prefix = format!("{}/", dir);
            for path in self.entries.keys() {
                if let Some(uri) = path.strip_prefix(&prefix) {
                    if !uri.contains('/') {
                        uris.insert(uri.to_string());
                    }
                }
            }
        }
        uris
    }

    /// Members sorted by uri.
    pub fn members(&self) -> Vec<Member> {
        self.uris()
            .into_iter()
            .filter_map(|uri| self.role_of(&uri).map(|role| Member { uri, role }))
            .collect()
    }

    pub fn admin_count(&self) -> usize {
        let prefix = format!("{}/", ADMINS);
        self.entries.keys().filter(|p| p.starts_with(&prefix)).count()
    }

    // -----------------------------------------------------------------------
    // Devices
    // -----------------------------------------------------------------------

    pub fn device_owner(&self, device: &DeviceId) -> Option<String> {
        self.entries
            .get(&format!("{}/{}", DEVICES, device.to_hex()))
            .map(|blob| String::from_utf8_lossy(blob).into_owned())
    }

    pub fn register_device(&mut self, device: &DeviceId, uri: &str) {
        self.entries.insert(
            format!("{}/{}", DEVICES, device.to_hex()),
            uri.as_bytes().to_vec(),
        );
    }

    pub fn devices_of(&self, uri: &str) -> Vec<DeviceId> {
        let prefix = format!("{}/", DEVICES);
        self.entries
            .iter()
            .filter(|(_, owner)| owner.as_slice() == uri.as_bytes())
            .filter_map(|(path, _)| path.strip_prefix(&prefix))
            .filter_map(|hex| DeviceId::from_hex(hex).ok())
            .collect()
    }

    pub fn remove_devices_of(&mut self, uri: &str) {
        for device in self.devices_of(uri) {
            self.entries.remove(&format!("{}/{}", DEVICES, device.to_hex()));
        }
    }

    pub fn is_device_banned(&self, device: &DeviceId) -> bool {
        self.entries
            .contains_key(&format!("{}/{}", BANNED_DEVICES, device.to_hex()))
    }

    /// Banned device entries keep the owner so an unban can restore it.
    pub fn banned_device_owner(&self, device: &DeviceId) -> Option<String> {
        self.entries
            .get(&format!("{}/{}", BANNED_DEVICES, device.to_hex()))
            .map(|blob| String::from_utf8_lossy(blob).into_owned())
    }

    pub fn ban_device(&mut self, device: &DeviceId, owner: &str) {
        self.entries
            .remove(&format!("{}/{}", DEVICES, device.to_hex()));
        self.entries.insert(
            format!("{}/{}", BANNED_DEVICES, device.to_hex()),
            owner.as_bytes().to_vec(),
        );
    }

    pub fn unban_device(&mut self, device: &DeviceId) {
        self.entries
            .remove(&format!("{}/{}", BANNED_DEVICES, device.to_hex()));
    }

    /// Devices banned while owned by `uri`.
    pub fn banned_devices_of(&self, uri: &str) -> Vec<DeviceId> {
        let prefix = format!("{}/", BANNED_DEVICES);
        self.entries
            .iter()
            .filter(|(_, owner)| owner.as_slice() == uri.as_bytes())
            .filter_map(|(path, _)| path.strip_prefix(&prefix))
            .filter_map(|hex| DeviceId::from_hex(hex).ok())
            .collect()
    }

    fn banned_devices(&self) -> Vec<DeviceId> {
        let prefix = format!("{}/", BANNED_DEVICES);
        self.entries
            .keys()
            .filter_map(|p| p.strip_prefix(&prefix))
            .filter_map(|hex| DeviceId::from_hex(hex).ok())
            .collect()
    }

    // -----------------------------------------------------------------------
    // Ballots
    // -----------------------------------------------------------------------

    /// Uris that voted for (action, kind, target).
    pub fn ballots(&self, action: VoteAction, kind: TargetKind, target: &str) -> Vec<String> {
        let prefix = ballot_dir(action, kind, target);
        self.entries
            .keys()
            .filter_map(|p| p.strip_prefix(&prefix))
            .map(|voter| voter.to_string())
            .collect()
    }

    pub fn cast_ballot(&mut self, action: VoteAction, kind: TargetKind, target: &str, voter: &str) {
        let path = format!("{}{}", ballot_dir(action, kind, target), voter);
        self.entries.insert(path, voter.as_bytes().to_vec());
    }

    pub fn clear_ballots(&mut self, action: VoteAction, kind: TargetKind, target: &str) {
        self.remove_prefix(&ballot_dir(action, kind, target));
    }

    /// Enforce the invariants that follow a ban: the devices of a banned uri
    /// are banned with it, a banned uri has no pending ban ballots, and a
    /// banned device is not registered.
    pub fn normalize(&mut self) {
        let banned_prefix = format!("{}/", BANNED_MEMBERS);
        let banned_uris: Vec<String> = self
            .entries
            .keys()
            .filter_map(|p| p.strip_prefix(&banned_prefix))
            .map(|u| u.to_string())
            .collect();
        for uri in banned_uris {
            for device in self.devices_of(&uri) {
                self.ban_device(&device, &uri);
            }
            self.clear_ballots(VoteAction::Ban, TargetKind::Member, &uri);
        }
        for device in self.banned_devices() {
            self.entries.remove(&format!("{}/{}", DEVICES, device.to_hex()));
            self.clear_ballots(VoteAction::Ban, TargetKind::Device, &device.to_hex());
        }
    }

    /// Non-role paths, for the generic part of a three-way merge.
    pub fn non_role_paths(&self) -> impl Iterator<Item = &String> {
        self.entries.keys().filter(|p| {
            !ROLE_DIRS
                .iter()
                .any(|(_, dir)| p.strip_prefix(dir).map(|r| r.starts_with('/')).unwrap_or(false))
        })
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }
}

// ---------------------------------------------------------------------------
// Diff
// ---------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
}

/// Structural difference between two trees. `Display` renders `--stat` text.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct TreeDiff {
    pub changes: Vec<FileChange>,
}

impl TreeDiff {
    pub fn between(old: &Tree, new: &Tree) -> Self {
        let mut changes = Vec::new();
        let paths: BTreeSet<&String> = old.entries.keys().chain(new.entries.keys()).collect();
        for path in paths {
            let kind = match (old.entries.get(path), new.entries.get(path)) {
                (None, Some(_)) => ChangeKind::Added,
                (Some(_), None) => ChangeKind::Removed,
                (Some(a), Some(b)) if a != b => ChangeKind::Modified,
                _ => continue,
            };
            changes.push(FileChange {
                path: path.clone(),
                kind,
            });
        }
        TreeDiff { changes }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }
}

impl fmt::Display for TreeDiff {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (mut insertions, mut deletions) = (0usize, 0usize);
        for change in &self.changes {
            let (count, marks) = match change.kind {
                ChangeKind::Added => {
                    insertions += 1;
                    (1, "+")
                }
                ChangeKind::Removed => {
                    deletions += 1;
                    (1, "-")
                }
                ChangeKind::Modified => {
                    insertions += 1;
                    deletions += 1;
                    (2, "+-")
                }
            };
            writeln!(f, " {} | {} {}", change.path, count, marks)?;
        }
        let files = self.changes.len();
        writeln!(
            f,
            " {} file{} changed, {} insertion{}(+), {} deletion{}(-)",
            files,
            if files == 1 { "" } else { "s" },
            insertions,
            if insertions == 1 { "" } else { "s" },
            deletions,
            if deletions == 1 { "" } else { "s" },
        )
    }
}

/// Extract the changed paths from `--stat` text.
pub fn changed_files(stats: &str) -> Vec<String> {
    stats
        .lines()
        .filter_map(|line| line.split_once(" | "))
        .map(|(path, _)| path.trim().to_string())
        .filter(|path| !path.is_empty())
        .collect()
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
