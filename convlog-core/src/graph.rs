/// Commit graph walks over an object store.
///
/// Orderings are deterministic: ties between unrelated commits break on
/// `(timestamp, id)`, so every replica lists and validates a given set of
/// commits in the same order.

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};

use convlog_protocol::conversation::{Commit, CommitId};

use crate::repository::{RepositoryError, Result};
use crate::store::ObjectStore;

pub(crate) fn load(store: &dyn ObjectStore, id: &CommitId) -> Result<Commit> {
    store
        .get_commit(id)?
        .ok_or(RepositoryError::MissingCommit(*id))
}

/// Commits reachable from `starts` (inclusive), without entering any commit
/// for which `stop` holds.
pub(crate) fn collect(
    store: &dyn ObjectStore,
    starts: &[CommitId],
    stop: impl Fn(&CommitId) -> bool,
) -> Result<HashMap<CommitId, Commit>> {
    let mut found = HashMap::new();
    let mut queue: VecDeque<CommitId> = starts.iter().copied().collect();
    while let Some(id) = queue.pop_front() {
        if found.contains_key(&id) || stop(&id) {
            continue;
        }
        let commit = load(store, &id)?;
        queue.extend(commit.parents.iter().copied());
        found.insert(id, commit);
    }
    Ok(found)
}

/// Ids reachable from `start`, inclusive.
pub(crate) fn ancestor_ids(store: &dyn ObjectStore, start: &CommitId) -> Result<HashSet<CommitId>> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([*start]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        queue.extend(load(store, &id)?.parents);
    }
    Ok(seen)
}

/// Whether `ancestor` is reachable from `descendant` (a commit is its own
/// ancestor).
pub(crate) fn is_ancestor(
    store: &dyn ObjectStore,
    ancestor: &CommitId,
    descendant: &CommitId,
) -> Result<bool> {
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([*descendant]);
    while let Some(id) = queue.pop_front() {
        if id == *ancestor {
            return Ok(true);
        }
        if seen.insert(id) {
            queue.extend(load(store, &id)?.parents);
        }
    }
    Ok(false)
}

/// Best common ancestor of `a` and `b`: a common ancestor that no other
/// common ancestor descends from. Several candidates resolve to the smallest
/// id.
pub(crate) fn merge_base(
    store: &dyn ObjectStore,
    a: &CommitId,
    b: &CommitId,
) -> Result<Option<CommitId>> {
    let from_a = ancestor_ids(store, a)?;

    let mut candidates = BTreeSet::new();
    let mut seen = HashSet::new();
    let mut queue = VecDeque::from([*b]);
    while let Some(id) = queue.pop_front() {
        if !seen.insert(id) {
            continue;
        }
        if from_a.contains(&id) {
            candidates.insert(id);
            continue;
        }
        queue.extend(load(store, &id)?.parents);
    }

    // Drop candidates that are proper ancestors of other candidates
    let mut dominated = HashSet::new();
    let mut queue = VecDeque::new();
    for id in &candidates {
        queue.extend(load(store, id)?.parents);
    }
    while let Some(id) = queue.pop_front() {
        if dominated.insert(id) {
            queue.extend(load(store, &id)?.parents);
        }
    }

    Ok(candidates.into_iter().find(|id| !dominated.contains(id)))
}

/// Parents before children.
pub(crate) fn oldest_first(commits: HashMap<CommitId, Commit>) -> Vec<Commit> {
    let mut pending_parents: HashMap<CommitId, usize> = HashMap::new();
    let mut children: HashMap<CommitId, Vec<CommitId>> = HashMap::new();
    let mut ready = BTreeSet::new();
    for (id, commit) in &commits {
        let inside: Vec<&CommitId> = commit.parents.iter().filter(|p| commits.contains_key(*p)).collect();
        for parent in &inside {
            children.entry(**parent).or_default().push(*id);
        }
        if inside.is_empty() {
            ready.insert((commit.timestamp, *id));
        } else {
            pending_parents.insert(*id, inside.len());
        }
    }

    let mut commits = commits;
    let mut ordered = Vec::with_capacity(commits.len());
    while let Some((_, id)) = ready.pop_first() {
        for child in children.get(&id).into_iter().flatten() {
            if let Some(count) = pending_parents.get_mut(child) {
                *count -= 1;
                if *count == 0 {
                    if let Some(commit) = commits.get(child) {
                        ready.insert((commit.timestamp, *child));
                    }
                }
            }
        }
        if let Some(commit) = commits.remove(&id) {
            ordered.push(commit);
        }
    }
    ordered
}

/// Children before parents, siblings newest first. Stops after `to`
/// (inclusive) or after `limit` commits when `limit > 0`.
pub(crate) fn newest_first(
    commits: HashMap<CommitId, Commit>,
    to: Option<&CommitId>,
    limit: usize,
) -> Vec<Commit> {
    let mut pending_children: HashMap<CommitId, usize> = HashMap::new();
    for commit in commits.values() {
        for parent in commit.parents.iter().filter(|p| commits.contains_key(*p)) {
            *pending_children.entry(*parent).or_default() += 1;
        }
    }
    let mut ready: BTreeSet<(i64, CommitId)> = commits
        .iter()
        .filter(|(id, _)| !pending_children.contains_key(*id))
        .map(|(id, commit)| (commit.timestamp, *id))
        .collect();

    let mut commits = commits;
    let mut ordered = Vec::new();
    while let Some((_, id)) = ready.pop_last() {
        let commit = match commits.remove(&id) {
            Some(commit) => commit,
            None => continue,
        };
        for parent in &commit.parents {
            if let Some(count) = pending_children.get_mut(parent) {
                *count -= 1;
                if *count == 0 {
                    if let Some(p) = commits.get(parent) {
                        ready.insert((p.timestamp, *parent));
                    }
                }
            }
        }
        let reached_end = to == Some(&id);
        ordered.push(commit);
        if reached_end || (limit > 0 && ordered.len() >= limit) {
            break;
        }
    }
    ordered
}
