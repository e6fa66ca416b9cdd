/// Three-way merge of membership trees.
///
/// Given the trees of a merge base and of both branch tips, produce the tree
/// of the merge commit. The result depends only on the three inputs (never on
/// which side is "ours"), so every replica that merges the same two branches
/// computes the same tree and can validate peers' merge commits.
///
/// Per uri role, and per other path:
/// - both sides agree → take it
/// - only one side changed relative to the base → take that side
/// - both changed differently → roles by `Role::merge_rank` (a ban always
///   wins); other paths keep the present value, then the greater blob
///
/// The result is normalized so bans take their full effect.

use std::cmp::max;
use std::collections::BTreeSet;

use crate::conversation::membership::Role;
use crate::conversation::tree::Tree;

pub fn three_way(base: &Tree, ours: &Tree, theirs: &Tree) -> Tree {
    let mut result = Tree::new();

    let paths: BTreeSet<&String> = base
        .non_role_paths()
        .chain(ours.non_role_paths())
        .chain(theirs.non_role_paths())
        .collect();
    for path in paths {
        let (b, o, t) = (base.get(path), ours.get(path), theirs.get(path));
        if let Some(blob) = pick(b, o, t, max) {
            result.insert(path.clone(), blob.clone());
        }
    }

    let mut uris = base.uris();
    uris.extend(ours.uris());
    uris.extend(theirs.uris());
    for uri in uris {
        let (b, o, t) = (base.role_of(&uri), ours.role_of(&uri), theirs.role_of(&uri));
        let role = pick(b, o, t, |x, y| {
            if Role::merge_rank(x) >= Role::merge_rank(y) {
                x
            } else {
                y
            }
        });
        result.set_role(&uri, role);
    }

    result.normalize();
    result
}

fn pick<T: PartialEq>(base: T, ours: T, theirs: T, conflict: impl FnOnce(T, T) -> T) -> T {
    if ours == theirs || theirs == base {
        ours
    } else if ours == base {
        theirs
    } else {
        conflict(ours, theirs)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
