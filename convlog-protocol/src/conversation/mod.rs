/// Conversation logs: signed, content-addressed commit graphs with membership.
///
/// A conversation is a DAG of immutable commits rooted at a genesis commit
/// whose id names the conversation. Every commit carries the membership tree
/// it produces; replicas validate each other's commits by recomputing that
/// tree through the policy engine, and reconcile divergent branches with a
/// deterministic three-way merge.
///
/// # Module structure
/// - `ids`: DeviceId, CommitId, TreeId and member uris
/// - `limits`: Guardrail constants and history limit checking
/// - `membership`: Roles, modes, members, vote targets and quorum policy
/// - `tree`: Membership tree, its content address and `--stat` diffs
/// - `commit`: Commit header/body/envelope, signing and verification
/// - `merge`: Three-way membership merge
/// - `policy`: Admission rules (Rejection, admit, apply, merge_tree)
pub mod commit;
pub mod ids;
pub mod limits;
pub mod membership;
pub mod merge;
pub mod policy;
pub mod tree;

// Re-export core types for convenience
pub use commit::{
    cbor_decode, cbor_encode, commit_id, Author, Commit, CommitBody, CommitEnvelope, CommitError,
    CommitHeader, MemberAction, COMMIT_DOMAIN,
};
pub use ids::{account_uri, is_valid_uri, CommitId, ConversationId, DeviceId, TreeId};
pub use limits::{check_history_limits, HistoryStatus};
pub use membership::{ConversationMode, Member, QuorumPolicy, Role, TargetKind, VoteAction};
pub use merge::three_way;
pub use policy::{
    admit, apply, genesis_tree, merge_tree, tally, ParentState, PolicyContext, Rejection,
    RejectionKind,
};
pub use tree::{changed_files, ChangeKind, FileChange, Tree, TreeDiff};
