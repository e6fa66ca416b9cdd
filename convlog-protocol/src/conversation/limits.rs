/// Conversation log guardrails.
///
/// These constants bound commit size, fetch size and history growth so that a
/// hostile peer cannot make a replica allocate without limit.

/// Max CBOR body size per commit (text, membership edit, ballot).
pub const MAX_COMMIT_BODY_BYTES: usize = 64 * 1024; // 64 KB

/// Max serialized envelope: body limit + header overhead (certificate,
/// parents, author, message).
pub const MAX_ENVELOPE_BYTES: usize = MAX_COMMIT_BODY_BYTES + 8 * 1024;

/// Max length of the free-form commit message.
pub const MAX_COMMIT_MSG_BYTES: usize = 4 * 1024;

/// Default max commits accepted from one peer in a single fetch.
pub const MAX_COMMITS_PER_FETCH: usize = 10_000;

/// History size at which replicas should warn (compaction is not supported).
pub const SOFT_CAP_COMMITS: usize = 250_000;

/// History size beyond which fetched branches are refused.
pub const HARD_CAP_COMMITS: usize = 1_000_000;

/// History size status for a conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HistoryStatus {
    /// Under soft cap.
    Ok,
    /// Large: still accepted, but worth surfacing.
    Large,
    /// Hard cap reached: refuse further fetched commits.
    HardCapReached,
}

/// Classify a history of `commit_count` commits.
pub fn check_history_limits(commit_count: usize) -> HistoryStatus {
    if commit_count >= HARD_CAP_COMMITS {
        HistoryStatus::HardCapReached
    } else if commit_count >= SOFT_CAP_COMMITS {
        HistoryStatus::Large
    } else {
        HistoryStatus::Ok
    }
}
