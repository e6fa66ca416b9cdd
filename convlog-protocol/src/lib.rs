//! # Convlog Protocol
//!
//! **Signed, content-addressed conversation logs with membership policy.**
//!
//! Each conversation is an append-only commit graph replicated between
//! devices that do not trust each other. This crate holds everything a
//! replica needs to decide, offline, whether a commit is acceptable:
//!
//! - **Device identity** (account-certified Ed25519 device keys)
//! - **Commit codec** (bincode header, CBOR body, detached signature)
//! - **Membership trees** (roles, devices, bans and ballots as a path map)
//! - **Policy engine** (mode, role, ban and quorum rules)
//! - **Three-way merge** of divergent membership
//!
//! ## Quick Start
//!
//! ```rust
//! use convlog_protocol::conversation::{genesis_tree, Author, Commit, CommitBody, ConversationMode};
//! use convlog_protocol::crypto::LocalIdentity;
//!
//! let alice = LocalIdentity::generate("alice").unwrap();
//! let mode = ConversationMode::InvitesOnly;
//! let tree = genesis_tree(&Author::from_identity(&alice), mode, None).unwrap();
//! let genesis = Commit::create_signed(
//!     vec![],
//!     CommitBody::Initial { mode, other_member: None },
//!     None,
//!     tree.id(),
//!     &alice,
//! )
//! .unwrap();
//! assert!(genesis.verify().is_ok());
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`crypto`] | Domain-separated signing, device certificates, local identity |
//! | [`conversation`] | Ids, commits, membership trees, policy, merge, limits |

#![allow(
    clippy::empty_line_after_doc_comments,
    clippy::doc_lazy_continuation,
    clippy::too_many_arguments
)]

// ── Public modules ──────────────────────────────────────────────────────────

/// Ed25519 signing and account → device certificates.
pub mod crypto;

/// Conversation commit graph: codec, membership tree, policy and merge.
pub mod conversation;

// ── Re-exports for convenience ──────────────────────────────────────────────

pub use conversation::{
    Commit, CommitBody, CommitEnvelope, CommitId, ConversationId, ConversationMode, DeviceId,
    Member, Rejection, Role, Tree,
};
pub use crypto::{DeviceCertificate, LocalIdentity};

// ── Library metadata ────────────────────────────────────────────────────────

/// Protocol crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Returns the protocol crate version string.
pub fn version() -> &'static str {
    VERSION
}

// ── Tests ───────────────────────────────────────────────────────────────────
