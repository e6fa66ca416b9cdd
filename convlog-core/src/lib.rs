//! # Convlog
//!
//! **Replicated conversation logs between untrusting devices.**
//!
//! Builds on [`convlog_protocol`] to keep one commit graph per conversation
//! on disk or in memory, and to exchange it with peers:
//!
//! - **Repository**: create, open and erase conversations; write messages,
//!   membership changes and votes; log, diff and member queries
//! - **Sync**: fetch a peer's head, validate every new commit against the
//!   policy engine, then fast-forward or merge
//! - **Channel gate**: accept or refuse incoming conversation and
//!   device-sync channels
//!
//! ## Quick Start
//!
//! ```rust
//! use std::sync::Arc;
//! use convlog::{create_conversation, ConvlogConfig, MemoryStoreFactory};
//! use convlog::conversation::ConversationMode;
//! use convlog::crypto::LocalIdentity;
//!
//! let factory = MemoryStoreFactory::new();
//! let alice = Arc::new(LocalIdentity::generate("alice").unwrap());
//! let repo = create_conversation(
//!     &factory,
//!     alice,
//!     ConvlogConfig::default(),
//!     ConversationMode::InvitesOnly,
//!     None,
//! )
//! .unwrap();
//! let hello = repo.commit_message("hello").unwrap();
//! assert_eq!(repo.head(), Some(hello));
//! ```
//!
//! ## Architecture
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | JSON runtime settings |
//! | [`store`] | Object stores: in memory and one directory per conversation |
//! | [`repository`] | Local operations on one conversation |
//! | [`sync`] | Fetch, validation, merge and the per-peer synchronizer |
//! | [`network`] | Transport seam, in-process network, channel gate |
//! | [`registry`] | Open conversations and channels of this process |

#![allow(
    clippy::empty_line_after_doc_comments,
    clippy::doc_lazy_continuation,
    clippy::too_many_arguments
)]

// ── Public modules ──────────────────────────────────────────────────────────

pub mod config;
pub mod network;
pub mod registry;
pub mod repository;
pub mod store;
pub mod sync;

mod graph;

pub use convlog_protocol::{conversation, crypto};

// ── Re-exports for convenience ──────────────────────────────────────────────

pub use config::{ConfigError, ConvlogConfig};
pub use network::{
    Channel, ChannelName, ConversationChannelHandler, LocalNetwork, LocalTransport,
    SyncChannelHandler, Transport, TransportError,
};
pub use registry::ConversationRegistry;
pub use repository::{create_conversation, open, Repository, RepositoryError};
pub use store::{FsStoreFactory, MemoryStoreFactory, ObjectStore, StoreError, StoreFactory};
pub use sync::{clone_conversation, MergeOutcome, SyncError, SyncState, Synchronizer};

// ── Library metadata ────────────────────────────────────────────────────────

/// Core crate version.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub fn version() -> &'static str {
    VERSION
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_matches_protocol() {
        assert!(!version().is_empty());
        assert_eq!(version(), convlog_protocol::version());
    }
}
