/// Core identity types for conversation logs.
///
/// - `DeviceId`: 16-byte stable device identity derived from the Ed25519 device key
/// - `CommitId`: 32-byte content address of a commit (header bytes + signature)
/// - `TreeId`: 32-byte content address of a membership tree
/// - `ConversationId`: the id of a conversation's genesis commit
///
/// Member identities (uris) are plain strings: 40 hex chars derived from an
/// account key, see [`account_uri`].

use serde::{Deserialize, Serialize};
use std::fmt;

/// Number of BLAKE3 output bytes kept for an account uri.
const ACCOUNT_URI_BYTES: usize = 20;

macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $len:expr, $short:expr) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub [u8; $len]);

        impl $name {
            /// Create from raw bytes.
            pub fn from_bytes(bytes: [u8; $len]) -> Self {
                $name(bytes)
            }

            /// Return the raw bytes.
            pub fn as_bytes(&self) -> &[u8; $len] {
                &self.0
            }

            /// Hex-encode for display/storage.
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }

            /// Decode from hex string.
            pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
                let bytes = hex::decode(s)?;
                let id: [u8; $len] = bytes
                    .try_into()
                    .map_err(|_| hex::FromHexError::InvalidStringLength)?;
                Ok($name(id))
            }

            /// First few hex chars, for logs.
            pub fn short(&self) -> String {
                self.to_hex()[..$short].to_string()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), self.short())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }
    };
}

hex_id!(
    /// Stable device identity: BLAKE3(Ed25519 device public key)[0..16].
    DeviceId,
    16,
    8
);

hex_id!(
    /// Content address of a commit: BLAKE3(signed_content || signature).
    CommitId,
    32,
    12
);

hex_id!(
    /// Content address of a membership tree.
    TreeId,
    32,
    12
);

/// A conversation is named by its genesis commit.
pub type ConversationId = CommitId;

impl DeviceId {
    /// Derive DeviceId from an Ed25519 public key.
    pub fn from_pubkey(pubkey: &[u8; 32]) -> Self {
        let hash = blake3::hash(pubkey);
        let mut id = [0u8; 16];
        id.copy_from_slice(&hash.as_bytes()[..16]);
        DeviceId(id)
    }
}

/// Stable member uri for an account key: hex(BLAKE3(account_pubkey)[0..20]).
pub fn account_uri(account_pubkey: &[u8; 32]) -> String {
    let hash = blake3::hash(account_pubkey);
    hex::encode(&hash.as_bytes()[..ACCOUNT_URI_BYTES])
}

/// Whether `uri` can be used as a single path component in a membership tree.
pub fn is_valid_uri(uri: &str) -> bool {
    !uri.is_empty()
        && uri.len() <= 256
        && uri
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '@' | ':'))
        && uri != "."
        && uri != ".."
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
