/// Commit codec and signer.
///
/// A commit is the unit of replication: an immutable, signed, content-addressed
/// change to one conversation.
///
/// - Header (`signed_content`): bincode-serialized `CommitHeader` (deterministic)
/// - Body: CBOR-serialized `CommitBody` via ciborium, carried inside the header
/// - Signature: Ed25519 by the author's device key over `signed_content`
/// - Id: BLAKE3(signed_content || signature), recomputed by every receiver
use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use thiserror::Error;

use crate::conversation::ids::{CommitId, DeviceId, TreeId};
use crate::conversation::limits::{MAX_COMMIT_BODY_BYTES, MAX_COMMIT_MSG_BYTES, MAX_ENVELOPE_BYTES};
use crate::conversation::membership::{ConversationMode, TargetKind, VoteAction};
use crate::crypto::identity::{DeviceCertificate, LocalIdentity};
use crate::crypto::signing;

/// Domain tag for commit signatures.
pub const COMMIT_DOMAIN: &[u8] = b"convlog/commit/v1";

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Error, Debug)]
pub enum CommitError {
    #[error("Body exceeds max size ({size} > {max})")]
    BodyTooLarge { size: usize, max: usize },

    #[error("Commit message exceeds max size ({size} > {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("Envelope exceeds max size ({size} > {max})")]
    EnvelopeTooLarge { size: usize, max: usize },

    #[error("CBOR encoding failed: {0}")]
    CborEncode(String),

    #[error("CBOR decoding failed: {0}")]
    CborDecode(String),

    #[error("Bincode serialization failed: {0}")]
    BincodeError(String),

    #[error("Invalid signature")]
    InvalidSignature,

    #[error("Device certificate invalid: {0}")]
    BadCertificate(String),

    #[error("Author does not match device certificate")]
    AuthorMismatch,
}

// ---------------------------------------------------------------------------
// Author and body
// ---------------------------------------------------------------------------

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Author {
    pub name: String,
    /// Stable member identity (account uri).
    pub uri: String,
    pub device: DeviceId,
}

impl Author {
    /// Author fields of commits signed by `identity`.
    pub fn from_identity(identity: &LocalIdentity) -> Self {
        Author {
            name: identity.name().to_string(),
            uri: identity.uri(),
            device: identity.device_id(),
        }
    }
}

#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MemberAction {
    /// Invite a uri (→ INVITED).
    Add,
    /// Author moves itself INVITED → MEMBER (or joins a public conversation).
    Join,
    /// Author removes itself; not a ban.
    Leave,
    /// Admin raises a MEMBER to ADMIN.
    Promote,
    /// Admin lowers another ADMIN to MEMBER.
    Demote,
}

/// Tagged commit payload. Policy switches on the tag explicitly.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub enum CommitBody {
    Initial {
        mode: ConversationMode,
        /// The fixed second participant of a one-to-one conversation.
        other_member: Option<String>,
    },
    Text {
        mime: String,
        body: String,
    },
    Member {
        action: MemberAction,
        uri: String,
    },
    Vote {
        action: VoteAction,
        kind: TargetKind,
        target: String,
    },
    Resolution {
        action: VoteAction,
        kind: TargetKind,
        target: String,
    },
    Merge,
}

impl CommitBody {
    /// Number of parents a commit with this body must have.
    pub fn expected_parents(&self) -> usize {
        match self {
            CommitBody::Initial { .. } => 0,
            CommitBody::Merge => 2,
            _ => 1,
        }
    }

    /// Default commit message when the caller supplies none.
    pub fn label(&self) -> String {
        match self {
            CommitBody::Initial { .. } => "Initial commit".to_string(),
            CommitBody::Text { mime, .. } => mime.clone(),
            CommitBody::Member { action, uri } => {
                let verb = match action {
                    MemberAction::Add => "add",
                    MemberAction::Join => "join",
                    MemberAction::Leave => "remove",
                    MemberAction::Promote => "promote",
                    MemberAction::Demote => "demote",
                };
                format!("member:{}:{}", verb, uri)
            }
            CommitBody::Vote { action, kind, target } => {
                format!("vote:{}:{}:{}", action.as_str(), kind.dir(), target)
            }
            CommitBody::Resolution { action, kind, target } => {
                format!("{}:{}:{}", action.as_str(), kind.dir(), target)
            }
            CommitBody::Merge => "merge".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Header / envelope
// ---------------------------------------------------------------------------

/// Everything that is signed. Field order is the canonical byte order.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CommitHeader {
    pub parents: Vec<CommitId>,
    pub author: Author,
    pub certificate: DeviceCertificate,
    pub tree: TreeId,
    /// CBOR-encoded `CommitBody`.
    pub body: Vec<u8>,
    pub commit_msg: String,
    /// Author-claimed seconds since epoch: display only, never trusted.
    pub timestamp: i64,
}

/// Storage and wire form of a commit.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct CommitEnvelope {
    pub signed_content: Vec<u8>,
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl CommitEnvelope {
    pub fn id(&self) -> CommitId {
        commit_id(&self.signed_content, &self.signature)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CommitError> {
        bincode::serialize(self).map_err(|e| CommitError::BincodeError(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CommitError> {
        if bytes.len() > MAX_ENVELOPE_BYTES + 128 {
            return Err(CommitError::EnvelopeTooLarge {
                size: bytes.len(),
                max: MAX_ENVELOPE_BYTES,
            });
        }
        bincode::deserialize(bytes).map_err(|e| CommitError::BincodeError(e.to_string()))
    }
}

/// Content address of a commit.
pub fn commit_id(signed_content: &[u8], signature: &[u8; 64]) -> CommitId {
    let mut hasher = blake3::Hasher::new();
    hasher.update(b"convlog/commit-id/v1");
    hasher.update(&(signed_content.len() as u64).to_le_bytes());
    hasher.update(signed_content);
    hasher.update(signature);
    CommitId(*hasher.finalize().as_bytes())
}

// ---------------------------------------------------------------------------
// Commit
// ---------------------------------------------------------------------------

/// Decoded commit. Built only by `create_signed` or `decode`, so `id` always
/// matches the bytes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Commit {
    pub id: CommitId,
    pub parents: Vec<CommitId>,
    pub author: Author,
    pub certificate: DeviceCertificate,
    pub tree: TreeId,
    pub body: CommitBody,
    pub commit_msg: String,
    pub timestamp: i64,
    pub signed_content: Vec<u8>,
    pub signature: [u8; 64],
}

impl Commit {
    /// Encode and sign a new commit with the local device key.
    ///
    /// `tree` must be the tree that results from applying `body` on top of
    /// `parents`; the caller computes it through the policy engine.
    pub fn create_signed(
        parents: Vec<CommitId>,
        body: CommitBody,
        commit_msg: Option<&str>,
        tree: TreeId,
        identity: &LocalIdentity,
    ) -> Result<Self, CommitError> {
        let body_bytes = cbor_encode(&body)?;
        if body_bytes.len() > MAX_COMMIT_BODY_BYTES {
            return Err(CommitError::BodyTooLarge {
                size: body_bytes.len(),
                max: MAX_COMMIT_BODY_BYTES,
            });
        }
        let commit_msg = commit_msg.map(str::to_string).unwrap_or_else(|| body.label());
        if commit_msg.len() > MAX_COMMIT_MSG_BYTES {
            return Err(CommitError::MessageTooLarge {
                size: commit_msg.len(),
                max: MAX_COMMIT_MSG_BYTES,
            });
        }

        let header = CommitHeader {
            parents,
            author: Author::from_identity(identity),
            certificate: identity.certificate().clone(),
            tree,
            body: body_bytes,
            commit_msg,
            timestamp: chrono::Utc::now().timestamp(),
        };
        let signed_content =
            bincode::serialize(&header).map_err(|e| CommitError::BincodeError(e.to_string()))?;
        let signature = identity.sign(COMMIT_DOMAIN, &signed_content);

        Ok(Commit::assemble(header, body, signed_content, signature))
    }

    /// Decode an envelope received from storage or a peer.
    ///
    /// Only parses; `verify` checks the signature and certificate.
    pub fn decode(envelope: &CommitEnvelope) -> Result<Self, CommitError> {
        if envelope.signed_content.len() > MAX_ENVELOPE_BYTES {
            return Err(CommitError::EnvelopeTooLarge {
                size: envelope.signed_content.len(),
                max: MAX_ENVELOPE_BYTES,
            });
        }
        let header: CommitHeader = bincode::deserialize(&envelope.signed_content)
            .map_err(|e| CommitError::BincodeError(e.to_string()))?;
        if header.body.len() > MAX_COMMIT_BODY_BYTES {
            return Err(CommitError::BodyTooLarge {
                size: header.body.len(),
                max: MAX_COMMIT_BODY_BYTES,
            });
        }
        let body: CommitBody = cbor_decode(&header.body)?;
        Ok(Commit::assemble(
            header,
            body,
            envelope.signed_content.clone(),
            envelope.signature,
        ))
    }

    fn assemble(
        header: CommitHeader,
        body: CommitBody,
        signed_content: Vec<u8>,
        signature: [u8; 64],
    ) -> Self {
        Commit {
            id: commit_id(&signed_content, &signature),
            parents: header.parents,
            author: header.author,
            certificate: header.certificate,
            tree: header.tree,
            body,
            commit_msg: header.commit_msg,
            timestamp: header.timestamp,
            signed_content,
            signature,
        }
    }

    /// Check the device signature, the account certificate, and that the
    /// claimed author is the certified (uri, device) pair.
    pub fn verify(&self) -> Result<(), CommitError> {
        self.certificate
            .verify()
            .map_err(|e| CommitError::BadCertificate(e.to_string()))?;
        if self.certificate.uri() != self.author.uri
            || self.certificate.device_id() != self.author.device
        {
            return Err(CommitError::AuthorMismatch);
        }

        let valid = signing::verify_signature(
            COMMIT_DOMAIN,
            &self.signed_content,
            &self.signature,
            &self.certificate.device_pubkey,
        )
        .map_err(|e| CommitError::BadCertificate(e.to_string()))?;
        if !valid {
            return Err(CommitError::InvalidSignature);
        }
        Ok(())
    }

    pub fn envelope(&self) -> CommitEnvelope {
        CommitEnvelope {
            signed_content: self.signed_content.clone(),
            signature: self.signature,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.parents.is_empty()
    }

    pub fn is_merge(&self) -> bool {
        self.parents.len() == 2
    }
}

// ---------------------------------------------------------------------------
// CBOR helpers
// ---------------------------------------------------------------------------

/// CBOR-encode a value to bytes.
pub fn cbor_encode<T: Serialize>(value: &T) -> Result<Vec<u8>, CommitError> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf).map_err(|e| CommitError::CborEncode(e.to_string()))?;
    Ok(buf)
}

/// CBOR-decode a value from bytes.
pub fn cbor_decode<T: serde::de::DeserializeOwned>(bytes: &[u8]) -> Result<T, CommitError> {
    ciborium::from_reader(bytes).map_err(|e| CommitError::CborDecode(e.to_string()))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn identity() -> LocalIdentity {
        LocalIdentity::generate("alice").unwrap()
    }

    fn text(body: &str) -> CommitBody {
        CommitBody::Text {
            mime: "text/plain".into(),
            body: body.into(),
        }
    }

    #[test]
    fn test_create_signed_and_verify() {
        let id = identity();
        let commit = Commit::create_signed(
            vec![CommitId::from_bytes([1; 32])],
            text("hello"),
            None,
            TreeId::from_bytes([2; 32]),
            &id,
        )
        .unwrap();

        commit.verify().unwrap();
        assert_eq!(commit.author.uri, id.uri());
        assert_eq!(commit.commit_msg, "text/plain");
        assert_eq!(commit.id, commit.envelope().id());
    }

    #[test]
    fn test_decode_matches_created() {
        let id = identity();
        let commit = Commit::create_signed(
            vec![],
            CommitBody::Initial {
                mode: ConversationMode::Public,
                other_member: None,
            },
            None,
            TreeId::from_bytes([0; 32]),
            &id,
        )
        .unwrap();

        let bytes = commit.envelope().to_bytes().unwrap();
        let decoded = Commit::decode(&CommitEnvelope::from_bytes(&bytes).unwrap()).unwrap();
        assert_eq!(decoded, commit);
        assert!(decoded.is_genesis());
    }

    #[test]
    fn test_verify_detects_tampered_content() {
        let id = identity();
        let commit = Commit::create_signed(
            vec![CommitId::from_bytes([1; 32])],
            text("hello"),
            None,
            TreeId::from_bytes([2; 32]),
            &id,
        )
        .unwrap();

        // Flip each byte of the signed content in turn; anything that still
        // decodes must fail verification.
        for i in 0..commit.signed_content.len() {
            let mut envelope = commit.envelope();
            envelope.signed_content[i] ^= 0x01;
            if let Ok(tampered) = Commit::decode(&envelope) {
                assert!(tampered.verify().is_err(), "byte {} not covered", i);
                assert_ne!(tampered.id, commit.id);
            }
        }
    }

    #[test]
    fn test_verify_detects_tampered_signature() {
        let id = identity();
        let commit = Commit::create_signed(
            vec![CommitId::from_bytes([1; 32])],
            text("hello"),
            None,
            TreeId::from_bytes([2; 32]),
            &id,
        )
        .unwrap();

        let mut envelope = commit.envelope();
        envelope.signature[10] ^= 0xFF;
        let tampered = Commit::decode(&envelope).unwrap();
        assert!(matches!(tampered.verify(), Err(CommitError::InvalidSignature)));
    }

    #[test]
    fn test_verify_detects_author_impersonation() {
        let alice = identity();
        let mallory = LocalIdentity::generate("mallory").unwrap();
        let commit = Commit::create_signed(
            vec![CommitId::from_bytes([1; 32])],
            text("hi"),
            None,
            TreeId::from_bytes([2; 32]),
            &mallory,
        )
        .unwrap();

        // Re-sign a header that claims Alice's uri with Mallory's device key
        let mut header: CommitHeader = bincode::deserialize(&commit.signed_content).unwrap();
        header.author.uri = alice.uri();
        let signed_content = bincode::serialize(&header).unwrap();
        let signature = mallory.sign(COMMIT_DOMAIN, &signed_content);
        let forged = Commit::decode(&CommitEnvelope {
            signed_content,
            signature,
        })
        .unwrap();

        assert!(matches!(forged.verify(), Err(CommitError::AuthorMismatch)));
    }

    #[test]
    fn test_body_too_large_rejected() {
        let id = identity();
        let huge = "x".repeat(MAX_COMMIT_BODY_BYTES + 1);
        let result = Commit::create_signed(
            vec![CommitId::from_bytes([1; 32])],
            text(&huge),
            Some("big"),
            TreeId::from_bytes([2; 32]),
            &id,
        );
        assert!(matches!(result, Err(CommitError::BodyTooLarge { .. })));
    }

    #[test]
    fn test_labels_and_parent_counts() {
        let merge = CommitBody::Merge;
        assert_eq!(merge.expected_parents(), 2);
        assert_eq!(merge.label(), "merge");

        let add = CommitBody::Member {
            action: MemberAction::Add,
            uri: "bob".into(),
        };
        assert_eq!(add.expected_parents(), 1);
        assert_eq!(add.label(), "member:add:bob");

        let vote = CommitBody::Vote {
            action: VoteAction::Ban,
            kind: TargetKind::Device,
            target: "abcd".into(),
        };
        assert_eq!(vote.label(), "vote:ban:devices:abcd");
    }
}
