//! Cryptographic primitives: Ed25519 signing with domain separation and
//! account-issued device certificates.

pub mod identity;
pub mod signing;

pub use identity::{CertificateError, DeviceCertificate, LocalIdentity};
pub use signing::{derive_public_key, generate_keypair, sign_data, verify_signature, SigningError};
