use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Error, Debug)]
pub enum SigningError {
    #[error("Invalid public key")]
    InvalidPublicKey,
    #[error("Invalid key length")]
    InvalidKeyLength,
}

pub type Result<T> = std::result::Result<T, SigningError>;

/// Generate an Ed25519 keypair
///
/// # Returns
/// (public_key, private_key) - the private half is wiped on drop
pub fn generate_keypair() -> ([u8; 32], Zeroizing<[u8; 32]>) {
    let signing_key = SigningKey::generate(&mut OsRng);

    let secret_key = Zeroizing::new(signing_key.to_bytes());
    let public_key = signing_key.verifying_key().to_bytes();

    (public_key, secret_key)
}

/// Sign `data` under a domain tag.
///
/// The tag is prefixed with its length so that no signature produced for one
/// domain (commit headers, device certificates) verifies in another.
pub fn sign_data(domain: &[u8], data: &[u8], private_key: &[u8; 32]) -> [u8; 64] {
    let signing_key = SigningKey::from_bytes(private_key);
    signing_key.sign(&framed(domain, data)).to_bytes()
}

/// Verify an Ed25519 signature produced by [`sign_data`] with the same domain.
///
/// Returns `Ok(false)` for a well-formed but wrong signature and `Err` only when
/// the public key itself is not a valid curve point.
pub fn verify_signature(
    domain: &[u8],
    data: &[u8],
    signature: &[u8; 64],
    public_key: &[u8; 32],
) -> Result<bool> {
    let verifying_key =
        VerifyingKey::from_bytes(public_key).map_err(|_| SigningError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(signature);

    Ok(verifying_key.verify(&framed(domain, data), &sig).is_ok())
}

/// Derive public key from private key
pub fn derive_public_key(private_key: &[u8]) -> Result<[u8; 32]> {
    let key_bytes: [u8; 32] = private_key
        .try_into()
        .map_err(|_| SigningError::InvalidKeyLength)?;
    let signing_key = SigningKey::from_bytes(&key_bytes);

    Ok(signing_key.verifying_key().to_bytes())
}

fn framed(domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(8 + domain.len() + data.len());
    buf.extend_from_slice(&(domain.len() as u64).to_le_bytes());
    buf.extend_from_slice(domain);
    buf.extend_from_slice(data);
    buf
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOMAIN: &[u8] = b"convlog-test";

    #[test]
    fn test_sign_verify() {
        let (public, private) = generate_keypair();
        let data = b"Test message for signing";

        let signature = sign_data(DOMAIN, data, &private);
        assert!(verify_signature(DOMAIN, data, &signature, &public).unwrap());
    }

    #[test]
    fn test_verify_invalid_signature() {
        let (public, _) = generate_keypair();
        let fake_signature = [0u8; 64];

        let valid = verify_signature(DOMAIN, b"Test message", &fake_signature, &public).unwrap();
        assert!(!valid);
    }

    #[test]
    fn test_domain_separation() {
        let (public, private) = generate_keypair();
        let signature = sign_data(b"commit", b"payload", &private);

        assert!(!verify_signature(b"device-cert", b"payload", &signature, &public).unwrap());
    }

    #[test]
    fn test_derive_public_key() {
        let (expected_public, private) = generate_keypair();
        let derived_public = derive_public_key(&private[..]).unwrap();

        assert_eq!(expected_public, derived_public);
        assert!(derive_public_key(&[1u8; 31]).is_err());
    }
}
