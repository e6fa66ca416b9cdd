/// Account and device identity.
///
/// An account key certifies device keys; devices sign commits. A member's uri
/// is derived from the account key, so any commit that carries a valid
/// certificate proves which member authored it without a directory lookup.

use serde::{Deserialize, Serialize};
use serde_big_array::BigArray;
use subtle::ConstantTimeEq;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::conversation::ids::{account_uri, DeviceId};
use crate::crypto::signing::{self, SigningError};

/// Domain tag for account → device certificates.
pub const DEVICE_CERT_DOMAIN: &[u8] = b"convlog/device-cert/v1";

#[derive(Error, Debug)]
pub enum CertificateError {
    #[error("Certificate signature does not verify")]
    BadSignature,

    #[error("This identity holds no account key and cannot certify devices")]
    NoAccountKey,

    #[error(transparent)]
    Signing(#[from] SigningError),
}

// ---------------------------------------------------------------------------
// DeviceCertificate
// ---------------------------------------------------------------------------

/// Account-signed statement that `device_pubkey` belongs to the account.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct DeviceCertificate {
    pub account_pubkey: [u8; 32],
    pub device_pubkey: [u8; 32],
    #[serde(with = "BigArray")]
    pub signature: [u8; 64],
}

impl DeviceCertificate {
    /// Certify `device_pubkey` with an account private key.
    pub fn issue(account_secret: &[u8; 32], device_pubkey: [u8; 32]) -> Result<Self, CertificateError> {
        let account_pubkey = signing::derive_public_key(account_secret)?;
        let signature = signing::sign_data(DEVICE_CERT_DOMAIN, &device_pubkey, account_secret);
        Ok(DeviceCertificate {
            account_pubkey,
            device_pubkey,
            signature,
        })
    }

    /// Check the account signature over the device key.
    pub fn verify(&self) -> Result<(), CertificateError> {
        let ok = signing::verify_signature(
            DEVICE_CERT_DOMAIN,
            &self.device_pubkey,
            &self.signature,
            &self.account_pubkey,
        )?;
        if ok {
            Ok(())
        } else {
            Err(CertificateError::BadSignature)
        }
    }

    /// Member uri of the certifying account.
    pub fn uri(&self) -> String {
        account_uri(&self.account_pubkey)
    }

    /// Device id of the certified key.
    pub fn device_id(&self) -> DeviceId {
        DeviceId::from_pubkey(&self.device_pubkey)
    }

    /// Whether this certificate covers `pubkey`.
    pub fn covers(&self, pubkey: &[u8; 32]) -> bool {
        self.device_pubkey.ct_eq(pubkey).into()
    }
}

// ---------------------------------------------------------------------------
// LocalIdentity
// ---------------------------------------------------------------------------

/// The local device's signing material.
pub struct LocalIdentity {
    name: String,
    /// Only the device that created the account keeps the account key.
    account_secret: Option<Zeroizing<[u8; 32]>>,
    device_secret: Zeroizing<[u8; 32]>,
    certificate: DeviceCertificate,
}

impl LocalIdentity {
    /// Create a fresh account with its first device.
    pub fn generate(name: &str) -> Result<Self, CertificateError> {
        let (_, account_secret) = signing::generate_keypair();
        let (device_pubkey, device_secret) = signing::generate_keypair();
        let certificate = DeviceCertificate::issue(&account_secret, device_pubkey)?;

        Ok(LocalIdentity {
            name: name.to_string(),
            account_secret: Some(account_secret),
            device_secret,
            certificate,
        })
    }

    /// Certify an additional device for the same account.
    pub fn add_device(&self) -> Result<Self, CertificateError> {
        let account_secret = self
            .account_secret
            .as_ref()
            .ok_or(CertificateError::NoAccountKey)?;
        let (device_pubkey, device_secret) = signing::generate_keypair();
        let certificate = DeviceCertificate::issue(account_secret, device_pubkey)?;

        Ok(LocalIdentity {
            name: self.name.clone(),
            account_secret: None,
            device_secret,
            certificate,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn uri(&self) -> String {
        self.certificate.uri()
    }

    pub fn device_id(&self) -> DeviceId {
        self.certificate.device_id()
    }

    pub fn device_pubkey(&self) -> [u8; 32] {
        self.certificate.device_pubkey
    }

    pub fn certificate(&self) -> &DeviceCertificate {
        &self.certificate
    }

    /// Sign with the device key.
    pub fn sign(&self, domain: &[u8], data: &[u8]) -> [u8; 64] {
        signing::sign_data(domain, data, &self.device_secret)
    }
}

impl std::fmt::Debug for LocalIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalIdentity")
            .field("name", &self.name)
            .field("device", &self.device_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_certificate_verifies() {
        let identity = LocalIdentity::generate("alice").unwrap();
        identity.certificate().verify().unwrap();
        assert_eq!(identity.uri().len(), 40);
        assert!(identity.certificate().covers(&identity.device_pubkey()));
    }

    #[test]
    fn test_second_device_shares_uri() {
        let primary = LocalIdentity::generate("alice").unwrap();
        let second = primary.add_device().unwrap();

        assert_eq!(primary.uri(), second.uri());
        assert_ne!(primary.device_id(), second.device_id());
        second.certificate().verify().unwrap();

        // Secondary devices cannot certify further devices
        assert!(matches!(second.add_device(), Err(CertificateError::NoAccountKey)));
    }

    #[test]
    fn test_forged_certificate_rejected() {
        let alice = LocalIdentity::generate("alice").unwrap();
        let mallory = LocalIdentity::generate("mallory").unwrap();

        // Mallory claims Alice's account for her own device key
        let mut forged = mallory.certificate().clone();
        forged.account_pubkey = alice.certificate().account_pubkey;
        assert!(forged.verify().is_err());
    }
}
