//! # Signing and Verification
//!
//! Every stored value is attributable to a publisher through an Ed25519
//! signature, and the network carries one well-known *master* public key
//! whose signatures grant override privileges (collection locking, relaxed
//! capacity rules, full TTL for otherwise-anonymous values).
//!
//! Signatures are domain-separated: the value domain prefix is prepended to
//! the payload before signing so a signature can never be replayed in a
//! different protocol context.

use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::kuid::Kuid;

/// Domain separation prefix for stored-value signatures.
pub const VALUE_SIGNATURE_DOMAIN: &[u8] = b"mangrove-value-v1:";

/// Error raised by signature verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum SignatureError {
    #[error("signature has invalid length (expected 64 bytes)")]
    InvalidLength,
    #[error("public key is not a valid Ed25519 point")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    VerificationFailed,
}

/// A publisher's public key as carried on the wire.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PublicKey([u8; 32]);

impl PublicKey {
    #[inline]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// The identifier this key maps to in the address space.
    pub fn id(&self) -> Kuid {
        Kuid::from_public_key(self)
    }

    /// Verify a domain-separated signature over `data`.
    pub fn verify(&self, domain: &[u8], data: &[u8], signature: &[u8]) -> Result<(), SignatureError> {
        let sig_bytes: [u8; 64] = signature
            .try_into()
            .map_err(|_| SignatureError::InvalidLength)?;
        let key = VerifyingKey::from_bytes(&self.0).map_err(|_| SignatureError::InvalidPublicKey)?;
        let mut prefixed = Vec::with_capacity(domain.len() + data.len());
        prefixed.extend_from_slice(domain);
        prefixed.extend_from_slice(data);
        key.verify(&prefixed, &Signature::from_bytes(&sig_bytes))
            .map_err(|_| SignatureError::VerificationFailed)
    }
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PublicKey({}..)", hex::encode(&self.0[..4]))
    }
}

/// An Ed25519 signing keypair owned by the local node or a test publisher.
#[derive(Clone)]
pub struct Keypair {
    signing_key: SigningKey,
}

impl Keypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::generate(&mut OsRng),
        }
    }

    pub fn from_secret_bytes(bytes: &[u8; 32]) -> Self {
        Self {
            signing_key: SigningKey::from_bytes(bytes),
        }
    }

    pub fn secret_bytes(&self) -> [u8; 32] {
        self.signing_key.to_bytes()
    }

    pub fn public_key(&self) -> PublicKey {
        PublicKey(self.signing_key.verifying_key().to_bytes())
    }

    /// The identifier derived from this keypair's public key.
    pub fn id(&self) -> Kuid {
        self.public_key().id()
    }

    /// Sign `data` under the given domain prefix.
    pub fn sign(&self, domain: &[u8], data: &[u8]) -> Vec<u8> {
        let mut prefixed = Vec::with_capacity(domain.len() + data.len());
        prefixed.extend_from_slice(domain);
        prefixed.extend_from_slice(data);
        self.signing_key.sign(&prefixed).to_bytes().to_vec()
    }
}

impl std::fmt::Debug for Keypair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keypair")
            .field("public_key", &self.public_key())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_and_verify_round_trip() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(VALUE_SIGNATURE_DOMAIN, b"payload");
        assert!(keypair
            .public_key()
            .verify(VALUE_SIGNATURE_DOMAIN, b"payload", &sig)
            .is_ok());
    }

    #[test]
    fn verification_fails_on_wrong_domain_or_payload() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(VALUE_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(
            keypair
                .public_key()
                .verify(b"other-domain:", b"payload", &sig),
            Err(SignatureError::VerificationFailed)
        );
        assert_eq!(
            keypair
                .public_key()
                .verify(VALUE_SIGNATURE_DOMAIN, b"tampered", &sig),
            Err(SignatureError::VerificationFailed)
        );
    }

    #[test]
    fn verification_fails_on_foreign_key() {
        let signer = Keypair::generate();
        let other = Keypair::generate();
        let sig = signer.sign(VALUE_SIGNATURE_DOMAIN, b"payload");
        assert!(other
            .public_key()
            .verify(VALUE_SIGNATURE_DOMAIN, b"payload", &sig)
            .is_err());
    }

    #[test]
    fn truncated_signature_is_rejected() {
        let keypair = Keypair::generate();
        let sig = keypair.sign(VALUE_SIGNATURE_DOMAIN, b"payload");
        assert_eq!(
            keypair
                .public_key()
                .verify(VALUE_SIGNATURE_DOMAIN, b"payload", &sig[..32]),
            Err(SignatureError::InvalidLength)
        );
    }
}
