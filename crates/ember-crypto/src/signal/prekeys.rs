//! Prekey records and the publishable bundle.
//!
//! A [`PreKeyBundle`] is what the directory hands out; it is untrusted until
//! [`PreKeyBundle::verify`] turns it into a [`VerifiedBundle`].

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};
use x25519_dalek::PublicKey as X25519Public;

use crate::error::CryptoError;
use crate::identity::{DeviceId, Identity};
use crate::signal::keys::{generate_x25519, key_array, SecretKey};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SignedPrekeyStatus {
    /// The one key handed out in new bundles.
    Current,
    /// Superseded; still accepted from late initiators until the grace period ends.
    Retiring { since: u64 },
}

/// Medium-term agreement key signed by the identity key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignedPrekeyRecord {
    pub id: u32,
    pub secret: SecretKey,
    pub public: [u8; 32],
    /// Ed25519 signature over `public` (64 bytes).
    pub signature: Vec<u8>,
    pub created_at: u64,
    pub status: SignedPrekeyStatus,
}

impl SignedPrekeyRecord {
    /// Generate and sign a new signed prekey, then check the signature
    /// before handing the record out.
    pub fn generate(id: u32, identity: &Identity, now: u64) -> Result<Self, CryptoError> {
        let (secret, public) = generate_x25519();
        let signature = identity.sign(&public);
        Identity::verify(&identity.public_key(), &public, &signature)
            .map_err(|e| CryptoError::SigningError(format!("self-check failed: {e}")))?;

        Ok(Self {
            id,
            secret,
            public,
            signature: signature.to_bytes().to_vec(),
            created_at: now,
            status: SignedPrekeyStatus::Current,
        })
    }

    pub fn is_current(&self) -> bool {
        self.status == SignedPrekeyStatus::Current
    }
}

/// Single-use agreement key.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OneTimePrekeyRecord {
    pub id: u32,
    pub secret: SecretKey,
    pub public: [u8; 32],
    /// Already placed in a published bundle.
    pub issued: bool,
}

impl OneTimePrekeyRecord {
    pub fn generate(id: u32) -> Self {
        let (secret, public) = generate_x25519();
        Self {
            id,
            secret,
            public,
            issued: false,
        }
    }
}

/// A bundle of public keys published for asynchronous session establishment.
///
/// Received from the directory as raw bytes; nothing in it is trusted until
/// verified.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreKeyBundle {
    pub device_id: DeviceId,
    /// Ed25519 identity public key.
    pub identity_key: Vec<u8>,
    pub signed_prekey_id: u32,
    /// X25519 signed prekey (public).
    pub signed_prekey: Vec<u8>,
    /// Signature over the signed prekey by the identity key.
    pub signed_prekey_signature: Vec<u8>,
    pub one_time_prekey_id: Option<u32>,
    /// Optional one-time prekey (consumed on first use).
    pub one_time_prekey: Option<Vec<u8>>,
}

impl PreKeyBundle {
    /// Check every field and the signed prekey signature.
    pub fn verify(&self) -> Result<VerifiedBundle, CryptoError> {
        let identity_bytes = key_array(&self.identity_key).ok_or_else(|| {
            CryptoError::BundleVerificationFailed("identity key wrong length".into())
        })?;
        let identity_key = VerifyingKey::from_bytes(&identity_bytes).map_err(|e| {
            CryptoError::BundleVerificationFailed(format!("identity key not a valid point: {e}"))
        })?;

        let signed_prekey = key_array(&self.signed_prekey).ok_or_else(|| {
            CryptoError::BundleVerificationFailed("signed prekey wrong length".into())
        })?;
        let signature_bytes = <[u8; 64]>::try_from(self.signed_prekey_signature.as_slice())
            .map_err(|_| {
                CryptoError::BundleVerificationFailed("signature wrong length".into())
            })?;
        Identity::verify(
            &identity_key,
            &signed_prekey,
            &Signature::from_bytes(&signature_bytes),
        )?;

        let one_time_prekey = match (self.one_time_prekey_id, &self.one_time_prekey) {
            (Some(id), Some(key)) => {
                let key = key_array(key).ok_or_else(|| {
                    CryptoError::BundleVerificationFailed("one-time prekey wrong length".into())
                })?;
                Some((id, X25519Public::from(key)))
            }
            (None, None) => None,
            _ => {
                return Err(CryptoError::BundleVerificationFailed(
                    "one-time prekey id and key must be published together".into(),
                ))
            }
        };

        Ok(VerifiedBundle {
            device_id: self.device_id.clone(),
            identity_key,
            identity_agreement: X25519Public::from(identity_key.to_montgomery().to_bytes()),
            signed_prekey_id: self.signed_prekey_id,
            signed_prekey: X25519Public::from(signed_prekey),
            one_time_prekey,
        })
    }

    pub fn to_json(&self) -> Result<Vec<u8>, CryptoError> {
        serde_json::to_vec(self).map_err(|e| CryptoError::Serialization(e.to_string()))
    }

    /// Parse a bundle as served by the directory. The result is still untrusted.
    pub fn from_json(bytes: &[u8]) -> Result<Self, CryptoError> {
        serde_json::from_slice(bytes)
            .map_err(|e| CryptoError::BundleVerificationFailed(format!("undecodable bundle: {e}")))
    }
}

/// A bundle whose signature has been checked; the only way to obtain live
/// peer keys for key agreement.
#[derive(Debug, Clone)]
pub struct VerifiedBundle {
    device_id: DeviceId,
    identity_key: VerifyingKey,
    identity_agreement: X25519Public,
    signed_prekey_id: u32,
    signed_prekey: X25519Public,
    one_time_prekey: Option<(u32, X25519Public)>,
}

impl VerifiedBundle {
    pub fn device_id(&self) -> &DeviceId {
        &self.device_id
    }

    pub fn identity_key(&self) -> &VerifyingKey {
        &self.identity_key
    }

    /// The identity key mapped to X25519.
    pub fn identity_agreement(&self) -> &X25519Public {
        &self.identity_agreement
    }

    pub fn signed_prekey_id(&self) -> u32 {
        self.signed_prekey_id
    }

    pub fn signed_prekey(&self) -> &X25519Public {
        &self.signed_prekey
    }

    pub fn one_time_prekey(&self) -> Option<(u32, &X25519Public)> {
        self.one_time_prekey.as_ref().map(|(id, key)| (*id, key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bundle_for(identity: &Identity, with_otpk: bool) -> PreKeyBundle {
        let spk = SignedPrekeyRecord::generate(1, identity, 0).unwrap();
        let otpk = OneTimePrekeyRecord::generate(100);
        PreKeyBundle {
            device_id: identity.device_id(),
            identity_key: identity.public_key_bytes().to_vec(),
            signed_prekey_id: spk.id,
            signed_prekey: spk.public.to_vec(),
            signed_prekey_signature: spk.signature.clone(),
            one_time_prekey_id: with_otpk.then_some(otpk.id),
            one_time_prekey: with_otpk.then(|| otpk.public.to_vec()),
        }
    }

    #[test]
    fn valid_bundle_verifies() {
        let identity = Identity::generate();
        let verified = bundle_for(&identity, true).verify().unwrap();
        assert_eq!(verified.identity_key().to_bytes(), identity.public_key_bytes());
        assert_eq!(
            verified.identity_agreement().as_bytes(),
            identity.to_x25519_public().as_bytes()
        );
        assert_eq!(verified.one_time_prekey().map(|(id, _)| id), Some(100));
    }

    #[test]
    fn bundle_without_one_time_prekey_verifies() {
        let identity = Identity::generate();
        let verified = bundle_for(&identity, false).verify().unwrap();
        assert!(verified.one_time_prekey().is_none());
    }

    #[test]
    fn swapped_signed_prekey_rejected() {
        let identity = Identity::generate();
        let mut bundle = bundle_for(&identity, false);
        let (_, other) = generate_x25519();
        bundle.signed_prekey = other.to_vec();
        assert!(matches!(
            bundle.verify(),
            Err(CryptoError::BundleVerificationFailed(_))
        ));
    }

    #[test]
    fn foreign_identity_rejected() {
        let identity = Identity::generate();
        let mallory = Identity::generate();
        let mut bundle = bundle_for(&identity, false);
        bundle.identity_key = mallory.public_key_bytes().to_vec();
        assert!(matches!(
            bundle.verify(),
            Err(CryptoError::BundleVerificationFailed(_))
        ));
    }

    #[test]
    fn truncated_fields_rejected() {
        let identity = Identity::generate();

        let mut short_sig = bundle_for(&identity, false);
        short_sig.signed_prekey_signature.pop();
        assert!(short_sig.verify().is_err());

        let mut short_key = bundle_for(&identity, false);
        short_key.identity_key.truncate(31);
        assert!(short_key.verify().is_err());

        let mut orphan_id = bundle_for(&identity, false);
        orphan_id.one_time_prekey_id = Some(3);
        assert!(orphan_id.verify().is_err());
    }

    #[test]
    fn json_garbage_is_a_verification_failure() {
        assert!(matches!(
            PreKeyBundle::from_json(b"{\"identity_key\": 5}"),
            Err(CryptoError::BundleVerificationFailed(_))
        ));
    }

    #[test]
    fn json_roundtrip_preserves_bundle() {
        let identity = Identity::generate();
        let bundle = bundle_for(&identity, true);
        let parsed = PreKeyBundle::from_json(&bundle.to_json().unwrap()).unwrap();
        assert_eq!(parsed, bundle);
        assert!(parsed.verify().is_ok());
    }
}
