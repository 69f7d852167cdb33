//! Asynchronous key agreement (X3DH).
//!
//! ```text
//! DH1 = DH(IK_a, SPK_b)   DH2 = DH(EK_a, IK_b)   DH3 = DH(EK_a, SPK_b)
//! DH4 = DH(EK_a, OPK_b)   (only when the bundle carried a one-time prekey)
//! SK  = HKDF(0xFF*32 || DH1 || DH2 || DH3 [|| DH4])
//! ```
//!
//! `SK` is handed straight to the ratchet and wiped; it is never stored.

use hkdf::Hkdf;
use sha2::Sha256;
use x25519_dalek::{PublicKey as X25519Public, SharedSecret};
use zeroize::Zeroizing;

use crate::error::CryptoError;
use crate::identity::{DeviceId, Identity};
use crate::signal::keys::{generate_x25519, SecretKey};
use crate::signal::message::PrekeyHeader;
use crate::signal::prekeys::{OneTimePrekeyRecord, SignedPrekeyRecord, VerifiedBundle};
use crate::signal::ratchet::{Session, SessionSeed};

const X3DH_INFO: &[u8] = b"EmberX3DH";

/// Initiator side: build a session from a verified bundle.
pub fn initiate(
    identity: &Identity,
    bundle: &VerifiedBundle,
    now: u64,
) -> Result<Session, CryptoError> {
    let (ephemeral_secret, ephemeral_public) = generate_x25519();
    let ephemeral = ephemeral_secret.to_x25519();
    let our_identity = identity.to_x25519_secret();

    let dh1 = our_identity.diffie_hellman(bundle.signed_prekey());
    let dh2 = ephemeral.diffie_hellman(bundle.identity_agreement());
    let dh3 = ephemeral.diffie_hellman(bundle.signed_prekey());
    let dh4 = bundle
        .one_time_prekey()
        .map(|(_, key)| ephemeral.diffie_hellman(key));

    if dh4.is_none() {
        tracing::warn!(
            peer = %bundle.device_id(),
            "bundle carried no one-time prekey; first message lacks one-time forward secrecy"
        );
    }

    let shared_secret = derive_shared_secret(&dh1, &dh2, &dh3, dh4.as_ref())?;

    let own_identity = identity.public_key_bytes();
    let peer_identity = bundle.identity_key().to_bytes();
    let prekey = PrekeyHeader {
        identity_key: own_identity,
        ephemeral_key: ephemeral_public,
        signed_prekey_id: bundle.signed_prekey_id(),
        one_time_prekey_id: bundle.one_time_prekey().map(|(id, _)| id),
    };

    Session::initiate(
        SessionSeed {
            peer: bundle.device_id().clone(),
            shared_secret,
            associated_data: [own_identity, peer_identity].concat(),
            peer_identity,
            base_key: ephemeral_public,
            created_at: now,
        },
        bundle.signed_prekey(),
        prekey,
    )
}

/// Responder side: recompute the initiator's secret from our private keys.
///
/// The caller has already located (and atomically removed) the one-time
/// prekey, or decided to proceed without it.
pub fn respond(
    identity: &Identity,
    peer: DeviceId,
    prekey: &PrekeyHeader,
    signed_prekey: &SignedPrekeyRecord,
    one_time_prekey: Option<&OneTimePrekeyRecord>,
    now: u64,
) -> Result<Session, CryptoError> {
    // A key that is not a valid Edwards point cannot have produced an
    // authentic message.
    let their_identity = Identity::peer_ed25519_to_x25519(&prekey.identity_key)
        .map_err(|_| CryptoError::MessageAuthenticationFailed)?;
    let their_ephemeral = X25519Public::from(prekey.ephemeral_key);
    let our_signed_prekey = signed_prekey.secret.to_x25519();

    let dh1 = our_signed_prekey.diffie_hellman(&their_identity);
    let dh2 = identity.to_x25519_secret().diffie_hellman(&their_ephemeral);
    let dh3 = our_signed_prekey.diffie_hellman(&their_ephemeral);
    let dh4 = one_time_prekey.map(|record| record.secret.to_x25519().diffie_hellman(&their_ephemeral));

    let shared_secret = derive_shared_secret(&dh1, &dh2, &dh3, dh4.as_ref())?;

    let own_identity = identity.public_key_bytes();
    Ok(Session::respond(
        SessionSeed {
            peer,
            shared_secret,
            associated_data: [prekey.identity_key, own_identity].concat(),
            peer_identity: prekey.identity_key,
            base_key: prekey.ephemeral_key,
            created_at: now,
        },
        signed_prekey.secret.clone(),
    ))
}

fn derive_shared_secret(
    dh1: &SharedSecret,
    dh2: &SharedSecret,
    dh3: &SharedSecret,
    dh4: Option<&SharedSecret>,
) -> Result<SecretKey, CryptoError> {
    let mut ikm = Zeroizing::new(Vec::with_capacity(160));
    ikm.extend_from_slice(&[0xFF; 32]);
    ikm.extend_from_slice(dh1.as_bytes());
    ikm.extend_from_slice(dh2.as_bytes());
    ikm.extend_from_slice(dh3.as_bytes());
    if let Some(dh4) = dh4 {
        ikm.extend_from_slice(dh4.as_bytes());
    }

    let hk = Hkdf::<Sha256>::new(Some(&[0u8; 32]), &ikm);
    let mut okm = [0u8; 32];
    hk.expand(X3DH_INFO, &mut okm)
        .map_err(|e| CryptoError::KeyGeneration(format!("HKDF expand failed: {e}")))?;
    Ok(SecretKey::from_bytes(okm))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::prekeys::PreKeyBundle;

    struct Responder {
        identity: Identity,
        signed_prekey: SignedPrekeyRecord,
        one_time_prekey: OneTimePrekeyRecord,
    }

    impl Responder {
        fn new() -> Self {
            let identity = Identity::generate();
            let signed_prekey = SignedPrekeyRecord::generate(1, &identity, 0).unwrap();
            Self {
                identity,
                signed_prekey,
                one_time_prekey: OneTimePrekeyRecord::generate(7),
            }
        }

        fn bundle(&self, with_otpk: bool) -> VerifiedBundle {
            PreKeyBundle {
                device_id: self.identity.device_id(),
                identity_key: self.identity.public_key_bytes().to_vec(),
                signed_prekey_id: self.signed_prekey.id,
                signed_prekey: self.signed_prekey.public.to_vec(),
                signed_prekey_signature: self.signed_prekey.signature.clone(),
                one_time_prekey_id: with_otpk.then_some(self.one_time_prekey.id),
                one_time_prekey: with_otpk.then(|| self.one_time_prekey.public.to_vec()),
            }
            .verify()
            .unwrap()
        }
    }

    #[test]
    fn both_sides_agree_with_one_time_prekey() {
        let alice = Identity::generate();
        let bob = Responder::new();

        let mut alice_session = initiate(&alice, &bob.bundle(true), 10).unwrap();
        let first = alice_session.encrypt(b"hello bob").unwrap();
        let prekey = first.header.prekey.unwrap();
        assert_eq!(prekey.one_time_prekey_id, Some(7));
        assert_eq!(prekey.identity_key, alice.public_key_bytes());

        let mut bob_session = respond(
            &bob.identity,
            alice.device_id(),
            &prekey,
            &bob.signed_prekey,
            Some(&bob.one_time_prekey),
            10,
        )
        .unwrap();
        assert_eq!(
            bob_session.decrypt(&first.header, &first.ciphertext, 10).unwrap(),
            b"hello bob"
        );
        assert_eq!(bob_session.peer_identity(), &alice.public_key_bytes());
    }

    #[test]
    fn both_sides_agree_without_one_time_prekey() {
        let alice = Identity::generate();
        let bob = Responder::new();

        let mut alice_session = initiate(&alice, &bob.bundle(false), 10).unwrap();
        let first = alice_session.encrypt(b"degraded but fine").unwrap();
        let prekey = first.header.prekey.unwrap();
        assert_eq!(prekey.one_time_prekey_id, None);

        let mut bob_session =
            respond(&bob.identity, alice.device_id(), &prekey, &bob.signed_prekey, None, 10)
                .unwrap();
        assert!(bob_session.decrypt(&first.header, &first.ciphertext, 10).is_ok());
    }

    #[test]
    fn responder_missing_one_time_term_cannot_decrypt() {
        let alice = Identity::generate();
        let bob = Responder::new();

        let mut alice_session = initiate(&alice, &bob.bundle(true), 10).unwrap();
        let first = alice_session.encrypt(b"x").unwrap();
        let prekey = first.header.prekey.unwrap();

        let mut bob_session =
            respond(&bob.identity, alice.device_id(), &prekey, &bob.signed_prekey, None, 10)
                .unwrap();
        assert!(matches!(
            bob_session.decrypt(&first.header, &first.ciphertext, 10),
            Err(CryptoError::MessageAuthenticationFailed)
        ));
    }

    #[test]
    fn each_initiation_uses_a_fresh_ephemeral() {
        let alice = Identity::generate();
        let bob = Responder::new();
        let bundle = bob.bundle(false);

        let mut s1 = initiate(&alice, &bundle, 0).unwrap();
        let mut s2 = initiate(&alice, &bundle, 0).unwrap();
        let h1 = s1.encrypt(b"a").unwrap().header.prekey.unwrap();
        let h2 = s2.encrypt(b"a").unwrap().header.prekey.unwrap();
        assert_ne!(h1.ephemeral_key, h2.ephemeral_key);
    }
}
