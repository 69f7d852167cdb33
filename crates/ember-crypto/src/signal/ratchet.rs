//! Double Ratchet session state.
//!
//! # Security Properties
//!
//! - Forward secrecy: every chain key is replaced by its successor and the
//!   old value zeroized as soon as a message key is derived from it.
//! - Break-in recovery: each change of the peer's ratchet key mixes a fresh
//!   DH output into the root key.
//! - Transactional decrypt: [`Session::decrypt`] works on a copy and only
//!   replaces `self` once the header MAC and the AEAD tag both check out.

use std::collections::VecDeque;

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::{Aes256Gcm, Nonce};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use x25519_dalek::PublicKey as X25519Public;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::CryptoError;
use crate::identity::DeviceId;
use crate::signal::keys::{generate_x25519, SecretKey};
use crate::signal::message::{EncryptedMessage, MessageHeader, PrekeyHeader, HEADER_MAC_LEN};

type HmacSha256 = Hmac<Sha256>;

const ROOT_INFO: &[u8] = b"EmberRatchetRoot";
const MESSAGE_KEY_INFO: &[u8] = b"EmberMessageKeys";

/// HMAC input for deriving a message key from a chain key
const MESSAGE_LABEL: &[u8] = &[0x01];

/// HMAC input for deriving the next chain key
const CHAIN_LABEL: &[u8] = &[0x02];

/// Header keys of this many superseded receiving chains are kept so late
/// messages on them can be told apart from forgeries. Chains that still
/// have cached message keys stay verifiable through those keys.
const RETIRED_CHAIN_LIMIT: usize = 8;

#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
struct RootKey([u8; 32]);

impl RootKey {
    /// Mix a DH output into the root key: new root key, new chain key, and
    /// the header key of that chain.
    fn ratchet(&self, dh_output: &[u8; 32]) -> Result<(RootKey, ChainKey, HeaderKey), CryptoError> {
        let hk = Hkdf::<Sha256>::new(Some(&self.0), dh_output);
        let mut okm = [0u8; 96];
        hk.expand(ROOT_INFO, &mut okm)
            .map_err(|e| CryptoError::KeyGeneration(format!("root KDF: {e}")))?;

        let mut root = [0u8; 32];
        let mut chain = [0u8; 32];
        let mut header = [0u8; 32];
        root.copy_from_slice(&okm[..32]);
        chain.copy_from_slice(&okm[32..64]);
        header.copy_from_slice(&okm[64..]);
        okm.zeroize();

        Ok((RootKey(root), ChainKey(chain), HeaderKey(header)))
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
struct ChainKey([u8; 32]);

impl ChainKey {
    /// One step of the symmetric ratchet. The caller must overwrite the
    /// current chain key with the returned successor.
    fn step(&self) -> (ChainKey, MessageKey) {
        (
            ChainKey(hmac_sha256(&self.0, CHAIN_LABEL)),
            MessageKey(hmac_sha256(&self.0, MESSAGE_LABEL)),
        )
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
struct HeaderKey([u8; 32]);

impl HeaderKey {
    fn mac(&self, header: &MessageHeader) -> [u8; HEADER_MAC_LEN] {
        let full = hmac_sha256(&self.0, &header.authenticated_bytes());
        let mut tag = [0u8; HEADER_MAC_LEN];
        tag.copy_from_slice(&full[..HEADER_MAC_LEN]);
        tag
    }

    fn verify(&self, header: &MessageHeader) -> Result<(), CryptoError> {
        let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(&self.0) else {
            unreachable!("HMAC-SHA256 accepts any key size");
        };
        mac.update(&header.authenticated_bytes());
        mac.verify_truncated_left(&header.mac)
            .map_err(|_| CryptoError::MessageAuthenticationFailed)
    }
}

#[derive(Clone, Zeroize, ZeroizeOnDrop, Serialize, Deserialize)]
struct MessageKey([u8; 32]);

impl MessageKey {
    fn cipher(&self) -> Result<(Aes256Gcm, [u8; 12]), CryptoError> {
        let hk = Hkdf::<Sha256>::new(None, &self.0);
        let mut okm = [0u8; 44];
        hk.expand(MESSAGE_KEY_INFO, &mut okm)
            .map_err(|e| CryptoError::KeyGeneration(format!("message KDF: {e}")))?;
        let cipher = Aes256Gcm::new_from_slice(&okm[..32])
            .map_err(|e| CryptoError::KeyGeneration(e.to_string()))?;
        let mut nonce = [0u8; 12];
        nonce.copy_from_slice(&okm[32..]);
        okm.zeroize();
        Ok((cipher, nonce))
    }

    fn seal(&self, aad: &[u8], plaintext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (cipher, nonce) = self.cipher()?;
        cipher
            .encrypt(Nonce::from_slice(&nonce), Payload { msg: plaintext, aad })
            .map_err(|e| CryptoError::EncryptionError(e.to_string()))
    }

    fn open(&self, aad: &[u8], ciphertext: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let (cipher, nonce) = self.cipher()?;
        cipher
            .decrypt(Nonce::from_slice(&nonce), Payload { msg: ciphertext, aad })
            .map_err(|_| CryptoError::MessageAuthenticationFailed)
    }
}

fn hmac_sha256(key: &[u8; 32], data: &[u8]) -> [u8; 32] {
    let Ok(mut mac) = <HmacSha256 as Mac>::new_from_slice(key) else {
        unreachable!("HMAC-SHA256 accepts any key size");
    };
    mac.update(data);
    let mut out = [0u8; 32];
    out.copy_from_slice(&mac.finalize().into_bytes());
    out
}

#[derive(Clone, Serialize, Deserialize)]
struct SendingChain {
    chain_key: ChainKey,
    header_key: HeaderKey,
    counter: u32,
}

#[derive(Clone, Serialize, Deserialize)]
struct ReceivingChain {
    ratchet_key: [u8; 32],
    chain_key: ChainKey,
    header_key: HeaderKey,
    counter: u32,
}

#[derive(Clone, Serialize, Deserialize)]
struct RetiredChain {
    ratchet_key: [u8; 32],
    header_key: HeaderKey,
}

#[derive(Clone, Serialize, Deserialize)]
struct SkippedKey {
    ratchet_key: [u8; 32],
    counter: u32,
    header_key: HeaderKey,
    message_key: MessageKey,
}

/// Lifecycle of a session as seen by callers. A retired session no longer
/// exists: it is deleted from the store and its keys are wiped on drop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionPhase {
    /// Keys agreed, no message sent or received yet.
    Established,
    /// At least one message has moved through the ratchet.
    Active,
}

/// What key agreement hands to the ratchet.
pub struct SessionSeed {
    pub peer: DeviceId,
    /// 32-byte agreed secret; consumed by session construction.
    pub shared_secret: SecretKey,
    /// Initiator identity key followed by responder identity key.
    pub associated_data: Vec<u8>,
    pub peer_identity: [u8; 32],
    /// The initiator's ephemeral key. Identifies the key agreement.
    pub base_key: [u8; 32],
    pub created_at: u64,
}

/// Per-peer ratchet state.
#[derive(Clone, Serialize, Deserialize)]
pub struct Session {
    peer: DeviceId,
    peer_identity: [u8; 32],
    base_key: [u8; 32],
    associated_data: Vec<u8>,
    root_key: RootKey,
    ratchet_secret: SecretKey,
    ratchet_public: [u8; 32],
    sending: Option<SendingChain>,
    previous_sending_counter: u32,
    receiving: Option<ReceivingChain>,
    retired_receiving: VecDeque<RetiredChain>,
    skipped: VecDeque<SkippedKey>,
    pending_prekey: Option<PrekeyHeader>,
    created_at: u64,
}

impl Session {
    /// Initiator state: first DH ratchet step against the peer's signed
    /// prekey, giving the first sending chain.
    pub fn initiate(
        seed: SessionSeed,
        peer_ratchet_key: &X25519Public,
        prekey: PrekeyHeader,
    ) -> Result<Self, CryptoError> {
        let root = RootKey(*seed.shared_secret.as_bytes());
        let (ratchet_secret, ratchet_public) = generate_x25519();
        let dh = ratchet_secret.to_x25519().diffie_hellman(peer_ratchet_key);
        let (root_key, chain_key, header_key) = root.ratchet(dh.as_bytes())?;

        Ok(Self {
            peer: seed.peer,
            peer_identity: seed.peer_identity,
            base_key: seed.base_key,
            associated_data: seed.associated_data,
            root_key,
            ratchet_secret,
            ratchet_public,
            sending: Some(SendingChain {
                chain_key,
                header_key,
                counter: 0,
            }),
            previous_sending_counter: 0,
            receiving: None,
            retired_receiving: VecDeque::new(),
            skipped: VecDeque::new(),
            pending_prekey: Some(prekey),
            created_at: seed.created_at,
        })
    }

    /// Responder state: the signed prekey serves as the first ratchet key;
    /// chains appear with the initiator's first message.
    pub fn respond(seed: SessionSeed, signed_prekey: SecretKey) -> Self {
        let ratchet_public = signed_prekey.x25519_public().to_bytes();
        Self {
            peer: seed.peer,
            peer_identity: seed.peer_identity,
            base_key: seed.base_key,
            associated_data: seed.associated_data,
            root_key: RootKey(*seed.shared_secret.as_bytes()),
            ratchet_secret: signed_prekey,
            ratchet_public,
            sending: None,
            previous_sending_counter: 0,
            receiving: None,
            retired_receiving: VecDeque::new(),
            skipped: VecDeque::new(),
            pending_prekey: None,
            created_at: seed.created_at,
        }
    }

    pub fn peer(&self) -> &DeviceId {
        &self.peer
    }

    pub fn peer_identity(&self) -> &[u8; 32] {
        &self.peer_identity
    }

    /// Ephemeral key of the key agreement this session was built from.
    pub fn base_key(&self) -> &[u8; 32] {
        &self.base_key
    }

    pub fn created_at(&self) -> u64 {
        self.created_at
    }

    /// Our current ratchet public key, as carried in outgoing headers.
    pub fn ratchet_public(&self) -> &[u8; 32] {
        &self.ratchet_public
    }

    pub fn pending_prekey(&self) -> Option<&PrekeyHeader> {
        self.pending_prekey.as_ref()
    }

    pub fn skipped_key_count(&self) -> usize {
        self.skipped.len()
    }

    pub fn phase(&self) -> SessionPhase {
        let sent = self.previous_sending_counter > 0
            || self.sending.as_ref().is_some_and(|chain| chain.counter > 0);
        if sent || self.receiving.is_some() {
            SessionPhase::Active
        } else {
            SessionPhase::Established
        }
    }

    /// An initiator session the peer never acknowledged, older than `max_age_secs`.
    /// The peer may have purged the signed prekey it was built on.
    pub fn is_stale(&self, now: u64, max_age_secs: u64) -> bool {
        self.pending_prekey.is_some() && now.saturating_sub(self.created_at) > max_age_secs
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CryptoError> {
        bincode::serialize(self).map_err(|e| CryptoError::Serialization(e.to_string()))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        bincode::deserialize(bytes).map_err(|e| CryptoError::Serialization(e.to_string()))
    }

    /// Encrypt one message, advancing the sending chain by one step.
    pub fn encrypt(&mut self, plaintext: &[u8]) -> Result<EncryptedMessage, CryptoError> {
        let sending = self
            .sending
            .as_mut()
            .ok_or_else(|| CryptoError::NoSession(format!("{} (no sending chain)", self.peer)))?;
        let counter = sending.counter;
        let next_counter = counter
            .checked_add(1)
            .ok_or_else(|| CryptoError::EncryptionError("sending chain exhausted".into()))?;

        let (next_chain_key, message_key) = sending.chain_key.step();
        sending.chain_key = next_chain_key;
        sending.counter = next_counter;

        #[cfg(test)]
        key_log::record(&message_key.0);

        let mut header = MessageHeader {
            ratchet_key: self.ratchet_public,
            previous_counter: self.previous_sending_counter,
            counter,
            prekey: self.pending_prekey,
            mac: [0u8; HEADER_MAC_LEN],
        };
        header.mac = sending.header_key.mac(&header);

        let ciphertext = message_key.seal(&aad(&self.associated_data, &header), plaintext)?;
        Ok(EncryptedMessage { header, ciphertext })
    }

    /// Decrypt one message. On any error `self` is left exactly as it was.
    pub fn decrypt(
        &mut self,
        header: &MessageHeader,
        ciphertext: &[u8],
        max_skip: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        let mut next = self.clone();
        let plaintext = next.decrypt_in_place(header, ciphertext, max_skip)?;
        *self = next;
        Ok(plaintext)
    }

    fn decrypt_in_place(
        &mut self,
        header: &MessageHeader,
        ciphertext: &[u8],
        max_skip: usize,
    ) -> Result<Vec<u8>, CryptoError> {
        let message_key = if let Some(index) = self.skipped.iter().position(|entry| {
            entry.ratchet_key == header.ratchet_key && entry.counter == header.counter
        }) {
            self.skipped[index].header_key.verify(header)?;
            self.skipped
                .remove(index)
                .map(|entry| entry.message_key)
                .ok_or(CryptoError::MessageAuthenticationFailed)?
        } else if let Some(receiving) = self
            .receiving
            .as_ref()
            .filter(|chain| chain.ratchet_key == header.ratchet_key)
        {
            receiving.header_key.verify(header)?;
            if header.counter < receiving.counter {
                return Err(CryptoError::MessageKeyExpired {
                    counter: header.counter,
                });
            }
            self.advance_receiving(header.counter, max_skip)?
        } else if let Some(header_key) = self.superseded_header_key(&header.ratchet_key) {
            header_key.verify(header)?;
            return Err(CryptoError::MessageKeyExpired {
                counter: header.counter,
            });
        } else {
            self.dh_ratchet(header, max_skip)?;
            self.advance_receiving(header.counter, max_skip)?
        };

        let plaintext = message_key.open(&aad(&self.associated_data, header), ciphertext)?;
        // The peer has a session with us; stop sending key agreement material.
        self.pending_prekey = None;
        Ok(plaintext)
    }

    /// Header key of an earlier receiving chain, from the retired list or
    /// from any key still cached for it.
    fn superseded_header_key(&self, ratchet_key: &[u8; 32]) -> Option<&HeaderKey> {
        self.retired_receiving
            .iter()
            .filter(|chain| &chain.ratchet_key == ratchet_key)
            .map(|chain| &chain.header_key)
            .chain(
                self.skipped
                    .iter()
                    .filter(|entry| &entry.ratchet_key == ratchet_key)
                    .map(|entry| &entry.header_key),
            )
            .next()
    }

    /// The peer moved to a new ratchet key: derive the matching receiving
    /// chain, authenticate the header under it, then start a new sending chain.
    fn dh_ratchet(&mut self, header: &MessageHeader, max_skip: usize) -> Result<(), CryptoError> {
        let their_key = X25519Public::from(header.ratchet_key);
        let dh = self.ratchet_secret.to_x25519().diffie_hellman(&their_key);
        let (root_key, chain_key, header_key) = self.root_key.ratchet(dh.as_bytes())?;
        header_key.verify(header)?;

        if let Some(old) = self.receiving.take() {
            self.cache_rest_of_chain(old, header.previous_counter, max_skip);
        }

        self.root_key = root_key;
        self.receiving = Some(ReceivingChain {
            ratchet_key: header.ratchet_key,
            chain_key,
            header_key,
            counter: 0,
        });

        self.previous_sending_counter = self.sending.as_ref().map_or(0, |chain| chain.counter);
        let (ratchet_secret, ratchet_public) = generate_x25519();
        let dh = ratchet_secret.to_x25519().diffie_hellman(&their_key);
        let (root_key, chain_key, header_key) = self.root_key.ratchet(dh.as_bytes())?;
        self.root_key = root_key;
        self.ratchet_secret = ratchet_secret;
        self.ratchet_public = ratchet_public;
        self.sending = Some(SendingChain {
            chain_key,
            header_key,
            counter: 0,
        });

        tracing::debug!(peer = %self.peer, "DH ratchet step");
        Ok(())
    }

    /// Keep the message keys the peer sent on its previous chain but we have
    /// not seen yet, then retire the chain.
    fn cache_rest_of_chain(&mut self, mut chain: ReceivingChain, until: u32, max_skip: usize) {
        let missing = until.saturating_sub(chain.counter) as usize;
        if missing > max_skip {
            tracing::warn!(
                peer = %self.peer,
                missing,
                "previous chain gap exceeds skip bound; its undelivered messages are lost"
            );
        } else {
            while chain.counter < until {
                let (next, message_key) = chain.chain_key.step();
                chain.chain_key = next;
                self.skipped.push_back(SkippedKey {
                    ratchet_key: chain.ratchet_key,
                    counter: chain.counter,
                    header_key: chain.header_key.clone(),
                    message_key,
                });
                chain.counter += 1;
            }
            self.evict_skipped(max_skip);
        }

        self.retired_receiving.push_back(RetiredChain {
            ratchet_key: chain.ratchet_key,
            header_key: chain.header_key.clone(),
        });
        while self.retired_receiving.len() > RETIRED_CHAIN_LIMIT {
            self.retired_receiving.pop_front();
        }
    }

    /// Walk the receiving chain to `target`, caching skipped keys, and
    /// return the key for `target`.
    fn advance_receiving(&mut self, target: u32, max_skip: usize) -> Result<MessageKey, CryptoError> {
        let receiving = self
            .receiving
            .as_mut()
            .ok_or(CryptoError::MessageAuthenticationFailed)?;
        // Reaching `target` must leave fewer than `max_skip` keys behind.
        let gap = target.saturating_sub(receiving.counter) as usize;
        if gap >= max_skip {
            return Err(CryptoError::MessageKeyExpired { counter: target });
        }

        while receiving.counter < target {
            let (next, message_key) = receiving.chain_key.step();
            receiving.chain_key = next;
            self.skipped.push_back(SkippedKey {
                ratchet_key: receiving.ratchet_key,
                counter: receiving.counter,
                header_key: receiving.header_key.clone(),
                message_key,
            });
            receiving.counter += 1;
        }

        let (next, message_key) = receiving.chain_key.step();
        receiving.chain_key = next;
        receiving.counter = receiving.counter.saturating_add(1);

        if gap > 0 {
            tracing::debug!(peer = %self.peer, skipped = gap, "cached skipped message keys");
        }
        self.evict_skipped(max_skip);
        Ok(message_key)
    }

    /// Drop the oldest cached keys beyond the bound.
    fn evict_skipped(&mut self, max_skip: usize) {
        while self.skipped.len() > max_skip {
            if let Some(evicted) = self.skipped.pop_front() {
                tracing::debug!(
                    peer = %self.peer,
                    counter = evicted.counter,
                    "evicted skipped message key"
                );
            }
        }
    }
}

fn aad(associated_data: &[u8], header: &MessageHeader) -> Vec<u8> {
    let mut out = associated_data.to_vec();
    out.extend_from_slice(&header.encode());
    out
}

#[cfg(test)]
pub(crate) mod key_log {
    use std::cell::RefCell;

    thread_local! {
        static SENT_KEYS: RefCell<Option<Vec<[u8; 32]>>> = const { RefCell::new(None) };
    }

    /// Start recording every sending message key derived on this thread.
    pub(crate) fn start() {
        SENT_KEYS.with(|keys| *keys.borrow_mut() = Some(Vec::new()));
    }

    pub(crate) fn record(key: &[u8; 32]) {
        SENT_KEYS.with(|keys| {
            if let Some(log) = keys.borrow_mut().as_mut() {
                log.push(*key);
            }
        });
    }

    pub(crate) fn finish() -> Vec<[u8; 32]> {
        SENT_KEYS.with(|keys| keys.borrow_mut().take().unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use super::*;

    const MAX_SKIP: usize = 1000;

    /// A matched pair of sessions built from the same secret, the way key
    /// agreement would.
    fn session_pair() -> (Session, Session) {
        let secret = [0x42u8; 32];
        let (spk_secret, spk_public) = generate_x25519();
        let ad = [[1u8; 32], [2u8; 32]].concat();

        let alice = Session::initiate(
            SessionSeed {
                peer: DeviceId::from("bob"),
                shared_secret: SecretKey::from_bytes(secret),
                associated_data: ad.clone(),
                peer_identity: [2u8; 32],
                base_key: [3u8; 32],
                created_at: 1_000,
            },
            &X25519Public::from(spk_public),
            PrekeyHeader {
                identity_key: [1u8; 32],
                ephemeral_key: [3u8; 32],
                signed_prekey_id: 1,
                one_time_prekey_id: None,
            },
        )
        .unwrap();
        let bob = Session::respond(
            SessionSeed {
                peer: DeviceId::from("alice"),
                shared_secret: SecretKey::from_bytes(secret),
                associated_data: ad,
                peer_identity: [1u8; 32],
                base_key: [3u8; 32],
                created_at: 1_000,
            },
            spk_secret,
        );
        (alice, bob)
    }

    fn deliver(to: &mut Session, message: &EncryptedMessage) -> Result<Vec<u8>, CryptoError> {
        to.decrypt(&message.header, &message.ciphertext, MAX_SKIP)
    }

    #[test]
    fn chain_step_is_deterministic_and_distinct() {
        let chain = ChainKey([5u8; 32]);
        let (next_a, mk_a) = chain.step();
        let (next_b, mk_b) = chain.step();
        assert_eq!(next_a.0, next_b.0);
        assert_eq!(mk_a.0, mk_b.0);
        assert_ne!(next_a.0, mk_a.0);
        assert_ne!(next_a.0, chain.0);
    }

    #[test]
    fn ping_pong_conversation() {
        let (mut alice, mut bob) = session_pair();
        assert_eq!(alice.phase(), SessionPhase::Established);

        for round in 0..5u8 {
            let m = alice.encrypt(&[round; 3]).unwrap();
            assert_eq!(deliver(&mut bob, &m).unwrap(), vec![round; 3]);
            let r = bob.encrypt(&[round + 100; 2]).unwrap();
            assert_eq!(deliver(&mut alice, &r).unwrap(), vec![round + 100; 2]);
        }
        assert_eq!(alice.phase(), SessionPhase::Active);
        assert_eq!(bob.phase(), SessionPhase::Active);
    }

    #[test]
    fn prekey_header_cleared_after_first_reply() {
        let (mut alice, mut bob) = session_pair();
        let first = alice.encrypt(b"one").unwrap();
        let second = alice.encrypt(b"two").unwrap();
        assert!(first.is_prekey_message());
        assert!(second.is_prekey_message());

        deliver(&mut bob, &first).unwrap();
        let reply = bob.encrypt(b"ack").unwrap();
        assert!(!reply.is_prekey_message());
        deliver(&mut alice, &reply).unwrap();

        assert!(alice.pending_prekey().is_none());
        assert!(!alice.encrypt(b"three").unwrap().is_prekey_message());
    }

    #[test]
    fn ratchet_key_changes_on_each_turn() {
        let (mut alice, mut bob) = session_pair();
        let a1 = alice.encrypt(b"a1").unwrap();
        deliver(&mut bob, &a1).unwrap();
        let b1 = bob.encrypt(b"b1").unwrap();
        deliver(&mut alice, &b1).unwrap();
        let a2 = alice.encrypt(b"a2").unwrap();

        assert_ne!(a1.header.ratchet_key, a2.header.ratchet_key);
        assert_eq!(a2.header.previous_counter, 1);
        assert_eq!(a2.header.counter, 0);
    }

    #[test]
    fn ten_thousand_sends_never_reuse_a_message_key() {
        let (mut alice, _bob) = session_pair();
        key_log::start();
        for i in 0..10_000u32 {
            alice.encrypt(&i.to_le_bytes()).unwrap();
        }
        let keys = key_log::finish();
        assert_eq!(keys.len(), 10_000);
        let unique: HashSet<[u8; 32]> = keys.into_iter().collect();
        assert_eq!(unique.len(), 10_000);
    }

    #[test]
    fn late_message_from_previous_chain_uses_cached_key() {
        let (mut alice, mut bob) = session_pair();
        let a0 = alice.encrypt(b"a0").unwrap();
        let a1 = alice.encrypt(b"a1").unwrap();
        deliver(&mut bob, &a0).unwrap();

        let b0 = bob.encrypt(b"b0").unwrap();
        deliver(&mut alice, &b0).unwrap();
        let a2 = alice.encrypt(b"a2").unwrap();
        deliver(&mut bob, &a2).unwrap();
        assert_eq!(bob.skipped_key_count(), 1);

        assert_eq!(deliver(&mut bob, &a1).unwrap(), b"a1");
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn cached_key_outlives_retired_chain_limit() {
        let (mut alice, mut bob) = session_pair();
        let a0 = alice.encrypt(b"a0").unwrap();
        let a1 = alice.encrypt(b"a1").unwrap();
        let a2 = alice.encrypt(b"a2").unwrap();
        deliver(&mut bob, &a0).unwrap();

        for _ in 0..=RETIRED_CHAIN_LIMIT + 1 {
            let reply = bob.encrypt(b"b").unwrap();
            deliver(&mut alice, &reply).unwrap();
            let next = alice.encrypt(b"a").unwrap();
            deliver(&mut bob, &next).unwrap();
        }
        assert!(bob
            .retired_receiving
            .iter()
            .all(|chain| chain.ratchet_key != a0.header.ratchet_key));

        assert_eq!(deliver(&mut bob, &a2).unwrap(), b"a2");
        // a1 is still cached, so the chain's header key is too.
        assert!(matches!(
            deliver(&mut bob, &a0),
            Err(CryptoError::MessageKeyExpired { counter: 0 })
        ));
        assert_eq!(deliver(&mut bob, &a1).unwrap(), b"a1");
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn replayed_message_is_expired_and_harmless() {
        let (mut alice, mut bob) = session_pair();
        let m = alice.encrypt(b"once").unwrap();
        deliver(&mut bob, &m).unwrap();
        assert!(matches!(
            deliver(&mut bob, &m),
            Err(CryptoError::MessageKeyExpired { counter: 0 })
        ));
        let next = alice.encrypt(b"twice").unwrap();
        assert_eq!(deliver(&mut bob, &next).unwrap(), b"twice");
    }

    #[test]
    fn replay_on_retired_chain_is_expired() {
        let (mut alice, mut bob) = session_pair();
        let a0 = alice.encrypt(b"a0").unwrap();
        deliver(&mut bob, &a0).unwrap();
        let b0 = bob.encrypt(b"b0").unwrap();
        deliver(&mut alice, &b0).unwrap();
        let a1 = alice.encrypt(b"a1").unwrap();
        deliver(&mut bob, &a1).unwrap();

        assert!(matches!(
            deliver(&mut bob, &a0),
            Err(CryptoError::MessageKeyExpired { .. })
        ));
    }

    #[test]
    fn eviction_drops_oldest_skipped_keys() {
        let (mut alice, mut bob) = session_pair();
        let max_skip = 4;
        let messages: Vec<_> = (0..8u8).map(|i| alice.encrypt(&[i]).unwrap()).collect();

        // Counter 3 caches 0..=2; counter 7 caches 4..=6 and pushes out 0 and 1.
        bob.decrypt(&messages[3].header, &messages[3].ciphertext, max_skip)
            .unwrap();
        bob.decrypt(&messages[7].header, &messages[7].ciphertext, max_skip)
            .unwrap();
        assert_eq!(bob.skipped_key_count(), 4);

        for evicted in &messages[..2] {
            assert!(matches!(
                bob.decrypt(&evicted.header, &evicted.ciphertext, max_skip),
                Err(CryptoError::MessageKeyExpired { .. })
            ));
        }
        for kept in [2usize, 4, 5, 6] {
            assert_eq!(
                bob.decrypt(&messages[kept].header, &messages[kept].ciphertext, max_skip)
                    .unwrap(),
                vec![kept as u8]
            );
        }
    }

    #[test]
    fn gap_reaching_the_bound_is_expired() {
        let (mut alice, mut bob) = session_pair();
        let max_skip = 5;
        let messages: Vec<_> = (0..=max_skip).map(|_| alice.encrypt(b"m").unwrap()).collect();
        let last = &messages[max_skip];
        assert!(matches!(
            bob.decrypt(&last.header, &last.ciphertext, max_skip),
            Err(CryptoError::MessageKeyExpired { counter: 5 })
        ));
        assert_eq!(bob.skipped_key_count(), 0);
        assert_eq!(
            bob.decrypt(&messages[4].header, &messages[4].ciphertext, max_skip)
                .unwrap(),
            b"m"
        );
    }

    #[test]
    fn failed_decrypt_leaves_state_untouched() {
        let (mut alice, mut bob) = session_pair();
        let m = alice.encrypt(b"payload").unwrap();
        let before = bob.to_bytes().unwrap();

        let mut tampered = m.clone();
        tampered.ciphertext[0] ^= 1;
        assert!(matches!(
            deliver(&mut bob, &tampered),
            Err(CryptoError::MessageAuthenticationFailed)
        ));
        assert_eq!(bob.to_bytes().unwrap(), before);
        assert_eq!(deliver(&mut bob, &m).unwrap(), b"payload");
    }

    #[test]
    fn forged_counter_rejected_before_chain_walk() {
        let (mut alice, mut bob) = session_pair();
        let mut m = alice.encrypt(b"x").unwrap();
        m.header.counter = u32::MAX;
        assert!(matches!(
            deliver(&mut bob, &m),
            Err(CryptoError::MessageAuthenticationFailed)
        ));
        assert_eq!(bob.skipped_key_count(), 0);
    }

    #[test]
    fn serialized_session_keeps_working() {
        let (mut alice, bob) = session_pair();
        let mut bob = Session::from_bytes(&bob.to_bytes().unwrap()).unwrap();
        let m = alice.encrypt(b"persisted").unwrap();
        assert_eq!(deliver(&mut bob, &m).unwrap(), b"persisted");
        assert!(Session::from_bytes(b"garbage").is_err());
    }

    #[test]
    fn staleness_only_applies_to_unacknowledged_initiators() {
        let (mut alice, mut bob) = session_pair();
        assert!(!alice.is_stale(1_000 + 10, 60));
        assert!(alice.is_stale(1_000 + 61, 60));
        assert!(!bob.is_stale(1_000 + 61, 60));

        let m = alice.encrypt(b"hi").unwrap();
        deliver(&mut bob, &m).unwrap();
        let r = bob.encrypt(b"hey").unwrap();
        deliver(&mut alice, &r).unwrap();
        assert!(!alice.is_stale(1_000 + 61, 60));
    }
}
