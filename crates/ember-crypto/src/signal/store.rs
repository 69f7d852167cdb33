use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;
use crate::identity::{DeviceId, Identity};
use crate::signal::prekeys::{OneTimePrekeyRecord, SignedPrekeyRecord};

/// Sessions are keyed by the pair of devices they connect.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SessionAddress {
    pub local: DeviceId,
    pub peer: DeviceId,
}

impl SessionAddress {
    pub fn new(local: DeviceId, peer: DeviceId) -> Self {
        Self { local, peer }
    }
}

impl fmt::Display for SessionAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}->{}", self.local, self.peer)
    }
}

/// Storage for the local identity and the identities of known peers.
///
/// Peer identities follow Trust On First Use: the first key seen for a
/// device is pinned, later mismatches are reported.
pub trait IdentityKeyStore: Send + Sync {
    /// Our own identity key pair.
    fn identity(&self) -> Result<Identity, CryptoError>;

    /// Check if a remote identity key is trusted.
    fn is_trusted_identity(&self, device: &DeviceId, identity_key: &[u8; 32])
        -> Result<bool, CryptoError>;

    /// Pin a remote identity key.
    fn save_identity(&self, device: &DeviceId, identity_key: &[u8; 32]) -> Result<(), CryptoError>;

    /// Forget a pinned identity (after the user re-verifies a safety number).
    fn forget_identity(&self, device: &DeviceId) -> Result<(), CryptoError>;
}

/// Storage for signed and one-time prekeys. Sole owner of their private halves.
pub trait PreKeyStore: Send + Sync {
    fn load_signed_prekey(&self, id: u32) -> Result<Option<SignedPrekeyRecord>, CryptoError>;

    /// Insert or replace a signed prekey record.
    fn store_signed_prekey(&self, record: SignedPrekeyRecord) -> Result<(), CryptoError>;

    fn remove_signed_prekey(&self, id: u32) -> Result<(), CryptoError>;

    fn signed_prekeys(&self) -> Result<Vec<SignedPrekeyRecord>, CryptoError>;

    fn store_one_time_prekey(&self, record: OneTimePrekeyRecord) -> Result<(), CryptoError>;

    /// Atomically pick an unissued one-time prekey and mark it issued.
    fn issue_one_time_prekey(&self) -> Result<Option<OneTimePrekeyRecord>, CryptoError>;

    /// Atomically remove and return a one-time prekey. A second call with the
    /// same id returns `None`.
    fn take_one_time_prekey(&self, id: u32) -> Result<Option<OneTimePrekeyRecord>, CryptoError>;

    /// Count of one-time prekeys not yet placed in a bundle.
    fn unissued_one_time_prekeys(&self) -> Result<usize, CryptoError>;

    /// Highest one-time prekey id ever stored, for id allocation.
    fn max_one_time_prekey_id(&self) -> Result<Option<u32>, CryptoError>;
}

/// Storage for serialized session state.
///
/// Implementations must make `save` atomic per address: a reader sees the
/// old bytes or the new bytes, never a mix.
pub trait SessionStore: Send + Sync {
    fn load_session(&self, address: &SessionAddress) -> Result<Option<Vec<u8>>, CryptoError>;

    fn store_session(&self, address: &SessionAddress, session_data: &[u8])
        -> Result<(), CryptoError>;

    fn has_session(&self, address: &SessionAddress) -> Result<bool, CryptoError>;

    fn delete_session(&self, address: &SessionAddress) -> Result<(), CryptoError>;

    /// Peers that `local` holds sessions with.
    fn list_sessions(&self, local: &DeviceId) -> Result<Vec<DeviceId>, CryptoError>;
}
