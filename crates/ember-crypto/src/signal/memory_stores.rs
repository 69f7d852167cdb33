//! In-memory implementations of the storage traits.
//!
//! These are suitable for:
//! - Testing and development
//! - Embedders that persist by snapshotting the stores themselves
//!
//! **WARNING**: Data is lost on process exit.

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use crate::error::CryptoError;
use crate::identity::{DeviceId, Identity};
use crate::signal::prekeys::{OneTimePrekeyRecord, SignedPrekeyRecord};
use crate::signal::store::{IdentityKeyStore, PreKeyStore, SessionAddress, SessionStore};

/// In-memory identity key store with a TOFU trust policy.
pub struct MemoryIdentityStore {
    identity_secret: [u8; 32],
    trusted: Mutex<HashMap<DeviceId, [u8; 32]>>,
}

impl MemoryIdentityStore {
    pub fn new(identity: &Identity) -> Self {
        Self {
            identity_secret: *identity.secret_key_bytes(),
            trusted: Mutex::new(HashMap::new()),
        }
    }
}

impl Drop for MemoryIdentityStore {
    fn drop(&mut self) {
        zeroize::Zeroize::zeroize(&mut self.identity_secret);
    }
}

impl IdentityKeyStore for MemoryIdentityStore {
    fn identity(&self) -> Result<Identity, CryptoError> {
        Ok(Identity::from_secret_bytes(&self.identity_secret))
    }

    fn is_trusted_identity(
        &self,
        device: &DeviceId,
        identity_key: &[u8; 32],
    ) -> Result<bool, CryptoError> {
        match self.trusted.lock().get(device) {
            Some(stored) => Ok(stored == identity_key),
            None => Ok(true), // TOFU: trust on first use
        }
    }

    fn save_identity(&self, device: &DeviceId, identity_key: &[u8; 32]) -> Result<(), CryptoError> {
        self.trusted.lock().insert(device.clone(), *identity_key);
        Ok(())
    }

    fn forget_identity(&self, device: &DeviceId) -> Result<(), CryptoError> {
        self.trusted.lock().remove(device);
        Ok(())
    }
}

#[derive(Default)]
struct PrekeyTables {
    signed: BTreeMap<u32, SignedPrekeyRecord>,
    one_time: BTreeMap<u32, OneTimePrekeyRecord>,
    max_one_time_id: Option<u32>,
}

/// In-memory prekey store. One lock covers every table, so issue and take
/// are atomic with respect to each other.
#[derive(Default)]
pub struct MemoryPreKeyStore {
    tables: Mutex<PrekeyTables>,
}

impl MemoryPreKeyStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl PreKeyStore for MemoryPreKeyStore {
    fn load_signed_prekey(&self, id: u32) -> Result<Option<SignedPrekeyRecord>, CryptoError> {
        Ok(self.tables.lock().signed.get(&id).cloned())
    }

    fn store_signed_prekey(&self, record: SignedPrekeyRecord) -> Result<(), CryptoError> {
        self.tables.lock().signed.insert(record.id, record);
        Ok(())
    }

    fn remove_signed_prekey(&self, id: u32) -> Result<(), CryptoError> {
        self.tables.lock().signed.remove(&id);
        Ok(())
    }

    fn signed_prekeys(&self) -> Result<Vec<SignedPrekeyRecord>, CryptoError> {
        Ok(self.tables.lock().signed.values().cloned().collect())
    }

    fn store_one_time_prekey(&self, record: OneTimePrekeyRecord) -> Result<(), CryptoError> {
        let mut tables = self.tables.lock();
        tables.max_one_time_id = tables.max_one_time_id.max(Some(record.id));
        tables.one_time.insert(record.id, record);
        Ok(())
    }

    fn issue_one_time_prekey(&self) -> Result<Option<OneTimePrekeyRecord>, CryptoError> {
        let mut tables = self.tables.lock();
        let next = tables.one_time.values_mut().find(|record| !record.issued);
        Ok(next.map(|record| {
            record.issued = true;
            record.clone()
        }))
    }

    fn take_one_time_prekey(&self, id: u32) -> Result<Option<OneTimePrekeyRecord>, CryptoError> {
        Ok(self.tables.lock().one_time.remove(&id))
    }

    fn unissued_one_time_prekeys(&self) -> Result<usize, CryptoError> {
        Ok(self
            .tables
            .lock()
            .one_time
            .values()
            .filter(|record| !record.issued)
            .count())
    }

    fn max_one_time_prekey_id(&self) -> Result<Option<u32>, CryptoError> {
        Ok(self.tables.lock().max_one_time_id)
    }
}

/// In-memory session store keyed by `(local, peer)`.
#[derive(Default)]
pub struct MemorySessionStore {
    sessions: Mutex<HashMap<SessionAddress, Vec<u8>>>,
}

impl MemorySessionStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl SessionStore for MemorySessionStore {
    fn load_session(&self, address: &SessionAddress) -> Result<Option<Vec<u8>>, CryptoError> {
        Ok(self.sessions.lock().get(address).cloned())
    }

    fn store_session(
        &self,
        address: &SessionAddress,
        session_data: &[u8],
    ) -> Result<(), CryptoError> {
        self.sessions
            .lock()
            .insert(address.clone(), session_data.to_vec());
        Ok(())
    }

    fn has_session(&self, address: &SessionAddress) -> Result<bool, CryptoError> {
        Ok(self.sessions.lock().contains_key(address))
    }

    fn delete_session(&self, address: &SessionAddress) -> Result<(), CryptoError> {
        self.sessions.lock().remove(address);
        Ok(())
    }

    fn list_sessions(&self, local: &DeviceId) -> Result<Vec<DeviceId>, CryptoError> {
        let mut peers: Vec<DeviceId> = self
            .sessions
            .lock()
            .keys()
            .filter(|address| &address.local == local)
            .map(|address| address.peer.clone())
            .collect();
        peers.sort();
        Ok(peers)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tofu_pins_first_identity() {
        let store = MemoryIdentityStore::new(&Identity::generate());
        let device = DeviceId::from("bob-phone");
        let first = [1u8; 32];
        let second = [2u8; 32];

        assert!(store.is_trusted_identity(&device, &first).unwrap());
        store.save_identity(&device, &first).unwrap();
        assert!(store.is_trusted_identity(&device, &first).unwrap());
        assert!(!store.is_trusted_identity(&device, &second).unwrap());

        store.forget_identity(&device).unwrap();
        assert!(store.is_trusted_identity(&device, &second).unwrap());
    }

    #[test]
    fn identity_roundtrips_through_store() {
        let identity = Identity::generate();
        let store = MemoryIdentityStore::new(&identity);
        assert_eq!(
            store.identity().unwrap().public_key_bytes(),
            identity.public_key_bytes()
        );
    }

    #[test]
    fn one_time_prekeys_issue_once_and_take_once() {
        let store = MemoryPreKeyStore::new();
        store.store_one_time_prekey(OneTimePrekeyRecord::generate(1)).unwrap();
        store.store_one_time_prekey(OneTimePrekeyRecord::generate(2)).unwrap();
        assert_eq!(store.unissued_one_time_prekeys().unwrap(), 2);

        let a = store.issue_one_time_prekey().unwrap().unwrap();
        let b = store.issue_one_time_prekey().unwrap().unwrap();
        assert_ne!(a.id, b.id);
        assert!(store.issue_one_time_prekey().unwrap().is_none());
        assert_eq!(store.unissued_one_time_prekeys().unwrap(), 0);

        assert!(store.take_one_time_prekey(a.id).unwrap().is_some());
        assert!(store.take_one_time_prekey(a.id).unwrap().is_none());
        assert_eq!(store.max_one_time_prekey_id().unwrap(), Some(2));
    }

    #[test]
    fn sessions_listed_per_local_device() {
        let store = MemorySessionStore::new();
        let alice = DeviceId::from("alice");
        let other = DeviceId::from("other");
        store
            .store_session(&SessionAddress::new(alice.clone(), "bob".into()), b"x")
            .unwrap();
        store
            .store_session(&SessionAddress::new(other.clone(), "carol".into()), b"y")
            .unwrap();

        assert_eq!(store.list_sessions(&alice).unwrap(), vec![DeviceId::from("bob")]);
        let addr = SessionAddress::new(alice.clone(), "bob".into());
        assert!(store.has_session(&addr).unwrap());
        store.delete_session(&addr).unwrap();
        assert!(!store.has_session(&addr).unwrap());
        assert!(store.list_sessions(&alice).unwrap().is_empty());
    }
}
