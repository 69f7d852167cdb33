//! A simulated device: identity, in-memory stores and both managers.

#![allow(dead_code)]

use std::sync::Arc;

use ember_crypto::signal::{
    EncryptedMessage, MemoryIdentityStore, MemoryPreKeyStore, MemorySessionStore, PreKeyBundle,
    PreKeyStore,
};
use ember_crypto::{CryptoError, DeviceId, Identity, PrekeyManager, SessionConfig, SessionManager};

pub struct Device {
    pub identity: Identity,
    pub sessions: Arc<SessionManager>,
    pub prekeys: PrekeyManager,
    pub prekey_store: Arc<MemoryPreKeyStore>,
}

impl Device {
    pub fn new() -> Self {
        Self::with_config(SessionConfig::default())
    }

    pub fn with_config(config: SessionConfig) -> Self {
        let identity = Identity::generate();
        let identity_store = Arc::new(MemoryIdentityStore::new(&identity));
        let prekey_store = Arc::new(MemoryPreKeyStore::new());

        let prekeys = PrekeyManager::new(config.clone(), identity_store.clone(), prekey_store.clone())
            .expect("prekey manager");
        prekeys.bootstrap().expect("bootstrap prekeys");

        let sessions = SessionManager::new(
            config,
            identity_store,
            prekey_store.clone(),
            Arc::new(MemorySessionStore::new()),
        )
        .expect("session manager");

        Self {
            identity,
            sessions: Arc::new(sessions),
            prekeys,
            prekey_store,
        }
    }

    pub fn id(&self) -> DeviceId {
        self.identity.device_id()
    }

    pub fn bundle(&self) -> PreKeyBundle {
        self.prekeys.publish_bundle().expect("publish bundle")
    }

    /// Start a session with `peer` from a freshly published bundle.
    pub fn connect(&self, peer: &Device) {
        self.sessions
            .establish_session(&peer.bundle())
            .expect("establish session");
    }

    pub fn encrypt_to(&self, peer: &Device, plaintext: &[u8]) -> EncryptedMessage {
        self.sessions
            .encrypt(&self.sessions.handle(peer.id()), plaintext)
            .expect("encrypt")
    }

    pub fn receive_from(
        &self,
        peer: &Device,
        message: &EncryptedMessage,
    ) -> Result<Vec<u8>, CryptoError> {
        self.sessions.decrypt(
            &self.sessions.handle(peer.id()),
            &message.header,
            &message.ciphertext,
        )
    }

    pub fn one_time_prekey_exists(&self, id: u32) -> bool {
        match self.prekey_store.take_one_time_prekey(id).expect("take") {
            Some(record) => {
                self.prekey_store.store_one_time_prekey(record).expect("restore");
                true
            }
            None => false,
        }
    }
}
