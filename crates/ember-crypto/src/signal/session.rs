use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::{PrekeyUnavailablePolicy, SessionConfig};
use crate::error::CryptoError;
use crate::identity::DeviceId;
use crate::signal::directory::BundleDirectory;
use crate::signal::keys::unix_now;
use crate::signal::message::{EncryptedMessage, MessageHeader, PrekeyHeader};
use crate::signal::prekeys::PreKeyBundle;
use crate::signal::ratchet::{Session, SessionPhase};
use crate::signal::store::{IdentityKeyStore, PreKeyStore, SessionAddress, SessionStore};
use crate::signal::x3dh;

/// Names one pairwise session owned by a [`SessionManager`].
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionHandle {
    address: SessionAddress,
}

impl SessionHandle {
    pub fn peer(&self) -> &DeviceId {
        &self.address.peer
    }

    pub fn address(&self) -> &SessionAddress {
        &self.address
    }
}

/// Manages end-to-end sessions for one local device.
///
/// Every operation on a session runs under that session's lock, from load
/// through the ratchet step to the save, so two callers never derive keys
/// from the same chain state. Operations on different peers run in parallel.
pub struct SessionManager {
    local: DeviceId,
    config: SessionConfig,
    identity_store: Arc<dyn IdentityKeyStore>,
    prekey_store: Arc<dyn PreKeyStore>,
    session_store: Arc<dyn SessionStore>,
    locks: Mutex<HashMap<SessionAddress, Arc<Mutex<()>>>>,
    /// Consecutive authentication failures per session. Not persisted.
    auth_failures: Mutex<HashMap<SessionAddress, u32>>,
}

impl SessionManager {
    /// Create a new session manager with the given storage backends.
    pub fn new(
        config: SessionConfig,
        identity_store: Arc<dyn IdentityKeyStore>,
        prekey_store: Arc<dyn PreKeyStore>,
        session_store: Arc<dyn SessionStore>,
    ) -> Result<Self, CryptoError> {
        config.validate()?;
        let local = identity_store.identity()?.device_id();
        Ok(Self {
            local,
            config,
            identity_store,
            prekey_store,
            session_store,
            locks: Mutex::new(HashMap::new()),
            auth_failures: Mutex::new(HashMap::new()),
        })
    }

    pub fn local_device(&self) -> &DeviceId {
        &self.local
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn handle(&self, peer: DeviceId) -> SessionHandle {
        SessionHandle {
            address: SessionAddress::new(self.local.clone(), peer),
        }
    }

    /// Establish a session with a peer from their bundle (initiator side).
    ///
    /// An existing session with the same peer is replaced.
    pub fn establish_session(&self, bundle: &PreKeyBundle) -> Result<SessionHandle, CryptoError> {
        let verified = bundle.verify()?;
        let peer = verified.device_id().clone();
        let peer_identity = verified.identity_key().to_bytes();

        if !self
            .identity_store
            .is_trusted_identity(&peer, &peer_identity)?
        {
            tracing::warn!(peer = %peer, "bundle identity key differs from the pinned key");
            return Err(CryptoError::UntrustedIdentity(peer.to_string()));
        }

        let identity = self.identity_store.identity()?;
        let handle = self.handle(peer);
        let lock = self.lock_for(&handle.address);
        let _guard = lock.lock();

        let session = x3dh::initiate(&identity, &verified, unix_now())?;
        self.save(&handle.address, &session)?;
        self.identity_store
            .save_identity(handle.peer(), &peer_identity)?;
        self.auth_failures.lock().remove(&handle.address);

        tracing::info!(
            peer = %handle.peer(),
            signed_prekey_id = verified.signed_prekey_id(),
            one_time_prekey = verified.one_time_prekey().is_some(),
            "session established"
        );
        Ok(handle)
    }

    /// Fetch the peer's bundle from `directory` and establish a session.
    pub async fn establish_session_from_directory<D: BundleDirectory>(
        &self,
        directory: &D,
        peer: &DeviceId,
    ) -> Result<SessionHandle, CryptoError> {
        let bundle = tokio::time::timeout(self.config.directory_timeout(), directory.fetch_bundle(peer))
            .await
            .map_err(|_| CryptoError::DirectoryTimeout(peer.to_string()))??;

        if &bundle.device_id != peer {
            return Err(CryptoError::BundleVerificationFailed(format!(
                "directory returned a bundle for {} when asked for {peer}",
                bundle.device_id
            )));
        }
        self.establish_session(&bundle)
    }

    /// Encrypt one message to the session's peer.
    ///
    /// Fails with [`CryptoError::StaleSession`] when our initial messages were
    /// never answered for longer than the configured staleness bound.
    pub fn encrypt(
        &self,
        handle: &SessionHandle,
        plaintext: &[u8],
    ) -> Result<EncryptedMessage, CryptoError> {
        let lock = self.lock_for(&handle.address);
        let _guard = lock.lock();

        let mut session = self
            .load(&handle.address)?
            .ok_or_else(|| CryptoError::NoSession(handle.peer().to_string()))?;
        if session.is_stale(unix_now(), self.config.max_session_staleness_secs) {
            return Err(CryptoError::StaleSession(handle.peer().to_string()));
        }

        let message = session.encrypt(plaintext)?;
        self.save(&handle.address, &session)?;

        tracing::debug!(
            peer = %handle.peer(),
            counter = message.header.counter,
            prekey = message.is_prekey_message(),
            "encrypted message"
        );
        Ok(message)
    }

    /// Decrypt one message from the session's peer.
    ///
    /// A message carrying a prekey header creates the session when none
    /// exists. On any error the stored session is left as it was.
    pub fn decrypt(
        &self,
        handle: &SessionHandle,
        header: &MessageHeader,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, CryptoError> {
        let lock = self.lock_for(&handle.address);
        let guard = lock.lock();
        let max_skip = self.config.max_skipped_message_keys;

        let Some(mut session) = self.load(&handle.address)? else {
            let Some(prekey) = header.prekey.as_ref() else {
                return Err(CryptoError::NoSession(handle.peer().to_string()));
            };
            let (session, plaintext) = self.accept_prekey_message(handle, prekey, header, ciphertext)?;
            self.commit_new_session(handle, &session)?;
            tracing::info!(peer = %handle.peer(), "session accepted from initial message");
            return Ok(plaintext);
        };

        match session.decrypt(header, ciphertext, max_skip) {
            Ok(plaintext) => {
                self.save(&handle.address, &session)?;
                self.auth_failures.lock().remove(&handle.address);
                tracing::debug!(peer = %handle.peer(), counter = header.counter, "decrypted message");
                Ok(plaintext)
            }
            Err(CryptoError::MessageAuthenticationFailed) => {
                // The peer may have started over with a fresh key agreement.
                if let Some(prekey) = header.prekey.as_ref() {
                    if prekey.ephemeral_key == *session.base_key() {
                        tracing::debug!(
                            peer = %handle.peer(),
                            counter = header.counter,
                            "initial message of the current session delivered again"
                        );
                        return Err(CryptoError::MessageKeyExpired {
                            counter: header.counter,
                        });
                    }
                    if let Ok((fresh, plaintext)) =
                        self.accept_prekey_message(handle, prekey, header, ciphertext)
                    {
                        self.commit_new_session(handle, &fresh)?;
                        tracing::info!(peer = %handle.peer(), "peer replaced the session");
                        return Ok(plaintext);
                    }
                }
                if self.record_auth_failure(&handle.address)? {
                    drop(guard);
                    self.release_lock(&handle.address, &lock);
                }
                Err(CryptoError::MessageAuthenticationFailed)
            }
            Err(e) => Err(e),
        }
    }

    /// Discard the session. The next send needs a fresh key agreement.
    pub fn reset_session(&self, handle: &SessionHandle) -> Result<(), CryptoError> {
        let lock = self.lock_for(&handle.address);
        let guard = lock.lock();
        self.session_store.delete_session(&handle.address)?;
        self.auth_failures.lock().remove(&handle.address);
        drop(guard);
        self.release_lock(&handle.address, &lock);
        tracing::info!(peer = %handle.peer(), "session reset");
        Ok(())
    }

    /// Accept a changed identity key for `peer` after the user re-verified
    /// it out of band. The old session is discarded.
    pub fn trust_new_identity(&self, peer: &DeviceId) -> Result<(), CryptoError> {
        self.identity_store.forget_identity(peer)?;
        self.reset_session(&self.handle(peer.clone()))
    }

    pub fn has_session(&self, handle: &SessionHandle) -> Result<bool, CryptoError> {
        self.session_store.has_session(&handle.address)
    }

    /// Lifecycle phase of the session, `None` once it was reset or never existed.
    pub fn session_phase(&self, handle: &SessionHandle) -> Result<Option<SessionPhase>, CryptoError> {
        Ok(self.load(&handle.address)?.map(|session| session.phase()))
    }

    /// Peers we hold sessions with.
    pub fn peers(&self) -> Result<Vec<DeviceId>, CryptoError> {
        self.session_store.list_sessions(&self.local)
    }

    /// Build the responder session for an initial message and decrypt the
    /// message on it. Nothing is persisted; a one-time prekey taken for the
    /// attempt is put back if the attempt fails.
    fn accept_prekey_message(
        &self,
        handle: &SessionHandle,
        prekey: &PrekeyHeader,
        header: &MessageHeader,
        ciphertext: &[u8],
    ) -> Result<(Session, Vec<u8>), CryptoError> {
        if !self
            .identity_store
            .is_trusted_identity(handle.peer(), &prekey.identity_key)?
        {
            tracing::warn!(peer = %handle.peer(), "initial message from an untrusted identity key");
            return Err(CryptoError::UntrustedIdentity(handle.peer().to_string()));
        }

        let signed_prekey = self
            .prekey_store
            .load_signed_prekey(prekey.signed_prekey_id)?
            .ok_or(CryptoError::PrekeyUnavailable(prekey.signed_prekey_id))?;

        let one_time_prekey = match prekey.one_time_prekey_id {
            None => None,
            Some(id) => match self.prekey_store.take_one_time_prekey(id)? {
                Some(record) => Some(record),
                None => match self.config.prekey_unavailable_policy {
                    PrekeyUnavailablePolicy::Reject => {
                        return Err(CryptoError::PrekeyUnavailable(id));
                    }
                    PrekeyUnavailablePolicy::FallbackWithoutOneTimeKey => {
                        tracing::warn!(
                            peer = %handle.peer(),
                            one_time_prekey_id = id,
                            "one-time prekey already consumed; continuing without it"
                        );
                        None
                    }
                },
            },
        };

        let identity = self.identity_store.identity()?;
        let attempt = x3dh::respond(
            &identity,
            handle.peer().clone(),
            prekey,
            &signed_prekey,
            one_time_prekey.as_ref(),
            unix_now(),
        )
        .and_then(|mut session| {
            let plaintext =
                session.decrypt(header, ciphertext, self.config.max_skipped_message_keys)?;
            Ok((session, plaintext))
        });

        if attempt.is_err() {
            if let Some(record) = one_time_prekey {
                self.prekey_store.store_one_time_prekey(record)?;
            }
        }
        attempt
    }

    fn commit_new_session(&self, handle: &SessionHandle, session: &Session) -> Result<(), CryptoError> {
        self.save(&handle.address, session)?;
        self.identity_store
            .save_identity(handle.peer(), session.peer_identity())?;
        self.auth_failures.lock().remove(&handle.address);
        Ok(())
    }

    /// Count a failure; returns whether the session was reset because of it.
    fn record_auth_failure(&self, address: &SessionAddress) -> Result<bool, CryptoError> {
        let count = {
            let mut failures = self.auth_failures.lock();
            let count = failures.entry(address.clone()).or_insert(0);
            *count += 1;
            *count
        };

        let Some(threshold) = self.config.auth_failure_reset_threshold else {
            return Ok(false);
        };
        if count < threshold {
            return Ok(false);
        }
        self.session_store.delete_session(address)?;
        self.auth_failures.lock().remove(address);
        tracing::warn!(
            session = %address,
            failures = count,
            "repeated authentication failures; session reset"
        );
        Ok(true)
    }

    fn lock_for(&self, address: &SessionAddress) -> Arc<Mutex<()>> {
        Arc::clone(self.locks.lock().entry(address.clone()).or_default())
    }

    /// Drop the registry entry for a deleted session unless another caller
    /// still holds or waits on its lock. Clones are only handed out under the
    /// registry lock, so the count cannot grow while we look at it.
    fn release_lock(&self, address: &SessionAddress, lock: &Arc<Mutex<()>>) {
        let mut locks = self.locks.lock();
        if Arc::strong_count(lock) == 2 {
            locks.remove(address);
        }
    }

    fn load(&self, address: &SessionAddress) -> Result<Option<Session>, CryptoError> {
        self.session_store
            .load_session(address)?
            .map(|bytes| Session::from_bytes(&bytes))
            .transpose()
    }

    fn save(&self, address: &SessionAddress, session: &Session) -> Result<(), CryptoError> {
        self.session_store
            .store_session(address, &session.to_bytes()?)
    }
}
