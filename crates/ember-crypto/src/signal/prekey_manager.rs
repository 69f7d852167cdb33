//! Prekey lifecycle: publishing, pool replenishment and signed prekey rotation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::SessionConfig;
use crate::error::CryptoError;
use crate::identity::DeviceId;
use crate::signal::keys::unix_now;
use crate::signal::prekeys::{
    OneTimePrekeyRecord, PreKeyBundle, SignedPrekeyRecord, SignedPrekeyStatus,
};
use crate::signal::store::{IdentityKeyStore, PreKeyStore};

/// Publishes bundles for the local device and keeps its prekeys fresh.
///
/// Cloning is cheap; clones share the stores and the maintenance locks.
#[derive(Clone)]
pub struct PrekeyManager {
    config: SessionConfig,
    identity_store: Arc<dyn IdentityKeyStore>,
    prekey_store: Arc<dyn PreKeyStore>,
    /// Set while a background replenishment is queued or running.
    replenishing: Arc<AtomicBool>,
    replenish_lock: Arc<Mutex<()>>,
    rotation_lock: Arc<Mutex<()>>,
}

impl PrekeyManager {
    pub fn new(
        config: SessionConfig,
        identity_store: Arc<dyn IdentityKeyStore>,
        prekey_store: Arc<dyn PreKeyStore>,
    ) -> Result<Self, CryptoError> {
        config.validate()?;
        Ok(Self {
            config,
            identity_store,
            prekey_store,
            replenishing: Arc::new(AtomicBool::new(false)),
            replenish_lock: Arc::new(Mutex::new(())),
            rotation_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn device_id(&self) -> Result<DeviceId, CryptoError> {
        Ok(self.identity_store.identity()?.device_id())
    }

    /// Make sure a current signed prekey exists and the one-time pool is full.
    pub fn bootstrap(&self) -> Result<(), CryptoError> {
        if self.current_signed_prekey()?.is_none() {
            self.try_rotate(unix_now())?;
        }
        self.replenish_one_time_prekeys()?;
        Ok(())
    }

    /// Snapshot of the identity key, the current signed prekey and one
    /// freshly issued one-time prekey.
    ///
    /// An empty pool still yields a bundle, without a one-time prekey.
    /// Falling below the low-water mark schedules replenishment in the
    /// background; the caller never waits for it.
    pub fn publish_bundle(&self) -> Result<PreKeyBundle, CryptoError> {
        let identity = self.identity_store.identity()?;
        let signed_prekey = self
            .current_signed_prekey()?
            .ok_or_else(|| CryptoError::PreKeyError("no current signed prekey".into()))?;
        let one_time_prekey = self.prekey_store.issue_one_time_prekey()?;

        if one_time_prekey.is_none() {
            tracing::warn!(
                device = %identity.device_id(),
                "one-time prekey pool exhausted; publishing bundle without one (degraded forward secrecy)"
            );
        }

        let remaining = self.prekey_store.unissued_one_time_prekeys()?;
        if remaining < self.config.prekey_low_water_mark {
            tracing::debug!(remaining, "one-time prekey pool below low-water mark");
            self.schedule_replenish();
        }

        Ok(PreKeyBundle {
            device_id: identity.device_id(),
            identity_key: identity.public_key_bytes().to_vec(),
            signed_prekey_id: signed_prekey.id,
            signed_prekey: signed_prekey.public.to_vec(),
            signed_prekey_signature: signed_prekey.signature,
            one_time_prekey_id: one_time_prekey.as_ref().map(|record| record.id),
            one_time_prekey: one_time_prekey.map(|record| record.public.to_vec()),
        })
    }

    /// Queue a replenishment unless one is already pending. Runs on the tokio
    /// blocking pool when a runtime is available, inline otherwise.
    pub fn schedule_replenish(&self) {
        if self.replenishing.swap(true, Ordering::AcqRel) {
            return;
        }

        let manager = self.clone();
        let job = move || {
            if let Err(e) = manager.replenish_one_time_prekeys() {
                tracing::error!(error = %e, "one-time prekey replenishment failed");
            }
            manager.replenishing.store(false, Ordering::Release);
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn_blocking(job);
            }
            Err(_) => job(),
        }
    }

    /// Top the unissued pool back up to the target. Returns how many keys
    /// were generated.
    pub fn replenish_one_time_prekeys(&self) -> Result<usize, CryptoError> {
        let _guard = self.replenish_lock.lock();

        let unissued = self.prekey_store.unissued_one_time_prekeys()?;
        let missing = self.config.prekey_pool_target.saturating_sub(unissued);
        if missing == 0 {
            return Ok(0);
        }

        let mut next_id = self
            .prekey_store
            .max_one_time_prekey_id()?
            .map_or(Some(1), |id| id.checked_add(1))
            .ok_or_else(|| CryptoError::PreKeyError("one-time prekey ids exhausted".into()))?;
        for _ in 0..missing {
            self.prekey_store
                .store_one_time_prekey(OneTimePrekeyRecord::generate(next_id))?;
            next_id = next_id
                .checked_add(1)
                .ok_or_else(|| CryptoError::PreKeyError("one-time prekey ids exhausted".into()))?;
        }

        tracing::info!(generated = missing, pool = unissued + missing, "replenished one-time prekeys");
        Ok(missing)
    }

    pub fn current_signed_prekey(&self) -> Result<Option<SignedPrekeyRecord>, CryptoError> {
        Ok(self
            .prekey_store
            .signed_prekeys()?
            .into_iter()
            .filter(SignedPrekeyRecord::is_current)
            .max_by_key(|record| record.id))
    }

    /// Unissued one-time prekeys left in the pool.
    pub fn available_one_time_prekeys(&self) -> Result<usize, CryptoError> {
        self.prekey_store.unissued_one_time_prekeys()
    }

    /// Replace the current signed prekey. The previous one keeps working for
    /// late initiators until the grace period ends.
    pub async fn rotate_signed_prekey(&self) -> Result<SignedPrekeyRecord, CryptoError> {
        self.rotate_at(unix_now()).await
    }

    /// Rotate when the current signed prekey is older than the rotation
    /// interval, or missing.
    pub async fn rotate_if_due(&self, now: u64) -> Result<Option<SignedPrekeyRecord>, CryptoError> {
        let due = match self.current_signed_prekey()? {
            Some(current) => {
                now.saturating_sub(current.created_at) >= self.config.signed_prekey_rotation_interval_secs
            }
            None => true,
        };
        if !due {
            return Ok(None);
        }
        self.rotate_at(now).await.map(Some)
    }

    /// Delete retiring signed prekeys whose grace period is over. Returns the
    /// number removed.
    pub fn purge_retired_signed_prekeys(&self, now: u64) -> Result<usize, CryptoError> {
        let grace = self.config.signed_prekey_grace_period_secs;
        let mut purged = 0;
        for record in self.prekey_store.signed_prekeys()? {
            if let SignedPrekeyStatus::Retiring { since } = record.status {
                if now.saturating_sub(since) > grace {
                    self.prekey_store.remove_signed_prekey(record.id)?;
                    tracing::info!(signed_prekey_id = record.id, "purged retired signed prekey");
                    purged += 1;
                }
            }
        }
        Ok(purged)
    }

    async fn rotate_at(&self, now: u64) -> Result<SignedPrekeyRecord, CryptoError> {
        let max_attempts = self.config.rotation_max_attempts;
        let mut delay = self.config.rotation_backoff_base();
        let mut attempt = 1;
        loop {
            match self.try_rotate(now) {
                Ok(record) => {
                    tracing::info!(signed_prekey_id = record.id, attempt, "rotated signed prekey");
                    return Ok(record);
                }
                Err(e) if attempt >= max_attempts => {
                    tracing::error!(error = %e, attempts = attempt, "signed prekey rotation gave up");
                    return Err(CryptoError::KeyRotationFailed {
                        attempts: attempt,
                        reason: e.to_string(),
                    });
                }
                Err(e) => {
                    tracing::warn!(error = %e, attempt, ?delay, "signed prekey rotation failed; retrying");
                    tokio::time::sleep(delay).await;
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }

    /// One rotation attempt. The new record is stored before the old one is
    /// demoted, so a failure part way never leaves the device without a
    /// current signed prekey.
    fn try_rotate(&self, now: u64) -> Result<SignedPrekeyRecord, CryptoError> {
        let _guard = self.rotation_lock.lock();

        let identity = self.identity_store.identity()?;
        let existing = self.prekey_store.signed_prekeys()?;
        let id = existing
            .iter()
            .map(|record| record.id)
            .max()
            .map_or(Some(1), |id| id.checked_add(1))
            .ok_or_else(|| CryptoError::PreKeyError("signed prekey ids exhausted".into()))?;

        let record = SignedPrekeyRecord::generate(id, &identity, now)?;
        self.prekey_store.store_signed_prekey(record.clone())?;

        for mut previous in existing.into_iter().filter(SignedPrekeyRecord::is_current) {
            previous.status = SignedPrekeyStatus::Retiring { since: now };
            self.prekey_store.store_signed_prekey(previous)?;
        }
        Ok(record)
    }
}
