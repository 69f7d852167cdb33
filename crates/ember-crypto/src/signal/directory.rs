//! Where initiators fetch peer bundles from.

use std::collections::{HashMap, VecDeque};
use std::future::Future;

use parking_lot::Mutex;

use crate::error::CryptoError;
use crate::identity::DeviceId;
use crate::signal::prekeys::PreKeyBundle;

/// A bundle directory service. Everything it returns is untrusted until
/// verified.
pub trait BundleDirectory: Send + Sync {
    /// Fetch one bundle for `device`. Unknown devices yield
    /// [`CryptoError::BundleNotFound`].
    fn fetch_bundle(
        &self,
        device: &DeviceId,
    ) -> impl Future<Output = Result<PreKeyBundle, CryptoError>> + Send;
}

/// Directory held in memory.
///
/// Each fetch hands out the oldest published bundle. The last one is kept
/// as a last resort and served without its one-time prekey afterwards, so a
/// one-time key never leaves the directory twice.
#[derive(Default)]
pub struct MemoryBundleDirectory {
    bundles: Mutex<HashMap<DeviceId, VecDeque<PreKeyBundle>>>,
}

impl MemoryBundleDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, bundle: PreKeyBundle) {
        self.bundles
            .lock()
            .entry(bundle.device_id.clone())
            .or_default()
            .push_back(bundle);
    }

    /// Bundles waiting for `device`.
    pub fn queued(&self, device: &DeviceId) -> usize {
        self.bundles.lock().get(device).map_or(0, VecDeque::len)
    }

    fn take(&self, device: &DeviceId) -> Result<PreKeyBundle, CryptoError> {
        let mut bundles = self.bundles.lock();
        let queue = bundles
            .get_mut(device)
            .ok_or_else(|| CryptoError::BundleNotFound(device.to_string()))?;

        if queue.len() > 1 {
            return queue
                .pop_front()
                .ok_or_else(|| CryptoError::BundleNotFound(device.to_string()));
        }

        let last = queue
            .front_mut()
            .ok_or_else(|| CryptoError::BundleNotFound(device.to_string()))?;
        let handed_out = last.clone();
        last.one_time_prekey_id = None;
        last.one_time_prekey = None;
        Ok(handed_out)
    }
}

impl BundleDirectory for MemoryBundleDirectory {
    fn fetch_bundle(
        &self,
        device: &DeviceId,
    ) -> impl Future<Output = Result<PreKeyBundle, CryptoError>> + Send {
        std::future::ready(self.take(device))
    }
}
