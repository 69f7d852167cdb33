//! Multi-recipient delivery over pairwise sessions.
//!
//! There is no shared group key: every recipient device gets its own
//! ciphertext under its own session, so one compromised session exposes
//! nothing sent to the others.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use futures::future::join_all;

use crate::error::CryptoError;
use crate::identity::DeviceId;
use crate::signal::message::EncryptedMessage;
use crate::signal::session::SessionManager;

/// Outcome of a group send for one recipient device.
#[derive(Debug)]
pub enum GroupDelivery {
    Sent(EncryptedMessage),
    /// No usable session yet; the caller retries once a bundle is available.
    PendingKeyAgreement,
    Failed(CryptoError),
}

impl GroupDelivery {
    pub fn message(&self) -> Option<&EncryptedMessage> {
        match self {
            Self::Sent(message) => Some(message),
            _ => None,
        }
    }

    pub fn is_pending(&self) -> bool {
        matches!(self, Self::PendingKeyAgreement)
    }
}

/// Bookkeeping for one group send. Holds no key material.
#[derive(Default)]
struct GroupSendContext {
    outcomes: BTreeMap<DeviceId, GroupDelivery>,
    sent: usize,
    pending: usize,
    failed: usize,
}

impl GroupSendContext {
    fn record(&mut self, device: DeviceId, delivery: GroupDelivery) {
        match &delivery {
            GroupDelivery::Sent(_) => self.sent += 1,
            GroupDelivery::PendingKeyAgreement => self.pending += 1,
            GroupDelivery::Failed(e) => {
                tracing::warn!(device = %device, error = %e, "group send failed for recipient");
                self.failed += 1;
            }
        }
        self.outcomes.insert(device, delivery);
    }

    fn finish(self) -> BTreeMap<DeviceId, GroupDelivery> {
        tracing::debug!(
            sent = self.sent,
            pending = self.pending,
            failed = self.failed,
            "group send complete"
        );
        self.outcomes
    }
}

/// Encrypts one logical message for many devices in parallel.
pub struct GroupFanoutEncryptor {
    manager: Arc<SessionManager>,
}

impl GroupFanoutEncryptor {
    pub fn new(manager: Arc<SessionManager>) -> Self {
        Self { manager }
    }

    /// Encrypt `plaintext` once per distinct device in `recipients`.
    ///
    /// Each device is handled on its own blocking task through the session
    /// manager, which serializes work per session. Devices without a session,
    /// or whose session went stale, come back as
    /// [`GroupDelivery::PendingKeyAgreement`]; a failure for one device never
    /// affects the others.
    pub async fn send_group(
        &self,
        plaintext: &[u8],
        recipients: &[DeviceId],
    ) -> BTreeMap<DeviceId, GroupDelivery> {
        let plaintext: Arc<[u8]> = Arc::from(plaintext);
        let devices: BTreeSet<DeviceId> = recipients.iter().cloned().collect();

        let sends = devices.into_iter().map(|device| {
            let manager = Arc::clone(&self.manager);
            let plaintext = Arc::clone(&plaintext);
            async move {
                let handle = manager.handle(device.clone());
                let result =
                    tokio::task::spawn_blocking(move || manager.encrypt(&handle, &plaintext)).await;
                let delivery = match result {
                    Ok(Ok(message)) => GroupDelivery::Sent(message),
                    Ok(Err(CryptoError::NoSession(_) | CryptoError::StaleSession(_))) => {
                        GroupDelivery::PendingKeyAgreement
                    }
                    Ok(Err(e)) => GroupDelivery::Failed(e),
                    Err(e) => GroupDelivery::Failed(CryptoError::EncryptionError(format!(
                        "encryption task failed: {e}"
                    ))),
                };
                (device, delivery)
            }
        });

        let mut context = GroupSendContext::default();
        for (device, delivery) in join_all(sends).await {
            context.record(device, delivery);
        }
        context.finish()
    }
}
