//! Tunables for the session core.
//!
//! Every bound that the protocol leaves open (skip-cache size, prekey pool
//! size, rotation cadence) lives here instead of being hard-coded.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::CryptoError;

const DAY_SECS: u64 = 24 * 60 * 60;

/// What the responder does when an initial message references a one-time
/// prekey that no longer exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PrekeyUnavailablePolicy {
    /// Refuse the session with `PrekeyUnavailable`.
    #[default]
    Reject,
    /// Recompute the secret without the one-time term. Only succeeds if the
    /// initiator also omitted it; logged as degraded.
    FallbackWithoutOneTimeKey,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Upper bound on cached skipped message keys per session. A single
    /// message may skip fewer keys than this.
    pub max_skipped_message_keys: usize,
    /// Number of unissued one-time prekeys replenishment fills up to.
    pub prekey_pool_target: usize,
    /// Replenishment is scheduled once the unissued pool drops below this.
    pub prekey_low_water_mark: usize,
    pub signed_prekey_rotation_interval_secs: u64,
    /// How long a retiring signed prekey stays usable for late initiators.
    pub signed_prekey_grace_period_secs: u64,
    /// An unacknowledged initiator session older than this is stale.
    pub max_session_staleness_secs: u64,
    pub prekey_unavailable_policy: PrekeyUnavailablePolicy,
    /// Consecutive authentication failures after which a session is reset.
    /// `None` disables automatic reset.
    pub auth_failure_reset_threshold: Option<u32>,
    pub rotation_max_attempts: u32,
    pub rotation_backoff_base_millis: u64,
    pub directory_timeout_millis: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_skipped_message_keys: 1000,
            prekey_pool_target: 100,
            prekey_low_water_mark: 20,
            signed_prekey_rotation_interval_secs: 7 * DAY_SECS,
            signed_prekey_grace_period_secs: 30 * DAY_SECS,
            max_session_staleness_secs: 30 * DAY_SECS,
            prekey_unavailable_policy: PrekeyUnavailablePolicy::Reject,
            auth_failure_reset_threshold: Some(10),
            rotation_max_attempts: 5,
            rotation_backoff_base_millis: 200,
            directory_timeout_millis: 10_000,
        }
    }
}

impl SessionConfig {
    /// Parse a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, CryptoError> {
        let config: Self =
            serde_json::from_str(json).map_err(|e| CryptoError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), CryptoError> {
        if self.max_skipped_message_keys == 0 {
            return Err(CryptoError::Config(
                "max_skipped_message_keys must be positive".into(),
            ));
        }
        if self.prekey_low_water_mark > self.prekey_pool_target {
            return Err(CryptoError::Config(format!(
                "prekey_low_water_mark ({}) exceeds prekey_pool_target ({})",
                self.prekey_low_water_mark, self.prekey_pool_target
            )));
        }
        if self.rotation_max_attempts == 0 {
            return Err(CryptoError::Config(
                "rotation_max_attempts must be at least 1".into(),
            ));
        }
        if self.auth_failure_reset_threshold == Some(0) {
            return Err(CryptoError::Config(
                "auth_failure_reset_threshold must be positive or null".into(),
            ));
        }
        Ok(())
    }

    pub fn signed_prekey_rotation_interval(&self) -> Duration {
        Duration::from_secs(self.signed_prekey_rotation_interval_secs)
    }

    pub fn signed_prekey_grace_period(&self) -> Duration {
        Duration::from_secs(self.signed_prekey_grace_period_secs)
    }

    pub fn max_session_staleness(&self) -> Duration {
        Duration::from_secs(self.max_session_staleness_secs)
    }

    pub fn rotation_backoff_base(&self) -> Duration {
        Duration::from_millis(self.rotation_backoff_base_millis)
    }

    pub fn directory_timeout(&self) -> Duration {
        Duration::from_millis(self.directory_timeout_millis)
    }
}
