use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("key generation failed: {0}")]
    KeyGeneration(String),

    #[error("signing failed: {0}")]
    SigningError(String),

    #[error("invalid key material: {0}")]
    InvalidKey(String),

    #[error("no session for {0}")]
    NoSession(String),

    /// The peer never acknowledged the session and it outlived the signed
    /// prekey grace period.
    #[error("session with {0} is stale; key agreement must be redone")]
    StaleSession(String),

    #[error("prekey error: {0}")]
    PreKeyError(String),

    #[error("key storage error: {0}")]
    StorageError(String),

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("encryption failed: {0}")]
    EncryptionError(String),

    /// The bundle's signature or key encoding did not check out. Never retry
    /// with the same bundle.
    #[error("bundle verification failed: {0}")]
    BundleVerificationFailed(String),

    #[error("no bundle published for device {0}")]
    BundleNotFound(String),

    #[error("bundle directory timed out for device {0}")]
    DirectoryTimeout(String),

    /// The referenced prekey was already consumed or purged.
    #[error("prekey {0} unavailable")]
    PrekeyUnavailable(u32),

    #[error("identity key for {0} does not match the trusted key")]
    UntrustedIdentity(String),

    /// Header or ciphertext failed authentication. Session state is unchanged.
    #[error("message authentication failed")]
    MessageAuthenticationFailed,

    /// The message key was evicted, already consumed, or lies beyond the skip
    /// bound. The message is permanently undecryptable.
    #[error("message key for counter {counter} expired")]
    MessageKeyExpired { counter: u32 },

    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("signed prekey rotation failed after {attempts} attempts: {reason}")]
    KeyRotationFailed { attempts: u32, reason: String },

    #[error("invalid configuration: {0}")]
    Config(String),
}
