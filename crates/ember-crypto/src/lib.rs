pub mod config;
pub mod error;
pub mod group;
pub mod identity;
pub mod signal;

pub use config::{PrekeyUnavailablePolicy, SessionConfig};
pub use error::CryptoError;
pub use group::{GroupDelivery, GroupFanoutEncryptor};
pub use identity::{DeviceId, Identity};
pub use signal::{PrekeyManager, SessionHandle, SessionManager};
