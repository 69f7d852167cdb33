pub mod directory;
pub mod keys;
pub mod memory_stores;
pub mod message;
pub mod prekey_manager;
pub mod prekeys;
pub mod ratchet;
pub mod session;
pub mod store;
pub mod x3dh;

pub use directory::{BundleDirectory, MemoryBundleDirectory};
pub use memory_stores::{MemoryIdentityStore, MemoryPreKeyStore, MemorySessionStore};
pub use message::{EncryptedMessage, MessageHeader, PrekeyHeader};
pub use prekey_manager::PrekeyManager;
pub use prekeys::{OneTimePrekeyRecord, PreKeyBundle, SignedPrekeyRecord, VerifiedBundle};
pub use ratchet::{Session, SessionPhase};
pub use session::{SessionHandle, SessionManager};
pub use store::{IdentityKeyStore, PreKeyStore, SessionAddress, SessionStore};
