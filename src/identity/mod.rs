pub mod custody;
pub mod directory;
pub mod handle;
pub mod verifier;

pub use custody::{ActiveSession, CustodyOptions, IdentityBackup, KeyCustody, Session};
pub use directory::{CachedDirectory, Directory, FileDirectory, MemoryDirectory, UserIdentity};
pub use handle::IdentityHandle;
pub use verifier::PassphraseVerifier;
