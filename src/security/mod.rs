pub mod secure_keystore;
pub mod secure_rng;

pub use secure_keystore::{DeviceStorage, FileDeviceStorage, MemoryDeviceStorage};
pub use secure_rng::SecureRng;
