pub mod device;
pub mod error;
pub mod identifier;

pub use device::*;
pub use error::Error;
pub use identifier::{normalize_mac, normalize_path, DeviceIdentifier, MacAddress};

pub type Result<T> = std::result::Result<T, Error>;
