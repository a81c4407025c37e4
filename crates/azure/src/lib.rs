//! Azure REST implementations of the capture service contracts.

pub mod arm;
pub mod blob;
pub mod files;
pub mod http;
pub mod keyvault;

pub use arm::ArmClient;
pub use blob::BlobArchiveClient;
pub use files::FileShareClient;
pub use http::{BearerToken, HttpSettings, SasToken};
pub use keyvault::KeyVaultClient;
