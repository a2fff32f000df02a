//! contacts-sync-core - Core library for contacts-sync
//!
//! This crate mirrors a local client registry against Google Contacts. It
//! contains the reconciliation engine, the OAuth credential vault, and thin
//! gateway implementations for the collaborators the engine talks to.

pub mod crypto;
pub mod error;
pub mod gateway;
pub mod google;
pub mod locks;
pub mod models;
pub mod oauth;
pub mod registry;
pub mod store;
pub mod sync;
pub mod util;
pub mod vault;

#[cfg(test)]
pub(crate) mod test_support;

pub use crypto::{CryptoError, EncryptionService};
pub use error::{GatewayError, StoreError};
pub use models::{LocalId, OwnerId, RemoteId};
pub use sync::{SyncEngine, SyncError, SyncPolicy, SyncResult};
pub use vault::{CredentialVault, VaultError};
