//! Durable storage for credentials, sync links, cursors and pending OAuth states

mod migrations;
mod sqlite;

pub use migrations::CURRENT_VERSION;
pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::StoreResult;
use crate::models::{Credential, LocalId, OwnerId, PendingAuthorization, SyncCursor, SyncLink};

/// Links between local and remote records, plus the incremental cursor
#[async_trait]
pub trait SyncMetadataStore: Send + Sync {
    async fn load_all(&self, owner_id: &OwnerId) -> StoreResult<Vec<SyncLink>>;

    async fn load_one(&self, owner_id: &OwnerId, local_id: &LocalId)
        -> StoreResult<Option<SyncLink>>;

    /// Upsert keyed on `(local_id, owner_id)`. A stored remote id is never
    /// cleared by a link that carries none.
    async fn save(&self, link: &SyncLink) -> StoreResult<()>;

    /// Returns whether a link was removed
    async fn delete(&self, owner_id: &OwnerId, local_id: &LocalId) -> StoreResult<bool>;

    async fn load_cursor(&self, owner_id: &OwnerId) -> StoreResult<Option<SyncCursor>>;

    async fn save_cursor(&self, cursor: &SyncCursor) -> StoreResult<()>;
}

/// Encrypted OAuth credentials, one per owner
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn load(&self, owner_id: &OwnerId) -> StoreResult<Option<Credential>>;

    /// Upsert keyed on the owner
    async fn save(&self, credential: &Credential) -> StoreResult<()>;

    /// Returns whether a credential was removed
    async fn delete(&self, owner_id: &OwnerId) -> StoreResult<bool>;
}

/// Pending OAuth consent states awaiting their callback
#[async_trait]
pub trait AuthorizationStateStore: Send + Sync {
    async fn save_state(&self, pending: &PendingAuthorization) -> StoreResult<()>;

    /// Consume a state. Single use: the row is removed even when expired,
    /// and expired states yield `None`.
    async fn take_state(&self, state: &str, now: DateTime<Utc>) -> StoreResult<Option<OwnerId>>;

    /// Remove every state that expired before `now`, returning how many were removed
    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize>;
}
