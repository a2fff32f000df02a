//! Collaborator interfaces for the two sides of the mirror

use async_trait::async_trait;

use crate::error::GatewayResult;
use crate::models::{ContactFields, LocalId, LocalRecord, OAuthToken, OwnerId, RemoteId, RemoteRecord};

/// A page of remote changes and the cursor to resume from
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeSet {
    pub records: Vec<RemoteRecord>,
    pub next_cursor: Option<String>,
}

/// The remote contacts provider
#[async_trait]
pub trait RemoteContactGateway: Send + Sync {
    /// Every contact of the token's owner, paginated until exhausted
    async fn list_all(&self, token: &OAuthToken) -> GatewayResult<Vec<RemoteRecord>>;

    /// Contacts changed since `cursor`.
    ///
    /// Without a cursor this is a full listing that also returns a fresh
    /// cursor. An expired or invalid cursor yields `GatewayError::CursorRejected`.
    async fn fetch_changes(
        &self,
        token: &OAuthToken,
        cursor: Option<&str>,
    ) -> GatewayResult<ChangeSet>;

    /// Rejects records without payload with `GatewayError::EmptyPayload`
    async fn create(&self, token: &OAuthToken, record: &LocalRecord) -> GatewayResult<RemoteId>;

    /// Rejects records without payload with `GatewayError::EmptyPayload`;
    /// a vanished remote contact yields `GatewayError::NotFound`
    async fn update(
        &self,
        token: &OAuthToken,
        remote_id: &RemoteId,
        record: &LocalRecord,
    ) -> GatewayResult<()>;

    async fn delete(&self, token: &OAuthToken, remote_id: &RemoteId) -> GatewayResult<()>;
}

/// The local client registry
#[async_trait]
pub trait LocalRegistryGateway: Send + Sync {
    async fn list_all(&self, owner_id: &OwnerId) -> GatewayResult<Vec<LocalRecord>>;

    async fn get(&self, owner_id: &OwnerId, id: &LocalId) -> GatewayResult<Option<LocalRecord>>;

    /// Create a record; the registry assigns its identifier
    async fn create(&self, owner_id: &OwnerId, fields: &ContactFields)
        -> GatewayResult<LocalRecord>;

    async fn update(
        &self,
        owner_id: &OwnerId,
        id: &LocalId,
        fields: &ContactFields,
    ) -> GatewayResult<()>;

    async fn delete(&self, owner_id: &OwnerId, id: &LocalId) -> GatewayResult<()>;
}
