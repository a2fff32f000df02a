//! Data models for contacts-sync

mod credential;
mod ids;
mod link;
mod record;

pub use credential::{ConnectionStatus, Credential, OAuthToken, PendingAuthorization};
pub use ids::{LinkId, LocalId, OwnerId, RemoteId};
pub use link::{ConflictField, ConflictPayload, LinkState, ModifiedSide, SyncCursor, SyncLink};
pub use record::{
    ContactFields, LocalRecord, PartialDate, Projection, RemoteName, RemoteRecord, RemoteValue,
    UNKNOWN_NAME,
};
pub(crate) use record::SECONDARY_PHONE_KIND;
