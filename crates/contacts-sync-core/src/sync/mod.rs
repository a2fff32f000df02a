//! Reconciliation engine between the local registry and the remote contacts provider.
//!
//! A pass fetches both sides, pairs records through their [`SyncLink`]s and
//! applies one [`SyncAction`] per pair. Per-record failures are counted and
//! logged but never abort a pass; only failures that make the whole pass
//! meaningless (no credential, remote listing, metadata) are returned as errors.

mod resolver;
mod result;


pub use resolver::{decide, decide_push, SyncAction};
pub use result::{ConflictItem, DeleteOutcome, SingleSyncOutcome, SyncMode, SyncResult};

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use thiserror::Error;

use crate::crypto::CryptoError;
use crate::error::{GatewayError, StoreError};
use crate::gateway::{LocalRegistryGateway, RemoteContactGateway};
use crate::locks::OwnerLocks;
use crate::models::{
    LinkState, LocalId, LocalRecord, ModifiedSide, OAuthToken, OwnerId, RemoteId, RemoteRecord,
    SyncCursor, SyncLink,
};
use crate::store::SyncMetadataStore;
use crate::util::owner_fingerprint;
use crate::vault::{CredentialVault, VaultError};

/// Default deadline for a full pass
pub const DEFAULT_FULL_DEADLINE: Duration = Duration::from_secs(300);
/// Default deadline for an incremental pass
pub const DEFAULT_INCREMENTAL_DEADLINE: Duration = Duration::from_secs(120);
/// Default deadline for single-record operations
pub const DEFAULT_SINGLE_DEADLINE: Duration = Duration::from_secs(30);

pub type SyncEngineResult<T> = std::result::Result<T, SyncError>;

/// Failure applying a single action; counted per record during passes
#[derive(Error, Debug)]
pub enum ApplyError {
    #[error("Remote write failed: {0}")]
    Remote(#[source] GatewayError),

    #[error("Local write failed: {0}")]
    Local(#[source] GatewayError),

    #[error("Saving sync link failed: {0}")]
    Metadata(#[source] StoreError),
}

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Owner has not connected a contacts account")]
    NotConnected,

    #[error("Stored credential could not be decrypted: {0}")]
    Crypto(#[source] CryptoError),

    #[error("Token refresh failed: {0}")]
    Refresh(String),

    #[error("Credential storage error: {0}")]
    Storage(#[source] StoreError),

    #[error("Authorization failed: {0}")]
    Authorization(#[source] VaultError),

    #[error("Fetching remote contacts failed: {0}")]
    RemoteFetch(#[source] GatewayError),

    #[error("Fetching local records failed: {0}")]
    LocalFetch(#[source] GatewayError),

    #[error("Sync metadata error: {0}")]
    Metadata(#[source] StoreError),

    #[error("Local record not found: {0}")]
    LocalNotFound(LocalId),

    #[error(transparent)]
    Apply(#[from] ApplyError),

    #[error("Sync did not finish within {0:?}")]
    DeadlineExceeded(Duration),
}

impl SyncError {
    /// Whether the owner has to go through the consent flow again
    pub const fn requires_reauthorization(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Refresh(_))
    }
}

impl From<VaultError> for SyncError {
    fn from(error: VaultError) -> Self {
        match error {
            VaultError::NotConnected => Self::NotConnected,
            VaultError::Crypto(error) => Self::Crypto(error),
            VaultError::Refresh(message) => Self::Refresh(message),
            VaultError::Storage(error) => Self::Storage(error),
            other => Self::Authorization(other),
        }
    }
}

/// Run `future` within `deadline`, dropping it (and any in-flight requests) on expiry.
///
/// Effects committed before the deadline are kept.
pub async fn with_deadline<T, F>(deadline: Duration, future: F) -> SyncEngineResult<T>
where
    F: Future<Output = SyncEngineResult<T>>,
{
    tokio::time::timeout(deadline, future)
        .await
        .unwrap_or_else(|_| Err(SyncError::DeadlineExceeded(deadline)))
}

/// Which optional behaviors a pass applies
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncPolicy {
    /// Delete the remote contact when its linked local record disappeared,
    /// instead of re-importing it
    pub propagate_local_deletions: bool,
}

#[derive(Clone)]
pub struct SyncEngine {
    vault: CredentialVault,
    remote: Arc<dyn RemoteContactGateway>,
    local: Arc<dyn LocalRegistryGateway>,
    metadata: Arc<dyn SyncMetadataStore>,
    policy: SyncPolicy,
    locks: OwnerLocks,
}

impl SyncEngine {
    pub fn new(
        vault: CredentialVault,
        remote: Arc<dyn RemoteContactGateway>,
        local: Arc<dyn LocalRegistryGateway>,
        metadata: Arc<dyn SyncMetadataStore>,
    ) -> Self {
        Self {
            vault,
            remote,
            local,
            metadata,
            policy: SyncPolicy::default(),
            locks: OwnerLocks::new(),
        }
    }

    #[must_use]
    pub const fn with_policy(mut self, policy: SyncPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub const fn vault(&self) -> &CredentialVault {
        &self.vault
    }

    pub const fn policy(&self) -> SyncPolicy {
        self.policy
    }

    /// Full two-way pass over every record of `owner_id`
    pub async fn run(&self, owner_id: &OwnerId) -> SyncEngineResult<SyncResult> {
        let _guard = self.locks.acquire(owner_id).await;
        let token = self.vault.get_valid_token(owner_id).await?;
        self.full_pass(owner_id, &token).await
    }

    /// Pass over remote changes since the stored cursor.
    ///
    /// Falls back to a full pass when the remote side rejects the cursor.
    pub async fn run_incremental(&self, owner_id: &OwnerId) -> SyncEngineResult<SyncResult> {
        let _guard = self.locks.acquire(owner_id).await;
        let token = self.vault.get_valid_token(owner_id).await?;

        let cursor = self
            .metadata
            .load_cursor(owner_id)
            .await
            .map_err(SyncError::Metadata)?;

        let started_at = Utc::now();
        let changes = match self
            .remote
            .fetch_changes(&token, cursor.as_ref().map(|cursor| cursor.token.as_str()))
            .await
        {
            Ok(changes) => changes,
            Err(GatewayError::CursorRejected) => {
                tracing::warn!(
                    owner = owner_fingerprint(owner_id.as_str()),
                    "Sync cursor rejected, falling back to full sync"
                );
                let result = self.full_pass(owner_id, &token).await?;
                self.reprime_cursor(owner_id, &token).await;
                return Ok(result);
            }
            Err(error) => return Err(SyncError::RemoteFetch(error)),
        };

        let local = self.list_local(owner_id).await;

        // Persist before applying: a crash replays changes instead of losing them.
        // A degraded pass skips linked records, so it keeps the old cursor to replay them.
        match changes.next_cursor {
            Some(next_cursor) if local.is_some() => {
                self.metadata
                    .save_cursor(&SyncCursor {
                        owner_id: owner_id.clone(),
                        token: next_cursor,
                        updated_at: Utc::now(),
                    })
                    .await
                    .map_err(SyncError::Metadata)?;
            }
            Some(_) => tracing::warn!(
                owner = owner_fingerprint(owner_id.as_str()),
                "Keeping previous sync cursor for a degraded pass"
            ),
            None => {}
        }

        let mut result = SyncResult::start(SyncMode::Incremental, started_at);
        self.reconcile(owner_id, &token, &changes.records, local, &mut result)
            .await?;
        let result = result.finish(Utc::now());
        log_result(owner_id, &result);
        Ok(result)
    }

    /// Push one local record to the remote side
    pub async fn sync_one(
        &self,
        owner_id: &OwnerId,
        local_id: &LocalId,
    ) -> SyncEngineResult<SingleSyncOutcome> {
        let _guard = self.locks.acquire(owner_id).await;
        let token = self.vault.get_valid_token(owner_id).await?;

        let record = self
            .local
            .get(owner_id, local_id)
            .await
            .map_err(SyncError::LocalFetch)?
            .ok_or_else(|| SyncError::LocalNotFound(local_id.clone()))?;
        let link = self
            .metadata
            .load_one(owner_id, local_id)
            .await
            .map_err(SyncError::Metadata)?;

        if !record.fields.has_payload() {
            tracing::info!(
                owner = owner_fingerprint(owner_id.as_str()),
                local_id = %local_id,
                "Skipping record without payload"
            );
            return Ok(SingleSyncOutcome::Skipped);
        }

        let (remote_id, created) = match decide_push(&record, link.as_ref()) {
            SyncAction::UpdateRemote(remote_id) => {
                match self.remote.update(&token, &remote_id, &record).await {
                    Ok(()) => (remote_id, false),
                    Err(GatewayError::NotFound(_)) => {
                        tracing::info!(
                            owner = owner_fingerprint(owner_id.as_str()),
                            local_id = %local_id,
                            remote_id = %remote_id,
                            "Remote contact is gone, recreating it"
                        );
                        let remote_id = self
                            .remote
                            .create(&token, &record)
                            .await
                            .map_err(ApplyError::Remote)?;
                        (remote_id, true)
                    }
                    Err(error) => return Err(ApplyError::Remote(error).into()),
                }
            }
            _ => {
                let remote_id = self
                    .remote
                    .create(&token, &record)
                    .await
                    .map_err(ApplyError::Remote)?;
                (remote_id, true)
            }
        };

        let now = Utc::now();
        let mut link =
            link.unwrap_or_else(|| SyncLink::pending(owner_id.clone(), local_id.clone(), now));
        link.attach_remote(remote_id.clone());
        link.mark_synced(ModifiedSide::Local, now);
        self.metadata
            .save(&link)
            .await
            .map_err(ApplyError::Metadata)?;

        Ok(if created {
            SingleSyncOutcome::Created { remote_id }
        } else {
            SingleSyncOutcome::Updated { remote_id }
        })
    }

    /// Remove a local record from the mirror: delete its remote contact, then its link
    pub async fn delete_synced(
        &self,
        owner_id: &OwnerId,
        local_id: &LocalId,
    ) -> SyncEngineResult<DeleteOutcome> {
        let _guard = self.locks.acquire(owner_id).await;

        let link = self
            .metadata
            .load_one(owner_id, local_id)
            .await
            .map_err(SyncError::Metadata)?;

        let mut remote_deleted = false;
        if let Some(remote_id) = link.and_then(|link| link.remote_id) {
            match self.vault.get_valid_token(owner_id).await {
                Ok(token) => {
                    remote_deleted = self.delete_remote(owner_id, &token, &remote_id).await;
                }
                Err(error) => tracing::warn!(
                    owner = owner_fingerprint(owner_id.as_str()),
                    local_id = %local_id,
                    "Cannot delete remote contact without a valid token: {}",
                    error
                ),
            }
        }

        let link_removed = self
            .metadata
            .delete(owner_id, local_id)
            .await
            .map_err(SyncError::Metadata)?;

        Ok(DeleteOutcome {
            remote_deleted,
            link_removed,
        })
    }

    async fn full_pass(
        &self,
        owner_id: &OwnerId,
        token: &OAuthToken,
    ) -> SyncEngineResult<SyncResult> {
        let started_at = Utc::now();
        let (remote, local) = tokio::join!(
            self.remote.list_all(token),
            self.list_local(owner_id)
        );
        let remote = remote.map_err(SyncError::RemoteFetch)?;

        let mut result = SyncResult::start(SyncMode::Full, started_at);
        self.reconcile(owner_id, token, &remote, local, &mut result)
            .await?;
        let result = result.finish(Utc::now());
        log_result(owner_id, &result);
        Ok(result)
    }

    /// Local records, or `None` when the registry is unavailable (degraded pass)
    async fn list_local(&self, owner_id: &OwnerId) -> Option<Vec<LocalRecord>> {
        match self.local.list_all(owner_id).await {
            Ok(records) => Some(records),
            Err(error) => {
                tracing::warn!(
                    owner = owner_fingerprint(owner_id.as_str()),
                    "Local registry unavailable, importing remote-only: {}",
                    error
                );
                None
            }
        }
    }

    async fn reprime_cursor(&self, owner_id: &OwnerId, token: &OAuthToken) {
        let next_cursor = match self.remote.fetch_changes(token, None).await {
            Ok(changes) => changes.next_cursor,
            Err(error) => {
                tracing::warn!(
                    owner = owner_fingerprint(owner_id.as_str()),
                    "Failed to re-prime sync cursor: {}",
                    error
                );
                return;
            }
        };

        let Some(next_cursor) = next_cursor else {
            return;
        };
        if let Err(error) = self
            .metadata
            .save_cursor(&SyncCursor {
                owner_id: owner_id.clone(),
                token: next_cursor,
                updated_at: Utc::now(),
            })
            .await
        {
            tracing::warn!(
                owner = owner_fingerprint(owner_id.as_str()),
                "Failed to save re-primed sync cursor: {}",
                error
            );
        }
    }

    async fn reconcile(
        &self,
        owner_id: &OwnerId,
        token: &OAuthToken,
        remote_records: &[RemoteRecord],
        local_records: Option<Vec<LocalRecord>>,
        result: &mut SyncResult,
    ) -> SyncEngineResult<()> {
        let links = self
            .metadata
            .load_all(owner_id)
            .await
            .map_err(SyncError::Metadata)?;

        let by_remote: HashMap<RemoteId, usize> = links
            .iter()
            .enumerate()
            .filter_map(|(index, link)| link.remote_id.clone().map(|id| (id, index)))
            .collect();
        let by_local: HashMap<LocalId, usize> = links
            .iter()
            .enumerate()
            .map(|(index, link)| (link.local_id.clone(), index))
            .collect();
        let local_index: Option<HashMap<LocalId, LocalRecord>> = local_records.map(|records| {
            records
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect()
        });

        result.degraded = local_index.is_none();
        result.total_processed =
            remote_records.len() + local_index.as_ref().map_or(0, HashMap::len);

        let propagate_deletions = self.policy.propagate_local_deletions && !result.degraded;

        // Phase A: remote -> local
        for remote in remote_records {
            let link = by_remote.get(&remote.id).map(|&index| &links[index]);

            let Some(link) = link else {
                self.import_remote(owner_id, remote, None, result).await;
                continue;
            };
            let Some(local_index) = local_index.as_ref() else {
                // Local side unknown; cannot tell whether the linked record still exists
                result.skipped += 1;
                continue;
            };

            match local_index.get(&link.local_id) {
                None if propagate_deletions => {
                    // Handled by the deletion step below
                }
                None => {
                    self.import_remote(owner_id, remote, Some(link), result)
                        .await;
                }
                Some(local) => {
                    self.apply_pair(owner_id, remote, local, link.clone(), result)
                        .await;
                }
            }
        }

        let Some(local_index) = local_index else {
            return Ok(());
        };

        // Phase B: local -> remote
        for local in local_index.values() {
            let link = by_local.get(&local.id).map(|&index| &links[index]);
            if decide(None, Some(local), link) != SyncAction::CreateRemote {
                continue;
            }
            self.export_local(owner_id, token, local, link.cloned(), result)
                .await;
        }

        if propagate_deletions {
            for link in &links {
                if local_index.contains_key(&link.local_id) {
                    continue;
                }
                self.propagate_deletion(owner_id, token, link, result).await;
            }
        }

        Ok(())
    }

    /// Create a local record from a remote contact and link them.
    /// A stale link (local record gone) is replaced by the new one.
    async fn import_remote(
        &self,
        owner_id: &OwnerId,
        remote: &RemoteRecord,
        stale_link: Option<&SyncLink>,
        result: &mut SyncResult,
    ) {
        let fields = remote.to_fields();
        let created = match self.local.create(owner_id, &fields).await {
            Ok(created) => created,
            Err(error) => {
                result.errors += 1;
                tracing::warn!(
                    owner = owner_fingerprint(owner_id.as_str()),
                    remote_id = %remote.id,
                    "Failed to create local record: {}",
                    error
                );
                return;
            }
        };

        let link = SyncLink::synced(
            owner_id.clone(),
            created.id.clone(),
            Some(remote.id.clone()),
            ModifiedSide::Remote,
            Utc::now(),
        );
        if let Err(error) = self.metadata.save(&link).await {
            result.errors += 1;
            tracing::warn!(
                owner = owner_fingerprint(owner_id.as_str()),
                local_id = %created.id,
                remote_id = %remote.id,
                "Failed to save sync link: {}",
                error
            );
            return;
        }

        if let Some(stale) = stale_link {
            if let Err(error) = self.metadata.delete(owner_id, &stale.local_id).await {
                tracing::warn!(
                    owner = owner_fingerprint(owner_id.as_str()),
                    local_id = %stale.local_id,
                    "Failed to drop stale sync link: {}",
                    error
                );
            }
        }

        result.created += 1;
    }

    async fn apply_pair(
        &self,
        owner_id: &OwnerId,
        remote: &RemoteRecord,
        local: &LocalRecord,
        mut link: SyncLink,
        result: &mut SyncResult,
    ) {
        let now = Utc::now();
        match decide(Some(remote), Some(local), Some(&link)) {
            SyncAction::UpdateLocal => {
                if let Err(error) = self
                    .local
                    .update(owner_id, &local.id, &remote.to_fields())
                    .await
                {
                    result.errors += 1;
                    tracing::warn!(
                        owner = owner_fingerprint(owner_id.as_str()),
                        local_id = %local.id,
                        remote_id = %remote.id,
                        "Failed to update local record: {}",
                        error
                    );
                    return;
                }
                link.mark_synced(ModifiedSide::Remote, now);
                if self.save_link(owner_id, &link, result).await {
                    result.updated += 1;
                }
            }
            SyncAction::Conflict(payload) => {
                tracing::info!(
                    owner = owner_fingerprint(owner_id.as_str()),
                    local_id = %local.id,
                    remote_id = %remote.id,
                    fields = ?payload.conflict_fields,
                    "Conflict detected"
                );
                result.conflicts.push(ConflictItem {
                    local_id: local.id.clone(),
                    remote_id: remote.id.clone(),
                    payload: payload.clone(),
                });
                link.mark_conflict(payload, now);
                self.save_link(owner_id, &link, result).await;
            }
            SyncAction::NoOp => {
                if link.state != LinkState::Synced {
                    // Both sides agree again, e.g. a conflict resolved by hand
                    link.mark_synced(link.last_modified_side, now);
                    self.save_link(owner_id, &link, result).await;
                }
                result.skipped += 1;
            }
            other => {
                tracing::debug!(action = ?other, "Unexpected action for a linked pair");
                result.skipped += 1;
            }
        }
    }

    async fn export_local(
        &self,
        owner_id: &OwnerId,
        token: &OAuthToken,
        local: &LocalRecord,
        link: Option<SyncLink>,
        result: &mut SyncResult,
    ) {
        if !local.fields.has_payload() {
            result.skipped += 1;
            return;
        }

        let now = Utc::now();
        let mut link =
            link.unwrap_or_else(|| SyncLink::pending(owner_id.clone(), local.id.clone(), now));

        match self.remote.create(token, local).await {
            Ok(remote_id) => {
                link.attach_remote(remote_id);
                link.mark_synced(ModifiedSide::Local, now);
                if self.save_link(owner_id, &link, result).await {
                    result.created += 1;
                }
            }
            Err(error) => {
                result.errors += 1;
                tracing::warn!(
                    owner = owner_fingerprint(owner_id.as_str()),
                    local_id = %local.id,
                    "Failed to create remote contact: {}",
                    error
                );
                link.mark_error(now);
                if let Err(error) = self.metadata.save(&link).await {
                    tracing::warn!(
                        owner = owner_fingerprint(owner_id.as_str()),
                        local_id = %local.id,
                        "Failed to record sync error: {}",
                        error
                    );
                }
            }
        }
    }

    async fn propagate_deletion(
        &self,
        owner_id: &OwnerId,
        token: &OAuthToken,
        link: &SyncLink,
        result: &mut SyncResult,
    ) {
        if let Some(remote_id) = &link.remote_id {
            if !self.delete_remote(owner_id, token, remote_id).await {
                result.errors += 1;
                return;
            }
            result.deleted += 1;
        }

        if let Err(error) = self.metadata.delete(owner_id, &link.local_id).await {
            result.errors += 1;
            tracing::warn!(
                owner = owner_fingerprint(owner_id.as_str()),
                local_id = %link.local_id,
                "Failed to delete sync link: {}",
                error
            );
        }
    }

    /// Returns whether the remote contact is gone afterwards
    async fn delete_remote(&self, owner_id: &OwnerId, token: &OAuthToken, remote_id: &RemoteId) -> bool {
        match self.remote.delete(token, remote_id).await {
            Ok(()) | Err(GatewayError::NotFound(_)) => true,
            Err(error) => {
                tracing::warn!(
                    owner = owner_fingerprint(owner_id.as_str()),
                    remote_id = %remote_id,
                    "Failed to delete remote contact: {}",
                    error
                );
                false
            }
        }
    }

    /// Returns whether the link was saved; failures are counted
    async fn save_link(&self, owner_id: &OwnerId, link: &SyncLink, result: &mut SyncResult) -> bool {
        match self.metadata.save(link).await {
            Ok(()) => true,
            Err(error) => {
                result.errors += 1;
                tracing::warn!(
                    owner = owner_fingerprint(owner_id.as_str()),
                    local_id = %link.local_id,
                    "Failed to save sync link: {}",
                    error
                );
                false
            }
        }
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("vault", &self.vault)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

fn log_result(owner_id: &OwnerId, result: &SyncResult) {
    tracing::info!(
        owner = owner_fingerprint(owner_id.as_str()),
        mode = ?result.mode,
        total = result.total_processed,
        created = result.created,
        updated = result.updated,
        skipped = result.skipped,
        deleted = result.deleted,
        errors = result.errors,
        conflicts = result.conflicts.len(),
        degraded = result.degraded,
        duration_ms = result.duration_ms,
        "Sync pass finished"
    );
}
