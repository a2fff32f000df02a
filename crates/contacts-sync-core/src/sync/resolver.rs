//! Pure reconciliation decisions

use crate::models::{ConflictPayload, LocalRecord, ModifiedSide, RemoteId, RemoteRecord, SyncLink};

/// What to do with one local/remote pair
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncAction {
    CreateLocal,
    CreateRemote,
    UpdateLocal,
    UpdateRemote(RemoteId),
    Conflict(ConflictPayload),
    NoOp,
}

/// Decide how to reconcile a pair found during a pass.
///
/// Only the canonical projection (name, primary phone) is compared. When both
/// sides changed since the last sync the result is a conflict; no winner is
/// picked automatically.
pub fn decide(
    remote: Option<&RemoteRecord>,
    local: Option<&LocalRecord>,
    link: Option<&SyncLink>,
) -> SyncAction {
    match (remote, local) {
        (Some(_), None) => SyncAction::CreateLocal,
        (None, Some(_)) => match link.and_then(|link| link.remote_id.as_ref()) {
            // Linked but outside this pass's remote window
            Some(_) => SyncAction::NoOp,
            None => SyncAction::CreateRemote,
        },
        (None, None) => SyncAction::NoOp,
        (Some(remote), Some(local)) => {
            let local_view = local.projection();
            let remote_view = remote.projection();
            if local_view == remote_view {
                return SyncAction::NoOp;
            }

            let local_changed_since_sync = link.is_some_and(|link| {
                link.last_modified_side == ModifiedSide::Local
                    && link
                        .last_synced_at
                        .is_some_and(|synced_at| local.updated_at > synced_at)
            });

            if local_changed_since_sync {
                SyncAction::Conflict(ConflictPayload::between(local_view, remote_view))
            } else {
                SyncAction::UpdateLocal
            }
        }
    }
}

/// Decide how to push a single local record to the remote side
pub fn decide_push(_local: &LocalRecord, link: Option<&SyncLink>) -> SyncAction {
    match link.and_then(|link| link.remote_id.clone()) {
        Some(remote_id) => SyncAction::UpdateRemote(remote_id),
        None => SyncAction::CreateRemote,
    }
}
