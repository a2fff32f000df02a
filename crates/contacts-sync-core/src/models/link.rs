//! Sync link and cursor models

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use super::{LinkId, LocalId, OwnerId, Projection, RemoteId};

/// Which side last produced the state recorded on a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModifiedSide {
    Local,
    Remote,
}

impl ModifiedSide {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl fmt::Display for ModifiedSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModifiedSide {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(format!("unknown modified side: {other}")),
        }
    }
}

/// A compared attribute that differs between the two sides
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictField {
    Name,
    Phone,
}

/// Structured diff recorded when both sides changed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictPayload {
    pub local: Projection,
    pub remote: Projection,
    pub conflict_fields: Vec<ConflictField>,
}

impl ConflictPayload {
    /// Build a payload from two projections, listing the fields that differ
    #[must_use]
    pub fn between(local: Projection, remote: Projection) -> Self {
        let mut conflict_fields = Vec::new();
        if local.name != remote.name {
            conflict_fields.push(ConflictField::Name);
        }
        if local.phone != remote.phone {
            conflict_fields.push(ConflictField::Phone);
        }
        Self {
            local,
            remote,
            conflict_fields,
        }
    }
}

/// Status of a link. A conflict always carries its payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", content = "conflict_payload", rename_all = "snake_case")]
pub enum LinkState {
    Synced,
    Pending,
    Error,
    Conflict(ConflictPayload),
}

impl LinkState {
    #[must_use]
    pub const fn status(&self) -> &'static str {
        match self {
            Self::Synced => "synced",
            Self::Pending => "pending",
            Self::Error => "error",
            Self::Conflict(_) => "conflict",
        }
    }

    #[must_use]
    pub const fn conflict_payload(&self) -> Option<&ConflictPayload> {
        match self {
            Self::Conflict(payload) => Some(payload),
            _ => None,
        }
    }

    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Rebuild a state from its stored status column and payload
    pub fn from_parts(status: &str, payload: Option<ConflictPayload>) -> Result<Self, String> {
        match (status, payload) {
            ("synced", _) => Ok(Self::Synced),
            ("pending", _) => Ok(Self::Pending),
            ("error", _) => Ok(Self::Error),
            ("conflict", Some(payload)) => Ok(Self::Conflict(payload)),
            ("conflict", None) => Err("conflict status without payload".to_string()),
            (other, _) => Err(format!("unknown link status: {other}")),
        }
    }
}

/// Pairing between a local record and a remote contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncLink {
    pub id: LinkId,
    pub owner_id: OwnerId,
    pub local_id: LocalId,
    pub remote_id: Option<RemoteId>,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub last_modified_side: ModifiedSide,
    #[serde(flatten)]
    pub state: LinkState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl SyncLink {
    /// A freshly synced link between the two records
    #[must_use]
    pub fn synced(
        owner_id: OwnerId,
        local_id: LocalId,
        remote_id: Option<RemoteId>,
        side: ModifiedSide,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: LinkId::new(),
            owner_id,
            local_id,
            remote_id,
            last_synced_at: Some(now),
            last_modified_side: side,
            state: LinkState::Synced,
            created_at: now,
            updated_at: now,
        }
    }

    /// A link for a local record not yet present on the remote side
    #[must_use]
    pub fn pending(owner_id: OwnerId, local_id: LocalId, now: DateTime<Utc>) -> Self {
        Self {
            id: LinkId::new(),
            owner_id,
            local_id,
            remote_id: None,
            last_synced_at: None,
            last_modified_side: ModifiedSide::Local,
            state: LinkState::Pending,
            created_at: now,
            updated_at: now,
        }
    }

    /// Record a successful sync originating on `side`
    pub fn mark_synced(&mut self, side: ModifiedSide, now: DateTime<Utc>) {
        self.state = LinkState::Synced;
        self.last_modified_side = side;
        self.last_synced_at = Some(now);
        self.updated_at = now;
    }

    /// Flag the link as conflicting; the last sync time is left untouched
    pub fn mark_conflict(&mut self, payload: ConflictPayload, now: DateTime<Utc>) {
        self.state = LinkState::Conflict(payload);
        self.updated_at = now;
    }

    pub fn mark_error(&mut self, now: DateTime<Utc>) {
        self.state = LinkState::Error;
        self.updated_at = now;
    }

    /// Attach a remote identifier. An existing identifier is only replaced, never cleared.
    pub fn attach_remote(&mut self, remote_id: RemoteId) {
        self.remote_id = Some(remote_id);
    }
}

/// Incremental-changes cursor for one owner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub owner_id: OwnerId,
    pub token: String,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn projection(name: &str, phone: &str) -> Projection {
        Projection {
            name: name.to_string(),
            phone: phone.to_string(),
        }
    }

    #[test]
    fn test_conflict_payload_lists_differing_fields() {
        let payload = ConflictPayload::between(projection("Ana", "+1"), projection("Anna", "+1"));
        assert_eq!(payload.conflict_fields, vec![ConflictField::Name]);

        let payload = ConflictPayload::between(projection("Ana", "+1"), projection("Anna", "+2"));
        assert_eq!(
            payload.conflict_fields,
            vec![ConflictField::Name, ConflictField::Phone]
        );
    }

    #[test]
    fn test_state_from_parts_requires_payload_for_conflict() {
        assert!(LinkState::from_parts("conflict", None).is_err());
        assert!(LinkState::from_parts("bogus", None).is_err());
        assert_eq!(
            LinkState::from_parts("synced", None).unwrap(),
            LinkState::Synced
        );
    }

    #[test]
    fn test_mark_conflict_keeps_last_synced_at() {
        let start = Utc::now();
        let mut link = SyncLink::synced(
            OwnerId::from("owner"),
            LocalId::from("local-1"),
            Some(RemoteId::from("people/c1")),
            ModifiedSide::Local,
            start,
        );

        let later = start + Duration::seconds(5);
        link.mark_conflict(
            ConflictPayload::between(projection("A", "1"), projection("B", "1")),
            later,
        );

        assert!(link.state.is_conflict());
        assert_eq!(link.last_synced_at, Some(start));
        assert_eq!(link.updated_at, later);

        link.mark_synced(ModifiedSide::Remote, later);
        assert_eq!(link.state, LinkState::Synced);
        assert_eq!(link.state.conflict_payload(), None);
        assert_eq!(link.last_synced_at, Some(later));
    }

    #[test]
    fn test_state_serializes_with_status_tag() {
        let json = serde_json::to_value(LinkState::Synced).unwrap();
        assert_eq!(json["status"], "synced");
    }
}
