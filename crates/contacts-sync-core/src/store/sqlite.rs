//! SQLite implementation of the storage traits

use std::path::Path;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use super::{migrations, AuthorizationStateStore, CredentialStore, SyncMetadataStore};
use crate::error::{StoreError, StoreResult};
use crate::models::{
    ConflictPayload, Credential, LinkId, LinkState, LocalId, ModifiedSide, OwnerId,
    PendingAuthorization, RemoteId, SyncCursor, SyncLink,
};

const LINK_COLUMNS: &str = "id, owner_id, local_id, remote_id, last_synced_at, last_modified_side, \
     status, conflict_payload, created_at, updated_at";

/// Shared handle to a single SQLite connection
#[derive(Clone)]
pub struct SqliteStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteStore {
    /// Open the database at the given path, creating it if it doesn't exist
    ///
    /// Runs migrations automatically.
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let conn = Connection::open(path.as_ref())?;
        conn.pragma_update_and_check(None, "journal_mode", "WAL", |row| {
            row.get::<_, String>(0)
        })?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (useful for testing)
    pub fn open_in_memory() -> StoreResult<Self> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(mut conn: Connection) -> StoreResult<Self> {
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        migrations::run(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run `op` against the connection on the blocking thread pool
    async fn call<T, F>(&self, op: F) -> StoreResult<T>
    where
        F: FnOnce(&Connection) -> StoreResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let conn = Arc::clone(&self.conn);
        tokio::task::spawn_blocking(move || {
            let conn = conn
                .lock()
                .map_err(|err| StoreError::Task(format!("connection lock poisoned: {err}")))?;
            op(&conn)
        })
        .await
        .map_err(|err| StoreError::Task(format!("storage task join error: {err}")))?
    }
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore").finish_non_exhaustive()
    }
}

fn to_millis(value: DateTime<Utc>) -> i64 {
    value.timestamp_millis()
}

fn from_millis(value: i64, column: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::from_timestamp_millis(value)
        .ok_or_else(|| StoreError::Corrupt(format!("{column} out of range: {value}")))
}

struct LinkRow {
    id: String,
    owner_id: String,
    local_id: String,
    remote_id: Option<String>,
    last_synced_at: Option<i64>,
    last_modified_side: String,
    status: String,
    conflict_payload: Option<String>,
    created_at: i64,
    updated_at: i64,
}

impl LinkRow {
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            owner_id: row.get(1)?,
            local_id: row.get(2)?,
            remote_id: row.get(3)?,
            last_synced_at: row.get(4)?,
            last_modified_side: row.get(5)?,
            status: row.get(6)?,
            conflict_payload: row.get(7)?,
            created_at: row.get(8)?,
            updated_at: row.get(9)?,
        })
    }

    fn into_link(self) -> StoreResult<SyncLink> {
        let payload = self
            .conflict_payload
            .as_deref()
            .map(serde_json::from_str::<ConflictPayload>)
            .transpose()?;

        Ok(SyncLink {
            id: self
                .id
                .parse::<LinkId>()
                .map_err(|error| StoreError::Corrupt(format!("link id: {error}")))?,
            owner_id: OwnerId::from(self.owner_id),
            local_id: LocalId::from(self.local_id),
            remote_id: self.remote_id.map(RemoteId::from),
            last_synced_at: self
                .last_synced_at
                .map(|value| from_millis(value, "last_synced_at"))
                .transpose()?,
            last_modified_side: self
                .last_modified_side
                .parse::<ModifiedSide>()
                .map_err(StoreError::Corrupt)?,
            state: LinkState::from_parts(&self.status, payload).map_err(StoreError::Corrupt)?,
            created_at: from_millis(self.created_at, "created_at")?,
            updated_at: from_millis(self.updated_at, "updated_at")?,
        })
    }
}

#[async_trait]
impl SyncMetadataStore for SqliteStore {
    async fn load_all(&self, owner_id: &OwnerId) -> StoreResult<Vec<SyncLink>> {
        let owner_id = owner_id.clone();
        self.call(move |conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {LINK_COLUMNS} FROM sync_links WHERE owner_id = ?1 ORDER BY created_at"
            ))?;
            let rows = stmt
                .query_map(params![owner_id.as_str()], LinkRow::from_row)?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            rows.into_iter().map(LinkRow::into_link).collect()
        })
        .await
    }

    async fn load_one(
        &self,
        owner_id: &OwnerId,
        local_id: &LocalId,
    ) -> StoreResult<Option<SyncLink>> {
        let (owner_id, local_id) = (owner_id.clone(), local_id.clone());
        self.call(move |conn| {
            let row = conn
                .query_row(
                    &format!(
                        "SELECT {LINK_COLUMNS} FROM sync_links WHERE owner_id = ?1 AND local_id = ?2"
                    ),
                    params![owner_id.as_str(), local_id.as_str()],
                    LinkRow::from_row,
                )
                .optional()?;
            row.map(LinkRow::into_link).transpose()
        })
        .await
    }

    async fn save(&self, link: &SyncLink) -> StoreResult<()> {
        let payload = link
            .state
            .conflict_payload()
            .map(serde_json::to_string)
            .transpose()?;
        let link = link.clone();

        self.call(move |conn| {
            conn.execute(
                "INSERT INTO sync_links (id, owner_id, local_id, remote_id, last_synced_at,
                     last_modified_side, status, conflict_payload, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
                 ON CONFLICT(local_id, owner_id) DO UPDATE SET
                     remote_id = COALESCE(excluded.remote_id, sync_links.remote_id),
                     last_synced_at = excluded.last_synced_at,
                     last_modified_side = excluded.last_modified_side,
                     status = excluded.status,
                     conflict_payload = excluded.conflict_payload,
                     updated_at = excluded.updated_at",
                params![
                    link.id.as_str(),
                    link.owner_id.as_str(),
                    link.local_id.as_str(),
                    link.remote_id.as_ref().map(RemoteId::as_str),
                    link.last_synced_at.map(to_millis),
                    link.last_modified_side.as_str(),
                    link.state.status(),
                    payload,
                    to_millis(link.created_at),
                    to_millis(link.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, owner_id: &OwnerId, local_id: &LocalId) -> StoreResult<bool> {
        let (owner_id, local_id) = (owner_id.clone(), local_id.clone());
        self.call(move |conn| {
            let removed = conn.execute(
                "DELETE FROM sync_links WHERE owner_id = ?1 AND local_id = ?2",
                params![owner_id.as_str(), local_id.as_str()],
            )?;
            Ok(removed > 0)
        })
        .await
    }

    async fn load_cursor(&self, owner_id: &OwnerId) -> StoreResult<Option<SyncCursor>> {
        let owner_id = owner_id.clone();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT token, updated_at FROM sync_cursors WHERE owner_id = ?1",
                    params![owner_id.as_str()],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;

            row.map(|(token, updated_at)| {
                Ok(SyncCursor {
                    owner_id: owner_id.clone(),
                    token,
                    updated_at: from_millis(updated_at, "updated_at")?,
                })
            })
            .transpose()
        })
        .await
    }

    async fn save_cursor(&self, cursor: &SyncCursor) -> StoreResult<()> {
        let cursor = cursor.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO sync_cursors (owner_id, token, updated_at) VALUES (?1, ?2, ?3)
                 ON CONFLICT(owner_id) DO UPDATE SET
                     token = excluded.token,
                     updated_at = excluded.updated_at",
                params![
                    cursor.owner_id.as_str(),
                    cursor.token,
                    to_millis(cursor.updated_at)
                ],
            )?;
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl CredentialStore for SqliteStore {
    async fn load(&self, owner_id: &OwnerId) -> StoreResult<Option<Credential>> {
        let owner_id = owner_id.clone();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "SELECT access_token, refresh_token, token_type, expires_at, scopes, created_at, updated_at
                     FROM oauth_credentials WHERE owner_id = ?1",
                    params![owner_id.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, String>(0)?,
                            row.get::<_, String>(1)?,
                            row.get::<_, String>(2)?,
                            row.get::<_, i64>(3)?,
                            row.get::<_, String>(4)?,
                            row.get::<_, i64>(5)?,
                            row.get::<_, i64>(6)?,
                        ))
                    },
                )
                .optional()?;

            let Some((access, refresh, token_type, expires_at, scopes, created_at, updated_at)) =
                row
            else {
                return Ok(None);
            };

            Ok(Some(Credential {
                owner_id,
                encrypted_access_token: access,
                encrypted_refresh_token: refresh,
                token_type,
                expires_at: from_millis(expires_at, "expires_at")?,
                scopes: serde_json::from_str(&scopes)?,
                created_at: from_millis(created_at, "created_at")?,
                updated_at: from_millis(updated_at, "updated_at")?,
            }))
        })
        .await
    }

    async fn save(&self, credential: &Credential) -> StoreResult<()> {
        let scopes = serde_json::to_string(&credential.scopes)?;
        let credential = credential.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO oauth_credentials (owner_id, access_token, refresh_token, token_type,
                     expires_at, scopes, created_at, updated_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT(owner_id) DO UPDATE SET
                     access_token = excluded.access_token,
                     refresh_token = excluded.refresh_token,
                     token_type = excluded.token_type,
                     expires_at = excluded.expires_at,
                     scopes = excluded.scopes,
                     updated_at = excluded.updated_at",
                params![
                    credential.owner_id.as_str(),
                    credential.encrypted_access_token,
                    credential.encrypted_refresh_token,
                    credential.token_type,
                    to_millis(credential.expires_at),
                    scopes,
                    to_millis(credential.created_at),
                    to_millis(credential.updated_at),
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, owner_id: &OwnerId) -> StoreResult<bool> {
        let owner_id = owner_id.clone();
        self.call(move |conn| {
            let removed = conn.execute(
                "DELETE FROM oauth_credentials WHERE owner_id = ?1",
                params![owner_id.as_str()],
            )?;
            Ok(removed > 0)
        })
        .await
    }
}

#[async_trait]
impl AuthorizationStateStore for SqliteStore {
    async fn save_state(&self, pending: &PendingAuthorization) -> StoreResult<()> {
        let pending = pending.clone();
        self.call(move |conn| {
            conn.execute(
                "INSERT INTO oauth_states (state, owner_id, expires_at) VALUES (?1, ?2, ?3)",
                params![
                    pending.state,
                    pending.owner_id.as_str(),
                    to_millis(pending.expires_at)
                ],
            )?;
            Ok(())
        })
        .await
    }

    async fn take_state(&self, state: &str, now: DateTime<Utc>) -> StoreResult<Option<OwnerId>> {
        let state = state.to_string();
        self.call(move |conn| {
            let row = conn
                .query_row(
                    "DELETE FROM oauth_states WHERE state = ?1 RETURNING owner_id, expires_at",
                    params![state],
                    |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)),
                )
                .optional()?;

            Ok(row.and_then(|(owner_id, expires_at)| {
                (expires_at > to_millis(now)).then(|| OwnerId::from(owner_id))
            }))
        })
        .await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        self.call(move |conn| {
            let removed = conn.execute(
                "DELETE FROM oauth_states WHERE expires_at <= ?1",
                params![to_millis(now)],
            )?;
            Ok(removed)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{ConflictField, Projection};
    use chrono::Duration;
    use pretty_assertions::assert_eq;

    fn owner() -> OwnerId {
        OwnerId::from("owner-1")
    }

    fn now_ms() -> DateTime<Utc> {
        // Storage keeps millisecond precision
        DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).unwrap()
    }

    fn link(local: &str, remote: Option<&str>) -> SyncLink {
        SyncLink::synced(
            owner(),
            LocalId::from(local),
            remote.map(RemoteId::from),
            ModifiedSide::Remote,
            now_ms(),
        )
    }

    #[tokio::test]
    async fn test_link_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let saved = link("c1", Some("people/1"));
        SyncMetadataStore::save(&store, &saved).await.unwrap();

        let loaded = store
            .load_one(&owner(), &LocalId::from("c1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, saved);
        assert_eq!(store.load_all(&owner()).await.unwrap().len(), 1);
        assert!(store
            .load_all(&OwnerId::from("someone-else"))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_link_upsert_keeps_remote_id() {
        let store = SqliteStore::open_in_memory().unwrap();
        SyncMetadataStore::save(&store, &link("c1", Some("people/1")))
            .await
            .unwrap();

        let mut without_remote = link("c1", None);
        without_remote.mark_error(now_ms());
        SyncMetadataStore::save(&store, &without_remote)
            .await
            .unwrap();

        let loaded = store
            .load_one(&owner(), &LocalId::from("c1"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded.remote_id, Some(RemoteId::from("people/1")));
        assert_eq!(loaded.state, LinkState::Error);
        assert_eq!(store.load_all(&owner()).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_conflict_payload_round_trip() {
        let store = SqliteStore::open_in_memory().unwrap();
        let mut conflicted = link("c1", Some("people/1"));
        conflicted.mark_conflict(
            ConflictPayload::between(
                Projection {
                    name: "Ana".into(),
                    phone: "+1".into(),
                },
                Projection {
                    name: "Anna".into(),
                    phone: "+1".into(),
                },
            ),
            now_ms(),
        );
        SyncMetadataStore::save(&store, &conflicted).await.unwrap();

        let loaded = store
            .load_one(&owner(), &LocalId::from("c1"))
            .await
            .unwrap()
            .unwrap();
        let payload = loaded.state.conflict_payload().unwrap();
        assert_eq!(payload.conflict_fields, vec![ConflictField::Name]);
    }

    #[tokio::test]
    async fn test_link_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        SyncMetadataStore::save(&store, &link("c1", None))
            .await
            .unwrap();
        assert!(SyncMetadataStore::delete(&store, &owner(), &LocalId::from("c1"))
            .await
            .unwrap());
        assert!(!SyncMetadataStore::delete(&store, &owner(), &LocalId::from("c1"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_cursor_upsert() {
        let store = SqliteStore::open_in_memory().unwrap();
        assert_eq!(store.load_cursor(&owner()).await.unwrap(), None);

        for token in ["first", "second"] {
            store
                .save_cursor(&SyncCursor {
                    owner_id: owner(),
                    token: token.to_string(),
                    updated_at: now_ms(),
                })
                .await
                .unwrap();
        }

        let cursor = store.load_cursor(&owner()).await.unwrap().unwrap();
        assert_eq!(cursor.token, "second");
    }

    #[tokio::test]
    async fn test_credential_upsert_and_delete() {
        let store = SqliteStore::open_in_memory().unwrap();
        let created = now_ms();
        let mut credential = Credential {
            owner_id: owner(),
            encrypted_access_token: "sealed-a".to_string(),
            encrypted_refresh_token: "sealed-r".to_string(),
            token_type: "Bearer".to_string(),
            expires_at: created + Duration::hours(1),
            scopes: vec!["contacts".to_string()],
            created_at: created,
            updated_at: created,
        };
        CredentialStore::save(&store, &credential).await.unwrap();

        credential.encrypted_access_token = "sealed-b".to_string();
        credential.updated_at = created + Duration::minutes(1);
        CredentialStore::save(&store, &credential).await.unwrap();

        let loaded = CredentialStore::load(&store, &owner())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(loaded, credential);

        assert!(CredentialStore::delete(&store, &owner()).await.unwrap());
        assert_eq!(CredentialStore::load(&store, &owner()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_state_is_single_use() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = now_ms();
        store
            .save_state(&PendingAuthorization {
                state: "abc".to_string(),
                owner_id: owner(),
                expires_at: now + Duration::minutes(10),
            })
            .await
            .unwrap();

        assert_eq!(store.take_state("abc", now).await.unwrap(), Some(owner()));
        assert_eq!(store.take_state("abc", now).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_expired_state_is_rejected_and_purged() {
        let store = SqliteStore::open_in_memory().unwrap();
        let now = now_ms();
        for (state, offset) in [("old", -5), ("older", -10), ("fresh", 5)] {
            store
                .save_state(&PendingAuthorization {
                    state: state.to_string(),
                    owner_id: owner(),
                    expires_at: now + Duration::minutes(offset),
                })
                .await
                .unwrap();
        }

        assert_eq!(store.take_state("old", now).await.unwrap(), None);
        assert_eq!(store.purge_expired(now).await.unwrap(), 1);
        assert_eq!(store.take_state("fresh", now).await.unwrap(), Some(owner()));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_concurrent_writes_share_one_connection() {
        let store = SqliteStore::open_in_memory().unwrap();
        let tasks: Vec<_> = (0..16)
            .map(|index| {
                let store = store.clone();
                tokio::spawn(async move {
                    SyncMetadataStore::save(&store, &link(&format!("c{index}"), None)).await
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap().unwrap();
        }

        assert_eq!(store.load_all(&owner()).await.unwrap().len(), 16);
    }

    #[tokio::test]
    async fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.db");

        {
            let store = SqliteStore::open(&path).unwrap();
            SyncMetadataStore::save(&store, &link("c1", Some("people/1")))
                .await
                .unwrap();
        }

        let reopened = SqliteStore::open(&path).unwrap();
        assert_eq!(reopened.load_all(&owner()).await.unwrap().len(), 1);
    }
}
