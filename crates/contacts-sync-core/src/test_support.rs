//! In-process fakes shared by the vault and engine tests

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::crypto::EncryptionService;
use crate::error::{GatewayError, GatewayResult, StoreResult};
use crate::gateway::{ChangeSet, LocalRegistryGateway, RemoteContactGateway};
use crate::models::{
    ContactFields, Credential, LocalId, LocalRecord, OAuthToken, OwnerId, RemoteId, RemoteName,
    RemoteRecord, RemoteValue, SECONDARY_PHONE_KIND,
};
use crate::oauth::{AuthorizationProvider, OAuthError, OAuthResult};
use crate::store::{CredentialStore, SqliteStore};

pub fn crypto() -> EncryptionService {
    EncryptionService::new(&[7u8; 32]).unwrap()
}

/// Store a credential whose access token decrypts to `stored-access`
pub async fn seed_credential(
    store: &SqliteStore,
    owner_id: &OwnerId,
    expires_at: DateTime<Utc>,
    refresh_token: &str,
) {
    let crypto = crypto();
    let now = Utc::now();
    CredentialStore::save(
        store,
        &Credential {
            owner_id: owner_id.clone(),
            encrypted_access_token: crypto.encrypt("stored-access").unwrap(),
            encrypted_refresh_token: crypto.encrypt(refresh_token).unwrap(),
            token_type: "Bearer".to_string(),
            expires_at,
            scopes: vec!["contacts".to_string()],
            created_at: now,
            updated_at: now,
        },
    )
    .await
    .unwrap();
}

/// Credential store that counts persisted writes
pub struct CountingCredentials {
    inner: SqliteStore,
    saves: AtomicUsize,
}

impl CountingCredentials {
    pub const fn new(inner: SqliteStore) -> Self {
        Self {
            inner,
            saves: AtomicUsize::new(0),
        }
    }

    pub fn saves(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CredentialStore for CountingCredentials {
    async fn load(&self, owner_id: &OwnerId) -> StoreResult<Option<Credential>> {
        CredentialStore::load(&self.inner, owner_id).await
    }

    async fn save(&self, credential: &Credential) -> StoreResult<()> {
        self.saves.fetch_add(1, Ordering::SeqCst);
        CredentialStore::save(&self.inner, credential).await
    }

    async fn delete(&self, owner_id: &OwnerId) -> StoreResult<bool> {
        CredentialStore::delete(&self.inner, owner_id).await
    }
}

#[derive(Default)]
pub struct FakeProvider {
    refreshes: AtomicUsize,
    exchanges: AtomicUsize,
    fail_refresh: AtomicBool,
    rotated_refresh_token: Mutex<Option<String>>,
}

impl FakeProvider {
    pub fn refresh_calls(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub fn exchange_calls(&self) -> usize {
        self.exchanges.load(Ordering::SeqCst)
    }

    pub fn fail_refresh(&self) {
        self.fail_refresh.store(true, Ordering::SeqCst);
    }

    pub fn rotate_refresh_token(&self, token: &str) {
        *self.rotated_refresh_token.lock().unwrap() = Some(token.to_string());
    }
}

#[async_trait]
impl AuthorizationProvider for FakeProvider {
    fn authorization_url(&self, state: &str) -> String {
        format!("https://accounts.example.com/auth?state={state}")
    }

    async fn exchange_code(&self, _code: &str) -> OAuthResult<OAuthToken> {
        self.exchanges.fetch_add(1, Ordering::SeqCst);
        Ok(OAuthToken {
            access_token: "exchanged-access".to_string(),
            refresh_token: Some("exchanged-refresh".to_string()),
            token_type: "Bearer".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            scopes: vec!["contacts".to_string()],
        })
    }

    async fn refresh(&self, _refresh_token: &str) -> OAuthResult<OAuthToken> {
        let call = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_refresh.load(Ordering::SeqCst) {
            return Err(OAuthError::Api("invalid_grant (400)".to_string()));
        }
        Ok(OAuthToken {
            access_token: format!("refreshed-access-{call}"),
            refresh_token: self.rotated_refresh_token.lock().unwrap().clone(),
            token_type: "Bearer".to_string(),
            expires_at: Utc::now() + Duration::hours(1),
            scopes: Vec::new(),
        })
    }
}

/// Remote contact with a display name and a primary phone
pub fn remote_record(id: &str, name: &str, phone: &str) -> RemoteRecord {
    let mut record = RemoteRecord::new(id);
    record.names = vec![RemoteName {
        display_name: Some(name.to_string()),
        ..RemoteName::default()
    }];
    record.phones = vec![RemoteValue::new(phone).with_kind("mobile")];
    record
}

pub fn local_record(id: &str, owner_id: &OwnerId, name: &str, phone: &str) -> LocalRecord {
    LocalRecord {
        id: LocalId::from(id),
        owner_id: owner_id.clone(),
        fields: ContactFields {
            name: name.to_string(),
            phone: phone.to_string(),
            ..ContactFields::default()
        },
        created_at: None,
        updated_at: Utc::now(),
    }
}

#[derive(Default)]
pub struct FakeRemote {
    records: Mutex<BTreeMap<RemoteId, RemoteRecord>>,
    /// Changed records, tagged with the number of cursors issued before the change
    changes: Mutex<Vec<(usize, RemoteRecord)>>,
    next_id: AtomicUsize,
    cursor_seq: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    deletes: AtomicUsize,
    reject_cursor: AtomicBool,
    fail_list: AtomicBool,
    fail_create: AtomicBool,
    fail_delete: AtomicBool,
}

impl FakeRemote {
    pub fn insert(&self, record: RemoteRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
    }

    pub fn get(&self, id: &str) -> Option<RemoteRecord> {
        self.records.lock().unwrap().get(&RemoteId::from(id)).cloned()
    }

    pub fn count(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    /// Record changes made after the most recently issued cursor
    pub fn set_changes(&self, records: Vec<RemoteRecord>) {
        let issued = self.cursor_seq.load(Ordering::SeqCst);
        let mut changes = self.changes.lock().unwrap();
        for record in records {
            self.insert(record.clone());
            changes.push((issued, record));
        }
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn delete_calls(&self) -> usize {
        self.deletes.load(Ordering::SeqCst)
    }

    pub fn reject_cursor(&self, reject: bool) {
        self.reject_cursor.store(reject, Ordering::SeqCst);
    }

    pub fn fail_list(&self) {
        self.fail_list.store(true, Ordering::SeqCst);
    }

    pub fn fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }

    pub fn fail_delete(&self) {
        self.fail_delete.store(true, Ordering::SeqCst);
    }

    fn next_cursor(&self) -> String {
        format!("cursor-{}", self.cursor_seq.fetch_add(1, Ordering::SeqCst) + 1)
    }

    /// Same write shape as the People API gateway: blank names are omitted and
    /// the secondary phone is typed as such
    fn record_from_fields(id: RemoteId, fields: &ContactFields) -> RemoteRecord {
        let mut record = RemoteRecord::new(id);
        if !fields.name.trim().is_empty() {
            record.names = vec![RemoteName {
                display_name: Some(fields.name.clone()),
                ..RemoteName::default()
            }];
        }
        if !fields.phone.is_empty() {
            record.phones.push(RemoteValue::new(fields.phone.clone()).with_kind("mobile"));
        }
        if let Some(secondary) = &fields.secondary_phone {
            record
                .phones
                .push(RemoteValue::new(secondary.clone()).with_kind(SECONDARY_PHONE_KIND));
        }
        record.emails = fields.email.iter().map(RemoteValue::new).collect();
        record.notes = fields.notes.iter().cloned().collect();
        record
    }
}

#[async_trait]
impl RemoteContactGateway for FakeRemote {
    async fn list_all(&self, _token: &OAuthToken) -> GatewayResult<Vec<RemoteRecord>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(GatewayError::Api("people API unavailable (503)".to_string()));
        }
        Ok(self.records.lock().unwrap().values().cloned().collect())
    }

    async fn fetch_changes(
        &self,
        token: &OAuthToken,
        cursor: Option<&str>,
    ) -> GatewayResult<ChangeSet> {
        let records = match cursor {
            None => self.list_all(token).await?,
            Some(_) if self.reject_cursor.load(Ordering::SeqCst) => {
                return Err(GatewayError::CursorRejected)
            }
            Some(cursor) => {
                let since = cursor
                    .strip_prefix("cursor-")
                    .and_then(|seq| seq.parse::<usize>().ok())
                    .unwrap_or_default();
                self.changes
                    .lock()
                    .unwrap()
                    .iter()
                    .filter(|(issued, _)| *issued >= since)
                    .map(|(_, record)| record.clone())
                    .collect()
            }
        };
        Ok(ChangeSet {
            records,
            next_cursor: Some(self.next_cursor()),
        })
    }

    async fn create(&self, _token: &OAuthToken, record: &LocalRecord) -> GatewayResult<RemoteId> {
        if !record.fields.has_payload() {
            return Err(GatewayError::EmptyPayload);
        }
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(GatewayError::Api("quota exceeded (429)".to_string()));
        }
        let id = RemoteId::from(format!(
            "people/c{}",
            self.next_id.fetch_add(1, Ordering::SeqCst) + 1
        ));
        self.insert(Self::record_from_fields(id.clone(), &record.fields));
        Ok(id)
    }

    async fn update(
        &self,
        _token: &OAuthToken,
        remote_id: &RemoteId,
        record: &LocalRecord,
    ) -> GatewayResult<()> {
        if !record.fields.has_payload() {
            return Err(GatewayError::EmptyPayload);
        }
        self.updates.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.lock().unwrap();
        if !records.contains_key(remote_id) {
            return Err(GatewayError::NotFound(remote_id.to_string()));
        }
        records.insert(
            remote_id.clone(),
            Self::record_from_fields(remote_id.clone(), &record.fields),
        );
        Ok(())
    }

    async fn delete(&self, _token: &OAuthToken, remote_id: &RemoteId) -> GatewayResult<()> {
        self.deletes.fetch_add(1, Ordering::SeqCst);
        if self.fail_delete.load(Ordering::SeqCst) {
            return Err(GatewayError::Api("backend error (500)".to_string()));
        }
        self.records
            .lock()
            .unwrap()
            .remove(remote_id)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(remote_id.to_string()))
    }
}

#[derive(Default)]
pub struct FakeLocal {
    records: Mutex<BTreeMap<LocalId, LocalRecord>>,
    next_id: AtomicUsize,
    creates: AtomicUsize,
    updates: AtomicUsize,
    fail_list: AtomicBool,
}

impl FakeLocal {
    pub fn insert(&self, record: LocalRecord) {
        self.records
            .lock()
            .unwrap()
            .insert(record.id.clone(), record);
    }

    pub fn get_record(&self, id: &str) -> Option<LocalRecord> {
        self.records.lock().unwrap().get(&LocalId::from(id)).cloned()
    }

    pub fn remove(&self, id: &str) {
        self.records.lock().unwrap().remove(&LocalId::from(id));
    }

    pub fn all(&self) -> Vec<LocalRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }

    pub fn create_calls(&self) -> usize {
        self.creates.load(Ordering::SeqCst)
    }

    pub fn update_calls(&self) -> usize {
        self.updates.load(Ordering::SeqCst)
    }

    pub fn fail_list(&self) {
        self.fail_list.store(true, Ordering::SeqCst);
    }

    pub fn recover_list(&self) {
        self.fail_list.store(false, Ordering::SeqCst);
    }
}

#[async_trait]
impl LocalRegistryGateway for FakeLocal {
    async fn list_all(&self, owner_id: &OwnerId) -> GatewayResult<Vec<LocalRecord>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(GatewayError::Api("registry unavailable (503)".to_string()));
        }
        Ok(self
            .records
            .lock()
            .unwrap()
            .values()
            .filter(|record| &record.owner_id == owner_id)
            .cloned()
            .collect())
    }

    async fn get(&self, owner_id: &OwnerId, id: &LocalId) -> GatewayResult<Option<LocalRecord>> {
        Ok(self
            .records
            .lock()
            .unwrap()
            .get(id)
            .filter(|record| &record.owner_id == owner_id)
            .cloned())
    }

    async fn create(
        &self,
        owner_id: &OwnerId,
        fields: &ContactFields,
    ) -> GatewayResult<LocalRecord> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        let now = Utc::now();
        let record = LocalRecord {
            id: LocalId::from(format!(
                "local-{}",
                self.next_id.fetch_add(1, Ordering::SeqCst) + 1
            )),
            owner_id: owner_id.clone(),
            fields: fields.clone(),
            created_at: Some(now),
            updated_at: now,
        };
        self.insert(record.clone());
        Ok(record)
    }

    async fn update(
        &self,
        _owner_id: &OwnerId,
        id: &LocalId,
        fields: &ContactFields,
    ) -> GatewayResult<()> {
        self.updates.fetch_add(1, Ordering::SeqCst);
        let mut records = self.records.lock().unwrap();
        let record = records
            .get_mut(id)
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))?;
        record.fields = fields.clone();
        record.updated_at = Utc::now();
        Ok(())
    }

    async fn delete(&self, _owner_id: &OwnerId, id: &LocalId) -> GatewayResult<()> {
        self.records
            .lock()
            .unwrap()
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| GatewayError::NotFound(id.to_string()))
    }
}
