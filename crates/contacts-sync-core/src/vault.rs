//! OAuth credential lifecycle: connect, refresh on expiry, disconnect.
//!
//! Tokens are encrypted before they reach the credential store and only
//! leave the vault as an in-memory [`OAuthToken`]. Refreshes for the same
//! owner are serialized so concurrent callers never race on a rotating
//! refresh token.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use rand::RngCore;
use serde::Serialize;
use thiserror::Error;
use zeroize::Zeroizing;

use crate::crypto::{CryptoError, EncryptionService};
use crate::error::StoreError;
use crate::locks::OwnerLocks;
use crate::models::{ConnectionStatus, Credential, OAuthToken, OwnerId, PendingAuthorization};
use crate::oauth::{AuthorizationProvider, OAuthError};
use crate::store::{AuthorizationStateStore, CredentialStore};
use crate::util::owner_fingerprint;

pub const DEFAULT_EXPIRY_SKEW_SECONDS: i64 = 60;
pub const DEFAULT_STATE_TTL_SECONDS: i64 = 600;
const STATE_BYTES: usize = 32;

pub type VaultResult<T> = std::result::Result<T, VaultError>;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("No credential stored for this owner")]
    NotConnected,

    #[error("Credential storage error: {0}")]
    Storage(#[from] StoreError),

    #[error("Stored credential could not be decrypted: {0}")]
    Crypto(#[from] CryptoError),

    /// The provider refused the refresh; the owner must authorize again
    #[error("Token refresh failed: {0}")]
    Refresh(String),

    #[error("Authorization state is unknown or expired")]
    InvalidState,

    #[error("Authorization code exchange failed: {0}")]
    Exchange(#[source] OAuthError),
}

/// Consent URL handed to the owner, plus the state that will come back on the callback
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AuthorizationRequest {
    pub authorization_url: String,
    pub state: String,
}

#[derive(Clone)]
pub struct CredentialVault {
    credentials: Arc<dyn CredentialStore>,
    states: Arc<dyn AuthorizationStateStore>,
    provider: Arc<dyn AuthorizationProvider>,
    crypto: EncryptionService,
    locks: OwnerLocks,
    expiry_skew: Duration,
    state_ttl: Duration,
}

impl CredentialVault {
    pub fn new(
        credentials: Arc<dyn CredentialStore>,
        states: Arc<dyn AuthorizationStateStore>,
        provider: Arc<dyn AuthorizationProvider>,
        crypto: EncryptionService,
    ) -> Self {
        Self {
            credentials,
            states,
            provider,
            crypto,
            locks: OwnerLocks::new(),
            expiry_skew: Duration::seconds(DEFAULT_EXPIRY_SKEW_SECONDS),
            state_ttl: Duration::seconds(DEFAULT_STATE_TTL_SECONDS),
        }
    }

    /// Refresh this long before the recorded expiry
    #[must_use]
    pub const fn with_expiry_skew(mut self, skew: Duration) -> Self {
        self.expiry_skew = skew;
        self
    }

    #[must_use]
    pub const fn with_state_ttl(mut self, ttl: Duration) -> Self {
        self.state_ttl = ttl;
        self
    }

    /// Return a usable access token, refreshing it first when it is (about to be) expired.
    ///
    /// Persists at most one credential update, and only after a successful refresh.
    pub async fn get_valid_token(&self, owner_id: &OwnerId) -> VaultResult<OAuthToken> {
        let _guard = self.locks.acquire(owner_id).await;

        let credential = self
            .credentials
            .load(owner_id)
            .await?
            .ok_or(VaultError::NotConnected)?;
        let access_token = Zeroizing::new(self.crypto.decrypt(&credential.encrypted_access_token)?);
        let refresh_token =
            Zeroizing::new(self.crypto.decrypt(&credential.encrypted_refresh_token)?);

        let now = Utc::now();
        if !credential.needs_refresh(now, self.expiry_skew) {
            return Ok(OAuthToken {
                access_token: access_token.to_string(),
                refresh_token: non_empty(&refresh_token),
                token_type: credential.token_type,
                expires_at: credential.expires_at,
                scopes: credential.scopes,
            });
        }

        if refresh_token.is_empty() {
            tracing::warn!(
                owner = owner_fingerprint(owner_id.as_str()),
                "Access token expired and no refresh token is stored"
            );
            return Err(VaultError::Refresh(
                "no refresh token stored for expired credential".to_string(),
            ));
        }

        tracing::info!(
            owner = owner_fingerprint(owner_id.as_str()),
            expired_at = %credential.expires_at,
            "Refreshing access token"
        );
        let refreshed = self.provider.refresh(&refresh_token).await.map_err(|error| {
            tracing::warn!(
                owner = owner_fingerprint(owner_id.as_str()),
                "Token refresh failed: {}",
                error
            );
            VaultError::Refresh(error.to_string())
        })?;

        // The provider may omit a rotated refresh token or the granted scopes
        let refresh_token = refreshed
            .refresh_token
            .clone()
            .unwrap_or_else(|| refresh_token.to_string());
        let scopes = if refreshed.scopes.is_empty() {
            credential.scopes
        } else {
            refreshed.scopes.clone()
        };

        let updated = Credential {
            owner_id: owner_id.clone(),
            encrypted_access_token: self.crypto.encrypt(&refreshed.access_token)?,
            encrypted_refresh_token: self.crypto.encrypt(&refresh_token)?,
            token_type: refreshed.token_type.clone(),
            expires_at: refreshed.expires_at,
            scopes: scopes.clone(),
            created_at: credential.created_at,
            updated_at: now,
        };
        self.credentials.save(&updated).await?;

        Ok(OAuthToken {
            access_token: refreshed.access_token,
            refresh_token: Some(refresh_token),
            token_type: refreshed.token_type,
            expires_at: refreshed.expires_at,
            scopes,
        })
    }

    /// Start the consent flow for `owner_id`, recording a single-use state
    pub async fn begin_authorization(&self, owner_id: &OwnerId) -> VaultResult<AuthorizationRequest> {
        let now = Utc::now();
        match self.states.purge_expired(now).await {
            Ok(0) => {}
            Ok(purged) => tracing::debug!("Purged {} expired authorization states", purged),
            Err(error) => tracing::warn!("Failed to purge expired authorization states: {}", error),
        }

        let state = generate_state();
        self.states
            .save_state(&PendingAuthorization {
                state: state.clone(),
                owner_id: owner_id.clone(),
                expires_at: now + self.state_ttl,
            })
            .await?;

        tracing::info!(
            owner = owner_fingerprint(owner_id.as_str()),
            "Started authorization flow"
        );
        Ok(AuthorizationRequest {
            authorization_url: self.provider.authorization_url(&state),
            state,
        })
    }

    /// Finish the consent flow: consume the state, exchange the code, store the credential
    pub async fn complete_authorization(&self, state: &str, code: &str) -> VaultResult<OwnerId> {
        let now = Utc::now();
        let owner_id = self
            .states
            .take_state(state, now)
            .await?
            .ok_or(VaultError::InvalidState)?;

        let _guard = self.locks.acquire(&owner_id).await;
        let token = self
            .provider
            .exchange_code(code)
            .await
            .map_err(VaultError::Exchange)?;
        let existing = self.credentials.load(&owner_id).await?;

        let encrypted_refresh_token = match (&token.refresh_token, &existing) {
            (Some(refresh_token), _) => self.crypto.encrypt(refresh_token)?,
            (None, Some(existing)) => existing.encrypted_refresh_token.clone(),
            (None, None) => {
                tracing::warn!(
                    owner = owner_fingerprint(owner_id.as_str()),
                    "Provider returned no refresh token; credential cannot be refreshed"
                );
                String::new()
            }
        };

        let credential = Credential {
            owner_id: owner_id.clone(),
            encrypted_access_token: self.crypto.encrypt(&token.access_token)?,
            encrypted_refresh_token,
            token_type: token.token_type,
            expires_at: token.expires_at,
            scopes: token.scopes,
            created_at: existing.map_or(now, |existing| existing.created_at),
            updated_at: now,
        };
        self.credentials.save(&credential).await?;

        tracing::info!(
            owner = owner_fingerprint(owner_id.as_str()),
            "Stored new credential"
        );
        Ok(owner_id)
    }

    pub async fn disconnect(&self, owner_id: &OwnerId) -> VaultResult<()> {
        let _guard = self.locks.acquire(owner_id).await;
        if !self.credentials.delete(owner_id).await? {
            return Err(VaultError::NotConnected);
        }
        tracing::info!(
            owner = owner_fingerprint(owner_id.as_str()),
            "Deleted credential"
        );
        Ok(())
    }

    pub async fn connection_status(&self, owner_id: &OwnerId) -> VaultResult<ConnectionStatus> {
        Ok(self
            .credentials
            .load(owner_id)
            .await?
            .map_or_else(ConnectionStatus::disconnected, |credential| {
                ConnectionStatus {
                    connected: true,
                    expires_at: Some(credential.expires_at),
                    scopes: credential.scopes,
                }
            }))
    }
}

impl std::fmt::Debug for CredentialVault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialVault")
            .field("crypto", &self.crypto)
            .field("expiry_skew", &self.expiry_skew)
            .field("state_ttl", &self.state_ttl)
            .finish_non_exhaustive()
    }
}

fn generate_state() -> String {
    let mut bytes = [0u8; STATE_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

fn non_empty(value: &str) -> Option<String> {
    (!value.is_empty()).then(|| value.to_string())
}
