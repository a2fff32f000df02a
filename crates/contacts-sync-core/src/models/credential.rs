//! OAuth credential models

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::OwnerId;

/// Plaintext OAuth token, only ever held in memory
#[derive(Clone, PartialEq, Eq)]
pub struct OAuthToken {
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
}

impl fmt::Debug for OAuthToken {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("OAuthToken")
            .field("access_token", &"[REDACTED]")
            .field("refresh_token", &"[REDACTED]")
            .field("token_type", &self.token_type)
            .field("expires_at", &self.expires_at)
            .field("scopes", &self.scopes)
            .finish()
    }
}

/// Stored credential for one owner; token fields are ciphertext
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credential {
    pub owner_id: OwnerId,
    pub encrypted_access_token: String,
    pub encrypted_refresh_token: String,
    pub token_type: String,
    pub expires_at: DateTime<Utc>,
    pub scopes: Vec<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Credential {
    /// Whether the access token must be refreshed before use at `now`.
    ///
    /// A zero skew means strictly `now > expires_at`.
    #[must_use]
    pub fn needs_refresh(&self, now: DateTime<Utc>, skew: Duration) -> bool {
        now > self.expires_at - skew
    }
}

/// Pending OAuth consent awaiting its callback
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingAuthorization {
    pub state: String,
    pub owner_id: OwnerId,
    pub expires_at: DateTime<Utc>,
}

/// Connection summary exposed to callers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
}

impl ConnectionStatus {
    #[must_use]
    pub const fn disconnected() -> Self {
        Self {
            connected: false,
            expires_at: None,
            scopes: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn credential(expires_at: DateTime<Utc>) -> Credential {
        Credential {
            owner_id: OwnerId::from("owner"),
            encrypted_access_token: String::new(),
            encrypted_refresh_token: String::new(),
            token_type: "Bearer".to_string(),
            expires_at,
            scopes: Vec::new(),
            created_at: expires_at,
            updated_at: expires_at,
        }
    }

    #[test]
    fn test_needs_refresh_with_zero_skew_is_strict() {
        let now = Utc::now();
        assert!(!credential(now).needs_refresh(now, Duration::zero()));
        assert!(credential(now - Duration::seconds(1)).needs_refresh(now, Duration::zero()));
    }

    #[test]
    fn test_needs_refresh_honors_skew() {
        let now = Utc::now();
        let expires = now + Duration::seconds(30);
        assert!(credential(expires).needs_refresh(now, Duration::seconds(60)));
        assert!(!credential(expires).needs_refresh(now, Duration::seconds(10)));
    }

    #[test]
    fn test_token_debug_redacts_secrets() {
        let token = OAuthToken {
            access_token: "secret-access-token".to_string(),
            refresh_token: Some("secret-refresh-token".to_string()),
            token_type: "Bearer".to_string(),
            expires_at: Utc::now(),
            scopes: vec!["contacts".to_string()],
        };
        let rendered = format!("{token:?}");
        assert!(!rendered.contains("secret-access-token"));
        assert!(!rendered.contains("secret-refresh-token"));
        assert!(rendered.contains("[REDACTED]"));
    }
}
