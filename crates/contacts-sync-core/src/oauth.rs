//! OAuth 2.0 authorization-code flow against Google

use std::fmt;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use reqwest::{Client, RequestBuilder};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

use crate::models::OAuthToken;
use crate::util::{is_http_url, parse_api_error};

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";

/// Scopes requested on consent: contacts read/write and the account email
pub const DEFAULT_SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/contacts",
    "https://www.googleapis.com/auth/userinfo.email",
];

/// Lifetime assumed when the token endpoint omits `expires_in`
const DEFAULT_EXPIRES_IN_SECONDS: i64 = 3600;

pub type OAuthResult<T> = std::result::Result<T, OAuthError>;

#[derive(Error, Debug)]
pub enum OAuthError {
    #[error("Invalid OAuth configuration: {0}")]
    InvalidConfiguration(&'static str),

    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Token endpoint error: {0}")]
    Api(String),

    #[error("Invalid token response: {0}")]
    InvalidResponse(&'static str),
}

/// The OAuth provider the credential vault talks to
#[async_trait]
pub trait AuthorizationProvider: Send + Sync {
    /// Consent URL embedding the given opaque state
    fn authorization_url(&self, state: &str) -> String;

    async fn exchange_code(&self, code: &str) -> OAuthResult<OAuthToken>;

    async fn refresh(&self, refresh_token: &str) -> OAuthResult<OAuthToken>;
}

#[derive(Clone)]
pub struct GoogleOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
    pub redirect_url: String,
    pub scopes: Vec<String>,
}

impl GoogleOAuthConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        redirect_url: impl Into<String>,
    ) -> Self {
        Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            redirect_url: redirect_url.into(),
            scopes: DEFAULT_SCOPES.iter().map(ToString::to_string).collect(),
        }
    }
}

impl fmt::Debug for GoogleOAuthConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("GoogleOAuthConfig")
            .field("client_id", &self.client_id)
            .field("client_secret", &"[REDACTED]")
            .field("redirect_url", &self.redirect_url)
            .field("scopes", &self.scopes)
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct GoogleOAuthProvider {
    config: GoogleOAuthConfig,
    auth_url: Url,
    token_url: Url,
    client: Client,
}

impl GoogleOAuthProvider {
    pub fn new(config: GoogleOAuthConfig) -> OAuthResult<Self> {
        if config.client_id.trim().is_empty() {
            return Err(OAuthError::InvalidConfiguration(
                "Client ID must not be empty",
            ));
        }
        if config.client_secret.trim().is_empty() {
            return Err(OAuthError::InvalidConfiguration(
                "Client secret must not be empty",
            ));
        }
        if !is_http_url(config.redirect_url.trim()) {
            return Err(OAuthError::InvalidConfiguration(
                "Redirect URL must include http:// or https://",
            ));
        }

        let auth_url = Url::parse(GOOGLE_AUTH_URL)
            .map_err(|_| OAuthError::InvalidConfiguration("Invalid authorization endpoint"))?;
        let token_url = Url::parse(GOOGLE_TOKEN_URL)
            .map_err(|_| OAuthError::InvalidConfiguration("Invalid token endpoint"))?;

        Ok(Self {
            config,
            auth_url,
            token_url,
            client: Client::builder().build()?,
        })
    }

    async fn send_token_request(&self, request: RequestBuilder) -> OAuthResult<OAuthToken> {
        let response = request.send().await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::Api(parse_api_error(status, &body)));
        }
        let payload = response.json::<TokenResponse>().await?;
        payload.into_token(Utc::now())
    }
}

#[async_trait]
impl AuthorizationProvider for GoogleOAuthProvider {
    fn authorization_url(&self, state: &str) -> String {
        let mut url = self.auth_url.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_url)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.config.scopes.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent")
            .append_pair("state", state);
        url.into()
    }

    async fn exchange_code(&self, code: &str) -> OAuthResult<OAuthToken> {
        if code.trim().is_empty() {
            return Err(OAuthError::InvalidConfiguration(
                "Authorization code must not be empty",
            ));
        }

        let request = self.client.post(self.token_url.clone()).form(&[
            ("grant_type", "authorization_code"),
            ("code", code),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
            ("redirect_uri", self.config.redirect_url.as_str()),
        ]);
        self.send_token_request(request).await
    }

    async fn refresh(&self, refresh_token: &str) -> OAuthResult<OAuthToken> {
        if refresh_token.trim().is_empty() {
            return Err(OAuthError::InvalidConfiguration(
                "Refresh token must not be empty",
            ));
        }

        let request = self.client.post(self.token_url.clone()).form(&[
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", self.config.client_id.as_str()),
            ("client_secret", self.config.client_secret.as_str()),
        ]);
        self.send_token_request(request).await
    }
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    refresh_token: Option<String>,
    expires_in: Option<i64>,
    token_type: Option<String>,
    scope: Option<String>,
}

impl TokenResponse {
    fn into_token(self, now: DateTime<Utc>) -> OAuthResult<OAuthToken> {
        let access_token = self
            .access_token
            .filter(|token| !token.trim().is_empty())
            .ok_or(OAuthError::InvalidResponse("missing access_token"))?;

        Ok(OAuthToken {
            access_token,
            refresh_token: self.refresh_token.filter(|token| !token.trim().is_empty()),
            token_type: self.token_type.unwrap_or_else(|| "Bearer".to_string()),
            expires_at: now
                + Duration::seconds(self.expires_in.unwrap_or(DEFAULT_EXPIRES_IN_SECONDS)),
            scopes: self
                .scope
                .map(|scope| scope.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        })
    }
}
