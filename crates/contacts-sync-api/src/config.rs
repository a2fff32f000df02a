use std::collections::HashMap;
use std::env;
use std::fmt;
use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;
use contacts_sync_core::crypto::KEY_SIZE;
use contacts_sync_core::google::PEOPLE_API_URL;
use http::HeaderValue;
use thiserror::Error;
use zeroize::Zeroizing;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingVar(&'static str),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Paths to the PEM files used for mutual TLS with the registry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryTlsPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub ca: PathBuf,
}

#[derive(Clone)]
pub struct AppConfig {
    pub bind_addr: String,
    pub database_path: PathBuf,
    pub google_client_id: String,
    pub google_client_secret: String,
    pub google_redirect_url: String,
    pub people_api_url: String,
    pub registry_url: String,
    pub registry_tls: Option<RegistryTlsPaths>,
    pub gateway_secret: String,
    pub encryption_key: Zeroizing<Vec<u8>>,
    pub allowed_origins: Vec<String>,
    pub http_timeout: Duration,
    pub full_sync_deadline: Duration,
    pub incremental_sync_deadline: Duration,
    pub single_sync_deadline: Duration,
    pub token_expiry_skew: Duration,
    pub oauth_state_ttl: Duration,
    pub propagate_local_deletions: bool,
}

impl fmt::Debug for AppConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("AppConfig")
            .field("bind_addr", &self.bind_addr)
            .field("database_path", &self.database_path)
            .field("google_client_id", &self.google_client_id)
            .field("google_client_secret", &"[REDACTED]")
            .field("google_redirect_url", &self.google_redirect_url)
            .field("people_api_url", &self.people_api_url)
            .field("registry_url", &self.registry_url)
            .field("registry_tls", &self.registry_tls)
            .field("gateway_secret", &"[REDACTED]")
            .field("encryption_key", &"[REDACTED]")
            .field("allowed_origins", &self.allowed_origins)
            .field("http_timeout", &self.http_timeout)
            .field("full_sync_deadline", &self.full_sync_deadline)
            .field("incremental_sync_deadline", &self.incremental_sync_deadline)
            .field("single_sync_deadline", &self.single_sync_deadline)
            .field("token_expiry_skew", &self.token_expiry_skew)
            .field("oauth_state_ttl", &self.oauth_state_ttl)
            .field("propagate_local_deletions", &self.propagate_local_deletions)
            .finish()
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let values: HashMap<String, String> = env::vars().collect();
        Self::from_lookup(|name| values.get(name).cloned())
    }

    pub(crate) fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let bind_addr = value_or_default(&lookup, "BIND_ADDR", "127.0.0.1:5004");
        let database_path =
            PathBuf::from(value_or_default(&lookup, "DATABASE_PATH", "contacts-sync.db"));

        let google_client_id = required_trimmed(&lookup, "GOOGLE_CLIENT_ID")?;
        let google_client_secret = required_trimmed(&lookup, "GOOGLE_CLIENT_SECRET")?;
        let google_redirect_url = required_trimmed(&lookup, "GOOGLE_REDIRECT_URL")?;
        require_http_url("GOOGLE_REDIRECT_URL", &google_redirect_url)?;

        let people_api_url = value_or_default(&lookup, "PEOPLE_API_URL", PEOPLE_API_URL);
        require_http_url("PEOPLE_API_URL", &people_api_url)?;

        let registry_url = trim_trailing(&value_or_default(
            &lookup,
            "BACKEND_SERVICE_URL",
            "http://localhost:5003",
        ))
        .to_string();
        require_http_url("BACKEND_SERVICE_URL", &registry_url)?;
        let registry_tls = parse_registry_tls(&lookup)?;

        let gateway_secret = required_trimmed(&lookup, "GATEWAY_SECRET")?;
        let encryption_key = parse_encryption_key(&required_trimmed(&lookup, "ENCRYPTION_KEY")?)?;

        let allowed_origins = value_or_default(&lookup, "ALLOWED_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(str::trim)
            .filter(|origin| !origin.is_empty())
            .map(ToString::to_string)
            .collect::<Vec<_>>();
        for origin in &allowed_origins {
            if origin != "*" && HeaderValue::from_str(origin).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "ALLOWED_ORIGINS contains an invalid origin: {origin}"
                )));
            }
        }

        let http_timeout = bounded_secs(&lookup, "HTTP_TIMEOUT_SECS", 30, 1..=300)?;
        let full_sync_deadline = bounded_secs(&lookup, "SYNC_FULL_DEADLINE_SECS", 300, 10..=3_600)?;
        let incremental_sync_deadline =
            bounded_secs(&lookup, "SYNC_INCREMENTAL_DEADLINE_SECS", 120, 10..=3_600)?;
        let single_sync_deadline =
            bounded_secs(&lookup, "SYNC_SINGLE_DEADLINE_SECS", 30, 1..=600)?;
        let token_expiry_skew = bounded_secs(&lookup, "TOKEN_EXPIRY_SKEW_SECS", 60, 0..=300)?;
        let oauth_state_ttl = bounded_secs(&lookup, "OAUTH_STATE_TTL_SECS", 600, 60..=3_600)?;

        let propagate_local_deletions =
            match value_or_default(&lookup, "PROPAGATE_LOCAL_DELETIONS", "false")
                .to_ascii_lowercase()
                .as_str()
            {
                "1" | "true" | "yes" | "on" => true,
                "0" | "false" | "no" | "off" => false,
                _ => {
                    return Err(ConfigError::Invalid(
                        "PROPAGATE_LOCAL_DELETIONS must be a boolean".to_string(),
                    ))
                }
            };

        Ok(Self {
            bind_addr,
            database_path,
            google_client_id,
            google_client_secret,
            google_redirect_url,
            people_api_url,
            registry_url,
            registry_tls,
            gateway_secret,
            encryption_key,
            allowed_origins,
            http_timeout,
            full_sync_deadline,
            incremental_sync_deadline,
            single_sync_deadline,
            token_expiry_skew,
            oauth_state_ttl,
            propagate_local_deletions,
        })
    }
}

/// Accepts the raw 32-byte key or its standard base64 encoding
fn parse_encryption_key(raw: &str) -> Result<Zeroizing<Vec<u8>>, ConfigError> {
    if raw.len() == KEY_SIZE {
        return Ok(Zeroizing::new(raw.as_bytes().to_vec()));
    }
    match STANDARD.decode(raw) {
        Ok(decoded) if decoded.len() == KEY_SIZE => Ok(Zeroizing::new(decoded)),
        _ => Err(ConfigError::Invalid(format!(
            "ENCRYPTION_KEY must be exactly {KEY_SIZE} bytes (raw or base64 encoded)"
        ))),
    }
}

fn parse_registry_tls(
    lookup: impl Fn(&str) -> Option<String>,
) -> Result<Option<RegistryTlsPaths>, ConfigError> {
    let cert = optional_trimmed(&lookup, "BACKEND_MTLS_CERT");
    let key = optional_trimmed(&lookup, "BACKEND_MTLS_KEY");
    let ca = optional_trimmed(&lookup, "BACKEND_CA_CERT");

    if cert.is_none() && key.is_none() && ca.is_none() {
        return Ok(None);
    }

    let cert = cert.ok_or(ConfigError::MissingVar("BACKEND_MTLS_CERT"))?;
    let key = key.ok_or(ConfigError::MissingVar("BACKEND_MTLS_KEY"))?;
    let ca = ca.ok_or(ConfigError::MissingVar("BACKEND_CA_CERT"))?;

    Ok(Some(RegistryTlsPaths {
        cert: PathBuf::from(cert),
        key: PathBuf::from(key),
        ca: PathBuf::from(ca),
    }))
}

fn bounded_secs(
    lookup: impl Fn(&str) -> Option<String>,
    name: &str,
    default: u64,
    range: RangeInclusive<u64>,
) -> Result<Duration, ConfigError> {
    let invalid = || {
        ConfigError::Invalid(format!(
            "{name} must be an integer in [{}, {}]",
            range.start(),
            range.end()
        ))
    };
    let secs = optional_trimmed(lookup, name)
        .map_or(Ok(default), |value| value.parse::<u64>())
        .map_err(|_| invalid())?;
    if !range.contains(&secs) {
        return Err(invalid());
    }
    Ok(Duration::from_secs(secs))
}

fn require_http_url(name: &str, value: &str) -> Result<(), ConfigError> {
    if value.starts_with("http://") || value.starts_with("https://") {
        Ok(())
    } else {
        Err(ConfigError::Invalid(format!(
            "{name} must start with http:// or https://"
        )))
    }
}

fn value_or_default(lookup: impl Fn(&str) -> Option<String>, name: &str, default: &str) -> String {
    optional_trimmed(lookup, name).unwrap_or_else(|| default.to_string())
}

fn required_trimmed(
    lookup: impl Fn(&str) -> Option<String>,
    name: &'static str,
) -> Result<String, ConfigError> {
    optional_trimmed(lookup, name).ok_or(ConfigError::MissingVar(name))
}

fn optional_trimmed(lookup: impl Fn(&str) -> Option<String>, name: &str) -> Option<String> {
    lookup(name).and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn trim_trailing(value: &str) -> &str {
    value.trim_end_matches('/')
}

#[cfg(test)]
pub(crate) mod tests {
    use std::collections::HashMap;

    use super::*;

    pub(crate) fn minimal_env() -> HashMap<&'static str, &'static str> {
        HashMap::from([
            ("GOOGLE_CLIENT_ID", "client-id.apps.googleusercontent.com"),
            ("GOOGLE_CLIENT_SECRET", "sensitive-client-secret"),
            ("GOOGLE_REDIRECT_URL", "http://localhost:5004/v1/oauth/callback"),
            ("GATEWAY_SECRET", "sensitive-gateway-secret"),
            ("ENCRYPTION_KEY", "0123456789abcdef0123456789abcdef"),
        ])
    }

    fn load(map: &HashMap<&str, &str>) -> Result<AppConfig, ConfigError> {
        AppConfig::from_lookup(|key| map.get(key).map(|value| (*value).to_string()))
    }

    #[test]
    fn config_requires_minimum_secrets() {
        let map: HashMap<&str, &str> = HashMap::new();
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("GOOGLE_CLIENT_ID"));

        let mut map = minimal_env();
        map.remove("GATEWAY_SECRET");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("GATEWAY_SECRET"));
    }

    #[test]
    fn config_applies_defaults() {
        let config = load(&minimal_env()).unwrap();
        assert_eq!(config.bind_addr, "127.0.0.1:5004");
        assert_eq!(config.registry_url, "http://localhost:5003");
        assert_eq!(config.people_api_url, PEOPLE_API_URL);
        assert_eq!(config.full_sync_deadline, Duration::from_secs(300));
        assert_eq!(config.incremental_sync_deadline, Duration::from_secs(120));
        assert_eq!(config.single_sync_deadline, Duration::from_secs(30));
        assert_eq!(config.token_expiry_skew, Duration::from_secs(60));
        assert_eq!(config.oauth_state_ttl, Duration::from_secs(600));
        assert_eq!(config.allowed_origins, vec!["http://localhost:5173"]);
        assert!(config.registry_tls.is_none());
        assert!(!config.propagate_local_deletions);
    }

    #[test]
    fn config_rejects_bad_encryption_keys() {
        let mut map = minimal_env();
        map.insert("ENCRYPTION_KEY", "too-short");
        assert!(load(&map).unwrap_err().to_string().contains("ENCRYPTION_KEY"));

        map.insert("ENCRYPTION_KEY", "MDEyMzQ1Njc4OWFiY2RlZjAxMjM0NTY3ODlhYmNkZWY=");
        let config = load(&map).unwrap();
        assert_eq!(config.encryption_key.as_slice(), b"0123456789abcdef0123456789abcdef");
    }

    #[test]
    fn config_requires_complete_mtls_paths() {
        let mut map = minimal_env();
        map.insert("BACKEND_MTLS_CERT", "/certs/client.pem");
        let err = load(&map).unwrap_err();
        assert!(err.to_string().contains("BACKEND_MTLS_KEY"));

        map.insert("BACKEND_MTLS_KEY", "/certs/client-key.pem");
        map.insert("BACKEND_CA_CERT", "/certs/ca.pem");
        let tls = load(&map).unwrap().registry_tls.unwrap();
        assert_eq!(tls.ca, PathBuf::from("/certs/ca.pem"));
    }

    #[test]
    fn config_validates_ranges_and_flags() {
        let mut map = minimal_env();
        map.insert("TOKEN_EXPIRY_SKEW_SECS", "301");
        assert!(load(&map).unwrap_err().to_string().contains("TOKEN_EXPIRY_SKEW_SECS"));

        map.insert("TOKEN_EXPIRY_SKEW_SECS", "0");
        map.insert("PROPAGATE_LOCAL_DELETIONS", "maybe");
        assert!(load(&map)
            .unwrap_err()
            .to_string()
            .contains("PROPAGATE_LOCAL_DELETIONS"));

        map.insert("PROPAGATE_LOCAL_DELETIONS", "TRUE");
        let config = load(&map).unwrap();
        assert_eq!(config.token_expiry_skew, Duration::ZERO);
        assert!(config.propagate_local_deletions);
    }

    #[test]
    fn config_redacts_sensitive_debug_fields() {
        let config = load(&minimal_env()).unwrap();

        let debug_output = format!("{config:?}");
        assert!(!debug_output.contains("sensitive-client-secret"));
        assert!(!debug_output.contains("sensitive-gateway-secret"));
        assert!(!debug_output.contains("0123456789abcdef"));
        assert!(debug_output.contains("[REDACTED]"));
    }
}
