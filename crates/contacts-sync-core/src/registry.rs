//! REST client for the local client registry

use std::fmt;
use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use reqwest::{Certificate, Client, Identity, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use url::Url;

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::LocalRegistryGateway;
use crate::models::{ContactFields, LocalId, LocalRecord, OwnerId};
use crate::util::{is_http_url, normalize_text_option, parse_api_error};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const GATEWAY_KEY_HEADER: &str = "x-gateway-key";

const CLIENTS_PATH: [&str; 3] = ["api", "v1", "clients"];

/// PEM material for mutual TLS with the registry
#[derive(Clone)]
pub struct RegistryTls {
    /// Client certificate followed by its private key
    pub identity_pem: Vec<u8>,
    pub ca_pem: Vec<u8>,
}

impl RegistryTls {
    pub fn from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        ca_path: impl AsRef<Path>,
    ) -> GatewayResult<Self> {
        let mut identity_pem = read_pem(cert_path.as_ref())?;
        identity_pem.push(b'\n');
        identity_pem.extend(read_pem(key_path.as_ref())?);
        Ok(Self {
            identity_pem,
            ca_pem: read_pem(ca_path.as_ref())?,
        })
    }
}

impl fmt::Debug for RegistryTls {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RegistryTls")
            .field("identity_pem", &"[REDACTED]")
            .field("ca_pem_len", &self.ca_pem.len())
            .finish()
    }
}

fn read_pem(path: &Path) -> GatewayResult<Vec<u8>> {
    std::fs::read(path).map_err(|error| {
        GatewayError::InvalidConfiguration(format!("cannot read {}: {error}", path.display()))
    })
}

#[derive(Clone)]
pub struct RegistryConfig {
    pub base_url: String,
    pub gateway_secret: String,
    pub request_timeout: Duration,
    pub tls: Option<RegistryTls>,
}

impl fmt::Debug for RegistryConfig {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RegistryConfig")
            .field("base_url", &self.base_url)
            .field("gateway_secret", &"[REDACTED]")
            .field("request_timeout", &self.request_timeout)
            .field("tls", &self.tls)
            .finish()
    }
}

#[derive(Clone)]
pub struct RegistryClient {
    base_url: Url,
    gateway_secret: String,
    client: Client,
}

impl fmt::Debug for RegistryClient {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        formatter
            .debug_struct("RegistryClient")
            .field("base_url", &self.base_url.as_str())
            .field("gateway_secret", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

impl RegistryClient {
    pub fn new(config: RegistryConfig) -> GatewayResult<Self> {
        let base_url = config.base_url.trim();
        if !is_http_url(base_url) {
            return Err(GatewayError::InvalidConfiguration(
                "registry URL must include http:// or https://".to_string(),
            ));
        }
        let base_url = Url::parse(base_url).map_err(|error| {
            GatewayError::InvalidConfiguration(format!("invalid registry URL: {error}"))
        })?;
        if base_url.cannot_be_a_base() {
            return Err(GatewayError::InvalidConfiguration(
                "registry URL cannot be a base".to_string(),
            ));
        }
        if config.gateway_secret.trim().is_empty() {
            return Err(GatewayError::InvalidConfiguration(
                "gateway secret must not be empty".to_string(),
            ));
        }

        let mut builder = Client::builder().timeout(config.request_timeout);
        if let Some(tls) = &config.tls {
            let identity = Identity::from_pem(&tls.identity_pem)?;
            let ca = Certificate::from_pem(&tls.ca_pem)?;
            builder = builder
                .use_rustls_tls()
                .identity(identity)
                .add_root_certificate(ca);
        }

        Ok(Self {
            base_url,
            gateway_secret: config.gateway_secret,
            client: builder.build()?,
        })
    }

    fn clients_url(&self, id: Option<&LocalId>) -> GatewayResult<Url> {
        let mut url = self.base_url.clone();
        {
            let mut segments = url.path_segments_mut().map_err(|()| {
                GatewayError::InvalidConfiguration("registry URL cannot be a base".to_string())
            })?;
            segments.pop_if_empty().extend(CLIENTS_PATH);
            if let Some(id) = id {
                segments.push(id.as_str());
            }
        }
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder, owner_id: &OwnerId) -> RequestBuilder {
        request
            .header(USER_ID_HEADER, owner_id.as_str())
            .header(GATEWAY_KEY_HEADER, &self.gateway_secret)
    }
}

#[async_trait]
impl LocalRegistryGateway for RegistryClient {
    async fn list_all(&self, owner_id: &OwnerId) -> GatewayResult<Vec<LocalRecord>> {
        let request = self.authorized(self.client.get(self.clients_url(None)?), owner_id);
        let response = ensure_success(request.send().await?).await?;
        let envelope = response.json::<Envelope<Vec<ClientDto>>>().await?;

        let records = envelope
            .data
            .into_iter()
            .map(|client| client.into_record(owner_id))
            .collect::<GatewayResult<Vec<_>>>()?;
        tracing::debug!(count = records.len(), "Listed registry clients");
        Ok(records)
    }

    async fn get(&self, owner_id: &OwnerId, id: &LocalId) -> GatewayResult<Option<LocalRecord>> {
        let request = self.authorized(self.client.get(self.clients_url(Some(id))?), owner_id);
        let response = request.send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let envelope = ensure_success(response)
            .await?
            .json::<Envelope<ClientDto>>()
            .await?;
        envelope.data.into_record(owner_id).map(Some)
    }

    async fn create(
        &self,
        owner_id: &OwnerId,
        fields: &ContactFields,
    ) -> GatewayResult<LocalRecord> {
        let request = self
            .authorized(self.client.post(self.clients_url(None)?), owner_id)
            .json(&ClientPayload::new(owner_id, fields));
        let envelope = ensure_success(request.send().await?)
            .await?
            .json::<Envelope<ClientDto>>()
            .await?;
        let record = envelope.data.into_record(owner_id)?;

        tracing::info!(local_id = %record.id, "Created registry client");
        Ok(record)
    }

    async fn update(
        &self,
        owner_id: &OwnerId,
        id: &LocalId,
        fields: &ContactFields,
    ) -> GatewayResult<()> {
        let request = self
            .authorized(self.client.patch(self.clients_url(Some(id))?), owner_id)
            .json(&ClientPayload::new(owner_id, fields));
        ensure_success(request.send().await?).await?;

        tracing::info!(local_id = %id, "Updated registry client");
        Ok(())
    }

    async fn delete(&self, owner_id: &OwnerId, id: &LocalId) -> GatewayResult<()> {
        let request = self.authorized(self.client.delete(self.clients_url(Some(id))?), owner_id);
        ensure_success(request.send().await?).await?;

        tracing::info!(local_id = %id, "Deleted registry client");
        Ok(())
    }
}

async fn ensure_success(response: Response) -> GatewayResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    let message = parse_api_error(status, &body);
    if status == StatusCode::NOT_FOUND {
        Err(GatewayError::NotFound(message))
    } else {
        Err(GatewayError::Api(message))
    }
}

/// `{"status": ..., "data": ...}` response wrapper
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    data: T,
}

/// A client as the registry serializes it
#[derive(Debug, Deserialize)]
struct ClientDto {
    id: String,
    #[serde(default)]
    name: String,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    phone: String,
    #[serde(default)]
    whatsapp: Option<String>,
    #[serde(default, deserialize_with = "deserialize_birth_date")]
    date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    address: Option<String>,
    #[serde(default)]
    notes: Option<String>,
    #[serde(default)]
    created_at: Option<DateTime<Utc>>,
    #[serde(default)]
    updated_at: Option<DateTime<Utc>>,
}

impl ClientDto {
    fn into_record(self, owner_id: &OwnerId) -> GatewayResult<LocalRecord> {
        if self.id.trim().is_empty() {
            return Err(GatewayError::InvalidPayload(
                "registry client has no id".to_string(),
            ));
        }

        Ok(LocalRecord {
            id: LocalId::new(self.id),
            owner_id: owner_id.clone(),
            fields: ContactFields {
                name: self.name,
                phone: self.phone,
                email: normalize_text_option(self.email),
                secondary_phone: normalize_text_option(self.whatsapp),
                date_of_birth: self.date_of_birth,
                address: normalize_text_option(self.address),
                notes: normalize_text_option(self.notes),
            },
            created_at: self.created_at,
            // A record with no timestamp never counts as changed since a sync
            updated_at: self.updated_at.or(self.created_at).unwrap_or_default(),
        })
    }
}

#[derive(Debug, Serialize)]
struct ClientPayload<'a> {
    name: &'a str,
    phone: &'a str,
    email: Option<&'a str>,
    whatsapp: Option<&'a str>,
    #[serde(serialize_with = "serialize_birth_date")]
    date_of_birth: Option<NaiveDate>,
    address: Option<&'a str>,
    notes: Option<&'a str>,
    user_id: &'a str,
}

impl<'a> ClientPayload<'a> {
    fn new(owner_id: &'a OwnerId, fields: &'a ContactFields) -> Self {
        Self {
            name: &fields.name,
            phone: &fields.phone,
            email: fields.email.as_deref(),
            whatsapp: fields.secondary_phone.as_deref(),
            date_of_birth: fields.date_of_birth,
            address: fields.address.as_deref(),
            notes: fields.notes.as_deref(),
            user_id: owner_id.as_str(),
        }
    }
}

/// Accepts `YYYY-MM-DD` or an RFC 3339 timestamp
fn deserialize_birth_date<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
where
    D: Deserializer<'de>,
{
    let Some(raw) = Option::<String>::deserialize(deserializer)? else {
        return Ok(None);
    };
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Ok(Some(date));
    }
    DateTime::parse_from_rfc3339(raw)
        .map(|timestamp| Some(timestamp.date_naive()))
        .map_err(serde::de::Error::custom)
}

#[allow(clippy::ref_option)]
fn serialize_birth_date<S>(date: &Option<NaiveDate>, serializer: S) -> Result<S::Ok, S::Error>
where
    S: Serializer,
{
    match date {
        Some(date) => serializer.serialize_str(&format!("{}T00:00:00Z", date.format("%Y-%m-%d"))),
        None => serializer.serialize_none(),
    }
}
