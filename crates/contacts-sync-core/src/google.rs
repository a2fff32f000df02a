//! Google People API gateway

use std::time::Duration;

use async_trait::async_trait;
use chrono::NaiveDate;
use reqwest::{Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{ChangeSet, RemoteContactGateway};
use crate::models::{
    ContactFields, LocalRecord, OAuthToken, PartialDate, RemoteId, RemoteName, RemoteRecord,
    RemoteValue, SECONDARY_PHONE_KIND,
};
use crate::util::parse_api_error;

pub const PEOPLE_API_URL: &str = "https://people.googleapis.com/v1/";

/// Fields read from and written to every contact
pub const PERSON_FIELDS: &str = "names,emailAddresses,phoneNumbers,addresses,birthdays,biographies";

const PAGE_SIZE: &str = "1000";
const RESOURCE_PREFIX: &str = "people/";

const EMAIL_KIND: &str = "home";
const PHONE_KIND: &str = "mobile";
const ADDRESS_KIND: &str = "home";

#[derive(Debug, Clone)]
pub struct PeopleGateway {
    base_url: Url,
    client: Client,
}

impl PeopleGateway {
    pub fn new(request_timeout: Duration) -> GatewayResult<Self> {
        let client = Client::builder().timeout(request_timeout).build()?;
        Ok(Self {
            base_url: parse_base_url(PEOPLE_API_URL)?,
            client,
        })
    }

    /// Point the gateway at another API root
    pub fn with_base_url(mut self, base_url: &str) -> GatewayResult<Self> {
        self.base_url = parse_base_url(base_url)?;
        Ok(self)
    }

    fn endpoint(&self, path: &str) -> GatewayResult<Url> {
        // "./" keeps "people:createContact" from parsing as a scheme
        self.base_url
            .join(&format!("./{path}"))
            .map_err(|error| GatewayError::InvalidConfiguration(error.to_string()))
    }

    /// Walk every page of the connection listing
    async fn list_connections(
        &self,
        token: &OAuthToken,
        sync_token: Option<&str>,
    ) -> GatewayResult<ChangeSet> {
        let url = self.endpoint("people/me/connections")?;
        let mut records = Vec::new();
        let mut next_cursor = None;
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![
                ("personFields", PERSON_FIELDS),
                ("pageSize", PAGE_SIZE),
                ("requestSyncToken", "true"),
            ];
            if let Some(sync_token) = sync_token {
                query.push(("syncToken", sync_token));
            }
            if let Some(page_token) = page_token.as_deref() {
                query.push(("pageToken", page_token));
            }

            let response = self
                .client
                .get(url.clone())
                .bearer_auth(&token.access_token)
                .query(&query)
                .send()
                .await?;

            let status = response.status();
            if !status.is_success() {
                let body = response.text().await.unwrap_or_default();
                if sync_token.is_some() && is_expired_sync_token(status, &body) {
                    return Err(GatewayError::CursorRejected);
                }
                return Err(status_error(status, &body));
            }

            let page = response.json::<ListConnectionsResponse>().await?;
            for person in page.connections {
                if person.is_deleted() {
                    continue;
                }
                match person.into_record() {
                    Ok(record) => records.push(record),
                    Err(error) => tracing::warn!("Skipping unreadable remote contact: {}", error),
                }
            }
            if page.next_sync_token.is_some() {
                next_cursor = page.next_sync_token;
            }

            match page.next_page_token.filter(|token| !token.is_empty()) {
                Some(next) => page_token = Some(next),
                None => break,
            }
        }

        tracing::debug!(
            count = records.len(),
            incremental = sync_token.is_some(),
            "Listed remote contacts"
        );
        Ok(ChangeSet {
            records,
            next_cursor,
        })
    }

    async fn fetch_etag(&self, token: &OAuthToken, remote_id: &RemoteId) -> GatewayResult<String> {
        let response = self
            .client
            .get(self.endpoint(remote_id.as_str())?)
            .bearer_auth(&token.access_token)
            .query(&[("personFields", "metadata")])
            .send()
            .await;
        let person = ensure_success(response?).await?.json::<Person>().await?;
        person
            .etag
            .ok_or_else(|| GatewayError::InvalidPayload("contact has no etag".to_string()))
    }
}

#[async_trait]
impl RemoteContactGateway for PeopleGateway {
    async fn list_all(&self, token: &OAuthToken) -> GatewayResult<Vec<RemoteRecord>> {
        Ok(self.list_connections(token, None).await?.records)
    }

    async fn fetch_changes(
        &self,
        token: &OAuthToken,
        cursor: Option<&str>,
    ) -> GatewayResult<ChangeSet> {
        self.list_connections(token, cursor.filter(|cursor| !cursor.is_empty()))
            .await
    }

    async fn create(&self, token: &OAuthToken, record: &LocalRecord) -> GatewayResult<RemoteId> {
        if !record.fields.has_payload() {
            return Err(GatewayError::EmptyPayload);
        }

        let response = self
            .client
            .post(self.endpoint("people:createContact")?)
            .bearer_auth(&token.access_token)
            .query(&[("personFields", PERSON_FIELDS)])
            .json(&Person::from_fields(&record.fields))
            .send()
            .await?;
        let created = ensure_success(response).await?.json::<Person>().await?;
        let remote_id = created
            .resource_name
            .filter(|name| name.starts_with(RESOURCE_PREFIX))
            .map(RemoteId::new)
            .ok_or_else(|| GatewayError::InvalidPayload("created contact has no resource name".to_string()))?;

        tracing::info!(remote_id = %remote_id, "Created remote contact");
        Ok(remote_id)
    }

    async fn update(
        &self,
        token: &OAuthToken,
        remote_id: &RemoteId,
        record: &LocalRecord,
    ) -> GatewayResult<()> {
        if !record.fields.has_payload() {
            return Err(GatewayError::EmptyPayload);
        }
        validate_resource_name(remote_id)?;

        let mut person = Person::from_fields(&record.fields);
        person.etag = Some(self.fetch_etag(token, remote_id).await?);

        let response = self
            .client
            .patch(self.endpoint(&format!("{}:updateContact", remote_id.as_str()))?)
            .bearer_auth(&token.access_token)
            .query(&[
                ("updatePersonFields", PERSON_FIELDS),
                ("personFields", PERSON_FIELDS),
            ])
            .json(&person)
            .send()
            .await?;
        ensure_success(response).await?;

        tracing::info!(remote_id = %remote_id, "Updated remote contact");
        Ok(())
    }

    async fn delete(&self, token: &OAuthToken, remote_id: &RemoteId) -> GatewayResult<()> {
        validate_resource_name(remote_id)?;

        let response = self
            .client
            .delete(self.endpoint(&format!("{}:deleteContact", remote_id.as_str()))?)
            .bearer_auth(&token.access_token)
            .send()
            .await?;
        ensure_success(response).await?;

        tracing::info!(remote_id = %remote_id, "Deleted remote contact");
        Ok(())
    }
}

fn parse_base_url(raw: &str) -> GatewayResult<Url> {
    let trimmed = raw.trim();
    let normalized = if trimmed.ends_with('/') {
        trimmed.to_string()
    } else {
        format!("{trimmed}/")
    };
    Url::parse(&normalized)
        .map_err(|error| GatewayError::InvalidConfiguration(format!("invalid People API URL: {error}")))
}

/// Resource names are `people/<id>` with no further path segments
fn validate_resource_name(remote_id: &RemoteId) -> GatewayResult<()> {
    let valid = remote_id
        .as_str()
        .strip_prefix(RESOURCE_PREFIX)
        .is_some_and(|id| {
            !id.is_empty() && id.chars().all(|ch| ch.is_ascii_alphanumeric() || ch == '_' || ch == '-')
        });
    if valid {
        Ok(())
    } else {
        Err(GatewayError::InvalidPayload(format!(
            "invalid contact resource name: {remote_id}"
        )))
    }
}

/// The People API reports stale sync tokens as 410, or 400 with `EXPIRED_SYNC_TOKEN`
fn is_expired_sync_token(status: StatusCode, body: &str) -> bool {
    status == StatusCode::GONE
        || (status == StatusCode::BAD_REQUEST
            && (body.contains("EXPIRED_SYNC_TOKEN") || body.to_ascii_lowercase().contains("sync token")))
}

fn status_error(status: StatusCode, body: &str) -> GatewayError {
    let message = parse_api_error(status, body);
    if status == StatusCode::NOT_FOUND {
        GatewayError::NotFound(message)
    } else {
        GatewayError::Api(message)
    }
}

async fn ensure_success(response: Response) -> GatewayResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(status_error(status, &body))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListConnectionsResponse {
    #[serde(default)]
    connections: Vec<Person>,
    next_page_token: Option<String>,
    next_sync_token: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Person {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    resource_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    etag: Option<String>,
    #[serde(default, skip_serializing)]
    metadata: Option<PersonMetadata>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    names: Vec<PersonName>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    email_addresses: Vec<TypedValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    phone_numbers: Vec<TypedValue>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    addresses: Vec<PersonAddress>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    birthdays: Vec<Birthday>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    biographies: Vec<Biography>,
}

#[derive(Debug, Default, Deserialize)]
struct PersonMetadata {
    #[serde(default)]
    deleted: bool,
}

#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersonName {
    #[serde(default, skip_serializing)]
    display_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    given_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    family_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    unstructured_name: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct TypedValue {
    #[serde(default)]
    value: String,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PersonAddress {
    #[serde(default)]
    formatted_value: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    kind: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
struct Birthday {
    #[serde(default)]
    date: Option<ApiDate>,
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
struct ApiDate {
    #[serde(default)]
    year: i32,
    #[serde(default)]
    month: u32,
    #[serde(default)]
    day: u32,
}

#[derive(Debug, Serialize, Deserialize)]
struct Biography {
    #[serde(default)]
    value: String,
}

impl Person {
    fn is_deleted(&self) -> bool {
        self.metadata.as_ref().is_some_and(|metadata| metadata.deleted)
    }

    fn from_fields(fields: &ContactFields) -> Self {
        let present = |value: Option<&str>| {
            value
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(ToString::to_string)
        };
        let typed = |value: String, kind: &str| TypedValue {
            value,
            kind: Some(kind.to_string()),
        };

        let mut phone_numbers = Vec::new();
        if let Some(phone) = present(Some(&fields.phone)) {
            phone_numbers.push(typed(phone, PHONE_KIND));
        }
        if let Some(secondary) = present(fields.secondary_phone.as_deref()) {
            phone_numbers.push(typed(secondary, SECONDARY_PHONE_KIND));
        }

        Self {
            names: present(Some(&fields.name))
                .map(|name| PersonName {
                    unstructured_name: Some(name),
                    ..PersonName::default()
                })
                .into_iter()
                .collect(),
            email_addresses: present(fields.email.as_deref())
                .map(|email| typed(email, EMAIL_KIND))
                .into_iter()
                .collect(),
            phone_numbers,
            addresses: present(fields.address.as_deref())
                .map(|address| PersonAddress {
                    formatted_value: Some(address),
                    kind: Some(ADDRESS_KIND.to_string()),
                })
                .into_iter()
                .collect(),
            birthdays: fields
                .date_of_birth
                .map(|date| Birthday {
                    date: Some(ApiDate::from(date)),
                })
                .into_iter()
                .collect(),
            biographies: present(fields.notes.as_deref())
                .map(|value| Biography { value })
                .into_iter()
                .collect(),
            ..Self::default()
        }
    }

    fn into_record(self) -> GatewayResult<RemoteRecord> {
        let resource_name = self
            .resource_name
            .filter(|name| !name.is_empty())
            .ok_or_else(|| GatewayError::InvalidPayload("contact has no resource name".to_string()))?;

        let mut record = RemoteRecord::new(resource_name);
        record.etag = self.etag;
        record.names = self
            .names
            .into_iter()
            .map(|name| RemoteName {
                display_name: name.display_name.or(name.unstructured_name),
                given_name: name.given_name,
                family_name: name.family_name,
            })
            .collect();
        record.emails = self.email_addresses.into_iter().map(TypedValue::into_value).collect();
        record.phones = self.phone_numbers.into_iter().map(TypedValue::into_value).collect();
        record.addresses = self
            .addresses
            .into_iter()
            .filter_map(|address| {
                let value = address.formatted_value?;
                Some(RemoteValue {
                    value,
                    kind: address.kind,
                })
            })
            .collect();
        record.birthdays = self
            .birthdays
            .into_iter()
            .filter_map(|birthday| birthday.date.map(PartialDate::from))
            .collect();
        record.notes = self.biographies.into_iter().map(|bio| bio.value).collect();
        Ok(record)
    }
}

impl TypedValue {
    fn into_value(self) -> RemoteValue {
        RemoteValue {
            value: self.value,
            kind: self.kind,
        }
    }
}

impl From<NaiveDate> for ApiDate {
    fn from(date: NaiveDate) -> Self {
        let date = PartialDate::from(date);
        Self {
            year: date.year,
            month: date.month,
            day: date.day,
        }
    }
}

impl From<ApiDate> for PartialDate {
    fn from(date: ApiDate) -> Self {
        Self {
            year: date.year,
            month: date.month,
            day: date.day,
        }
    }
}
