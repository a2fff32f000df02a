//! Contact record models for both sides of the mirror

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use super::{LocalId, OwnerId, RemoteId};

/// Name given to a record imported from a contact with no name entry
pub const UNKNOWN_NAME: &str = "Unknown";

/// Phone kind the remote side uses for the secondary (messaging) number
pub(crate) const SECONDARY_PHONE_KIND: &str = "other";

/// The user-visible attributes of a contact, shared by both sides
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContactFields {
    pub name: String,
    pub phone: String,
    #[serde(default)]
    pub email: Option<String>,
    /// Secondary phone, typically a messaging number
    #[serde(default)]
    pub secondary_phone: Option<String>,
    #[serde(default)]
    pub date_of_birth: Option<NaiveDate>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl ContactFields {
    /// Whether any of the identifying attributes is populated.
    ///
    /// Name, phone, email, address and notes count; a record with only a
    /// birthday or secondary phone is treated as empty.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        let filled = |value: &str| !value.trim().is_empty();
        filled(&self.name)
            || filled(&self.phone)
            || self.email.as_deref().is_some_and(filled)
            || self.address.as_deref().is_some_and(filled)
            || self.notes.as_deref().is_some_and(filled)
    }

    /// The subset of fields compared during reconciliation.
    ///
    /// A blank name projects to [`UNKNOWN_NAME`], which is how the remote
    /// side reads back a contact pushed without a name.
    #[must_use]
    pub fn projection(&self) -> Projection {
        let name = self.name.trim();
        Projection {
            name: if name.is_empty() { UNKNOWN_NAME } else { name }.to_string(),
            phone: self.phone.trim().to_string(),
        }
    }
}

/// Canonical comparison projection: name and primary phone
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Projection {
    pub name: String,
    pub phone: String,
}

/// A client record owned by the local registry
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalRecord {
    pub id: LocalId,
    pub owner_id: OwnerId,
    #[serde(flatten)]
    pub fields: ContactFields,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl LocalRecord {
    #[must_use]
    pub fn projection(&self) -> Projection {
        self.fields.projection()
    }
}

/// A single name entry on a remote contact
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteName {
    pub display_name: Option<String>,
    pub given_name: Option<String>,
    pub family_name: Option<String>,
}

/// A typed value entry (email, phone, address) on a remote contact
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteValue {
    pub value: String,
    #[serde(default)]
    pub kind: Option<String>,
}

impl RemoteValue {
    pub fn new(value: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            kind: None,
        }
    }

    #[must_use]
    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }
    fn is_secondary(&self) -> bool {
        self.kind.as_deref() == Some(SECONDARY_PHONE_KIND)
    }
}

/// A date that may lack a year (recurring birthdays without a year)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartialDate {
    #[serde(default)]
    pub year: i32,
    #[serde(default)]
    pub month: u32,
    #[serde(default)]
    pub day: u32,
}

impl PartialDate {
    /// Full calendar date, or `None` when the year is missing or the date is invalid
    #[must_use]
    pub fn to_naive_date(self) -> Option<NaiveDate> {
        if self.year <= 0 {
            return None;
        }
        NaiveDate::from_ymd_opt(self.year, self.month, self.day)
    }
}

impl From<NaiveDate> for PartialDate {
    fn from(date: NaiveDate) -> Self {
        use chrono::Datelike;
        Self {
            year: date.year(),
            month: date.month(),
            day: date.day(),
        }
    }
}

/// A contact as held by the remote contacts provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteRecord {
    pub id: RemoteId,
    #[serde(default)]
    pub names: Vec<RemoteName>,
    #[serde(default)]
    pub emails: Vec<RemoteValue>,
    #[serde(default)]
    pub phones: Vec<RemoteValue>,
    #[serde(default)]
    pub addresses: Vec<RemoteValue>,
    #[serde(default)]
    pub birthdays: Vec<PartialDate>,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub etag: Option<String>,
}

impl RemoteRecord {
    /// An empty record with only its identifier set
    pub fn new(id: impl Into<RemoteId>) -> Self {
        Self {
            id: id.into(),
            names: Vec::new(),
            emails: Vec::new(),
            phones: Vec::new(),
            addresses: Vec::new(),
            birthdays: Vec::new(),
            notes: Vec::new(),
            etag: None,
        }
    }

    /// Name taken from the first name entry, or [`UNKNOWN_NAME`]
    #[must_use]
    pub fn canonical_name(&self) -> String {
        let Some(first) = self.names.first() else {
            return UNKNOWN_NAME.to_string();
        };

        if let Some(display) = first.display_name.as_deref().map(str::trim) {
            if !display.is_empty() {
                return display.to_string();
            }
        }

        let joined = [first.given_name.as_deref(), first.family_name.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");
        if joined.is_empty() {
            UNKNOWN_NAME.to_string()
        } else {
            joined
        }
    }

    /// First phone that is not the secondary (messaging) number
    #[must_use]
    pub fn primary_phone(&self) -> String {
        self.phones
            .iter()
            .find(|phone| !phone.is_secondary())
            .map(|phone| phone.value.trim().to_string())
            .unwrap_or_default()
    }

    /// Map the canonical (first) entry of every field to local attributes
    #[must_use]
    pub fn to_fields(&self) -> ContactFields {
        let first_value = |values: &[RemoteValue]| {
            values
                .first()
                .map(|entry| entry.value.trim().to_string())
                .filter(|value| !value.is_empty())
        };

        let secondary_phone = self
            .phones
            .iter()
            .find(|phone| phone.is_secondary())
            .map(|phone| phone.value.trim().to_string())
            .filter(|value| !value.is_empty());

        ContactFields {
            name: self.canonical_name(),
            phone: self.primary_phone(),
            email: first_value(&self.emails),
            secondary_phone,
            date_of_birth: self.birthdays.first().and_then(|date| date.to_naive_date()),
            address: first_value(&self.addresses),
            notes: self
                .notes
                .first()
                .map(|note| note.trim().to_string())
                .filter(|note| !note.is_empty()),
        }
    }

    #[must_use]
    pub fn projection(&self) -> Projection {
        Projection {
            name: self.canonical_name(),
            phone: self.primary_phone(),
        }
    }
}
