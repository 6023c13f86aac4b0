// Document model - open JSON field map plus typed system fields

use crate::error::{NodbError, Result};
use chrono::{DateTime, SecondsFormat, SubsecRound, Timelike, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;

pub const ID_FIELD: &str = "_id";
pub const CREATED_DATE_FIELD: &str = "created_date";
pub const MODIFIED_DATE_FIELD: &str = "modified_date";
pub const DELETED_FIELD: &str = "__deleted";

/// A stored record. System fields are kept out of `fields` so they cannot
/// be confused with caller data; on disk they sit next to it in one object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Document {
    #[serde(rename = "_id")]
    pub id: String,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "timestamp"
    )]
    pub created_date: Option<DateTime<Utc>>,
    #[serde(
        default,
        skip_serializing_if = "Option::is_none",
        with = "timestamp"
    )]
    pub modified_date: Option<DateTime<Utc>>,
    /// Tombstone. Any stored value, `false` included, hides the document
    /// from default views; only an absent field counts as live.
    #[serde(rename = "__deleted", default, skip_serializing_if = "Option::is_none")]
    pub deleted: Option<bool>,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// A validated write to one of the reserved fields.
enum SystemWrite {
    CreatedDate(Option<DateTime<Utc>>),
    ModifiedDate(Option<DateTime<Utc>>),
    Deleted(Option<bool>),
}

impl Document {
    /// Build a fresh document from caller data. Any `_id` in the input is
    /// discarded; the store assigns `id`.
    pub(crate) fn from_input(id: String, data: Value) -> Result<Self> {
        let map = match data {
            Value::Object(map) => map,
            other => {
                return Err(NodbError::InvalidDocument(format!(
                    "expected a JSON object, got {}",
                    type_name(&other)
                )))
            }
        };

        let mut doc = Document {
            id,
            created_date: None,
            modified_date: None,
            deleted: None,
            fields: Map::new(),
        };
        for (key, value) in map {
            if key == ID_FIELD {
                log::debug!("Ignoring caller-supplied _id {value} on insert");
                continue;
            }
            doc.apply(key, value)?;
        }
        Ok(doc)
    }

    /// Look up a field by name, including the system fields.
    pub fn get(&self, field: &str) -> Option<Cow<'_, Value>> {
        match field {
            ID_FIELD => Some(Cow::Owned(Value::String(self.id.clone()))),
            CREATED_DATE_FIELD => self
                .created_date
                .map(|ts| Cow::Owned(Value::String(format_timestamp(&ts)))),
            MODIFIED_DATE_FIELD => self
                .modified_date
                .map(|ts| Cow::Owned(Value::String(format_timestamp(&ts)))),
            DELETED_FIELD => self.deleted.map(|flag| Cow::Owned(Value::Bool(flag))),
            _ => self.fields.get(field).map(Cow::Borrowed),
        }
    }

    /// Merge `updates` into this document: new keys are added, existing
    /// keys overwritten. Reserved keys are validated before anything is
    /// changed.
    pub fn merge(&mut self, updates: &Map<String, Value>) -> Result<()> {
        validate_updates(updates)?;
        for (key, value) in updates {
            self.apply(key.clone(), value.clone())?;
        }
        Ok(())
    }

    /// Stamp both audit dates with the same instant, cut to milliseconds.
    pub(crate) fn stamp(&mut self, now: DateTime<Utc>) {
        let now = now.trunc_subsecs(3);
        self.created_date = Some(now);
        self.modified_date = Some(now);
    }

    pub fn to_value(&self) -> Result<Value> {
        Ok(serde_json::to_value(self)?)
    }

    fn apply(&mut self, key: String, value: Value) -> Result<()> {
        match system_write(&key, &value)? {
            Some(SystemWrite::CreatedDate(ts)) => self.created_date = ts,
            Some(SystemWrite::ModifiedDate(ts)) => self.modified_date = ts,
            Some(SystemWrite::Deleted(flag)) => self.deleted = flag,
            None => {
                self.fields.insert(key, value);
            }
        }
        Ok(())
    }
}

/// Check that an update map only writes reserved fields in allowed ways.
pub fn validate_updates(updates: &Map<String, Value>) -> Result<()> {
    for (key, value) in updates {
        if key == ID_FIELD {
            return Err(NodbError::ReservedField {
                field: key.clone(),
                reason: "document ids cannot be changed".into(),
            });
        }
        system_write(key, value)?;
    }
    Ok(())
}

fn system_write(key: &str, value: &Value) -> Result<Option<SystemWrite>> {
    let write = match key {
        CREATED_DATE_FIELD => SystemWrite::CreatedDate(parse_date_field(key, value)?),
        MODIFIED_DATE_FIELD => SystemWrite::ModifiedDate(parse_date_field(key, value)?),
        DELETED_FIELD => match value {
            Value::Bool(flag) => SystemWrite::Deleted(Some(*flag)),
            // Writing null clears the tombstone
            Value::Null => SystemWrite::Deleted(None),
            other => {
                return Err(NodbError::ReservedField {
                    field: key.to_string(),
                    reason: format!("expected a boolean, got {}", type_name(other)),
                })
            }
        },
        _ => return Ok(None),
    };
    Ok(Some(write))
}

fn parse_date_field(key: &str, value: &Value) -> Result<Option<DateTime<Utc>>> {
    match value {
        Value::Null => Ok(None),
        Value::String(raw) => parse_timestamp(raw).map(Some).map_err(|e| {
            NodbError::ReservedField {
                field: key.to_string(),
                reason: format!("invalid timestamp '{raw}': {e}"),
            }
        }),
        other => Err(NodbError::ReservedField {
            field: key.to_string(),
            reason: format!("expected a timestamp string, got {}", type_name(other)),
        }),
    }
}

/// ISO-8601 in UTC with millisecond precision, e.g. `2024-05-01T10:00:00.000Z`.
/// Timestamps read with finer precision keep their extra digits.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    let format = if ts.nanosecond() % 1_000_000 == 0 {
        SecondsFormat::Millis
    } else {
        SecondsFormat::AutoSi
    };
    ts.to_rfc3339_opts(format, true)
}

pub fn parse_timestamp(raw: &str) -> std::result::Result<DateTime<Utc>, chrono::ParseError> {
    DateTime::parse_from_rfc3339(raw).map(|ts| ts.with_timezone(&Utc))
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

mod timestamp {
    use chrono::{DateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S>(value: &Option<DateTime<Utc>>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        match value {
            Some(ts) => serializer.serialize_str(&super::format_timestamp(ts)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<DateTime<Utc>>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let raw: Option<String> = Option::deserialize(deserializer)?;
        raw.map(|s| super::parse_timestamp(&s).map_err(serde::de::Error::custom))
            .transpose()
    }
}
