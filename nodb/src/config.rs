use crate::error::{NodbError, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

pub const DATE_AUDIT_KEY: &str = "dateAudit";

/// Keys the descriptor and the collection file already use. Config values
/// are flattened next to them, so none of these may appear in `extra`.
pub const RESERVED_KEYS: [&str; 4] = ["name", "version", "data", DATE_AUDIT_KEY];

/// Per-collection configuration, fixed when the collection is first created.
/// Keys other than `dateAudit` are kept verbatim.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectionConfig {
    /// Stamp `created_date` and `modified_date` on insert.
    #[serde(rename = "dateAudit", default, skip_serializing_if = "is_false")]
    pub date_audit: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl CollectionConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn date_audit(mut self, enabled: bool) -> Self {
        self.date_audit = enabled;
        self
    }

    /// Attach an arbitrary configuration value. A boolean `dateAudit` sets
    /// [`date_audit`](Self::date_audit); reserved keys are caught by
    /// [`validate`](Self::validate).
    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        let key = key.into();
        let value = value.into();
        match value.as_bool() {
            Some(flag) if key == DATE_AUDIT_KEY => self.date_audit = flag,
            _ => {
                self.extra.insert(key, value);
            }
        }
        self
    }

    /// Reject extra keys that would collide with the file layout.
    pub fn validate(&self) -> Result<()> {
        match self
            .extra
            .keys()
            .find(|key| RESERVED_KEYS.contains(&key.as_str()))
        {
            Some(key) => Err(NodbError::ReservedField {
                field: key.clone(),
                reason: "reserved by the collection file layout".into(),
            }),
            None => Ok(()),
        }
    }
}

/// Entry in `nodb.json` describing one collection: its name plus config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionDescriptor {
    pub name: String,
    #[serde(flatten)]
    pub config: CollectionConfig,
}

impl CollectionDescriptor {
    pub fn new(name: impl Into<String>, config: CollectionConfig) -> Self {
        CollectionDescriptor {
            name: name.into(),
            config,
        }
    }
}

fn is_false(flag: &bool) -> bool {
    !*flag
}
