//! Remote objects and acknowledgements.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A flat field map, used both for remote object bodies and local table rows.
pub type Record = serde_json::Map<String, Value>;

/// Name of the server-maintained modification time field.
///
/// Queries filter and sort on this field.
pub const MODIFIED_FIELD: &str = "_modified";

/// Name of the server-assigned object id field.
pub const ID_FIELD: &str = "_id";

/// An object stored in a remote collection.
///
/// `id` and `modified_at` are assigned by the remote store. An outgoing object
/// without an `id` is created; one carrying an `id` is updated.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteObject {
    /// Server-assigned id, absent until the object has been created remotely.
    #[serde(rename = "_id", default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Server modification time in milliseconds.
    #[serde(rename = "_modified", default, skip_serializing_if = "Option::is_none")]
    pub modified_at: Option<i64>,
    /// Application fields.
    #[serde(flatten)]
    pub fields: Record,
}

impl RemoteObject {
    /// Creates an object that has not been stored remotely yet.
    pub fn new(fields: Record) -> Self {
        Self {
            id: None,
            modified_at: None,
            fields,
        }
    }

    /// Sets the remote id.
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    /// Sets the remote modification time.
    #[must_use]
    pub fn with_modified_at(mut self, modified_at: i64) -> Self {
        self.modified_at = Some(modified_at);
        self
    }

    /// Sets a single application field.
    #[must_use]
    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }

    /// Returns true if the object already exists remotely.
    pub fn is_persisted(&self) -> bool {
        self.id.is_some()
    }

    /// Returns a field by name, including the `_id` and `_modified` fields.
    pub fn get(&self, name: &str) -> Option<Value> {
        match name {
            ID_FIELD => self.id.clone().map(Value::String),
            MODIFIED_FIELD => self.modified_at.map(Value::from),
            _ => self.fields.get(name).cloned(),
        }
    }
}

/// What a remote store reports after a successful create or update.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteAck {
    /// The object's id (newly assigned on create, unchanged on update).
    pub id: String,
    /// The server modification time assigned to this write.
    pub modified_at: i64,
}

impl RemoteAck {
    /// Creates a new acknowledgement.
    pub fn new(id: impl Into<String>, modified_at: i64) -> Self {
        Self {
            id: id.into(),
            modified_at,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn new_object_is_not_persisted() {
        let obj = RemoteObject::new(Record::new()).with_field("title", "milk");
        assert!(!obj.is_persisted());
        assert_eq!(obj.get("title"), Some(json!("milk")));
        assert_eq!(obj.get(MODIFIED_FIELD), None);
    }

    #[test]
    fn reserved_fields_are_readable() {
        let obj = RemoteObject::default().with_id("abc").with_modified_at(42);
        assert!(obj.is_persisted());
        assert_eq!(obj.get(ID_FIELD), Some(json!("abc")));
        assert_eq!(obj.get(MODIFIED_FIELD), Some(json!(42)));
    }

    #[test]
    fn json_shape_flattens_fields() {
        let obj = RemoteObject::default()
            .with_id("o1")
            .with_modified_at(10)
            .with_field("title", "eggs");

        let value = serde_json::to_value(&obj).unwrap();
        assert_eq!(value, json!({"_id": "o1", "_modified": 10, "title": "eggs"}));

        let back: RemoteObject = serde_json::from_value(value).unwrap();
        assert_eq!(back, obj);
    }

    #[test]
    fn unsaved_object_omits_reserved_fields() {
        let obj = RemoteObject::default().with_field("n", 1);
        let value = serde_json::to_value(&obj).unwrap();
        assert_eq!(value, json!({"n": 1}));
    }
}
