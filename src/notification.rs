//! Notification records and the local notification store.
//!
//! The server omits empty fields from downloaded messages. [`Notification`]
//! reconciles whatever arrives against the full key set documented for the
//! download endpoint, so every key can be read uniformly (`null` when unset).
//! Keys outside that set, and values of unexpected types, are kept verbatim.

use std::collections::BTreeMap;

use anyhow::Result;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};

static NULL: Value = Value::Null;

/// One downloaded message.
///
/// Backed by the raw JSON object the server sent, so a field of an
/// unexpected type never makes a record unreadable. Typed accessors cover
/// the keys the client acts on.
#[derive(Debug, Clone, PartialEq)]
pub struct Notification {
    fields: Map<String, Value>,
}

impl Default for Notification {
    fn default() -> Self {
        Self::from_map(Map::new())
    }
}

impl Serialize for Notification {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.fields.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Notification {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Map::<String, Value>::deserialize(deserializer).map(Self::from_map)
    }
}

impl Notification {
    /// The fixed key set every normalized record exposes.
    pub const KEYS: [&'static str; 20] = [
        "id",
        "id_str",
        "umid",
        "umid_str",
        "title",
        "message",
        "app",
        "aid",
        "aid_str",
        "icon",
        "date",
        "queued_date",
        "dispatched_date",
        "priority",
        "sound",
        "url",
        "url_title",
        "acked",
        "receipt",
        "html",
    ];

    /// Record from a JSON object, with every key of [`Self::KEYS`] present.
    #[must_use]
    pub fn from_map(mut fields: Map<String, Value>) -> Self {
        for key in Self::KEYS {
            fields.entry(key).or_insert(Value::Null);
        }
        Self { fields }
    }

    /// Normalize a raw server record. Only non-objects are rejected.
    pub fn from_value(value: Value) -> Result<Self> {
        match value {
            Value::Object(fields) => Ok(Self::from_map(fields)),
            other => anyhow::bail!("Notification record is not a JSON object: {other}"),
        }
    }

    /// Full record as a JSON object.
    #[must_use]
    pub fn to_value(&self) -> Value {
        Value::Object(self.fields.clone())
    }

    /// Uniform lookup: `Value::Null` for unset or unknown keys.
    #[must_use]
    pub fn field(&self, key: &str) -> &Value {
        self.fields.get(key).unwrap_or(&NULL)
    }

    /// Message id; numeric strings are accepted.
    #[must_use]
    pub fn id(&self) -> Option<i64> {
        match self.field("id") {
            Value::Number(n) => n.as_i64(),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Message body, when it is a string.
    #[must_use]
    pub fn message(&self) -> Option<&str> {
        self.field("message").as_str()
    }

    /// Message text split on whitespace.
    #[must_use]
    pub fn words(&self) -> Vec<String> {
        self.message()
            .unwrap_or_default()
            .split_whitespace()
            .map(str::to_string)
            .collect()
    }

    /// First word of the message, if any.
    #[must_use]
    pub fn command_word(&self) -> Option<&str> {
        self.message()?.split_whitespace().next()
    }
}

/// Downloaded messages keyed by id.
///
/// Merging overwrites earlier copies of the same id. Acknowledged ids are
/// dropped together via [`NotificationStore::remove_through`].
#[derive(Debug, Clone, Default)]
pub struct NotificationStore {
    messages: BTreeMap<i64, Notification>,
}

impl NotificationStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace a message. Records without an id are not stored.
    pub fn merge(&mut self, notification: Notification) -> bool {
        let Some(id) = notification.id() else {
            log::warn!("[store] Ignoring notification without id");
            return false;
        };
        self.messages.insert(id, notification);
        true
    }

    /// Highest id currently stored.
    #[must_use]
    pub fn highest_id(&self) -> Option<i64> {
        self.messages.keys().next_back().copied()
    }

    /// Drop every message with `id <= last_id`, returning how many were removed.
    pub fn remove_through(&mut self, last_id: i64) -> usize {
        let before = self.messages.len();
        self.messages.retain(|&id, _| id > last_id);
        before - self.messages.len()
    }

    /// Ids in ascending order.
    pub fn ids(&self) -> impl Iterator<Item = i64> + '_ {
        self.messages.keys().copied()
    }

    /// Number of stored messages.
    #[must_use]
    pub fn len(&self) -> usize {
        self.messages.len()
    }

    /// Returns `true` if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn with_id(id: i64) -> Notification {
        Notification::from_value(json!({ "id": id })).unwrap()
    }

    #[test]
    fn test_sparse_record_exposes_every_key() {
        let notification = Notification::from_value(json!({ "id": 1, "message": "hi" })).unwrap();
        let value = notification.to_value();
        let object = value.as_object().unwrap();

        for key in Notification::KEYS {
            assert!(object.contains_key(key), "missing key {key}");
        }
        assert_eq!(value["title"], Value::Null);
        assert_eq!(value["message"], json!("hi"));
    }

    #[test]
    fn test_unknown_keys_pass_through() {
        let notification =
            Notification::from_value(json!({ "id": 9, "future_field": "x" })).unwrap();
        assert_eq!(notification.field("future_field"), &json!("x"));
        assert_eq!(notification.field("nonexistent"), &Value::Null);
        assert_eq!(notification.to_value()["future_field"], json!("x"));
    }

    #[test]
    fn test_mistyped_fields_are_kept_verbatim() {
        let notification = Notification::from_value(json!({
            "id": "12",
            "message": "hello",
            "html": true,
            "priority": "2",
            "aid": "app-1"
        }))
        .unwrap();

        assert_eq!(notification.id(), Some(12));
        assert_eq!(notification.message(), Some("hello"));
        assert_eq!(notification.field("html"), &json!(true));
        assert_eq!(notification.field("priority"), &json!("2"));
    }

    #[test]
    fn test_non_object_record_is_rejected() {
        assert!(Notification::from_value(json!([1, 2])).is_err());
        assert!(Notification::from_value(json!("ping")).is_err());
    }

    #[test]
    fn test_deserialize_fills_fixed_keys() {
        let notification: Notification = serde_json::from_str(r#"{ "id": 4 }"#).unwrap();
        assert_eq!(notification.id(), Some(4));
        assert_eq!(notification.field("url_title"), &Value::Null);
        assert!(notification.fields.contains_key("url_title"));
    }

    #[test]
    fn test_command_word_and_words() {
        let notification =
            Notification::from_value(json!({ "message": "  ping   arg1 arg2 " })).unwrap();
        assert_eq!(notification.command_word(), Some("ping"));
        assert_eq!(notification.words(), vec!["ping", "arg1", "arg2"]);

        let empty = Notification::default();
        assert_eq!(empty.command_word(), None);
        assert!(empty.words().is_empty());

        let numeric = Notification::from_value(json!({ "message": 42 })).unwrap();
        assert_eq!(numeric.command_word(), None);
    }

    #[test]
    fn test_highest_id_empty_store() {
        assert_eq!(NotificationStore::new().highest_id(), None);
    }

    #[test]
    fn test_highest_id_is_max_key() {
        let mut store = NotificationStore::new();
        for id in [3, 7, 5] {
            store.merge(with_id(id));
        }
        assert_eq!(store.highest_id(), Some(7));
    }

    #[test]
    fn test_merge_overwrites_same_id() {
        let mut store = NotificationStore::new();
        store.merge(Notification::from_value(json!({ "id": 1, "title": "old" })).unwrap());
        store.merge(Notification::from_value(json!({ "id": 1, "title": "new" })).unwrap());
        assert_eq!(store.len(), 1);
        assert_eq!(store.messages[&1].field("title"), &json!("new"));
    }

    #[test]
    fn test_merge_rejects_missing_id() {
        let mut store = NotificationStore::new();
        assert!(!store.merge(Notification::default()));
        assert!(!store.merge(Notification::from_value(json!({ "id": true })).unwrap()));
        assert!(store.is_empty());
    }

    #[test]
    fn test_remove_through_keeps_higher_ids() {
        let mut store = NotificationStore::new();
        for id in [1, 2, 3, 4, 5] {
            store.merge(with_id(id));
        }
        assert_eq!(store.remove_through(3), 3);
        assert_eq!(store.ids().collect::<Vec<_>>(), vec![4, 5]);
    }
}
