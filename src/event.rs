//! Canonical event model.
//!
//! Every inbound payload, whatever its envelope, is normalised into one
//! [`Event`] before any rule sees it. The event is immutable once built and is
//! shared read-only between the matcher, the property resolver and every
//! action spawned for the request.
//!
//! # Canonical map
//!
//! Filter expressions, `payloadValue` paths and templates all see the event
//! through the same three-key namespace:
//!
//! ```json
//! {
//!   "data": { "test": 123 },
//!   "attributes": { "a": "b" },
//!   "id": "1"
//! }
//! ```

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// A normalised inbound event.
///
/// - `data`: arbitrary JSON object, key order preserved from the payload
/// - `attributes`: string-to-string metadata (pub/sub attributes, generic
///   `attributes` key)
/// - `id`: message identifier, empty when the source has none
///
/// The canonical map is built on first use and kept, so the event should not
/// be mutated once it has been handed to a dispatch.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Event {
    /// Event payload
    #[serde(default)]
    pub data: Map<String, Value>,

    /// String attributes attached to the event
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,

    /// Message identifier
    #[serde(default)]
    pub id: String,

    #[serde(skip)]
    canonical: OnceLock<Value>,
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data && self.attributes == other.attributes && self.id == other.id
    }
}

impl Event {
    /// Create an event with the given data and no attributes or id
    pub fn new(data: Map<String, Value>) -> Self {
        Self::from_parts(data, BTreeMap::new(), String::new())
    }

    /// Create an event from all of its fields
    pub fn from_parts(
        data: Map<String, Value>,
        attributes: BTreeMap<String, String>,
        id: impl Into<String>,
    ) -> Self {
        Self {
            data,
            attributes,
            id: id.into(),
            canonical: OnceLock::new(),
        }
    }

    /// Build an event from a JSON value, wrapping non-objects under `items`.
    ///
    /// Convenient for tests and embedding; listeners do their own shaping.
    pub fn from_value(data: Value) -> Self {
        match data {
            Value::Object(map) => Self::new(map),
            other => {
                let mut map = Map::new();
                map.insert("items".to_string(), other);
                Self::new(map)
            }
        }
    }

    /// Set the attributes
    pub fn with_attributes<K, V, I>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.attributes = attributes
            .into_iter()
            .map(|(k, v)| (k.into(), v.into()))
            .collect();
        self.canonical = OnceLock::new();
        self
    }

    /// Set the id
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = id.into();
        self.canonical = OnceLock::new();
        self
    }

    /// The canonical `{data, attributes, id}` map used as the variable
    /// namespace for expressions and templates. Built once per event.
    pub fn canonical(&self) -> &Value {
        self.canonical.get_or_init(|| self.build_canonical())
    }

    /// Owned copy of [`canonical`](Self::canonical)
    pub fn as_value(&self) -> Value {
        self.canonical().clone()
    }

    fn build_canonical(&self) -> Value {
        let attributes: Map<String, Value> = self
            .attributes
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();

        let mut root = Map::with_capacity(3);
        root.insert("data".to_string(), Value::Object(self.data.clone()));
        root.insert("attributes".to_string(), Value::Object(attributes));
        root.insert("id".to_string(), Value::String(self.id.clone()));
        Value::Object(root)
    }
}

/// Render a scalar JSON value the way it should appear inside a string.
///
/// Strings come back without quotes, `null` becomes empty, and compound
/// values are rendered as compact JSON.
pub(crate) fn value_to_string(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        Value::Bool(b) => b.to_string(),
        Value::Number(n) => n.to_string(),
        other => other.to_string(),
    }
}

/// Human-readable name of a JSON value's runtime type, used in errors.
pub(crate) fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "double",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "list",
        Value::Object(_) => "map",
    }
}
