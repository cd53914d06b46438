//! Property resolution.
//!
//! A rule property is described by a [`PropertyDescriptor`] naming one or more
//! sources. [`PropertyResolver::resolve`] evaluates exactly one of them, in
//! this order:
//!
//! 1. `valueFrom.secretKeyRef` (optionally a dotted `path` into a JSON or
//!    YAML secret)
//! 2. `payloadValue.propertyPaths` (first path that evaluates wins)
//! 3. `fromFile`
//! 4. `fromEnv`
//! 5. `value`
//!
//! The result is a [`PropertyValue`] whose accessors coerce it to the shape a
//! caller needs. An absent value coerces to the empty string, list or map.

use crate::config::{PropertyDescriptor, Rule, SecretRef};
use crate::event::{type_name, value_to_string, Event};
use crate::expr::Expression;
use crate::secrets::{SecretError, SecretStore};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Errors that can occur while resolving a property.
#[derive(Debug, Error)]
pub enum PropertyError {
    #[error("error getting secret {project}/{name}/{version}: {source}")]
    Secret {
        project: String,
        name: String,
        version: String,
        #[source]
        source: SecretError,
    },

    #[error("failed to decode the secret {name} as JSON or YAML, which is required when a path is set: {message}")]
    SecretDecode { name: String, message: String },

    #[error("failed to find the path '{path}' in the secret {name}")]
    SecretPath { name: String, path: String },

    #[error("error getting property value from the following paths '{paths}'. Errors: {errors}")]
    PayloadPaths { paths: String, errors: String },

    #[error("error reading file '{path}': {source}")]
    File {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("expected the value to be a {expected}, however it is of type {found}")]
    TypeMismatch {
        expected: &'static str,
        found: &'static str,
    },

    #[error("property '{name}': {source}")]
    Named {
        name: String,
        #[source]
        source: Box<PropertyError>,
    },
}

impl PropertyError {
    fn named(self, name: &str) -> Self {
        PropertyError::Named {
            name: name.to_string(),
            source: Box::new(self),
        }
    }
}

/// A resolved property value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PropertyValue(Option<Value>);

impl PropertyValue {
    /// No value
    pub fn empty() -> Self {
        Self(None)
    }

    pub fn new(value: Value) -> Self {
        Self(Some(value))
    }

    /// The raw value, if any
    pub fn raw(&self) -> Option<&Value> {
        self.0.as_ref()
    }

    /// True when absent, null or an empty string/list/map
    pub fn is_empty(&self) -> bool {
        match &self.0 {
            None | Some(Value::Null) => true,
            Some(Value::String(s)) => s.is_empty(),
            Some(Value::Array(items)) => items.is_empty(),
            Some(Value::Object(map)) => map.is_empty(),
            Some(_) => false,
        }
    }

    /// Coerce to a string. Numbers and booleans are formatted.
    pub fn as_string(&self) -> Result<String, PropertyError> {
        match &self.0 {
            None | Some(Value::Null) => Ok(String::new()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(v @ (Value::Number(_) | Value::Bool(_))) => Ok(value_to_string(v)),
            Some(other) => Err(mismatch("string", other)),
        }
    }

    /// Coerce to a list of strings. A single string becomes a one item list.
    pub fn as_string_list(&self) -> Result<Vec<String>, PropertyError> {
        match &self.0 {
            None | Some(Value::Null) => Ok(Vec::new()),
            Some(Value::Array(items)) => items
                .iter()
                .map(|item| match item {
                    Value::Array(_) | Value::Object(_) => Err(mismatch("string list", item)),
                    scalar => Ok(value_to_string(scalar)),
                })
                .collect(),
            Some(Value::String(s)) => Ok(vec![s.clone()]),
            Some(other) => Err(mismatch("string list", other)),
        }
    }

    /// Coerce to a string map; non-string values are formatted.
    pub fn as_string_map(&self) -> Result<BTreeMap<String, String>, PropertyError> {
        match &self.0 {
            None | Some(Value::Null) => Ok(BTreeMap::new()),
            Some(Value::Object(map)) => Ok(map
                .iter()
                .map(|(k, v)| (k.clone(), value_to_string(v)))
                .collect()),
            Some(Value::String(s)) if s.trim_start().starts_with('{') => {
                let map: Map<String, Value> =
                    serde_json::from_str(s).map_err(|_| mismatch("string map", &Value::String(s.clone())))?;
                Ok(map.iter().map(|(k, v)| (k.clone(), value_to_string(v))).collect())
            }
            Some(other) => Err(mismatch("string map", other)),
        }
    }

    /// Coerce to a map of arbitrary JSON values.
    pub fn as_json_map(&self) -> Result<Map<String, Value>, PropertyError> {
        match &self.0 {
            None | Some(Value::Null) => Ok(Map::new()),
            Some(Value::Object(map)) => Ok(map.clone()),
            Some(other) => Err(mismatch("map", other)),
        }
    }
}

fn mismatch(expected: &'static str, found: &Value) -> PropertyError {
    PropertyError::TypeMismatch {
        expected,
        found: type_name(found),
    }
}

/// Resolves property descriptors against an event.
#[derive(Clone)]
pub struct PropertyResolver {
    secrets: Arc<dyn SecretStore>,
}

impl PropertyResolver {
    pub fn new(secrets: Arc<dyn SecretStore>) -> Self {
        Self { secrets }
    }

    /// Resolve one descriptor.
    ///
    /// Only the highest precedence source that is set is consulted.
    pub async fn resolve(
        &self,
        descriptor: &PropertyDescriptor,
        event: &Event,
    ) -> Result<PropertyValue, PropertyError> {
        if let Some(secret) = descriptor
            .value_from
            .as_ref()
            .and_then(|v| v.secret_key_ref.as_ref())
        {
            return self.resolve_secret(secret).await.map(PropertyValue::new);
        }

        if let Some(payload) = descriptor
            .payload_value
            .as_ref()
            .filter(|p| !p.property_paths.is_empty())
        {
            return resolve_payload(&payload.property_paths, event);
        }

        if let Some(path) = descriptor.from_file.as_deref().filter(|p| !p.is_empty()) {
            let content = tokio::fs::read_to_string(path)
                .await
                .map_err(|source| PropertyError::File {
                    path: path.to_string(),
                    source,
                })?;
            return Ok(PropertyValue::new(Value::String(content)));
        }

        if let Some(name) = descriptor.from_env.as_deref().filter(|n| !n.is_empty()) {
            let value = std::env::var(name).unwrap_or_default();
            if value.is_empty() {
                warn!(env_var = %name, "Environment variable for property is empty or not set");
            } else {
                debug!(env_var = %name, length = value.len(), "Resolved property from environment");
            }
            return Ok(PropertyValue::new(Value::String(value)));
        }

        Ok(descriptor
            .value
            .clone()
            .map(PropertyValue::new)
            .unwrap_or_default())
    }

    /// Resolve the property `name` of `rule`; a missing property is empty.
    pub async fn resolve_named(
        &self,
        rule: &Rule,
        name: &str,
        event: &Event,
    ) -> Result<PropertyValue, PropertyError> {
        match rule.properties.get(name) {
            Some(descriptor) => self
                .resolve(descriptor, event)
                .await
                .map_err(|e| e.named(name)),
            None => Ok(PropertyValue::empty()),
        }
    }

    /// Resolve and coerce to a string
    pub async fn string(&self, rule: &Rule, name: &str, event: &Event) -> Result<String, PropertyError> {
        self.resolve_named(rule, name, event)
            .await?
            .as_string()
            .map_err(|e| e.named(name))
    }

    /// Resolve and coerce to a string list
    pub async fn string_list(
        &self,
        rule: &Rule,
        name: &str,
        event: &Event,
    ) -> Result<Vec<String>, PropertyError> {
        self.resolve_named(rule, name, event)
            .await?
            .as_string_list()
            .map_err(|e| e.named(name))
    }

    /// Resolve and coerce to a string map
    pub async fn string_map(
        &self,
        rule: &Rule,
        name: &str,
        event: &Event,
    ) -> Result<BTreeMap<String, String>, PropertyError> {
        self.resolve_named(rule, name, event)
            .await?
            .as_string_map()
            .map_err(|e| e.named(name))
    }

    async fn resolve_secret(&self, secret: &SecretRef) -> Result<Value, PropertyError> {
        let content = self
            .secrets
            .get_secret(&secret.project, &secret.name, &secret.version)
            .await
            .map_err(|source| PropertyError::Secret {
                project: secret.project.clone(),
                name: secret.name.clone(),
                version: secret.version.clone(),
                source,
            })?;

        let Some(path) = secret.path.as_deref().filter(|p| !p.is_empty()) else {
            return Ok(Value::String(content));
        };

        let document: Value = match serde_json::from_str(&content) {
            Ok(doc) => doc,
            Err(_) => serde_yaml::from_str(&content).map_err(|e| PropertyError::SecretDecode {
                name: secret.name.clone(),
                message: e.to_string(),
            })?,
        };

        lookup_path(&document, path)
            .map(|v| Value::String(value_to_string(v)))
            .ok_or_else(|| PropertyError::SecretPath {
                name: secret.name.clone(),
                path: path.to_string(),
            })
    }
}

/// Try each path in order; the first that evaluates wins.
fn resolve_payload(paths: &[String], event: &Event) -> Result<PropertyValue, PropertyError> {
    let env = event.canonical();
    let mut errors = Vec::with_capacity(paths.len());

    for path in paths {
        match Expression::parse(path).and_then(|expr| expr.evaluate(env)) {
            Ok(value) => {
                debug!(path = %path, "Resolved property from payload");
                let value = match value {
                    Value::Number(_) | Value::Bool(_) => Value::String(value_to_string(&value)),
                    other => other,
                };
                return Ok(PropertyValue::new(value));
            }
            Err(e) => errors.push(e.to_string()),
        }
    }

    Err(PropertyError::PayloadPaths {
        paths: paths.join(", "),
        errors: errors.join("; "),
    })
}

/// Walk a dotted path through objects (and numeric list indices).
fn lookup_path<'a>(root: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.')
        .filter(|segment| !segment.is_empty())
        .try_fold(root, |current, segment| match current {
            Value::Object(map) => map.get(segment),
            Value::Array(items) => segment.parse::<usize>().ok().and_then(|i| items.get(i)),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::secrets::{MemorySecretStore, UnconfiguredSecretStore};
    use serde_json::json;

    fn resolver() -> PropertyResolver {
        let store = MemorySecretStore::new()
            .with_secret("proj", "plain", "latest", "hunter2")
            .with_secret("proj", "json", "3", r#"{"db": {"password": "pw", "port": 5432}}"#)
            .with_secret("proj", "yaml", "latest", "smtp:\n  user: bot\n")
            .with_secret("proj", "text", "latest", "not: [valid");
        PropertyResolver::new(Arc::new(store))
    }

    fn event() -> Event {
        Event::from_value(json!({"y": "from-y", "n": 7, "list": ["a", "b"]}))
            .with_attributes([("repo", "core")])
            .with_id("id-1")
    }

    #[tokio::test]
    async fn test_literal_value() {
        let value = resolver()
            .resolve(&PropertyDescriptor::literal("hello"), &event())
            .await
            .unwrap();
        assert_eq!(value.as_string().unwrap(), "hello");
    }

    #[tokio::test]
    async fn test_payload_beats_literal() {
        let descriptor = PropertyDescriptor {
            value: Some(json!("literal")),
            ..PropertyDescriptor::payload(["data.y"])
        };
        let value = resolver().resolve(&descriptor, &event()).await.unwrap();
        assert_eq!(value.as_string().unwrap(), "from-y");
    }

    #[tokio::test]
    async fn test_payload_first_resolving_path_wins() {
        let descriptor = PropertyDescriptor::payload(["data.x", "data.y"]);
        let value = resolver().resolve(&descriptor, &event()).await.unwrap();
        assert_eq!(value.as_string().unwrap(), "from-y");
    }

    #[tokio::test]
    async fn test_payload_error_lists_every_path() {
        let descriptor = PropertyDescriptor::payload(["data.x", "data.z"]);
        let err = resolver().resolve(&descriptor, &event()).await.unwrap_err();
        let message = err.to_string();
        assert!(message.contains("'data.x, data.z'"), "{}", message);
        assert!(message.contains("data.x"));
        assert!(message.contains("data.z"));
    }

    #[tokio::test]
    async fn test_payload_scalars_and_lists() {
        let r = resolver();
        let n = r
            .resolve(&PropertyDescriptor::payload(["data.n"]), &event())
            .await
            .unwrap();
        assert_eq!(n.as_string().unwrap(), "7");

        let list = r
            .resolve(&PropertyDescriptor::payload(["data.list"]), &event())
            .await
            .unwrap();
        assert_eq!(list.as_string_list().unwrap(), vec!["a", "b"]);

        let attr = r
            .resolve(&PropertyDescriptor::payload(["attributes.repo"]), &event())
            .await
            .unwrap();
        assert_eq!(attr.as_string().unwrap(), "core");
    }

    #[tokio::test]
    async fn test_secret_beats_everything() {
        let descriptor = PropertyDescriptor {
            value: Some(json!("literal")),
            from_env: Some("PATH".into()),
            ..PropertyDescriptor::secret(SecretRef::new("proj", "plain"))
        };
        let value = resolver().resolve(&descriptor, &event()).await.unwrap();
        assert_eq!(value.as_string().unwrap(), "hunter2");
    }

    #[tokio::test]
    async fn test_secret_json_and_yaml_paths() {
        let r = resolver();
        let json_secret = SecretRef::new("proj", "json")
            .with_version("3")
            .with_path("db.port");
        let value = r
            .resolve(&PropertyDescriptor::secret(json_secret), &event())
            .await
            .unwrap();
        assert_eq!(value.as_string().unwrap(), "5432");

        let yaml_secret = SecretRef::new("proj", "yaml").with_path("smtp.user");
        let value = r
            .resolve(&PropertyDescriptor::secret(yaml_secret), &event())
            .await
            .unwrap();
        assert_eq!(value.as_string().unwrap(), "bot");
    }

    #[tokio::test]
    async fn test_secret_failures() {
        let r = resolver();

        let missing = SecretRef::new("proj", "nope").with_version("9");
        let err = r
            .resolve(&PropertyDescriptor::secret(missing), &event())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("error getting secret proj/nope/9"));

        let bad_path = SecretRef::new("proj", "json").with_version("3").with_path("db.user");
        let err = r
            .resolve(&PropertyDescriptor::secret(bad_path), &event())
            .await
            .unwrap_err();
        assert!(matches!(err, PropertyError::SecretPath { .. }));

        let undecodable = SecretRef::new("proj", "text").with_path("a");
        let err = r
            .resolve(&PropertyDescriptor::secret(undecodable), &event())
            .await
            .unwrap_err();
        assert!(matches!(err, PropertyError::SecretDecode { .. }));

        let unconfigured = PropertyResolver::new(Arc::new(UnconfiguredSecretStore));
        let err = unconfigured
            .resolve(&PropertyDescriptor::secret(SecretRef::new("p", "n")), &event())
            .await
            .unwrap_err();
        assert!(matches!(err, PropertyError::Secret { .. }));
    }

    #[tokio::test]
    async fn test_file_verbatim() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("value.txt");
        std::fs::write(&path, "hello").unwrap();

        let descriptor = PropertyDescriptor::file(path.to_string_lossy());
        let value = resolver().resolve(&descriptor, &event()).await.unwrap();
        assert_eq!(value.as_string().unwrap(), "hello");

        let with_newline = dir.path().join("nl.txt");
        std::fs::write(&with_newline, "  {{ id }}\n").unwrap();
        let value = resolver()
            .resolve(&PropertyDescriptor::file(with_newline.to_string_lossy()), &event())
            .await
            .unwrap();
        assert_eq!(value.as_string().unwrap(), "  {{ id }}\n");
    }

    #[tokio::test]
    async fn test_missing_file_is_error() {
        let err = resolver()
            .resolve(&PropertyDescriptor::file("/no/such/file"), &event())
            .await
            .unwrap_err();
        assert!(matches!(err, PropertyError::File { .. }));
    }

    #[tokio::test]
    async fn test_env_never_errors() {
        std::env::set_var("ER_PROPERTY_TEST_ENV", "from-env");
        let value = resolver()
            .resolve(&PropertyDescriptor::env("ER_PROPERTY_TEST_ENV"), &event())
            .await
            .unwrap();
        assert_eq!(value.as_string().unwrap(), "from-env");
        std::env::remove_var("ER_PROPERTY_TEST_ENV");

        let value = resolver()
            .resolve(&PropertyDescriptor::env("ER_PROPERTY_TEST_UNSET"), &event())
            .await
            .unwrap();
        assert_eq!(value.as_string().unwrap(), "");
    }

    #[tokio::test]
    async fn test_resolve_named_missing_is_empty() {
        let rule = Rule::new("r", "log");
        let r = resolver();
        assert_eq!(r.string(&rule, "absent", &event()).await.unwrap(), "");
        assert!(r.string_list(&rule, "absent", &event()).await.unwrap().is_empty());
        assert!(r.string_map(&rule, "absent", &event()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_named_errors_carry_property_name() {
        let rule = Rule::new("r", "log").with_property("to", PropertyDescriptor::literal(json!({"a": 1})));
        let err = resolver().string(&rule, "to", &event()).await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "property 'to': expected the value to be a string, however it is of type map"
        );
    }

    #[test]
    fn test_accessor_coercions() {
        let empty = PropertyValue::empty();
        assert_eq!(empty.as_string().unwrap(), "");
        assert!(empty.as_string_list().unwrap().is_empty());
        assert!(empty.as_string_map().unwrap().is_empty());
        assert!(empty.as_json_map().unwrap().is_empty());
        assert!(empty.is_empty());

        let map = PropertyValue::new(json!({"a": "x", "b": 2, "c": true, "d": null}));
        let coerced = map.as_string_map().unwrap();
        assert_eq!(coerced["a"], "x");
        assert_eq!(coerced["b"], "2");
        assert_eq!(coerced["c"], "true");
        assert_eq!(coerced["d"], "");

        let json_text = PropertyValue::new(json!(r#"{"h": "v"}"#));
        assert_eq!(json_text.as_string_map().unwrap()["h"], "v");

        let list = PropertyValue::new(json!(["a", 1]));
        assert_eq!(list.as_string_list().unwrap(), vec!["a", "1"]);
        assert!(matches!(
            list.as_string(),
            Err(PropertyError::TypeMismatch { expected: "string", found: "list" })
        ));
        assert!(matches!(
            PropertyValue::new(json!([[1]])).as_string_list(),
            Err(PropertyError::TypeMismatch { .. })
        ));
        assert!(matches!(
            PropertyValue::new(json!(5)).as_string_map(),
            Err(PropertyError::TypeMismatch { expected: "string map", found: "int" })
        ));
    }

    #[test]
    fn test_lookup_path() {
        let doc = json!({"a": {"b": [10, {"c": "deep"}]}});
        assert_eq!(lookup_path(&doc, "a.b.1.c"), Some(&json!("deep")));
        assert_eq!(lookup_path(&doc, "a.x"), None);
    }
}
