//! Generic JSON listener.
//!
//! The whole body becomes the event data. A top-level `attributes` object is
//! copied (stringified) into the event attributes; arrays are wrapped under
//! `items` so `data` is always an object.

use super::{stringify_attributes, Listener, NormalizeError};
use crate::event::{type_name, Event};
use crate::failure::FailureDetail;
use serde_json::{Map, Value};

/// Listener accepting any JSON object or array.
#[derive(Debug, Clone, Copy, Default)]
pub struct GenericListener;

impl Listener for GenericListener {
    fn name(&self) -> &str {
        "generic"
    }

    fn api_path(&self) -> &str {
        "generic"
    }

    fn parse_payload(&self, payload: &[u8]) -> Result<Event, FailureDetail> {
        let body: Value = serde_json::from_slice(payload).map_err(|e| {
            FailureDetail::new(
                "unmarshal-body-data",
                "Unmarshal Body Data",
                format!(
                    "{} listener failed to unmarshal the body. Error: {}",
                    self.name(),
                    e
                ),
                self.api_path(),
            )
        })?;

        payload_to_event(body).map_err(|e| {
            FailureDetail::new(
                "convert-generic-payload",
                "Convert Generic Payload",
                e.to_string(),
                self.api_path(),
            )
        })
    }
}

/// Shape a decoded generic payload into an [`Event`].
pub fn payload_to_event(body: Value) -> Result<Event, NormalizeError> {
    match body {
        Value::Object(data) => {
            let attributes = match data.get("attributes") {
                Some(Value::Object(attrs)) => stringify_attributes(attrs),
                _ => Default::default(),
            };
            Ok(Event::from_parts(data, attributes, String::new()))
        }
        Value::Array(items) => {
            let mut data = Map::new();
            data.insert("items".to_string(), Value::Array(items));
            Ok(Event::new(data))
        }
        other => Err(NormalizeError::UnsupportedPayload(type_name(&other))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_object_payload_with_attributes() {
        let body = json!({"kind": "push", "attributes": {"repo": "core", "count": 2}});
        let event = GenericListener
            .parse_payload(body.to_string().as_bytes())
            .unwrap();

        assert_eq!(event.data["kind"], "push");
        assert_eq!(event.attributes["repo"], "core");
        assert_eq!(event.attributes["count"], "2");
        // attributes also stay visible in data
        assert!(event.data.contains_key("attributes"));
    }

    #[test]
    fn test_array_payload_wrapped_in_items() {
        let event = GenericListener.parse_payload(b"[1, 2]").unwrap();
        assert_eq!(event.data["items"], json!([1, 2]));
        assert!(event.attributes.is_empty());
    }

    #[test]
    fn test_scalar_payload_rejected() {
        let err = GenericListener.parse_payload(b"42").unwrap_err();
        assert_eq!(err.kind, "convert-generic-payload");
        assert_eq!(err.instance, "generic");
        assert!(err.detail.contains("int"));
    }

    #[test]
    fn test_invalid_json() {
        let err = GenericListener.parse_payload(b"nope").unwrap_err();
        assert_eq!(err.kind, "unmarshal-body-data");
    }
}
