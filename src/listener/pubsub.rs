//! Pub/Sub push envelope listener.
//!
//! ```json
//! {
//!   "message": {
//!     "data": "eyJ0ZXN0IjoxMjN9",
//!     "attributes": { "a": "b" },
//!     "messageId": "1"
//!   },
//!   "subscription": "projects/p/subscriptions/s"
//! }
//! ```
//!
//! `message.data` is tried as a raw JSON object first and as base64 encoded
//! JSON second.

use super::{decode_body, stringify_attributes, Listener, NormalizeError};
use crate::event::{type_name, Event};
use crate::failure::FailureDetail;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde_json::{Map, Value};
use tracing::debug;

/// Listener for Pub/Sub push subscriptions.
#[derive(Debug, Clone, Copy, Default)]
pub struct PubSubListener;

impl Listener for PubSubListener {
    fn name(&self) -> &str {
        "pub/sub"
    }

    fn api_path(&self) -> &str {
        "pubsub"
    }

    fn parse_payload(&self, payload: &[u8]) -> Result<Event, FailureDetail> {
        let body = decode_body(self, payload)?;

        message_to_event(&body).map_err(|e| {
            FailureDetail::new(
                "convert-pubsub-message",
                "Convert Pub/Sub Message",
                e.to_string(),
                self.api_path(),
            )
        })
    }
}

/// Convert a decoded push envelope into an [`Event`].
pub fn message_to_event(body: &Map<String, Value>) -> Result<Event, NormalizeError> {
    let message = match body.get("message") {
        Some(Value::Object(message)) => message,
        Some(other) => return Err(NormalizeError::MessageNotObject(type_name(other))),
        None => return Err(NormalizeError::MissingMessage),
    };

    let attributes = match message.get("attributes") {
        Some(Value::Object(attrs)) => stringify_attributes(attrs),
        _ => Default::default(),
    };

    let id = message
        .get("messageId")
        .or_else(|| message.get("message_id"))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    let data = match message.get("data") {
        None | Some(Value::Null) => Map::new(),
        Some(Value::Object(data)) => data.clone(),
        Some(Value::String(raw)) => decode_data(raw)?,
        Some(other) => return Err(NormalizeError::DataType(type_name(other))),
    };

    Ok(Event::from_parts(data, attributes, id))
}

fn decode_data(raw: &str) -> Result<Map<String, Value>, NormalizeError> {
    if raw.is_empty() {
        return Ok(Map::new());
    }

    if let Ok(data) = serde_json::from_str::<Map<String, Value>>(raw) {
        return Ok(data);
    }

    debug!("pub/sub data is not raw JSON, decoding as base64");
    let decoded = STANDARD.decode(raw.trim())?;
    serde_json::from_slice::<Map<String, Value>>(&decoded).map_err(NormalizeError::DecodedJson)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_base64_data() {
        let body = br#"{"message":{"data":"eyJ0ZXN0IjoxMjN9","messageId":"1","attributes":{"a":"b"}}}"#;
        let event = PubSubListener.parse_payload(body).unwrap();

        assert_eq!(event.id, "1");
        assert_eq!(event.attributes.get("a").map(String::as_str), Some("b"));
        assert_eq!(Value::Object(event.data), json!({"test": 123}));
    }

    #[test]
    fn test_raw_json_string_data() {
        let body = json!({"message": {"data": "{\"name\":\"x\"}", "messageId": "7"}});
        let event = PubSubListener
            .parse_payload(body.to_string().as_bytes())
            .unwrap();
        assert_eq!(event.data["name"], "x");
        assert!(event.attributes.is_empty());
    }

    #[test]
    fn test_non_string_attributes_are_stringified() {
        let body = json!({"message": {"attributes": {"n": 5, "flag": true}}});
        let event = PubSubListener
            .parse_payload(body.to_string().as_bytes())
            .unwrap();
        assert_eq!(event.attributes["n"], "5");
        assert_eq!(event.attributes["flag"], "true");
        assert!(event.data.is_empty());
        assert_eq!(event.id, "");
    }

    #[test]
    fn test_missing_message() {
        let err = PubSubListener.parse_payload(br#"{"other": 1}"#).unwrap_err();
        assert_eq!(err.kind, "convert-pubsub-message");
        assert!(err.detail.contains("message property not found"));
    }

    #[test]
    fn test_message_not_object() {
        let err = PubSubListener
            .parse_payload(br#"{"message": "text"}"#)
            .unwrap_err();
        assert_eq!(err.kind, "convert-pubsub-message");
        assert!(err.detail.contains("string"));
    }

    #[test]
    fn test_invalid_base64() {
        let err = PubSubListener
            .parse_payload(br#"{"message": {"data": "not base64 !!"}}"#)
            .unwrap_err();
        assert!(err.detail.contains("base64"));
    }

    #[test]
    fn test_base64_of_non_json() {
        // "hello" base64 encoded
        let err = PubSubListener
            .parse_payload(br#"{"message": {"data": "aGVsbG8="}}"#)
            .unwrap_err();
        assert!(err.detail.contains("base64 decoded"));
    }

    #[test]
    fn test_unparseable_body() {
        let err = PubSubListener.parse_payload(b"{not json").unwrap_err();
        assert_eq!(err.kind, "unmarshal-body-data");
    }
}
