//! Payload normalisers.
//!
//! A [`Listener`] turns the raw body of a `POST /api/v1/{path}` request into
//! the canonical [`Event`]. Listeners never panic on malformed input: every
//! failure comes back as a [`FailureDetail`] that the HTTP layer returns as is.
//!
//! ## Built-in listeners
//!
//! | Name      | Path      | Payload                                   |
//! |-----------|-----------|-------------------------------------------|
//! | `pub/sub` | `pubsub`  | Pub/Sub push envelope (`message.data` ...)|
//! | `generic` | `generic` | Any JSON object or array                  |

pub mod generic;
pub mod pubsub;

use crate::event::Event;
use crate::failure::FailureDetail;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

pub use generic::GenericListener;
pub use pubsub::PubSubListener;

/// Errors raised while converting a decoded body into an [`Event`].
#[derive(Debug, Error)]
pub enum NormalizeError {
    #[error("message property not found in the pub/sub message")]
    MissingMessage,

    #[error("the pub/sub message property is of type '{0}', expected an object")]
    MessageNotObject(&'static str),

    #[error("the pub/sub message data is of type '{0}', expected a string or an object")]
    DataType(&'static str),

    #[error("failed to decode the pub/sub message data as base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("failed to parse the base64 decoded pub/sub message data as a JSON object: {0}")]
    DecodedJson(serde_json::Error),

    #[error("unknown payload type '{0}', expected an object or an array")]
    UnsupportedPayload(&'static str),
}

/// A payload normaliser bound to one API path.
pub trait Listener: Send + Sync {
    /// Display name used in logs and failure titles (e.g. `pub/sub`)
    fn name(&self) -> &str;

    /// Path segment under `/api/v1/` (e.g. `pubsub`)
    fn api_path(&self) -> &str;

    /// Convert the raw request body into an [`Event`].
    fn parse_payload(&self, payload: &[u8]) -> Result<Event, FailureDetail>;
}

/// Lookup table of listeners keyed by API path.
#[derive(Clone, Default)]
pub struct ListenerSet {
    by_path: HashMap<String, Arc<dyn Listener>>,
}

impl ListenerSet {
    /// Create an empty set
    pub fn new() -> Self {
        Self::default()
    }

    /// The pub/sub and generic listeners
    pub fn builtin() -> Self {
        let mut set = Self::new();
        set.register(Arc::new(PubSubListener));
        set.register(Arc::new(GenericListener));
        set
    }

    /// Register a listener under its API path
    pub fn register(&mut self, listener: Arc<dyn Listener>) {
        self.by_path
            .insert(listener.api_path().to_string(), listener);
    }

    /// Find the listener serving `path`
    pub fn get(&self, path: &str) -> Option<Arc<dyn Listener>> {
        self.by_path.get(path).cloned()
    }

    /// Registered API paths, sorted
    pub fn paths(&self) -> Vec<&str> {
        let mut paths: Vec<&str> = self.by_path.keys().map(|s| s.as_str()).collect();
        paths.sort_unstable();
        paths
    }
}

/// Decode a request body into a JSON object, or a failure naming the listener.
pub(crate) fn decode_body(
    listener: &dyn Listener,
    payload: &[u8],
) -> Result<Map<String, Value>, FailureDetail> {
    serde_json::from_slice::<Map<String, Value>>(payload).map_err(|e| {
        FailureDetail::new(
            "unmarshal-body-data",
            "Unmarshal Body Data",
            format!(
                "{} listener failed to unmarshal the body to a JSON object. Error: {}",
                listener.name(),
                e
            ),
            listener.api_path(),
        )
    })
}

/// Stringify every attribute value so the map is string to string.
pub(crate) fn stringify_attributes(
    attributes: &Map<String, Value>,
) -> std::collections::BTreeMap<String, String> {
    attributes
        .iter()
        .map(|(k, v)| (k.clone(), crate::event::value_to_string(v)))
        .collect()
}
