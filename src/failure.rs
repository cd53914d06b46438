//! Structured failure records returned to HTTP callers.
//!
//! A [`FailureDetail`] is the only error surface the caller ever sees. The
//! dispatcher produces one per failing rule; listeners produce one when the
//! request body cannot be read or normalised.

use serde::{Deserialize, Serialize};

/// Status used for every failure originating from dispatch or normalisation.
pub const FAILURE_STATUS: u16 = 400;

/// A single failure, serialised with the field names `type`, `title`,
/// `status`, `detail` and `instance`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailureDetail {
    /// Machine readable tag (e.g. `exists`, `webhook-execute-reactor`)
    #[serde(rename = "type")]
    pub kind: String,

    /// Short human title
    pub title: String,

    /// HTTP status associated with the failure
    pub status: u16,

    /// Human readable message
    pub detail: String,

    /// Endpoint identifier that triggered the failure
    pub instance: String,
}

impl FailureDetail {
    /// Create a failure with the standard `400` status
    pub fn new(
        kind: impl Into<String>,
        title: impl Into<String>,
        detail: impl Into<String>,
        instance: impl Into<String>,
    ) -> Self {
        Self {
            kind: kind.into(),
            title: title.into(),
            status: FAILURE_STATUS,
            detail: detail.into(),
            instance: instance.into(),
        }
    }

    /// Override the status
    pub fn with_status(mut self, status: u16) -> Self {
        self.status = status;
        self
    }
}
