//! Action system for the event reactor.
//!
//! Actions are the units of work a matching rule triggers. The [`Action`]
//! trait defines the interface every action implements; the
//! [`ActionRegistry`] maps a rule's `type` to a constructor.
//!
//! ## Built-in Actions
//!
//! - [`LogAction`] (`log`): logs a rendered message (diagnostic mode only)
//! - [`WebhookAction`] (`webhook`): signed HTTP POST
//! - [`EmailAction`] (`email`): SMTP mail
//! - [`WebexAction`] (`webex`): Webex space message
//! - [`GithubCommentAction`] (`github/comment`): commit and PR comments
//! - [`PowershellAction`] (`powershell`): runs a PowerShell script
//!
//! ## Creating Custom Actions
//!
//! ```rust,ignore
//! use event_reactor::action::{Action, ActionContext, ActionError, PropertySpec};
//! use event_reactor::Event;
//! use async_trait::async_trait;
//!
//! struct MyAction(ActionContext);
//!
//! #[async_trait]
//! impl Action for MyAction {
//!     fn name(&self) -> &str {
//!         "my-action"
//!     }
//!
//!     fn description(&self) -> &str {
//!         "Does the thing"
//!     }
//!
//!     fn properties(&self) -> &[PropertySpec] {
//!         &[]
//!     }
//!
//!     async fn execute(&self, event: &Event) -> Result<(), ActionError> {
//!         Ok(())
//!     }
//! }
//!
//! registry.register("my-action", |ctx| Box::new(MyAction(ctx)));
//! ```

pub mod email;
pub mod github_comment;
mod http;
pub mod log;
pub mod powershell;
pub mod registry;
pub mod webex;
pub mod webhook;

use crate::config::Rule;
use crate::event::Event;
use crate::property::{PropertyError, PropertyResolver};
use crate::template::{
    TemplateError, TemplateOptions, TemplateRenderer, IGNORE_ERRORS_PROPERTY, LEFT_DELIM_PROPERTY,
    RIGHT_DELIM_PROPERTY,
};
use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{warn, Span};

pub use email::EmailAction;
pub use github_comment::GithubCommentAction;
pub use log::LogAction;
pub use powershell::PowershellAction;
pub use registry::{ActionConstructor, ActionRegistry};
pub use webex::WebexAction;
pub use webhook::WebhookAction;

/// Errors that can occur during action execution.
#[derive(Error, Debug)]
pub enum ActionError {
    /// Required properties are not configured on the rule
    #[error("the following required properties are missing: {}", .0.join(", "))]
    MissingProperties(Vec<String>),

    /// A required property resolved to an empty value
    #[error("the '{0}' property was not supplied or was empty")]
    EmptyProperty(String),

    /// A property resolved to a value the action cannot use
    #[error("the '{name}' property is invalid: {reason}")]
    InvalidProperty { name: String, reason: String },

    #[error(transparent)]
    Property(#[from] PropertyError),

    #[error(transparent)]
    Template(#[from] TemplateError),

    /// HTTP request failed
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// The action timed out
    #[error("action timed out after {0}ms")]
    Timeout(u64),

    /// Generic action failure
    #[error("{0}")]
    Failed(String),
}

/// Value shape expected for a property
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyKind {
    String,
    StringList,
    StringMap,
}

/// Documentation of one property an action reads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PropertySpec {
    pub name: &'static str,
    pub description: &'static str,
    pub required: bool,
    pub kind: PropertyKind,
}

impl PropertySpec {
    pub const fn required(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: true,
            kind: PropertyKind::String,
        }
    }

    pub const fn optional(name: &'static str, description: &'static str) -> Self {
        Self {
            name,
            description,
            required: false,
            kind: PropertyKind::String,
        }
    }

    pub const fn of_kind(mut self, kind: PropertyKind) -> Self {
        self.kind = kind;
        self
    }
}

/// The core Action trait.
///
/// Instances are built per dispatch by an [`ActionConstructor`], bound to one
/// rule, so they hold no state across events.
#[async_trait]
pub trait Action: Send + Sync {
    /// Registry name of the action (e.g. "webhook")
    fn name(&self) -> &str;

    /// One line description
    fn description(&self) -> &str;

    /// Properties the action reads
    fn properties(&self) -> &[PropertySpec];

    /// Names of the properties that must be configured
    fn required_property_names(&self) -> Vec<&str> {
        self.properties()
            .iter()
            .filter(|p| p.required)
            .map(|p| p.name)
            .collect()
    }

    /// Execute the action for the given event.
    async fn execute(&self, event: &Event) -> Result<(), ActionError>;
}

/// Everything an action needs, bound to one rule.
#[derive(Clone)]
pub struct ActionContext {
    /// Rule the action runs for
    pub rule: Arc<Rule>,

    /// Span carrying the rule identity; the dispatcher runs the action in it
    pub span: Span,

    pub resolver: PropertyResolver,

    /// Shared HTTP client
    pub http: reqwest::Client,

    pub templates: TemplateRenderer,
}

impl ActionContext {
    /// Fail when any required property is not configured on the rule.
    pub fn check_required(&self, properties: &[PropertySpec]) -> Result<(), ActionError> {
        let missing: Vec<String> = properties
            .iter()
            .filter(|p| p.required && !self.rule.properties.contains_key(p.name))
            .map(|p| p.name.to_string())
            .collect();

        if missing.is_empty() {
            Ok(())
        } else {
            Err(ActionError::MissingProperties(missing))
        }
    }

    /// Template options from the rule's delimiter and error-policy
    /// properties. Resolution problems fall back to the defaults.
    pub async fn template_options(&self, event: &Event) -> TemplateOptions {
        let left = self.template_option(LEFT_DELIM_PROPERTY, event).await;
        let right = self.template_option(RIGHT_DELIM_PROPERTY, event).await;
        let ignore = self.template_option(IGNORE_ERRORS_PROPERTY, event).await;
        TemplateOptions::from_properties(&left, &right, &ignore)
    }

    async fn template_option(&self, name: &str, event: &Event) -> String {
        self.resolver
            .string(&self.rule, name, event)
            .await
            .unwrap_or_else(|e| {
                warn!(property = %name, error = %e, "Failed to resolve template option");
                String::new()
            })
    }

    /// Resolve a string property
    pub async fn string(&self, name: &str, event: &Event) -> Result<String, ActionError> {
        Ok(self.resolver.string(&self.rule, name, event).await?)
    }

    /// Resolve a string property and fail if it is empty
    pub async fn non_empty_string(&self, name: &str, event: &Event) -> Result<String, ActionError> {
        let value = self.string(name, event).await?;
        if value.trim().is_empty() {
            return Err(ActionError::EmptyProperty(name.to_string()));
        }
        Ok(value)
    }

    /// Resolve a string property and render it
    pub async fn rendered(
        &self,
        name: &str,
        event: &Event,
        options: &TemplateOptions,
    ) -> Result<String, ActionError> {
        let raw = self.string(name, event).await?;
        Ok(self.templates.render(name, &raw, event, options)?)
    }

    /// Resolve a string map property, rendering each value
    pub async fn rendered_map(
        &self,
        name: &str,
        event: &Event,
        options: &TemplateOptions,
    ) -> Result<BTreeMap<String, String>, ActionError> {
        let map = self.resolver.string_map(&self.rule, name, event).await?;
        map.into_iter()
            .map(|(key, value)| {
                let rendered = self
                    .templates
                    .render(&format!("{}.{}", name, key), &value, event, options)?;
                Ok((key, rendered))
            })
            .collect()
    }

    /// Resolve a map property keeping its JSON values
    pub async fn json_map(&self, name: &str, event: &Event) -> Result<Map<String, Value>, ActionError> {
        Ok(self
            .resolver
            .resolve_named(&self.rule, name, event)
            .await?
            .as_json_map()?)
    }

    /// Resolve an unsigned integer property, `default` when empty
    pub async fn number_or(&self, name: &str, event: &Event, default: u32) -> Result<u32, ActionError> {
        let raw = self.string(name, event).await?;
        let raw = raw.trim();
        if raw.is_empty() {
            return Ok(default);
        }
        raw.parse::<u32>().map_err(|e| ActionError::InvalidProperty {
            name: name.to_string(),
            reason: format!("'{}' is not a valid number: {}", raw, e),
        })
    }

    /// Resolve a boolean property (`"true"`, case insensitive)
    pub async fn flag(&self, name: &str, event: &Event) -> Result<bool, ActionError> {
        Ok(self
            .string(name, event)
            .await?
            .trim()
            .eq_ignore_ascii_case("true"))
    }
}
