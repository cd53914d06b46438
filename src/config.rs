//! Configuration module for the event reactor.
//!
//! The rule document is JSON, YAML or TOML with environment variable
//! substitution (`${VAR}`) applied before parsing.
//!
//! # Example
//!
//! ```yaml
//! alwaysReturn200: false
//! reactorConfigs:
//!   - name: notify-on-push
//!     type: webhook
//!     filterExpression: attributes.eventType == 'push'
//!     failOnError: true
//!     properties:
//!       url:
//!         value: https://hooks.example.com/${HOOK_ID}
//!       webhookSecret:
//!         valueFrom:
//!           secretKeyRef: { name: hook-secret, projectId: my-project, version: latest }
//!       repo:
//!         payloadValue:
//!           propertyPaths: ["data.repository.name", "attributes.repo"]
//! ```

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, HashSet};
use std::env;
use std::fs;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::expr::{ExprError, Expression};

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Failed to parse YAML: {0}")]
    YamlError(#[from] serde_yaml::Error),

    #[error("Failed to parse TOML: {0}")]
    TomlError(#[from] toml::de::Error),

    #[error("Validation error: {0}")]
    ValidationError(String),
}

/// Root configuration document
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    /// Configured rules, evaluated for every event
    #[serde(default)]
    pub reactor_configs: Vec<Arc<Rule>>,

    /// Inbound header whose value is attached to request logs
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_header_key: Option<String>,

    /// Register the diagnostic `log` action
    #[serde(default, alias = "loadTestAction")]
    pub load_test_reactor: bool,

    /// Answer 200 even when failures are reported
    #[serde(default)]
    pub always_return_200: bool,

    /// Log every raw request body
    #[serde(default, alias = "logRawPubSubPayload")]
    pub log_raw_payload: bool,

    /// Log the normalised event data
    #[serde(default)]
    pub log_event_data_payload: bool,

    /// Per-action timeout; absent means actions may run indefinitely
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action_timeout_secs: Option<u64>,

    /// Report filter evaluation errors as failures instead of non-matches
    #[serde(default)]
    pub strict_filter_evaluation: bool,
}

/// A configured filter and action binding
#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(rename_all = "camelCase")]
pub struct Rule {
    pub name: String,

    /// Action type looked up in the registry (e.g. `webhook`)
    #[serde(rename = "type")]
    pub kind: String,

    /// Filter expression; empty matches every event
    #[serde(default, alias = "celExpressionFilter")]
    pub filter_expression: String,

    #[serde(default)]
    pub disabled: bool,

    #[serde(default)]
    pub properties: BTreeMap<String, PropertyDescriptor>,

    /// Whether an action failure is reported to the caller (default true)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fail_on_error: Option<bool>,

    #[serde(skip)]
    compiled_filter: OnceLock<Result<Expression, ExprError>>,
}

impl PartialEq for Rule {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
            && self.kind == other.kind
            && self.filter_expression == other.filter_expression
            && self.disabled == other.disabled
            && self.properties == other.properties
            && self.fail_on_error == other.fail_on_error
    }
}

impl Rule {
    /// Create an enabled rule with no filter and no properties
    pub fn new(name: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Set the filter expression
    pub fn with_filter(mut self, expression: impl Into<String>) -> Self {
        self.filter_expression = expression.into();
        self.compiled_filter = OnceLock::new();
        self
    }

    /// The parsed filter, or `None` when the rule has no filter.
    ///
    /// Parsed on first use and kept for the life of the rule.
    pub fn filter(&self) -> Option<&Result<Expression, ExprError>> {
        let source = self.filter_expression.trim();
        if source.is_empty() {
            return None;
        }
        Some(self.compiled_filter.get_or_init(|| Expression::parse(source)))
    }

    /// Add a property
    pub fn with_property(mut self, name: impl Into<String>, descriptor: PropertyDescriptor) -> Self {
        self.properties.insert(name.into(), descriptor);
        self
    }

    /// Set the fail-on-error policy
    pub fn with_fail_on_error(mut self, fail: bool) -> Self {
        self.fail_on_error = Some(fail);
        self
    }

    /// Disable the rule
    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    /// Effective fail-on-error policy
    pub fn should_fail_on_error(&self) -> bool {
        self.fail_on_error.unwrap_or(true)
    }
}

/// Where a property's value comes from.
///
/// When several sources are set the first of secret, payload, file, env,
/// literal wins.
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PropertyDescriptor {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<Value>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value_from: Option<ValueSource>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload_value: Option<PayloadValueRef>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_file: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from_env: Option<String>,
}

impl PropertyDescriptor {
    /// A literal value
    pub fn literal(value: impl Into<Value>) -> Self {
        Self {
            value: Some(value.into()),
            ..Default::default()
        }
    }

    /// A secret reference
    pub fn secret(secret: SecretRef) -> Self {
        Self {
            value_from: Some(ValueSource {
                secret_key_ref: Some(secret),
            }),
            ..Default::default()
        }
    }

    /// A list of payload paths, tried in order
    pub fn payload<I, S>(paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            payload_value: Some(PayloadValueRef {
                property_paths: paths.into_iter().map(Into::into).collect(),
            }),
            ..Default::default()
        }
    }

    /// File contents
    pub fn file(path: impl Into<String>) -> Self {
        Self {
            from_file: Some(path.into()),
            ..Default::default()
        }
    }

    /// Environment variable
    pub fn env(name: impl Into<String>) -> Self {
        Self {
            from_env: Some(name.into()),
            ..Default::default()
        }
    }
}

/// Indirect value sources
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ValueSource {
    #[serde(default, alias = "secretRef", skip_serializing_if = "Option::is_none")]
    pub secret_key_ref: Option<SecretRef>,
}

/// Reference to a secret, optionally to a field inside a JSON/YAML secret
#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,

    #[serde(rename = "projectId", alias = "namespace", default)]
    pub project: String,

    #[serde(default = "default_secret_version")]
    pub version: String,

    /// Dotted path into the decoded secret document
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
}

impl SecretRef {
    pub fn new(project: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            project: project.into(),
            version: default_secret_version(),
            path: None,
        }
    }

    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }
}

fn default_secret_version() -> String {
    crate::secrets::LATEST_VERSION.to_string()
}

/// Payload paths evaluated against the event
#[derive(Debug, Deserialize, Serialize, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PayloadValueRef {
    #[serde(default)]
    pub property_paths: Vec<String>,
}

/// Document formats accepted by [`ServerConfig::load_from`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfigFormat {
    Json,
    Yaml,
    Toml,
}

impl ConfigFormat {
    /// Guess the format from a file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension()?.to_str()?.to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "yaml" | "yml" => Some(Self::Yaml),
            "toml" => Some(Self::Toml),
            _ => None,
        }
    }
}

impl ServerConfig {
    /// Load configuration from the `EVENT_REACTOR_CONFIG` path.
    pub fn load() -> Result<Self, ConfigError> {
        match env::var("EVENT_REACTOR_CONFIG") {
            Ok(path) if !path.is_empty() => Self::load_from(path),
            _ => {
                info!("EVENT_REACTOR_CONFIG not set, using the default configuration");
                Ok(Self::default())
            }
        }
    }

    /// Load configuration from a specific path.
    ///
    /// A missing file yields the default (empty) configuration.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();

        if !path.exists() {
            info!(
                path = %path.display(),
                "Config file not found, using defaults"
            );
            return Ok(Self::default());
        }

        info!(path = %path.display(), "Loading configuration");

        let content = fs::read_to_string(path)?;
        let config = Self::parse(&content, ConfigFormat::from_path(path))?;

        info!(
            rules = config.reactor_configs.len(),
            enabled = config.reactor_configs.iter().filter(|r| !r.disabled).count(),
            "Configuration loaded"
        );

        Ok(config)
    }

    /// Parse and validate a document. Without a format, JSON is tried first
    /// and YAML second.
    pub fn parse(content: &str, format: Option<ConfigFormat>) -> Result<Self, ConfigError> {
        let content = substitute_env_vars(content);

        let config: ServerConfig = match format {
            Some(ConfigFormat::Json) => serde_json::from_str(&content)?,
            Some(ConfigFormat::Yaml) => serde_yaml::from_str(&content)?,
            Some(ConfigFormat::Toml) => toml::from_str(&content)?,
            None => match serde_json::from_str(&content) {
                Ok(config) => config,
                Err(json_err) => {
                    debug!(error = %json_err, "Config is not JSON, trying YAML");
                    serde_yaml::from_str(&content)?
                }
            },
        };

        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    ///
    /// Structural problems fail; problems limited to one rule are logged so
    /// the remaining rules still load.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = HashSet::new();

        for (index, rule) in self.reactor_configs.iter().enumerate() {
            if rule.name.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "reactor config at index {} has an empty name",
                    index
                )));
            }

            if rule.kind.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "reactor config '{}' has an empty type",
                    rule.name
                )));
            }

            if !seen.insert(rule.name.as_str()) {
                warn!(rule = %rule.name, "Duplicate reactor config name");
            }

            if let Some(Err(e)) = rule.filter() {
                warn!(
                    rule = %rule.name,
                    error = %e,
                    "Filter expression does not parse, the rule will never match"
                );
            }

            for (name, descriptor) in &rule.properties {
                if let Some(secret) = descriptor
                    .value_from
                    .as_ref()
                    .and_then(|v| v.secret_key_ref.as_ref())
                {
                    if secret.name.is_empty() {
                        warn!(
                            rule = %rule.name,
                            property = %name,
                            "Secret reference has an empty name"
                        );
                    }
                }
            }

            if rule.disabled {
                debug!(rule = %rule.name, "Reactor config is disabled");
            }
        }

        if self.action_timeout_secs == Some(0) {
            return Err(ConfigError::ValidationError(
                "actionTimeoutSecs must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }

    /// Warn about rules whose type the registry does not know and return
    /// their names.
    pub fn warn_unknown_types(&self, known: &[&str]) -> Vec<&str> {
        let mut unknown = Vec::new();
        for rule in &self.reactor_configs {
            if !known.contains(&rule.kind.as_str()) {
                warn!(
                    rule = %rule.name,
                    rule_type = %rule.kind,
                    known = ?known,
                    "Reactor config references an unknown type"
                );
                unknown.push(rule.name.as_str());
            }
        }
        unknown
    }

    /// Names of all configured rules
    pub fn rule_names(&self) -> Vec<&str> {
        self.reactor_configs.iter().map(|r| r.name.as_str()).collect()
    }
}

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
    })
}

/// Substitute environment variables in the format ${VAR_NAME}
fn substitute_env_vars(content: &str) -> String {
    env_var_pattern()
        .replace_all(content, |caps: &regex::Captures| {
            let var_name = &caps[1];
            match env::var(var_name) {
                Ok(value) => value,
                Err(_) => {
                    debug!(var = %var_name, "Environment variable not set, keeping placeholder");
                    caps[0].to_string()
                }
            }
        })
        .to_string()
}
