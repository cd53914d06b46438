//! Template rendering for rule properties.
//!
//! Properties documented as "rendered" are expanded with [`minijinja`] using
//! the event's canonical map as the namespace, so `{{ data.repo.name }}`,
//! `{{ attributes.eventType }}` and `{{ id }}` are all available.
//!
//! Each rule may change the variable delimiters (useful when the property
//! itself contains `{{`, e.g. a script) and may ask for render errors to be
//! ignored, in which case the raw string is used instead.
//!
//! ```yaml
//! properties:
//!   templateLeftDelim:  { value: "<<" }
//!   templateRightDelim: { value: ">>" }
//!   ignoreTemplateErrors: { value: "true" }
//! ```

use crate::event::Event;
use minijinja::syntax::SyntaxConfig;
use minijinja::Environment;
use thiserror::Error;
use tracing::warn;

/// Property naming the left variable delimiter
pub const LEFT_DELIM_PROPERTY: &str = "templateLeftDelim";

/// Property naming the right variable delimiter
pub const RIGHT_DELIM_PROPERTY: &str = "templateRightDelim";

/// Property that, when `"true"`, passes raw strings through on render errors
pub const IGNORE_ERRORS_PROPERTY: &str = "ignoreTemplateErrors";

pub const DEFAULT_LEFT_DELIM: &str = "{{";
pub const DEFAULT_RIGHT_DELIM: &str = "}}";

/// Errors that can occur while rendering a template.
#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("invalid template delimiters '{left}' '{right}': {message}")]
    Delimiters {
        left: String,
        right: String,
        message: String,
    },

    #[error("failed to render the '{name}' template: {message}")]
    Render { name: String, message: String },
}

/// Per-rule rendering options.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateOptions {
    pub left_delim: String,
    pub right_delim: String,
    pub ignore_errors: bool,
}

impl Default for TemplateOptions {
    fn default() -> Self {
        Self {
            left_delim: DEFAULT_LEFT_DELIM.to_string(),
            right_delim: DEFAULT_RIGHT_DELIM.to_string(),
            ignore_errors: false,
        }
    }
}

impl TemplateOptions {
    /// Build options from already resolved property strings; empty strings
    /// keep the defaults.
    pub fn from_properties(left: &str, right: &str, ignore_errors: &str) -> Self {
        let mut options = Self::default();
        if !left.is_empty() {
            options.left_delim = left.to_string();
        }
        if !right.is_empty() {
            options.right_delim = right.to_string();
        }
        options.ignore_errors = ignore_errors.trim().eq_ignore_ascii_case("true");
        options
    }

    fn is_default_syntax(&self) -> bool {
        self.left_delim == DEFAULT_LEFT_DELIM && self.right_delim == DEFAULT_RIGHT_DELIM
    }
}

/// Renders property templates against an event.
#[derive(Debug, Clone, Copy, Default)]
pub struct TemplateRenderer;

impl TemplateRenderer {
    pub fn new() -> Self {
        Self
    }

    /// Render `template` against `event`.
    ///
    /// `name` identifies the template in errors and logs (usually the
    /// property name). Strings without the left delimiter are returned as is.
    pub fn render(
        &self,
        name: &str,
        template: &str,
        event: &Event,
        options: &TemplateOptions,
    ) -> Result<String, TemplateError> {
        if !template.contains(options.left_delim.as_str()) {
            return Ok(template.to_string());
        }

        match self.try_render(name, template, event, options) {
            Ok(rendered) => Ok(rendered),
            Err(e) if options.ignore_errors => {
                warn!(
                    template = %name,
                    error = %e,
                    "Template rendering failed, using the raw value"
                );
                Ok(template.to_string())
            }
            Err(e) => Err(e),
        }
    }

    fn try_render(
        &self,
        name: &str,
        template: &str,
        event: &Event,
        options: &TemplateOptions,
    ) -> Result<String, TemplateError> {
        let mut env = Environment::new();

        if !options.is_default_syntax() {
            let syntax = SyntaxConfig::builder()
                .variable_delimiters(options.left_delim.clone(), options.right_delim.clone())
                .build()
                .map_err(|e| TemplateError::Delimiters {
                    left: options.left_delim.clone(),
                    right: options.right_delim.clone(),
                    message: e.to_string(),
                })?;
            env.set_syntax(syntax);
        }

        env.render_str(template, event.canonical())
            .map_err(|e| TemplateError::Render {
                name: name.to_string(),
                message: e.to_string(),
            })
    }
}
