//! Log Action - structured logging of a rendered message.
//!
//! The [`LogAction`] is the diagnostic action, registered only when
//! `loadTestReactor` is enabled. It is useful for checking filters and
//! templates against live traffic without side effects.
//!
//! # Example
//!
//! ```yaml
//! - name: trace-pushes
//!   type: log
//!   filterExpression: attributes.eventType == 'push'
//!   properties:
//!     message:
//!       value: "push to {{ data.repository.name }} ({{ id }})"
//! ```

use super::{Action, ActionContext, ActionError, PropertySpec};
use crate::event::Event;
use async_trait::async_trait;
use tracing::info;

const PROPERTIES: &[PropertySpec] = &[PropertySpec::required(
    "message",
    "The message to log. Rendered as a template.",
)];

/// An action that logs a rendered message.
#[derive(Clone)]
pub struct LogAction {
    ctx: ActionContext,
}

impl LogAction {
    pub const NAME: &'static str = "log";

    pub fn new(ctx: ActionContext) -> Self {
        Self { ctx }
    }
}

#[async_trait]
impl Action for LogAction {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Logs a rendered message; intended for testing rules"
    }

    fn properties(&self) -> &[PropertySpec] {
        PROPERTIES
    }

    async fn execute(&self, event: &Event) -> Result<(), ActionError> {
        self.ctx.check_required(PROPERTIES)?;

        let options = self.ctx.template_options(event).await;
        let message = self.ctx.rendered("message", event, &options).await?;

        info!(
            rule = %self.ctx.rule.name,
            event_id = %event.id,
            "{}",
            message
        );

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::test_support::context;
    use serde_json::json;

    #[tokio::test]
    async fn test_log_action() {
        let action = LogAction::new(context("log", &[("message", json!("hello {{ id }}"))]));
        let event = Event::from_value(json!({})).with_id("abc");

        action.execute(&event).await.unwrap();
        assert_eq!(action.name(), "log");
        assert_eq!(action.required_property_names(), vec!["message"]);
    }

    #[tokio::test]
    async fn test_log_action_requires_message() {
        let action = LogAction::new(context("log", &[]));
        let err = action.execute(&Event::default()).await.unwrap_err();
        assert!(matches!(err, ActionError::MissingProperties(ref names) if names == &["message"]));
    }

    #[tokio::test]
    async fn test_log_action_template_error() {
        let action = LogAction::new(context("log", &[("message", json!("{{ id | nope }}"))]));
        let err = action.execute(&Event::default()).await.unwrap_err();
        assert!(matches!(err, ActionError::Template(_)));
    }
}
