//! Email Action - SMTP mail with templated subject and body.
//!
//! Port 465 uses implicit TLS; every other port negotiates STARTTLS. The
//! sender address doubles as the SMTP user name.

use super::{Action, ActionContext, ActionError, PropertySpec};
use crate::event::Event;
use async_trait::async_trait;
use lettre::{
    message::Mailbox, transport::smtp::authentication::Credentials, AsyncSmtpTransport,
    AsyncTransport, Message, Tokio1Executor,
};
use std::time::Duration;
use tracing::{debug, info, warn};

const DEFAULT_MAX_RETRIES: u32 = 5;
const RETRY_INTERVAL: Duration = Duration::from_secs(1);
const IMPLICIT_TLS_PORT: u16 = 465;

const PROPERTIES: &[PropertySpec] = &[
    PropertySpec::required("from", "The email address of the sender"),
    PropertySpec::required("password", "The password for the smtp server"),
    PropertySpec::required(
        "to",
        "The email address of the recipient(s). Multiple addresses can be separated by a comma, semicolon, or space",
    ),
    PropertySpec::required("subject", "The subject of the email. Rendered as a template."),
    PropertySpec::required("body", "The body of the email. Rendered as a template."),
    PropertySpec::required("smtpHost", "The smtp server host"),
    PropertySpec::required("smtpPort", "The smtp server port"),
    PropertySpec::optional(
        "maxRetries",
        "The maximum number of times to retry sending the email. Defaults to 5",
    ),
];

/// Split a recipient list on commas, semicolons and whitespace.
pub fn split_addresses(to: &str) -> Vec<String> {
    to.split(|c: char| c == ',' || c == ';' || c.is_whitespace())
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn invalid(name: &str, reason: impl ToString) -> ActionError {
    ActionError::InvalidProperty {
        name: name.to_string(),
        reason: reason.to_string(),
    }
}

/// Resolved settings for one delivery.
#[derive(Debug)]
struct Delivery {
    host: String,
    port: u16,
    from: Mailbox,
    password: String,
    message: Message,
    max_retries: u32,
}

/// An action that sends an email through an SMTP relay.
#[derive(Clone)]
pub struct EmailAction {
    ctx: ActionContext,
}

impl EmailAction {
    pub const NAME: &'static str = "email";

    pub fn new(ctx: ActionContext) -> Self {
        Self { ctx }
    }

    /// Resolve and validate everything before touching the network.
    async fn prepare(&self, event: &Event) -> Result<Delivery, ActionError> {
        let options = self.ctx.template_options(event).await;

        let host = self.ctx.non_empty_string("smtpHost", event).await?;
        let port_raw = self.ctx.non_empty_string("smtpPort", event).await?;
        let port: u16 = port_raw.trim().parse().map_err(|e| {
            invalid("smtpPort", format!("'{}' is not a valid port: {}", port_raw, e))
        })?;
        let max_retries = self
            .ctx
            .number_or("maxRetries", event, DEFAULT_MAX_RETRIES)
            .await?;

        let from_raw = self.ctx.non_empty_string("from", event).await?;
        let from: Mailbox = from_raw.trim().parse().map_err(|e| invalid("from", e))?;

        let recipients = split_addresses(&self.ctx.non_empty_string("to", event).await?);
        if recipients.is_empty() {
            return Err(ActionError::EmptyProperty("to".to_string()));
        }

        let password = self.ctx.non_empty_string("password", event).await?;
        let subject = self.ctx.rendered("subject", event, &options).await?;
        let body = self.ctx.rendered("body", event, &options).await?;
        if body.trim().is_empty() {
            return Err(ActionError::EmptyProperty("body".to_string()));
        }

        let mut builder = Message::builder().from(from.clone());
        for recipient in &recipients {
            let mailbox: Mailbox = recipient.parse().map_err(|e| invalid("to", e))?;
            builder = builder.to(mailbox);
        }
        let message = builder
            .subject(subject)
            .body(body)
            .map_err(|e| ActionError::Failed(format!("failed to build the email: {}", e)))?;

        Ok(Delivery {
            host,
            port,
            from,
            password,
            message,
            max_retries,
        })
    }
}

#[async_trait]
impl Action for EmailAction {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Sends an email to the specified recipient(s) using the supplied smtp server and credentials"
    }

    fn properties(&self) -> &[PropertySpec] {
        PROPERTIES
    }

    async fn execute(&self, event: &Event) -> Result<(), ActionError> {
        self.ctx.check_required(PROPERTIES)?;
        let delivery = self.prepare(event).await?;

        let builder = if delivery.port == IMPLICIT_TLS_PORT {
            AsyncSmtpTransport::<Tokio1Executor>::relay(&delivery.host)
        } else {
            AsyncSmtpTransport::<Tokio1Executor>::starttls_relay(&delivery.host)
        }
        .map_err(|e| invalid("smtpHost", e))?;

        let transport = builder
            .port(delivery.port)
            .credentials(Credentials::new(
                delivery.from.email.to_string(),
                delivery.password.clone(),
            ))
            .build();

        debug!(host = %delivery.host, port = delivery.port, "Sending email");

        let mut attempt = 0;
        loop {
            match transport.send(delivery.message.clone()).await {
                Ok(_) => {
                    info!(
                        host = %delivery.host,
                        from = %delivery.from,
                        "Email sent"
                    );
                    return Ok(());
                }
                Err(e) if attempt < delivery.max_retries => {
                    warn!(error = %e, attempt, "Failed to send email, will retry");
                    attempt += 1;
                    tokio::time::sleep(RETRY_INTERVAL).await;
                }
                Err(e) => {
                    return Err(ActionError::Failed(format!(
                        "failed to send the email after {} attempts: {}",
                        attempt + 1,
                        e
                    )));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::test_support::context;
    use serde_json::{json, Value};

    fn properties() -> Vec<(&'static str, Value)> {
        vec![
            ("from", json!("reactor@example.com")),
            ("password", json!("hunter2")),
            ("to", json!("a@example.com; b@example.com")),
            ("subject", json!("PR {{ data.number }}")),
            ("body", json!("opened by {{ data.user }}")),
            ("smtpHost", json!("smtp.example.com")),
            ("smtpPort", json!("587")),
        ]
    }

    fn event() -> Event {
        Event::from_value(json!({"number": 7, "user": "octocat"}))
    }

    fn with(overrides: &[(&'static str, Value)]) -> EmailAction {
        let mut props = properties();
        for (name, value) in overrides {
            props.retain(|(n, _)| n != name);
            props.push((*name, value.clone()));
        }
        EmailAction::new(context("email", &props))
    }

    #[test]
    fn test_split_addresses() {
        assert_eq!(
            split_addresses("a@x.com,b@x.com; c@x.com  d@x.com"),
            vec!["a@x.com", "b@x.com", "c@x.com", "d@x.com"]
        );
        assert!(split_addresses(" ;, ").is_empty());
    }

    #[tokio::test]
    async fn test_prepare_renders_message() {
        let delivery = with(&[]).prepare(&event()).await.unwrap();
        assert_eq!(delivery.host, "smtp.example.com");
        assert_eq!(delivery.port, 587);
        assert_eq!(delivery.max_retries, DEFAULT_MAX_RETRIES);

        let raw = String::from_utf8(delivery.message.formatted()).unwrap();
        assert!(raw.contains("Subject: PR 7"));
        assert!(raw.contains("opened by octocat"));
        assert!(raw.contains("a@example.com"));
        assert!(raw.contains("b@example.com"));
    }

    #[tokio::test]
    async fn test_missing_properties() {
        let action = EmailAction::new(context("email", &[("from", json!("a@b.com"))]));
        let err = action.execute(&event()).await.unwrap_err();
        match err {
            ActionError::MissingProperties(names) => {
                assert!(names.contains(&"smtpHost".to_string()));
                assert!(!names.contains(&"from".to_string()));
                assert!(!names.contains(&"maxRetries".to_string()));
            }
            other => panic!("unexpected error: {}", other),
        }
    }

    #[tokio::test]
    async fn test_invalid_port() {
        let err = with(&[("smtpPort", json!("smtp"))])
            .execute(&event())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidProperty { ref name, .. } if name == "smtpPort"));
    }

    #[tokio::test]
    async fn test_invalid_recipient() {
        let err = with(&[("to", json!("not-an-address"))])
            .prepare(&event())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::InvalidProperty { ref name, .. } if name == "to"));
    }

    #[tokio::test]
    async fn test_empty_body() {
        let err = with(&[("body", json!("  "))])
            .prepare(&event())
            .await
            .unwrap_err();
        assert!(matches!(err, ActionError::EmptyProperty(ref name) if name == "body"));
    }
}
