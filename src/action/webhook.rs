//! Webhook Action - signed HTTP POST to external URLs.
//!
//! The [`WebhookAction`] posts the event (or a rendered body) to a URL. When a
//! `webhookSecret` is configured the body is signed with HMAC-SHA256 and the
//! hex digest is sent in the signature header, so receivers can verify the
//! delivery came from the reactor and was not tampered with.
//!
//! # Example
//!
//! ```yaml
//! - name: notify-ci
//!   type: webhook
//!   properties:
//!     url:
//!       value: https://ci.example.com/hooks/{{ attributes.repo }}
//!     webhookSecret:
//!       valueFrom:
//!         secretKeyRef: { projectId: ci, name: hook-secret }
//!     bodyTemplate:
//!       value: '{"ref": "{{ data.ref }}"}'
//!     additionalHeaders:
//!       value:
//!         X-Event-Id: "{{ id }}"
//! ```

use super::http::send_with_retries;
use super::{Action, ActionContext, ActionError, PropertyKind, PropertySpec};
use crate::event::Event;
use crate::template::TemplateOptions;
use async_trait::async_trait;
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, info};

/// Header carrying the body signature when none is configured
pub const DEFAULT_SIGNATURE_HEADER: &str = "X-Event-Reactor-Signature";

const DEFAULT_MAX_RETRIES: u32 = 4;

const PROPERTIES: &[PropertySpec] = &[
    PropertySpec::required("url", "The url to send the webhook to. Rendered as a template."),
    PropertySpec::optional(
        "webhookSecret",
        "Secret used to sign the body with HMAC-SHA256 so receivers can verify the delivery",
    ),
    PropertySpec::optional(
        "bodyTemplate",
        "Body to send, rendered as a template. Defaults to the JSON encoded event.",
    ),
    PropertySpec::optional("bearerToken", "Token sent in the Authorization header"),
    PropertySpec::optional(
        "signatureHeader",
        "Header carrying the signature. Defaults to X-Event-Reactor-Signature.",
    ),
    PropertySpec::optional(
        "additionalHeaders",
        "Extra headers to send. Values are rendered as templates.",
    )
    .of_kind(PropertyKind::StringMap),
    PropertySpec::optional("maxRetries", "Retries on server errors. Defaults to 4."),
];

type HmacSha256 = Hmac<Sha256>;

/// Hex encoded HMAC-SHA256 of `body` keyed with `secret`.
pub fn sign_body(secret: &[u8], body: &[u8]) -> Result<String, ActionError> {
    let mut mac = HmacSha256::new_from_slice(secret)
        .map_err(|e| ActionError::Failed(format!("invalid webhook secret: {}", e)))?;
    mac.update(body);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// An action that sends the event to an HTTP endpoint.
#[derive(Clone)]
pub struct WebhookAction {
    ctx: ActionContext,
}

impl WebhookAction {
    pub const NAME: &'static str = "webhook";

    pub fn new(ctx: ActionContext) -> Self {
        Self { ctx }
    }

    async fn body(&self, event: &Event, options: &TemplateOptions) -> Result<String, ActionError> {
        let template = self.ctx.string("bodyTemplate", event).await?;
        if template.is_empty() {
            return Ok(serde_json::to_string(event)?);
        }
        Ok(self
            .ctx
            .templates
            .render("bodyTemplate", &template, event, options)?)
    }
}

#[async_trait]
impl Action for WebhookAction {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Sends a webhook to a specified URL. The payload of the webhook is the event data."
    }

    fn properties(&self) -> &[PropertySpec] {
        PROPERTIES
    }

    async fn execute(&self, event: &Event) -> Result<(), ActionError> {
        self.ctx.check_required(PROPERTIES)?;
        let options = self.ctx.template_options(event).await;

        let url = self.ctx.rendered("url", event, &options).await?;
        if url.trim().is_empty() {
            return Err(ActionError::EmptyProperty("url".to_string()));
        }

        let body = self.body(event, &options).await?;
        let secret = self.ctx.string("webhookSecret", event).await?;
        let bearer = self.ctx.string("bearerToken", event).await?;
        let mut signature_header = self.ctx.string("signatureHeader", event).await?;
        if signature_header.is_empty() {
            signature_header = DEFAULT_SIGNATURE_HEADER.to_string();
        }
        let headers = self
            .ctx
            .rendered_map("additionalHeaders", event, &options)
            .await?;
        let max_retries = self
            .ctx
            .number_or("maxRetries", event, DEFAULT_MAX_RETRIES)
            .await?;

        let mut request = self.ctx.http.post(&url);
        if !secret.is_empty() {
            request = request.header(
                signature_header.as_str(),
                sign_body(secret.as_bytes(), body.as_bytes())?,
            );
        }
        for (name, value) in &headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if !bearer.is_empty() {
            request = request.bearer_auth(&bearer);
        }

        debug!(url = %url, signed = !secret.is_empty(), "Sending webhook");
        let delivered = send_with_retries(request.body(body), &url, max_retries).await?;

        info!(url = %url, status = %delivered.status, "Webhook delivered");
        Ok(())
    }
}
