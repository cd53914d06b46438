//! Webex Action - posts a message, optionally with an adaptive card, to a
//! Webex space.

use super::http::send_with_retries;
use super::{Action, ActionContext, ActionError, PropertySpec};
use crate::event::Event;
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::info;

/// Messages endpoint used when `apiUrl` is not configured
pub const DEFAULT_API_URL: &str = "https://api.ciscospark.com/v1/messages";

const ADAPTIVE_CARD_CONTENT_TYPE: &str = "application/vnd.microsoft.card.adaptive";
const EMPTY_MESSAGE: &str = "empty message";
const MAX_RETRIES: u32 = 3;

const PROPERTIES: &[PropertySpec] = &[
    PropertySpec::optional("apiUrl", "The Webex messages endpoint. Defaults to https://api.ciscospark.com/v1/messages"),
    PropertySpec::required(
        "token",
        "The webex token to use for authentication. It must be allowed to write messages to the space.",
    ),
    PropertySpec::required("spaceId", "The space to send the message to"),
    PropertySpec::optional("message", "Markdown message to send. Rendered as a template."),
    PropertySpec::optional(
        "card",
        "Adaptive card JSON sent as an attachment. Rendered as a template.",
    ),
];

/// An action that sends a message to a Webex space.
#[derive(Clone)]
pub struct WebexAction {
    ctx: ActionContext,
}

impl WebexAction {
    pub const NAME: &'static str = "webex";

    pub fn new(ctx: ActionContext) -> Self {
        Self { ctx }
    }
}

/// Request body for the messages API.
fn message_body(space_id: &str, markdown: &str, card: Option<Value>) -> Value {
    let mut body = json!({
        "roomId": space_id,
        "markdown": markdown,
    });
    if let Some(card) = card {
        body["attachments"] = json!([{
            "contentType": ADAPTIVE_CARD_CONTENT_TYPE,
            "content": card,
        }]);
    }
    body
}

#[async_trait]
impl Action for WebexAction {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn description(&self) -> &str {
        "Sends a message to a Webex space"
    }

    fn properties(&self) -> &[PropertySpec] {
        PROPERTIES
    }

    async fn execute(&self, event: &Event) -> Result<(), ActionError> {
        self.ctx.check_required(PROPERTIES)?;
        let options = self.ctx.template_options(event).await;

        let token = self.ctx.non_empty_string("token", event).await?;
        let space_id = self.ctx.non_empty_string("spaceId", event).await?;

        let mut message = self.ctx.rendered("message", event, &options).await?;
        if message.is_empty() {
            message = EMPTY_MESSAGE.to_string();
        }

        let card = self.ctx.rendered("card", event, &options).await?;
        let card = if card.trim().is_empty() {
            None
        } else {
            Some(serde_json::from_str::<Value>(&card).map_err(|e| {
                ActionError::InvalidProperty {
                    name: "card".to_string(),
                    reason: format!("the rendered card is not valid JSON: {}", e),
                }
            })?)
        };

        let mut api_url = self.ctx.string("apiUrl", event).await?;
        if api_url.is_empty() {
            api_url = DEFAULT_API_URL.to_string();
        }

        let with_card = card.is_some();
        let request = self
            .ctx
            .http
            .post(&api_url)
            .bearer_auth(&token)
            .json(&message_body(&space_id, &message, card));

        send_with_retries(request, &api_url, MAX_RETRIES).await?;
        info!(space_id = %space_id, with_card, "Webex message sent");
        Ok(())
    }
}
