//! HTTP delivery shared by the network-bound actions.
//!
//! Requests are retried on transport errors and 5xx responses with an
//! exponential backoff. Any other non-2xx response fails immediately with the
//! URL, status and response body in the error.

use super::ActionError;
use reqwest::{RequestBuilder, StatusCode};
use std::time::Duration;
use tracing::{debug, warn};

/// Timeout applied to each individual attempt
pub(crate) const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

const BASE_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Successful response.
#[derive(Debug)]
pub(crate) struct Delivered {
    pub status: StatusCode,
    pub body: String,
}

fn backoff(attempt: u32) -> Duration {
    BASE_BACKOFF
        .checked_mul(1u32 << attempt.min(16))
        .map_or(MAX_BACKOFF, |d| d.min(MAX_BACKOFF))
}

/// Error message for a response outside the 2xx range.
pub(crate) fn status_error(url: &str, status: StatusCode, body: &str) -> ActionError {
    ActionError::Failed(format!(
        "http request failed with status code {}\n\n  URL: {}\n\n{}",
        status.as_u16(),
        url,
        body
    ))
}

/// Send `request`, retrying up to `max_retries` times.
pub(crate) async fn send_with_retries(
    request: RequestBuilder,
    url: &str,
    max_retries: u32,
) -> Result<Delivered, ActionError> {
    let request = request.timeout(REQUEST_TIMEOUT);
    let mut attempt = 0;

    loop {
        if attempt > 0 {
            debug!(attempt, max_retries, url = %url, "Retrying request");
            tokio::time::sleep(backoff(attempt - 1)).await;
        }

        // Bodies are always buffered, so cloning only fails for streams.
        let Some(current) = request.try_clone() else {
            return deliver_once(request, url).await;
        };

        match current.send().await {
            Ok(response) => {
                let status = response.status();
                let body = response.text().await.unwrap_or_default();

                if status.is_success() {
                    return Ok(Delivered { status, body });
                }

                if !status.is_server_error() || attempt >= max_retries {
                    return Err(status_error(url, status, &body));
                }

                warn!(status = %status, url = %url, attempt, "Server error, will retry");
            }
            Err(e) => {
                if attempt >= max_retries || e.is_builder() {
                    return Err(ActionError::Http(e));
                }
                warn!(error = %e, url = %url, attempt, "Request failed, will retry");
            }
        }

        attempt += 1;
    }
}

async fn deliver_once(request: RequestBuilder, url: &str) -> Result<Delivered, ActionError> {
    let response = request.send().await?;
    let status = response.status();
    let body = response.text().await?;
    if status.is_success() {
        Ok(Delivered { status, body })
    } else {
        Err(status_error(url, status, &body))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        assert_eq!(backoff(0), Duration::from_millis(100));
        assert_eq!(backoff(1), Duration::from_millis(200));
        assert_eq!(backoff(3), Duration::from_millis(800));
        assert_eq!(backoff(30), MAX_BACKOFF);
    }

    #[tokio::test]
    async fn test_retries_server_errors() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(503)
            .expect(2)
            .create_async()
            .await;

        let url = format!("{}/hook", server.url());
        let err = send_with_retries(reqwest::Client::new().post(&url), &url, 1)
            .await
            .unwrap_err();

        mock.assert_async().await;
        assert!(err.to_string().contains("status code 503"));
    }

    #[tokio::test]
    async fn test_client_error_is_not_retried() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/hook")
            .with_status(404)
            .with_body("no such hook")
            .expect(1)
            .create_async()
            .await;

        let url = format!("{}/hook", server.url());
        let err = send_with_retries(reqwest::Client::new().post(&url), &url, 3)
            .await
            .unwrap_err();

        mock.assert_async().await;
        let message = err.to_string();
        assert!(message.contains("404"));
        assert!(message.contains(&url));
        assert!(message.contains("no such hook"));
    }

    #[tokio::test]
    async fn test_success_returns_body() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/ok")
            .with_status(201)
            .with_body("created")
            .create_async()
            .await;

        let url = format!("{}/ok", server.url());
        let delivered = send_with_retries(reqwest::Client::new().get(&url), &url, 0)
            .await
            .unwrap();
        assert_eq!(delivered.status, StatusCode::CREATED);
        assert_eq!(delivered.body, "created");
    }
}
