//! HTTP surface.
//!
//! | Route                  | Purpose                                        |
//! |------------------------|------------------------------------------------|
//! | `GET /healthz`         | liveness                                       |
//! | `GET /readyz`          | readiness                                      |
//! | `GET /metrics`         | JSON counters                                  |
//! | `ANY /echo`            | echoes the request, handy as a webhook target  |
//! | `POST /api/v1/{path}`  | normalise the body and dispatch it             |
//!
//! A dispatch with no failures answers `200` with an empty body. Otherwise the
//! body is the JSON array of [`FailureDetail`] records with status `400`,
//! or `200` when `alwaysReturn200` is set.

use crate::config::ServerConfig;
use crate::dispatcher::Dispatcher;
use crate::failure::FailureDetail;
use crate::listener::ListenerSet;
use crate::reload::ConfigStore;
use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{header::HeaderName, HeaderMap, HeaderValue, Method, StatusCode, Uri},
    response::{IntoResponse, Json, Response},
    routing::{any, get, post},
    Router,
};
use serde_json::{json, Map, Value};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Header carrying the request id, read from the request when present
pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Application metrics
#[derive(Debug)]
pub struct Metrics {
    events_received: AtomicU64,
    dispatch_failures: AtomicU64,
    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            events_received: AtomicU64::new(0),
            dispatch_failures: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    fn increment_events(&self) {
        self.events_received.fetch_add(1, Ordering::Relaxed);
    }

    fn add_failures(&self, count: usize) {
        self.dispatch_failures
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn events_received(&self) -> u64 {
        self.events_received.load(Ordering::Relaxed)
    }

    pub fn dispatch_failures(&self) -> u64 {
        self.dispatch_failures.load(Ordering::Relaxed)
    }

    fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared state of the HTTP handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ConfigStore>,
    pub dispatcher: Arc<Dispatcher>,
    pub listeners: Arc<ListenerSet>,
    pub metrics: Arc<Metrics>,
}

impl AppState {
    pub fn new(config: Arc<ConfigStore>, dispatcher: Dispatcher, listeners: ListenerSet) -> Self {
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            listeners: Arc::new(listeners),
            metrics: Arc::new(Metrics::new()),
        }
    }
}

/// Build the router
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(health_check))
        .route("/readyz", get(health_check))
        .route("/metrics", get(get_metrics))
        .route("/echo", any(echo))
        .route("/api/v1/:listener", post(execute_listener))
        .with_state(Arc::new(state))
}

async fn health_check() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Get metrics endpoint - returns server metrics as JSON
async fn get_metrics(State(state): State<Arc<AppState>>) -> Json<Value> {
    let uptime = state.metrics.uptime_seconds();
    let config = state.config.snapshot();

    let uptime_str = if uptime < 60 {
        format!("{}s", uptime)
    } else if uptime < 3600 {
        format!("{}m {}s", uptime / 60, uptime % 60)
    } else {
        format!("{}h {}m {}s", uptime / 3600, (uptime % 3600) / 60, uptime % 60)
    };

    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_seconds": uptime,
        "uptime": uptime_str,
        "events": {
            "received": state.metrics.events_received(),
            "dispatch_failures": state.metrics.dispatch_failures(),
        },
        "rules": config.reactor_configs.len(),
        "actions": state.dispatcher.registry().names(),
        "status": "running"
    }))
}

async fn echo(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Json<Value> {
    let headers: Map<String, Value> = headers
        .iter()
        .map(|(name, value)| {
            (
                name.to_string(),
                Value::String(String::from_utf8_lossy(value.as_bytes()).into_owned()),
            )
        })
        .collect();

    let body = serde_json::from_slice::<Value>(&body)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&body).into_owned()));

    debug!(method = %method, path = %uri.path(), "Echo request");
    Json(json!({
        "method": method.as_str(),
        "path": uri.path(),
        "headers": headers,
        "body": body,
    }))
}

async fn execute_listener(
    State(state): State<Arc<AppState>>,
    Path(listener_path): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = headers
        .get(REQUEST_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

    // One snapshot for the whole request
    let config = state.config.snapshot();

    let trace = config
        .trace_header_key
        .as_deref()
        .filter(|key| !key.is_empty())
        .and_then(|key| headers.get(key))
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let span = info_span!(
        "request",
        request_id = %request_id,
        listener = %listener_path,
        trace = %trace
    );

    let mut response = handle(&state, &config, &listener_path, body)
        .instrument(span)
        .await;

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response
            .headers_mut()
            .insert(HeaderName::from_static(REQUEST_ID_HEADER), value);
    }
    response
}

async fn handle(state: &AppState, config: &ServerConfig, listener_path: &str, body: Bytes) -> Response {
    let Some(listener) = state.listeners.get(listener_path) else {
        warn!("Unknown listener");
        let failure = FailureDetail::new(
            "unknown-listener",
            "Unknown Listener",
            format!(
                "no listener is registered for '{}'. Known listeners: {}",
                listener_path,
                state.listeners.paths().join(", ")
            ),
            listener_path,
        )
        .with_status(StatusCode::NOT_FOUND.as_u16());
        return (StatusCode::NOT_FOUND, Json(vec![failure])).into_response();
    };

    debug!(listener = %listener.name(), "Executing listener");

    if body.is_empty() {
        let message = "request body was empty, request cannot be processed";
        error!("{}", message);
        let failure = FailureDetail::new(
            format!("{}-get-request-body", listener.name()),
            format!("{} Get Request Body", listener.name()),
            message,
            listener.api_path(),
        );
        return failure_response(config, vec![failure]);
    }

    state.metrics.increment_events();

    if config.log_raw_payload {
        info!(payload = %String::from_utf8_lossy(&body), "Raw payload");
    }

    let event = match listener.parse_payload(&body) {
        Ok(event) => event,
        Err(failure) => {
            error!(failure_type = %failure.kind, "{}", failure.detail);
            return failure_response(config, vec![failure]);
        }
    };

    if config.log_event_data_payload {
        let data = Value::Object(event.data.clone());
        info!(
            event_id = %event.id,
            data = %data,
            attributes = ?event.attributes,
            "Event payload"
        );
    }

    let failures = state
        .dispatcher
        .dispatch(listener.api_path(), Arc::new(event), &config.reactor_configs)
        .await;

    if failures.is_empty() {
        return StatusCode::OK.into_response();
    }

    state.metrics.add_failures(failures.len());
    failure_response(config, failures)
}

/// Failures as a JSON array. The status comes from the first failure unless
/// `alwaysReturn200` is set.
fn failure_response(config: &ServerConfig, failures: Vec<FailureDetail>) -> Response {
    let status = failures
        .first()
        .and_then(|f| StatusCode::from_u16(f.status).ok())
        .unwrap_or(StatusCode::BAD_REQUEST);

    let status = if config.always_return_200 {
        warn!(
            failures = failures.len(),
            "At least one error occurred however the server is configured to always return 200"
        );
        StatusCode::OK
    } else {
        status
    };

    (status, Json(failures)).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::ActionRegistry;
    use crate::config::ConfigFormat;
    use crate::property::PropertyResolver;
    use crate::secrets::MemorySecretStore;
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use tower::ServiceExt;

    const PUBSUB_BODY: &str =
        r#"{"message":{"data":"eyJ0ZXN0IjoxMjN9","messageId":"1","attributes":{"a":"b"}}}"#;

    fn state(config: &str) -> AppState {
        let config = ServerConfig::parse(config, Some(ConfigFormat::Json)).unwrap();
        let dispatcher = Dispatcher::new(
            Arc::new(ActionRegistry::builtin(true)),
            PropertyResolver::new(Arc::new(MemorySecretStore::new())),
        );
        AppState::new(
            Arc::new(ConfigStore::new(config)),
            dispatcher,
            ListenerSet::builtin(),
        )
    }

    fn log_rule_config() -> &'static str {
        r#"{
            "reactorConfigs": [{
                "name": "trace",
                "type": "log",
                "filterExpression": "data.test == 123 && attributes.a == 'b'",
                "properties": {"message": {"value": "got {{ id }}"}}
            }]
        }"#
    }

    async fn post(app: Router, path: &str, body: &str) -> (StatusCode, HeaderMap, Vec<u8>) {
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri(path)
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, headers, bytes.to_vec())
    }

    fn failures(body: &[u8]) -> Vec<FailureDetail> {
        serde_json::from_slice(body).unwrap()
    }

    #[tokio::test]
    async fn test_health() {
        let app = router(state("{}"));
        for path in ["/healthz", "/readyz"] {
            let response = app
                .clone()
                .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
                .await
                .unwrap();
            assert_eq!(response.status(), StatusCode::OK);
            let body = response.into_body().collect().await.unwrap().to_bytes();
            assert_eq!(serde_json::from_slice::<Value>(&body).unwrap(), json!({"status": "ok"}));
        }
    }

    #[tokio::test]
    async fn test_pubsub_success_is_empty_200() {
        let state = state(log_rule_config());
        let metrics = Arc::clone(&state.metrics);

        let (status, headers, body) = post(router(state), "/api/v1/pubsub", PUBSUB_BODY).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
        assert!(headers.contains_key(REQUEST_ID_HEADER));
        assert_eq!(metrics.events_received(), 1);
        assert_eq!(metrics.dispatch_failures(), 0);
    }

    #[tokio::test]
    async fn test_request_id_is_propagated() {
        let app = router(state(log_rule_config()));
        let response = app
            .oneshot(
                Request::builder()
                    .method("POST")
                    .uri("/api/v1/generic")
                    .header(REQUEST_ID_HEADER, "req-42")
                    .body(Body::from(r#"{"test": 123}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.headers()[REQUEST_ID_HEADER], "req-42");
    }

    #[tokio::test]
    async fn test_payload_logging_flags() {
        let config = r#"{
            "logRawPayload": true,
            "logEventDataPayload": true,
            "reactorConfigs": [{"name": "fine", "type": "log", "properties": {"message": {"value": "ok"}}}]
        }"#;

        let (status, _, body) = post(router(state(config)), "/api/v1/pubsub", PUBSUB_BODY).await;

        assert_eq!(status, StatusCode::OK);
        assert!(body.is_empty());
    }

    #[tokio::test]
    async fn test_empty_body() {
        let (status, _, body) = post(router(state("{}")), "/api/v1/pubsub", "").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let failures = failures(&body);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, "pub/sub-get-request-body");
        assert_eq!(failures[0].instance, "pubsub");
    }

    #[tokio::test]
    async fn test_unknown_listener() {
        let (status, _, body) = post(router(state("{}")), "/api/v1/kafka", "{}").await;

        assert_eq!(status, StatusCode::NOT_FOUND);
        let failures = failures(&body);
        assert_eq!(failures[0].kind, "unknown-listener");
        assert_eq!(failures[0].status, 404);
    }

    #[tokio::test]
    async fn test_malformed_payload() {
        let (status, _, body) = post(router(state("{}")), "/api/v1/pubsub", "not json").await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(failures(&body)[0].kind, "unmarshal-body-data");
    }

    #[tokio::test]
    async fn test_dispatch_failures_are_returned() {
        let config = r#"{"reactorConfigs": [
            {"name": "mystery", "type": "unknown-type"},
            {"name": "fine", "type": "log", "properties": {"message": {"value": "ok"}}}
        ]}"#;
        let state = state(config);
        let metrics = Arc::clone(&state.metrics);

        let (status, _, body) = post(router(state), "/api/v1/generic", r#"{"x": 1}"#).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        let failures = failures(&body);
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].kind, "exists");
        assert_eq!(failures[0].instance, "generic");
        assert_eq!(metrics.dispatch_failures(), 1);
    }

    #[tokio::test]
    async fn test_always_return_200() {
        let config = r#"{
            "alwaysReturn200": true,
            "reactorConfigs": [{"name": "mystery", "type": "unknown-type"}]
        }"#;

        let (status, _, body) = post(router(state(config)), "/api/v1/generic", r#"{"x": 1}"#).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(failures(&body)[0].kind, "exists");
    }

    #[tokio::test]
    async fn test_reload_is_seen_by_next_request() {
        let state = state("{}");
        let store = Arc::clone(&state.config);
        let app = router(state);

        let (status, _, _) = post(app.clone(), "/api/v1/generic", r#"{"x": 1}"#).await;
        assert_eq!(status, StatusCode::OK);

        store.replace(
            ServerConfig::parse(
                r#"{"reactorConfigs": [{"name": "mystery", "type": "unknown-type"}]}"#,
                None,
            )
            .unwrap(),
        );

        let (status, _, _) = post(app, "/api/v1/generic", r#"{"x": 1}"#).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_echo() {
        let app = router(state("{}"));
        let response = app
            .oneshot(
                Request::builder()
                    .method("PUT")
                    .uri("/echo")
                    .header("x-custom", "yes")
                    .body(Body::from(r#"{"a": 1}"#))
                    .unwrap(),
            )
            .await
            .unwrap();

        let body = response.into_body().collect().await.unwrap().to_bytes();
        let echoed: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(echoed["method"], "PUT");
        assert_eq!(echoed["path"], "/echo");
        assert_eq!(echoed["headers"]["x-custom"], "yes");
        assert_eq!(echoed["body"], json!({"a": 1}));
    }

    #[tokio::test]
    async fn test_metrics() {
        let app = router(state(log_rule_config()));
        post(app.clone(), "/api/v1/pubsub", PUBSUB_BODY).await;

        let response = app
            .oneshot(Request::builder().uri("/metrics").body(Body::empty()).unwrap())
            .await
            .unwrap();
        let body = response.into_body().collect().await.unwrap().to_bytes();
        let metrics: Value = serde_json::from_slice(&body).unwrap();

        assert_eq!(metrics["events"]["received"], 1);
        assert_eq!(metrics["rules"], 1);
        assert_eq!(metrics["status"], "running");
    }
}
