//! Event Dispatcher - runs every matching rule's action for one event.
//!
//! # Flow
//!
//! ```text
//! Event ──► for each rule (configured order)
//!             │
//!             ├─ matcher error ─────────► FailureDetail "match-message"
//!             ├─ no match ──────────────► skipped
//!             ├─ unknown type ──────────► FailureDetail "exists"
//!             └─ match ─► spawn action ─┐
//!                                       │ (all run concurrently)
//!           join in rule order ◄────────┘
//!             └─ error && failOnError ──► FailureDetail "<type>-execute-reactor"
//! ```
//!
//! Rule failures are isolated: one failing, panicking or slow action never
//! cancels its siblings. Without an action timeout a slow action holds the
//! whole dispatch until it finishes.
//!
//! # Example
//!
//! ```rust,ignore
//! use event_reactor::{ActionRegistry, Dispatcher, PropertyResolver};
//! use std::sync::Arc;
//! use std::time::Duration;
//!
//! let dispatcher = Dispatcher::new(Arc::new(ActionRegistry::builtin(false)), resolver)
//!     .with_action_timeout(Duration::from_secs(30));
//!
//! let failures = dispatcher.dispatch("/api/v1/pubsub", Arc::new(event), &rules).await;
//! ```

use crate::action::{Action, ActionContext, ActionError, ActionRegistry};
use crate::config::Rule;
use crate::event::Event;
use crate::failure::FailureDetail;
use crate::matcher::{self, MatchFn};
use crate::property::PropertyResolver;
use crate::template::TemplateRenderer;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Failure type when a rule's filter cannot be evaluated (strict mode only)
pub const MATCH_FAILURE: &str = "match-message";

/// Failure type when a rule names an action type that is not registered
pub const EXISTS_FAILURE: &str = "exists";

/// Outcome of the synchronous part of dispatch for one rule.
enum Pending {
    Failed(FailureDetail),
    Running {
        rule: Arc<Rule>,
        handle: JoinHandle<Result<(), ActionError>>,
    },
}

/// Dispatches events to the actions of matching rules.
///
/// Cheap to share behind an `Arc`; the registry is read-only and the rule set
/// is passed to every call, so a reload never affects a dispatch in flight.
#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<ActionRegistry>,
    resolver: PropertyResolver,
    http: reqwest::Client,
    templates: TemplateRenderer,
    action_timeout: Option<Duration>,
    strict_filters: bool,
}

impl Dispatcher {
    /// Create a dispatcher with no action timeout and lenient filters.
    pub fn new(registry: Arc<ActionRegistry>, resolver: PropertyResolver) -> Self {
        Self {
            registry,
            resolver,
            http: reqwest::Client::new(),
            templates: TemplateRenderer::new(),
            action_timeout: None,
            strict_filters: false,
        }
    }

    /// Fail actions that run longer than `timeout`
    pub fn with_action_timeout(mut self, timeout: Duration) -> Self {
        self.action_timeout = Some(timeout);
        self
    }

    /// Report filter errors as failures instead of treating them as no match
    pub fn with_strict_filters(mut self, strict: bool) -> Self {
        self.strict_filters = strict;
        self
    }

    /// Use a specific HTTP client for actions
    pub fn with_http_client(mut self, client: reqwest::Client) -> Self {
        self.http = client;
        self
    }

    pub fn registry(&self) -> &ActionRegistry {
        &self.registry
    }

    pub fn action_timeout(&self) -> Option<Duration> {
        self.action_timeout
    }

    /// Dispatch `event` against `rules`.
    ///
    /// Returns one [`FailureDetail`] per failing rule, in rule order, once
    /// every spawned action has finished. `instance` identifies the endpoint
    /// that received the event.
    pub async fn dispatch(
        &self,
        instance: &str,
        event: Arc<Event>,
        rules: &[Arc<Rule>],
    ) -> Vec<FailureDetail> {
        if rules.is_empty() {
            warn!(instance = %instance, "No rules configured");
            return Vec::new();
        }

        let matches: MatchFn = if self.strict_filters {
            matcher::matches_strict
        } else {
            matcher::matches
        };

        let mut pending = Vec::with_capacity(rules.len());

        for rule in rules {
            match matches(rule, &event) {
                Ok(true) => {}
                Ok(false) => {
                    debug!(rule = %rule.name, "Rule does not match event");
                    continue;
                }
                Err(e) => {
                    error!(rule = %rule.name, error = %e, "Failed to match event");
                    pending.push(Pending::Failed(FailureDetail::new(
                        MATCH_FAILURE,
                        "Match Message",
                        e.to_string(),
                        instance,
                    )));
                    continue;
                }
            }

            let Some(constructor) = self.registry.lookup(&rule.kind) else {
                let detail = format!(
                    "reactor type of '{}' does not exist. Verify the reactor type of '{}' within the configuration",
                    rule.kind, rule.name
                );
                error!(rule = %rule.name, action_type = %rule.kind, "{}", detail);
                pending.push(Pending::Failed(FailureDetail::new(
                    EXISTS_FAILURE,
                    "Exists",
                    detail,
                    instance,
                )));
                continue;
            };

            let span = info_span!("action", rule = %rule.name, action_type = %rule.kind);
            let action = constructor(ActionContext {
                rule: Arc::clone(rule),
                span: span.clone(),
                resolver: self.resolver.clone(),
                http: self.http.clone(),
                templates: self.templates,
            });

            debug!(rule = %rule.name, action = %action.name(), "Executing action");
            let handle = tokio::spawn(
                run(action, Arc::clone(&event), self.action_timeout).instrument(span),
            );
            pending.push(Pending::Running {
                rule: Arc::clone(rule),
                handle,
            });
        }

        let mut failures = Vec::new();
        for entry in pending {
            match entry {
                Pending::Failed(failure) => failures.push(failure),
                Pending::Running { rule, handle } => {
                    let outcome = handle.await.unwrap_or_else(|e| {
                        Err(ActionError::Failed(format!("action task failed: {}", e)))
                    });
                    if let Some(failure) = execution_failure(&rule, outcome, instance) {
                        failures.push(failure);
                    }
                }
            }
        }

        info!(
            instance = %instance,
            event_id = %event.id,
            rules = rules.len(),
            failures = failures.len(),
            "Dispatch complete"
        );

        failures
    }
}

async fn run(
    action: Box<dyn Action>,
    event: Arc<Event>,
    timeout: Option<Duration>,
) -> Result<(), ActionError> {
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, action.execute(&event)).await {
            Ok(result) => result,
            Err(_) => Err(ActionError::Timeout(limit.as_millis() as u64)),
        },
        None => action.execute(&event).await,
    }
}

/// Fold an action outcome into an optional failure per the rule's policy.
fn execution_failure(
    rule: &Rule,
    outcome: Result<(), ActionError>,
    instance: &str,
) -> Option<FailureDetail> {
    let err = match outcome {
        Ok(()) => {
            debug!(rule = %rule.name, action_type = %rule.kind, "Action completed");
            return None;
        }
        Err(err) => err,
    };

    if !rule.should_fail_on_error() {
        warn!(
            rule = %rule.name,
            action_type = %rule.kind,
            error = %err,
            "Action failed, failOnError is false so the failure is not reported"
        );
        return None;
    }

    error!(rule = %rule.name, action_type = %rule.kind, error = %err, "Action failed");
    Some(FailureDetail::new(
        format!("{}-execute-reactor", rule.kind),
        format!("{} Execute Reactor", rule.kind),
        err.to_string(),
        instance,
    ))
}
