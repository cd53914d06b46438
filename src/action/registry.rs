//! Registry of action constructors keyed by rule type.
//!
//! The registry is built once at startup and shared read-only afterwards.

use super::{
    Action, ActionContext, EmailAction, GithubCommentAction, LogAction, PowershellAction,
    WebexAction, WebhookAction,
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::debug;

/// Builds an action bound to a rule.
pub type ActionConstructor = Arc<dyn Fn(ActionContext) -> Box<dyn Action> + Send + Sync>;

/// Maps action type names to constructors.
#[derive(Clone, Default)]
pub struct ActionRegistry {
    constructors: HashMap<String, ActionConstructor>,
}

impl ActionRegistry {
    /// Create a new empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding every built-in action; the diagnostic `log` action
    /// only when `load_test_action` is set.
    pub fn builtin(load_test_action: bool) -> Self {
        let mut registry = Self::new();
        registry.register(WebhookAction::NAME, |ctx| Box::new(WebhookAction::new(ctx)));
        registry.register(EmailAction::NAME, |ctx| Box::new(EmailAction::new(ctx)));
        registry.register(WebexAction::NAME, |ctx| Box::new(WebexAction::new(ctx)));
        registry.register(GithubCommentAction::NAME, |ctx| {
            Box::new(GithubCommentAction::new(ctx))
        });
        registry.register(PowershellAction::NAME, |ctx| Box::new(PowershellAction::new(ctx)));

        if load_test_action {
            registry.register(LogAction::NAME, |ctx| Box::new(LogAction::new(ctx)));
        }

        registry
    }

    /// Register a constructor under `type_name`, replacing any previous one
    pub fn register<F>(&mut self, type_name: &str, constructor: F)
    where
        F: Fn(ActionContext) -> Box<dyn Action> + Send + Sync + 'static,
    {
        debug!(action_type = %type_name, "Registering action");
        self.constructors
            .insert(type_name.to_string(), Arc::new(constructor));
    }

    /// Get the constructor for `type_name`
    pub fn lookup(&self, type_name: &str) -> Option<ActionConstructor> {
        self.constructors.get(type_name).cloned()
    }

    /// List all registered action type names, sorted
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.constructors.keys().map(|s| s.as_str()).collect();
        names.sort_unstable();
        names
    }
}

impl fmt::Debug for ActionRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ActionRegistry")
            .field("actions", &self.names())
            .finish()
    }
}
