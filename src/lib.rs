//! # Event Reactor
//!
//! A rule driven event reactor. Pub/sub push messages and generic webhooks are
//! normalised into one [`Event`] shape, every configured [`Rule`] whose filter
//! matches gets its action run concurrently, and the caller receives the list
//! of failures.
//!
//! ## Architecture
//!
//! ```text
//! HTTP -> Listener -> Event -> Dispatcher -> matcher -> Action (webhook, email, ...)
//!                                   |
//!                                   +-> FailureDetail[] -> HTTP response
//! ```
//!
//! ## Modules
//!
//! - [`event`]: The canonical event
//! - [`listener`]: Payload normalisers (pub/sub, generic)
//! - [`config`]: The rule document
//! - [`expr`] and [`matcher`]: Filter expressions and rule matching
//! - [`property`], [`secrets`] and [`template`]: Action property resolution
//! - [`action`]: The `Action` trait, the registry and built-in actions
//! - [`dispatcher`]: Concurrent fan out of one event to its rules
//! - [`api`]: The HTTP surface
//! - [`reload`]: Hot reload of the rule document
//! - [`shutdown`]: Graceful shutdown coordination

pub mod action;
pub mod api;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod expr;
pub mod failure;
pub mod listener;
pub mod matcher;
pub mod property;
pub mod reload;
pub mod secrets;
pub mod shutdown;
pub mod template;

// Re-export commonly used types at crate root
pub use action::{Action, ActionError, ActionRegistry};
pub use config::{Rule, ServerConfig};
pub use dispatcher::Dispatcher;
pub use event::Event;
pub use expr::Expression;
pub use failure::FailureDetail;
pub use listener::ListenerSet;
pub use property::PropertyResolver;
pub use reload::ConfigStore;
pub use shutdown::ShutdownSignal;
