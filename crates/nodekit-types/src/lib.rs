//! `nodekit-types` – shared vocabulary of the nodekit workspace.
//!
//! Holds the two error enums that cross crate boundaries and the
//! [`MessageHandler`] capability used for subscription and feedback
//! callbacks.

use std::fmt;
use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// The kind of cached middleware entity, used in [`SessionError::TypeMismatch`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Publisher,
    ServiceClient,
    ActionClient,
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityKind::Publisher => write!(f, "publisher"),
            EntityKind::ServiceClient => write!(f, "service client"),
            EntityKind::ActionClient => write!(f, "action client"),
        }
    }
}

/// Errors raised by a middleware adapter.
///
/// The session never translates these except during `init`, where they are
/// wrapped in [`SessionError::InitializationFailed`].
#[derive(Error, Debug, Clone, PartialEq)]
pub enum MiddlewareError {
    #[error("Middleware Context Error: {0}")]
    Context(String),

    #[error("Middleware Transport Error: {0}")]
    Transport(String),

    #[error("Middleware Serialization Error: {0}")]
    Serialization(String),

    #[error("Service '{service}' failed: {details}")]
    Service { service: String, details: String },

    #[error("Action '{action}' failed: {details}")]
    Action { action: String, details: String },

    #[error("Node '{0}' has been destroyed")]
    NodeDestroyed(String),

    #[error("Operation not supported by this middleware: {0}")]
    Unsupported(String),
}

/// Errors surfaced by `NodeSession`.
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("node session is not initialized")]
    NotInitialized,

    #[error("node session initialization failed: {0}")]
    InitializationFailed(#[source] MiddlewareError),

    #[error("service '{service}' not available after {timeout:?}")]
    ServiceUnavailable { service: String, timeout: Duration },

    #[error("action server '{action}' not available after {timeout:?}")]
    ActionServerUnavailable { action: String, timeout: Duration },

    #[error("goal rejected by action server '{action}'")]
    GoalRejected { action: String },

    #[error("{kind} '{name}' is cached with type '{cached}', requested '{requested}'")]
    TypeMismatch {
        kind: EntityKind,
        name: String,
        cached: String,
        requested: String,
    },

    #[error(transparent)]
    Middleware(#[from] MiddlewareError),
}

/// Capability invoked for every inbound message or action feedback.
///
/// Closures of the form `Fn(&Value)` implement it automatically.
pub trait MessageHandler: Send + Sync {
    fn on_message(&self, message: &Value);
}

impl<F> MessageHandler for F
where
    F: Fn(&Value) + Send + Sync,
{
    fn on_message(&self, message: &Value) {
        self(message)
    }
}
