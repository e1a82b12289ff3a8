//! The middleware boundary.
//!
//! nodekit never speaks a robotics wire protocol itself.  A [`Middleware`]
//! value represents one middleware context; it creates [`MiddlewareNode`]s,
//! and nodes hand out the raw entity handles that `NodeSession` caches.
//!
//! # Overview
//!
//! - [`Middleware`] – context lifecycle and node creation.
//! - [`MiddlewareNode`] – entity factories, node-scoped parameters and the
//!   non-blocking [`spin_once`][MiddlewareNode::spin_once] pump.
//! - [`RawPublisher`], [`RawSubscription`], [`RawServiceClient`],
//!   [`RawActionClient`], [`RawGoalHandle`] – the entities themselves.
//!
//! Adapters queue every inbound event (messages, service replies, action
//! feedback and results) on a [`ReadyQueue`][crate::ReadyQueue]; nothing
//! reaches user code until the owning node is spun.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use nodekit_types::{MessageHandler, MiddlewareError};
use serde_json::Value;
use tokio::time::Instant;

/// Interval between availability probes while waiting for a service or an
/// action server.
pub const AVAILABILITY_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// One middleware context.
///
/// Only one session should hold a context in the ready state at a time.
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Establish the context.  Called once per session `init`.
    async fn init_context(&self) -> Result<(), MiddlewareError>;

    /// Tear the context down.  Nodes created from it are unusable afterwards.
    async fn shutdown_context(&self) -> Result<(), MiddlewareError>;

    /// Create a node named `name` under `namespace`.
    fn create_node(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Arc<dyn MiddlewareNode>, MiddlewareError>;
}

/// A node created by a [`Middleware`].
#[async_trait]
pub trait MiddlewareNode: Send + Sync {
    fn name(&self) -> &str;

    fn namespace(&self) -> &str;

    fn create_publisher(
        &self,
        topic: &str,
        type_name: &str,
    ) -> Result<Arc<dyn RawPublisher>, MiddlewareError>;

    /// Create a subscription; `handler` is invoked from `spin_once` for every
    /// message received on `topic`.
    fn create_subscription(
        &self,
        topic: &str,
        type_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn RawSubscription>, MiddlewareError>;

    fn create_client(
        &self,
        service: &str,
        type_name: &str,
    ) -> Result<Arc<dyn RawServiceClient>, MiddlewareError>;

    fn create_action_client(
        &self,
        action: &str,
        type_name: &str,
    ) -> Result<Arc<dyn RawActionClient>, MiddlewareError>;

    fn has_parameter(&self, name: &str) -> bool;

    fn declare_parameter(&self, name: &str, default_value: Value) -> Result<(), MiddlewareError>;

    fn get_parameter(&self, name: &str) -> Option<Value>;

    /// Set a parameter and wait for the node to acknowledge it.
    async fn set_parameter(&self, name: &str, value: Value) -> Result<(), MiddlewareError>;

    /// Run every callback that is ready right now without blocking.
    ///
    /// Returns the number of callbacks executed.
    fn spin_once(&self) -> usize;

    /// Destroy the node together with every entity it created.
    fn destroy(&self) -> Result<(), MiddlewareError>;
}

pub trait RawPublisher: Send + Sync {
    fn publish(&self, message: &Value) -> Result<(), MiddlewareError>;
}

pub trait RawSubscription: Send + Sync {
    /// Stop delivery and release the underlying subscription.
    fn destroy(&self) -> Result<(), MiddlewareError>;
}

#[async_trait]
pub trait RawServiceClient: Send + Sync {
    /// Wait up to `timeout` for a server.  `Ok(false)` means none appeared.
    async fn wait_for_service(&self, timeout: Duration) -> Result<bool, MiddlewareError>;

    async fn call(&self, request: Value) -> Result<Value, MiddlewareError>;
}

#[async_trait]
pub trait RawActionClient: Send + Sync {
    /// Wait up to `timeout` for an action server.
    async fn wait_for_server(&self, timeout: Duration) -> Result<bool, MiddlewareError>;

    /// Submit `goal` and wait for the server to accept or reject it.
    ///
    /// Feedback received after acceptance is passed to `feedback` in receipt
    /// order, always before the result becomes available.
    async fn send_goal(
        &self,
        goal: Value,
        feedback: Option<Arc<dyn MessageHandler>>,
    ) -> Result<Box<dyn RawGoalHandle>, MiddlewareError>;
}

#[async_trait]
pub trait RawGoalHandle: Send {
    fn is_accepted(&self) -> bool;

    /// Wait for the terminal result of an accepted goal.
    async fn result(self: Box<Self>) -> Result<Value, MiddlewareError>;
}

/// Re-run `probe` every [`AVAILABILITY_POLL_INTERVAL`] until it reports
/// `true` or `timeout` elapses.
///
/// The probe always runs at least once, so a zero timeout still detects an
/// entity that is already present.
pub async fn poll_until<F, Fut>(timeout: Duration, mut probe: F) -> Result<bool, MiddlewareError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool, MiddlewareError>>,
{
    let deadline = Instant::now() + timeout;
    loop {
        if probe().await? {
            return Ok(true);
        }
        let now = Instant::now();
        if now >= deadline {
            return Ok(false);
        }
        tokio::time::sleep((deadline - now).min(AVAILABILITY_POLL_INTERVAL)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn poll_until_gives_up_after_timeout() {
        let started = std::time::Instant::now();
        let found = poll_until(Duration::from_millis(40), || async { Ok(false) })
            .await
            .unwrap();
        assert!(!found);
        assert!(started.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn poll_until_probes_once_with_zero_timeout() {
        let probes = AtomicUsize::new(0);
        let found = poll_until(Duration::ZERO, || {
            probes.fetch_add(1, Ordering::SeqCst);
            async { Ok(true) }
        })
        .await
        .unwrap();
        assert!(found);
        assert_eq!(probes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn poll_until_propagates_probe_errors() {
        let result = poll_until(Duration::from_millis(20), || async {
            Err(MiddlewareError::Transport("link down".to_string()))
        })
        .await;
        assert!(matches!(result, Err(MiddlewareError::Transport(_))));
    }
}
