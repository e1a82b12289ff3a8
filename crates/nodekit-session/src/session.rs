//! [`NodeSession`] – the node session facade.
//!
//! A session owns one middleware node and four identity-keyed caches:
//!
//! | Cache | Key | Entry |
//! |---|---|---|
//! | publishers | topic | one publisher |
//! | subscriptions | topic | set of subscriptions, one per `subscribe` |
//! | service clients | service | one client |
//! | action clients | action | one client |
//!
//! Every cache lives inside the active node state, so the caches exist only
//! while the session is ready and `shutdown` discards them in one step.
//! Publisher and client caches remember the interface type they were created
//! with; asking for the same name with another type fails with
//! [`SessionError::TypeMismatch`].
//!
//! Mutating operations take `&mut self`: the session does no locking of its
//! own and relies on the borrow checker to serialise callers.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use nodekit_middleware::{
    Middleware, MiddlewareNode, RawActionClient, RawPublisher, RawServiceClient, RawSubscription,
};
use nodekit_types::{EntityKind, MessageHandler, MiddlewareError, SessionError};
use serde_json::Value;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::{DEFAULT_CALL_TIMEOUT, SessionConfig};
use crate::dispatch::Dispatcher;

/// Cached publisher for one topic.  Clones share the underlying handle.
#[derive(Clone)]
pub struct Publisher {
    topic: String,
    type_name: String,
    inner: Arc<dyn RawPublisher>,
}

impl Publisher {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn type_name(&self) -> &str {
        &self.type_name
    }

    /// Send `message`.  Fire-and-forget: only synchronous send errors are
    /// reported.
    pub fn publish(&self, message: &Value) -> Result<(), SessionError> {
        Ok(self.inner.publish(message)?)
    }

    /// `true` when both values wrap the same underlying publisher.
    pub fn same_handle(&self, other: &Publisher) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for Publisher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Publisher")
            .field("topic", &self.topic)
            .field("type_name", &self.type_name)
            .finish()
    }
}

/// Identifies one subscription created by [`NodeSession::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(Uuid);

impl fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct Cached<T: ?Sized> {
    type_name: String,
    handle: Arc<T>,
}

/// Return the cached entity for `name`, creating it on a miss.
///
/// Entries are inserted only after `create` succeeds.
fn resolve<T: ?Sized>(
    cache: &mut HashMap<String, Cached<T>>,
    kind: EntityKind,
    name: &str,
    type_name: &str,
    create: impl FnOnce() -> Result<Arc<T>, MiddlewareError>,
) -> Result<Arc<T>, SessionError> {
    if let Some(entry) = cache.get(name) {
        if entry.type_name != type_name {
            return Err(SessionError::TypeMismatch {
                kind,
                name: name.to_string(),
                cached: entry.type_name.clone(),
                requested: type_name.to_string(),
            });
        }
        return Ok(Arc::clone(&entry.handle));
    }
    let handle = create()?;
    debug!(%kind, entity = name, type_name, "created middleware entity");
    cache.insert(
        name.to_string(),
        Cached { type_name: type_name.to_string(), handle: Arc::clone(&handle) },
    );
    Ok(handle)
}

/// Everything that exists only while the session is ready.
struct ActiveNode {
    node: Arc<dyn MiddlewareNode>,
    dispatcher: Dispatcher,
    publishers: HashMap<String, Cached<dyn RawPublisher>>,
    subscriptions: HashMap<String, HashMap<SubscriptionHandle, Box<dyn RawSubscription>>>,
    clients: HashMap<String, Cached<dyn RawServiceClient>>,
    action_clients: HashMap<String, Cached<dyn RawActionClient>>,
}

impl ActiveNode {
    fn new(node: Arc<dyn MiddlewareNode>, dispatcher: Dispatcher) -> Self {
        Self {
            node,
            dispatcher,
            publishers: HashMap::new(),
            subscriptions: HashMap::new(),
            clients: HashMap::new(),
            action_clients: HashMap::new(),
        }
    }
}

/// Facade over one middleware node.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use nodekit_middleware::Loopback;
/// use nodekit_session::{NodeSession, SessionConfig};
/// use serde_json::json;
///
/// # async fn demo() -> Result<(), nodekit_types::SessionError> {
/// let mut session = NodeSession::new(Arc::new(Loopback::new()), SessionConfig::default());
/// session.init().await?;
/// session.publish("/chatter", "std_msgs/msg/String", &json!({ "data": "hi" }))?;
/// session.shutdown().await?;
/// # Ok(())
/// # }
/// ```
pub struct NodeSession {
    config: SessionConfig,
    middleware: Arc<dyn Middleware>,
    active: Option<ActiveNode>,
}

impl NodeSession {
    /// Create an uninitialized session.  Nothing touches the middleware until
    /// [`init`][Self::init].
    pub fn new(middleware: Arc<dyn Middleware>, config: SessionConfig) -> Self {
        Self { config, middleware, active: None }
    }

    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.active.is_some()
    }

    pub fn fully_qualified_name(&self) -> String {
        self.config.fully_qualified_name()
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    /// Bring the session to the ready state.
    ///
    /// Idempotent.  On failure the session stays uninitialized and no context
    /// or node is left behind.
    pub async fn init(&mut self) -> Result<(), SessionError> {
        if self.active.is_some() {
            return Ok(());
        }
        self.middleware
            .init_context()
            .await
            .map_err(SessionError::InitializationFailed)?;

        let node = match self.middleware.create_node(&self.config.node_name, &self.config.namespace)
        {
            Ok(node) => node,
            Err(e) => {
                if let Err(teardown) = self.middleware.shutdown_context().await {
                    warn!(error = %teardown, "context teardown after failed init also failed");
                }
                return Err(SessionError::InitializationFailed(e));
            }
        };

        let dispatcher = Dispatcher::start(Arc::clone(&node), self.config.spin_interval());
        self.active = Some(ActiveNode::new(node, dispatcher));
        info!(
            node = %self.fully_qualified_name(),
            spin_interval_ms = self.config.spin_interval_ms,
            "node session ready"
        );
        Ok(())
    }

    /// Return the session to the uninitialized state.
    ///
    /// No-op when already uninitialized.  The dispatch loop is stopped before
    /// the node is destroyed.  The session is uninitialized afterwards even
    /// when teardown reports an error.
    pub async fn shutdown(&mut self) -> Result<(), SessionError> {
        let Some(active) = self.active.take() else {
            return Ok(());
        };
        let ActiveNode { node, dispatcher, publishers, subscriptions, clients, action_clients } =
            active;

        dispatcher.stop().await;
        // Entities are released with the node rather than one by one.
        drop((publishers, subscriptions, clients, action_clients));

        let destroyed = node.destroy();
        let context = self.middleware.shutdown_context().await;
        info!(node = %self.fully_qualified_name(), "node session shut down");
        destroyed?;
        context?;
        Ok(())
    }

    fn active(&self) -> Result<&ActiveNode, SessionError> {
        self.active.as_ref().ok_or(SessionError::NotInitialized)
    }

    fn active_mut(&mut self) -> Result<&mut ActiveNode, SessionError> {
        self.active.as_mut().ok_or(SessionError::NotInitialized)
    }

    // -----------------------------------------------------------------------
    // Topics
    // -----------------------------------------------------------------------

    /// Return the publisher for `topic`, creating it on first use.
    pub fn create_publisher(
        &mut self,
        topic: &str,
        type_name: &str,
    ) -> Result<Publisher, SessionError> {
        let active = self.active_mut()?;
        let node = Arc::clone(&active.node);
        let inner = resolve(&mut active.publishers, EntityKind::Publisher, topic, type_name, || {
            node.create_publisher(topic, type_name)
        })?;
        Ok(Publisher { topic: topic.to_string(), type_name: type_name.to_string(), inner })
    }

    /// Publish `message` on `topic`, creating the publisher if needed.
    pub fn publish(
        &mut self,
        topic: &str,
        type_name: &str,
        message: &Value,
    ) -> Result<(), SessionError> {
        self.create_publisher(topic, type_name)?.publish(message)
    }

    /// Add a new subscription on `topic`.
    ///
    /// Every call creates an independent subscription; `handler` receives
    /// every message published on `topic` until the returned handle is
    /// passed to [`unsubscribe`][Self::unsubscribe].
    pub fn subscribe(
        &mut self,
        topic: &str,
        type_name: &str,
        handler: impl MessageHandler + 'static,
    ) -> Result<SubscriptionHandle, SessionError> {
        let active = self.active_mut()?;
        let subscription = active.node.create_subscription(topic, type_name, Arc::new(handler))?;
        let handle = SubscriptionHandle(Uuid::new_v4());
        active.subscriptions.entry(topic.to_string()).or_default().insert(handle, subscription);
        debug!(topic, type_name, %handle, "subscribed");
        Ok(handle)
    }

    /// Remove one subscription.  Unknown topics or handles are ignored.
    pub fn unsubscribe(
        &mut self,
        topic: &str,
        handle: SubscriptionHandle,
    ) -> Result<(), SessionError> {
        let active = self.active_mut()?;
        let Some(set) = active.subscriptions.get_mut(topic) else {
            return Ok(());
        };
        let Some(subscription) = set.remove(&handle) else {
            return Ok(());
        };
        if set.is_empty() {
            active.subscriptions.remove(topic);
        }
        debug!(topic, %handle, "unsubscribed");
        Ok(subscription.destroy()?)
    }

    // -----------------------------------------------------------------------
    // Services and actions
    // -----------------------------------------------------------------------

    /// [`call_service_with_timeout`][Self::call_service_with_timeout] with
    /// [`DEFAULT_CALL_TIMEOUT`].
    pub async fn call_service(
        &mut self,
        service: &str,
        type_name: &str,
        request: Value,
    ) -> Result<Value, SessionError> {
        self.call_service_with_timeout(service, type_name, request, DEFAULT_CALL_TIMEOUT).await
    }

    /// Call `service` once.
    ///
    /// `timeout` bounds only the wait for the service to appear; once sent,
    /// the request runs until the middleware replies or fails.
    pub async fn call_service_with_timeout(
        &mut self,
        service: &str,
        type_name: &str,
        request: Value,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        let active = self.active_mut()?;
        let node = Arc::clone(&active.node);
        let client = resolve(&mut active.clients, EntityKind::ServiceClient, service, type_name, || {
            node.create_client(service, type_name)
        })?;

        if !client.wait_for_service(timeout).await? {
            warn!(service, ?timeout, "service not available");
            return Err(SessionError::ServiceUnavailable { service: service.to_string(), timeout });
        }
        Ok(client.call(request).await?)
    }

    /// [`send_action_goal_with_timeout`][Self::send_action_goal_with_timeout]
    /// with [`DEFAULT_CALL_TIMEOUT`].
    pub async fn send_action_goal(
        &mut self,
        action: &str,
        type_name: &str,
        goal: Value,
        on_feedback: Option<Arc<dyn MessageHandler>>,
    ) -> Result<Value, SessionError> {
        self.send_action_goal_with_timeout(action, type_name, goal, on_feedback, DEFAULT_CALL_TIMEOUT)
            .await
    }

    /// Submit `goal` and wait for its result.
    ///
    /// `on_feedback` sees every feedback message in receipt order before this
    /// call returns the result.  `timeout` bounds only the wait for the
    /// action server.
    pub async fn send_action_goal_with_timeout(
        &mut self,
        action: &str,
        type_name: &str,
        goal: Value,
        on_feedback: Option<Arc<dyn MessageHandler>>,
        timeout: Duration,
    ) -> Result<Value, SessionError> {
        let active = self.active_mut()?;
        let node = Arc::clone(&active.node);
        let client =
            resolve(&mut active.action_clients, EntityKind::ActionClient, action, type_name, || {
                node.create_action_client(action, type_name)
            })?;

        if !client.wait_for_server(timeout).await? {
            warn!(action, ?timeout, "action server not available");
            return Err(SessionError::ActionServerUnavailable { action: action.to_string(), timeout });
        }
        let goal_handle = client.send_goal(goal, on_feedback).await?;
        if !goal_handle.is_accepted() {
            warn!(action, "goal rejected");
            return Err(SessionError::GoalRejected { action: action.to_string() });
        }
        Ok(goal_handle.result().await?)
    }

    // -----------------------------------------------------------------------
    // Parameters
    // -----------------------------------------------------------------------

    /// Declare `name` with `default_value` unless the node already has it.
    pub fn declare_param(&self, name: &str, default_value: Value) -> Result<(), SessionError> {
        let active = self.active()?;
        if active.node.has_parameter(name) {
            return Ok(());
        }
        Ok(active.node.declare_parameter(name, default_value)?)
    }

    /// Current value of `name`, or `None` when it is not set.
    pub fn get_param(&self, name: &str) -> Result<Option<Value>, SessionError> {
        Ok(self.active()?.node.get_parameter(name))
    }

    /// Forward `value` to the node without local type checks.
    pub async fn set_param(&self, name: &str, value: Value) -> Result<(), SessionError> {
        let node = Arc::clone(&self.active()?.node);
        Ok(node.set_parameter(name, value).await?)
    }

    // -----------------------------------------------------------------------
    // Introspection
    // -----------------------------------------------------------------------

    pub fn has_publisher(&self, topic: &str) -> bool {
        self.active.as_ref().is_some_and(|a| a.publishers.contains_key(topic))
    }

    pub fn has_service_client(&self, service: &str) -> bool {
        self.active.as_ref().is_some_and(|a| a.clients.contains_key(service))
    }

    pub fn has_action_client(&self, action: &str) -> bool {
        self.active.as_ref().is_some_and(|a| a.action_clients.contains_key(action))
    }

    /// Number of tracked subscriptions on `topic`.
    pub fn subscription_count(&self, topic: &str) -> usize {
        self.active
            .as_ref()
            .and_then(|a| a.subscriptions.get(topic))
            .map_or(0, HashMap::len)
    }
}

impl Drop for NodeSession {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            warn!(node = %self.config.fully_qualified_name(), "node session dropped while ready");
            drop(active.dispatcher);
            if let Err(e) = active.node.destroy() {
                warn!(error = %e, "node destroy on drop failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodekit_middleware::{Loopback, LoopbackStats};
    use serde_json::json;

    fn session_on(loopback: &Loopback) -> NodeSession {
        let config = SessionConfig::default()
            .with_node_name("unit")
            .with_spin_interval(Duration::from_millis(2));
        NodeSession::new(Arc::new(loopback.clone()), config)
    }

    #[tokio::test]
    async fn init_is_idempotent() {
        let loopback = Loopback::new();
        let mut session = session_on(&loopback);
        session.init().await.unwrap();
        session.init().await.unwrap();
        assert!(session.is_ready());
        assert_eq!(loopback.stats().nodes_created, 1);
        assert_eq!(loopback.stats().contexts_initialized, 1);
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_when_uninitialized_is_a_noop() {
        let loopback = Loopback::new();
        let mut session = session_on(&loopback);
        session.shutdown().await.unwrap();
        session.shutdown().await.unwrap();
        assert!(!session.is_ready());
        assert_eq!(loopback.stats().nodes_destroyed, 0);
    }

    #[tokio::test]
    async fn shutdown_destroys_node_and_context() {
        let loopback = Loopback::new();
        let mut session = session_on(&loopback);
        session.init().await.unwrap();
        session.subscribe("/a", "std_msgs/msg/Empty", |_: &Value| {}).unwrap();
        session.create_publisher("/b", "std_msgs/msg/Empty").unwrap();

        session.shutdown().await.unwrap();

        assert!(!session.is_ready());
        assert!(!loopback.is_context_active());
        assert_eq!(loopback.stats().nodes_destroyed, 1);
        assert_eq!(loopback.subscriber_count("/a"), 0);
        assert_eq!(session.subscription_count("/a"), 0);
        assert!(!session.has_publisher("/b"));
    }

    #[tokio::test]
    async fn publisher_type_conflict_is_reported() {
        let loopback = Loopback::new();
        let mut session = session_on(&loopback);
        session.init().await.unwrap();
        session.create_publisher("/count", "std_msgs/msg/Int32").unwrap();

        let err = session.create_publisher("/count", "std_msgs/msg/String").unwrap_err();
        match err {
            SessionError::TypeMismatch { kind, cached, requested, .. } => {
                assert_eq!(kind, EntityKind::Publisher);
                assert_eq!(cached, "std_msgs/msg/Int32");
                assert_eq!(requested, "std_msgs/msg/String");
            }
            other => panic!("expected TypeMismatch, got {other:?}"),
        }
        assert_eq!(LoopbackStats::count(&loopback.stats().publishers_created, "/count"), 1);
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn unsubscribe_drops_empty_topic_entry() {
        let loopback = Loopback::new();
        let mut session = session_on(&loopback);
        session.init().await.unwrap();
        let handle = session.subscribe("/scan", "sensor_msgs/msg/LaserScan", |_: &Value| {}).unwrap();
        assert_eq!(session.subscription_count("/scan"), 1);

        session.unsubscribe("/scan", handle).unwrap();
        assert_eq!(session.subscription_count("/scan"), 0);
        assert_eq!(loopback.subscriber_count("/scan"), 0);

        session.unsubscribe("/scan", handle).unwrap();
        session.unsubscribe("/unknown", handle).unwrap();
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn failed_availability_keeps_client_cached() {
        let loopback = Loopback::new();
        let mut session = session_on(&loopback);
        session.init().await.unwrap();

        let err = session
            .call_service_with_timeout("/reset", "std_srvs/srv/Empty", json!({}), Duration::from_millis(10))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::ServiceUnavailable { .. }));
        assert!(session.has_service_client("/reset"));

        loopback.serve("/reset", "std_srvs/srv/Empty", |_| Ok(json!({})));
        let reply = session
            .call_service_with_timeout("/reset", "std_srvs/srv/Empty", json!({}), Duration::from_millis(10))
            .await
            .unwrap();
        assert_eq!(reply, json!({}));
        assert_eq!(LoopbackStats::count(&loopback.stats().clients_created, "/reset"), 1);
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn service_errors_pass_through() {
        let loopback = Loopback::new();
        loopback.serve("/fail", "std_srvs/srv/Trigger", |_| Err("motor offline".to_string()));
        let mut session = session_on(&loopback);
        session.init().await.unwrap();

        let err = session.call_service("/fail", "std_srvs/srv/Trigger", json!({})).await.unwrap_err();
        assert!(matches!(
            err,
            SessionError::Middleware(MiddlewareError::Service { ref details, .. }) if details == "motor offline"
        ));
        assert!(session.is_ready());
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn action_client_type_conflict_is_reported() {
        let loopback = Loopback::new();
        let mut session = session_on(&loopback);
        session.init().await.unwrap();
        let _ = session
            .send_action_goal_with_timeout(
                "/spin",
                "nav2_msgs/action/Spin",
                json!({}),
                None,
                Duration::from_millis(5),
            )
            .await;

        let err = session
            .send_action_goal("/spin", "nav2_msgs/action/BackUp", json!({}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::TypeMismatch { kind: EntityKind::ActionClient, .. }));
        session.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn parameters_forward_to_node() {
        let loopback = Loopback::new();
        let mut session = session_on(&loopback);
        session.init().await.unwrap();

        session.declare_param("max_speed", json!(0.5)).unwrap();
        assert_eq!(session.get_param("max_speed").unwrap(), Some(json!(0.5)));
        session.set_param("max_speed", json!("fast")).await.unwrap();
        assert_eq!(session.get_param("max_speed").unwrap(), Some(json!("fast")));
        session.shutdown().await.unwrap();
    }
}
