//! `rosbridge_server` client middleware.
//!
//! [`Rosbridge`] speaks the rosbridge v2 JSON protocol over a WebSocket
//! (`ws://host:port`, default [`DEFAULT_ROSBRIDGE_URL`]).  rosbridge does the
//! actual ROS 2 work; this adapter only encodes `op` frames and routes the
//! replies:
//!
//! | Outbound | Inbound |
//! |---|---|
//! | `advertise`, `publish`, `unadvertise` | – |
//! | `subscribe`, `unsubscribe` | `publish` |
//! | `call_service` | `service_response` |
//! | `send_action_goal` | `action_feedback`, `action_result` |
//!
//! Service and action-server availability is probed through the `rosapi`
//! services `/rosapi/services` and `/rosapi/action_servers`.  A rosbridge
//! client is not a ROS node, so node parameters live in the adapter node.
//!
//! rosbridge has no explicit goal-acceptance frame.  A goal counts as
//! accepted on its first feedback or on a result with a terminal status; a
//! failed result that arrives before either is reported as a rejection.
//!
//! When the socket drops, every outstanding call and goal completes with
//! [`MiddlewareError::Transport`] and the context must be initialised again.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use nodekit_types::{MessageHandler, MiddlewareError};
use parking_lot::Mutex;
use serde_json::{Value, json};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::adapter::{
    AVAILABILITY_POLL_INTERVAL, Middleware, MiddlewareNode, RawActionClient, RawGoalHandle,
    RawPublisher, RawServiceClient, RawSubscription, poll_until,
};
use crate::ready_queue::ReadyQueue;

/// Default rosbridge WebSocket endpoint.
pub const DEFAULT_ROSBRIDGE_URL: &str = "ws://localhost:9090";

const ROSAPI_SERVICES: &str = "/rosapi/services";
const ROSAPI_SERVICES_TYPE: &str = "rosapi_msgs/srv/Services";
const ROSAPI_ACTION_SERVERS: &str = "/rosapi/action_servers";
const ROSAPI_ACTION_SERVERS_TYPE: &str = "rosapi_msgs/srv/GetActionServers";

/// `action_msgs/msg/GoalStatus` values that mean the goal ran.
const STATUS_SUCCEEDED: u64 = 4;
const STATUS_CANCELED: u64 = 5;
const STATUS_ABORTED: u64 = 6;

// ---------------------------------------------------------------------------
// Frame encoding
// ---------------------------------------------------------------------------

/// Builders for outbound rosbridge frames.
pub mod frame {
    use serde_json::{Value, json};

    pub fn advertise(topic: &str, type_name: &str) -> Value {
        json!({ "op": "advertise", "topic": topic, "type": type_name })
    }

    pub fn unadvertise(topic: &str) -> Value {
        json!({ "op": "unadvertise", "topic": topic })
    }

    pub fn publish(topic: &str, msg: &Value) -> Value {
        json!({ "op": "publish", "topic": topic, "msg": msg })
    }

    pub fn subscribe(id: &str, topic: &str, type_name: &str) -> Value {
        json!({ "op": "subscribe", "id": id, "topic": topic, "type": type_name })
    }

    pub fn unsubscribe(id: &str, topic: &str) -> Value {
        json!({ "op": "unsubscribe", "id": id, "topic": topic })
    }

    pub fn call_service(id: &str, service: &str, type_name: &str, args: &Value) -> Value {
        json!({
            "op": "call_service",
            "id": id,
            "service": service,
            "type": type_name,
            "args": args
        })
    }

    pub fn send_action_goal(id: &str, action: &str, action_type: &str, args: &Value) -> Value {
        json!({
            "op": "send_action_goal",
            "id": id,
            "action": action,
            "action_type": action_type,
            "args": args,
            "feedback": true
        })
    }
}

// ---------------------------------------------------------------------------
// Link: one WebSocket connection and its reply routing
// ---------------------------------------------------------------------------

struct TopicRoute {
    id: String,
    node_id: Uuid,
    handler: Arc<dyn MessageHandler>,
    queue: Arc<ReadyQueue>,
    alive: Arc<AtomicBool>,
}

struct PendingCall {
    service: String,
    queue: Arc<ReadyQueue>,
    reply: oneshot::Sender<Result<Value, MiddlewareError>>,
}

struct PendingGoal {
    action: String,
    queue: Arc<ReadyQueue>,
    feedback: Option<Arc<dyn MessageHandler>>,
    accepted: Option<oneshot::Sender<bool>>,
    result: oneshot::Sender<Result<Value, MiddlewareError>>,
}

#[derive(Default)]
struct Routes {
    topics: HashMap<String, Vec<TopicRoute>>,
    calls: HashMap<String, PendingCall>,
    goals: HashMap<String, PendingGoal>,
}

struct Link {
    outbound: mpsc::UnboundedSender<String>,
    routes: Mutex<Routes>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    closed: AtomicBool,
}

impl Link {
    fn new(outbound: mpsc::UnboundedSender<String>) -> Self {
        Self {
            outbound,
            routes: Mutex::new(Routes::default()),
            tasks: Mutex::new(Vec::new()),
            closed: AtomicBool::new(false),
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn send(&self, frame: Value) -> Result<(), MiddlewareError> {
        let closed = || MiddlewareError::Transport("rosbridge connection is closed".to_string());
        if self.is_closed() {
            return Err(closed());
        }
        self.outbound.send(frame.to_string()).map_err(|_| closed())
    }

    /// Issue a `call_service` and wait for the matching `service_response`.
    ///
    /// The reply is delivered through `queue`, so the caller's node must be
    /// spinning.  Dropping the future forgets the request.
    async fn call(
        self: &Arc<Self>,
        queue: &Arc<ReadyQueue>,
        service: &str,
        type_name: &str,
        args: &Value,
    ) -> Result<Value, MiddlewareError> {
        let id = format!("call_service:{service}:{}", Uuid::new_v4());
        let (tx, rx) = oneshot::channel();
        self.routes.lock().calls.insert(
            id.clone(),
            PendingCall { service: service.to_string(), queue: Arc::clone(queue), reply: tx },
        );
        let _route = PendingRoute::call(Arc::clone(self), id.clone());
        self.send(frame::call_service(&id, service, type_name, args))?;
        rx.await.map_err(|_| {
            MiddlewareError::Transport(format!("rosbridge dropped the call to '{service}'"))
        })?
    }

    /// Ask rosapi whether `name` appears in the list returned by `service`.
    async fn rosapi_lists(
        self: &Arc<Self>,
        queue: &Arc<ReadyQueue>,
        service: &str,
        type_name: &str,
        field: &str,
        name: &str,
    ) -> Result<bool, MiddlewareError> {
        match self.call(queue, service, type_name, &json!({})).await {
            Ok(reply) => Ok(reply[field]
                .as_array()
                .is_some_and(|names| names.iter().any(|n| n.as_str() == Some(name)))),
            // rosapi missing or refusing: treat the entity as unavailable.
            Err(MiddlewareError::Service { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Route one inbound text frame.
    fn route(&self, text: &str) {
        let frame: Value = match serde_json::from_str(text) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(error = %e, "rosbridge sent a frame that is not JSON");
                return;
            }
        };
        let op = frame["op"].as_str().unwrap_or("");
        match op {
            "publish" => self.route_message(&frame),
            "service_response" => self.route_service_response(&frame),
            "action_feedback" => self.route_action_feedback(&frame),
            "action_result" => self.route_action_result(&frame),
            "status" => {
                let level = frame["level"].as_str().unwrap_or("info");
                let msg = frame["msg"].as_str().unwrap_or("");
                warn!(status_level = level, detail = msg, "rosbridge status");
            }
            other => debug!(op = other, "ignoring rosbridge frame"),
        }
    }

    fn route_message(&self, frame: &Value) {
        let Some(topic) = frame["topic"].as_str() else {
            return;
        };
        let routes = self.routes.lock();
        let Some(subscribers) = routes.topics.get(topic) else {
            return;
        };
        for route in subscribers {
            let handler = Arc::clone(&route.handler);
            let alive = Arc::clone(&route.alive);
            let msg = frame["msg"].clone();
            route.queue.push(move || {
                if alive.load(Ordering::SeqCst) {
                    handler.on_message(&msg);
                }
            });
        }
    }

    fn route_service_response(&self, frame: &Value) {
        let Some(id) = frame["id"].as_str() else {
            return;
        };
        let Some(pending) = self.routes.lock().calls.remove(id) else {
            debug!(id, "service_response for an unknown call");
            return;
        };
        let values = frame["values"].clone();
        let reply = if frame["result"].as_bool().unwrap_or(true) {
            Ok(values)
        } else {
            Err(MiddlewareError::Service {
                service: pending.service,
                details: values.as_str().map(str::to_string).unwrap_or_else(|| values.to_string()),
            })
        };
        let tx = pending.reply;
        pending.queue.push(move || {
            let _ = tx.send(reply);
        });
    }

    fn route_action_feedback(&self, frame: &Value) {
        let Some(id) = frame["id"].as_str() else {
            return;
        };
        let mut routes = self.routes.lock();
        let Some(goal) = routes.goals.get_mut(id) else {
            return;
        };
        if let Some(accepted) = goal.accepted.take() {
            goal.queue.push(move || {
                let _ = accepted.send(true);
            });
        }
        if let Some(handler) = &goal.feedback {
            let handler = Arc::clone(handler);
            let values = frame["values"].clone();
            goal.queue.push(move || handler.on_message(&values));
        }
    }

    fn route_action_result(&self, frame: &Value) {
        let Some(id) = frame["id"].as_str() else {
            return;
        };
        let Some(mut goal) = self.routes.lock().goals.remove(id) else {
            return;
        };
        let succeeded = frame["result"].as_bool().unwrap_or(true);
        let status = frame["status"].as_u64();
        let ran = matches!(status, Some(STATUS_SUCCEEDED | STATUS_CANCELED | STATUS_ABORTED));

        if let Some(accepted) = goal.accepted.take() {
            let accepted_now = succeeded || ran;
            goal.queue.push(move || {
                let _ = accepted.send(accepted_now);
            });
            if !accepted_now {
                return;
            }
        }

        let outcome = if succeeded {
            Ok(frame["values"].clone())
        } else {
            Err(MiddlewareError::Action {
                action: goal.action,
                details: match status {
                    Some(code) => format!("goal finished with status {code}"),
                    None => "goal failed".to_string(),
                },
            })
        };
        let tx = goal.result;
        goal.queue.push(move || {
            let _ = tx.send(outcome);
        });
    }

    /// Mark the link dead and fail every outstanding call and goal through
    /// its node's queue.  Only the first call has an effect.
    fn disconnect(&self, reason: &str) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (calls, goals) = {
            let mut routes = self.routes.lock();
            (std::mem::take(&mut routes.calls), std::mem::take(&mut routes.goals))
        };
        warn!(reason, calls = calls.len(), goals = goals.len(), "rosbridge link lost");

        for call in calls.into_values() {
            let error = MiddlewareError::Transport(format!("{reason} while calling '{}'", call.service));
            let tx = call.reply;
            call.queue.push(move || {
                let _ = tx.send(Err(error));
            });
        }
        for goal in goals.into_values() {
            let error = MiddlewareError::Transport(format!("{reason} while running '{}'", goal.action));
            let (accepted, result) = (goal.accepted, goal.result);
            goal.queue.push(move || {
                // A goal still awaiting acceptance fails on the dropped sender.
                drop(accepted);
                let _ = result.send(Err(error));
            });
        }
    }

    /// Drop every route and stop the socket tasks.
    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        *self.routes.lock() = Routes::default();
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

/// Removes a call or goal route when the request that owns it goes away.
struct PendingRoute {
    link: Arc<Link>,
    id: String,
    goal: bool,
}

impl PendingRoute {
    fn call(link: Arc<Link>, id: String) -> Self {
        Self { link, id, goal: false }
    }

    fn goal(link: Arc<Link>, id: String) -> Self {
        Self { link, id, goal: true }
    }
}

impl Drop for PendingRoute {
    fn drop(&mut self) {
        let mut routes = self.link.routes.lock();
        if self.goal {
            routes.goals.remove(&self.id);
        } else {
            routes.calls.remove(&self.id);
        }
    }
}

// ---------------------------------------------------------------------------
// Middleware
// ---------------------------------------------------------------------------

/// [`Middleware`] backed by a `rosbridge_server` WebSocket.
pub struct Rosbridge {
    url: String,
    link: Mutex<Option<Arc<Link>>>,
}

impl Rosbridge {
    /// Create an adapter for `url` (e.g. `"ws://localhost:9090"`).  Nothing
    /// connects until the context is initialised.
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into(), link: Mutex::new(None) }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    /// `true` while the WebSocket is up.  A lost connection stays `false`
    /// until the context is initialised again.
    pub fn is_connected(&self) -> bool {
        self.link.lock().as_ref().is_some_and(|link| !link.is_closed())
    }
}

impl Default for Rosbridge {
    fn default() -> Self {
        Self::new(DEFAULT_ROSBRIDGE_URL)
    }
}

#[async_trait]
impl Middleware for Rosbridge {
    async fn init_context(&self) -> Result<(), MiddlewareError> {
        if let Some(stale) = self.link.lock().take_if(|link| link.is_closed()) {
            stale.close();
        }
        if self.is_connected() {
            return Err(MiddlewareError::Context(format!(
                "rosbridge context for {} is already initialized",
                self.url
            )));
        }
        let (ws_stream, _) = connect_async(self.url.as_str()).await.map_err(|e| {
            MiddlewareError::Context(format!("rosbridge connect to {}: {e}", self.url))
        })?;
        let (mut ws_tx, mut ws_rx) = ws_stream.split();
        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<String>();
        let link = Arc::new(Link::new(outbound));

        let writer_link = Arc::clone(&link);
        let writer = tokio::spawn(async move {
            while let Some(text) = outbound_rx.recv().await {
                if let Err(e) = ws_tx.send(Message::Text(text.into())).await {
                    error!(error = %e, "rosbridge send failed");
                    writer_link.disconnect("rosbridge send failed");
                    break;
                }
            }
        });

        let reader_link = Arc::clone(&link);
        let reader = tokio::spawn(async move {
            while let Some(frame) = ws_rx.next().await {
                match frame {
                    Ok(Message::Text(text)) => reader_link.route(text.as_str()),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "rosbridge receive failed");
                        break;
                    }
                }
            }
            reader_link.disconnect("rosbridge connection closed");
        });

        link.tasks.lock().extend([writer, reader]);
        *self.link.lock() = Some(link);
        info!(url = %self.url, "rosbridge context initialized");
        Ok(())
    }

    async fn shutdown_context(&self) -> Result<(), MiddlewareError> {
        if let Some(link) = self.link.lock().take() {
            link.close();
            info!(url = %self.url, "rosbridge context shut down");
        }
        Ok(())
    }

    fn create_node(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Arc<dyn MiddlewareNode>, MiddlewareError> {
        let link = self.link.lock().clone().ok_or_else(|| {
            MiddlewareError::Context("rosbridge context is not initialized".to_string())
        })?;
        Ok(Arc::new(RosbridgeNode::new(name, namespace, link)))
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

struct RosbridgeNode {
    id: Uuid,
    name: String,
    namespace: String,
    link: Arc<Link>,
    queue: Arc<ReadyQueue>,
    alive: Arc<AtomicBool>,
    parameters: Mutex<HashMap<String, Value>>,
    advertised: Mutex<HashSet<String>>,
}

impl RosbridgeNode {
    fn new(name: &str, namespace: &str, link: Arc<Link>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            namespace: namespace.to_string(),
            link,
            queue: Arc::new(ReadyQueue::new()),
            alive: Arc::new(AtomicBool::new(true)),
            parameters: Mutex::new(HashMap::new()),
            advertised: Mutex::new(HashSet::new()),
        }
    }

    fn ensure_alive(&self) -> Result<(), MiddlewareError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MiddlewareError::NodeDestroyed(self.name.clone()))
        }
    }
}

#[async_trait]
impl MiddlewareNode for RosbridgeNode {
    fn name(&self) -> &str {
        &self.name
    }

    fn namespace(&self) -> &str {
        &self.namespace
    }

    fn create_publisher(
        &self,
        topic: &str,
        type_name: &str,
    ) -> Result<Arc<dyn RawPublisher>, MiddlewareError> {
        self.ensure_alive()?;
        self.link.send(frame::advertise(topic, type_name))?;
        self.advertised.lock().insert(topic.to_string());
        Ok(Arc::new(RosbridgePublisher {
            link: Arc::clone(&self.link),
            topic: topic.to_string(),
            node: self.name.clone(),
            alive: Arc::clone(&self.alive),
        }))
    }

    fn create_subscription(
        &self,
        topic: &str,
        type_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn RawSubscription>, MiddlewareError> {
        self.ensure_alive()?;
        let id = format!("subscribe:{topic}:{}", Uuid::new_v4());
        let alive = Arc::new(AtomicBool::new(true));
        self.link.routes.lock().topics.entry(topic.to_string()).or_default().push(TopicRoute {
            id: id.clone(),
            node_id: self.id,
            handler,
            queue: Arc::clone(&self.queue),
            alive: Arc::clone(&alive),
        });
        let subscription = RosbridgeSubscription {
            link: Arc::clone(&self.link),
            id,
            topic: topic.to_string(),
            alive,
        };
        if let Err(e) = self.link.send(frame::subscribe(&subscription.id, topic, type_name)) {
            subscription.forget();
            return Err(e);
        }
        Ok(Box::new(subscription))
    }

    fn create_client(
        &self,
        service: &str,
        type_name: &str,
    ) -> Result<Arc<dyn RawServiceClient>, MiddlewareError> {
        self.ensure_alive()?;
        Ok(Arc::new(RosbridgeServiceClient {
            link: Arc::clone(&self.link),
            queue: Arc::clone(&self.queue),
            service: service.to_string(),
            type_name: type_name.to_string(),
        }))
    }

    fn create_action_client(
        &self,
        action: &str,
        type_name: &str,
    ) -> Result<Arc<dyn RawActionClient>, MiddlewareError> {
        self.ensure_alive()?;
        Ok(Arc::new(RosbridgeActionClient {
            link: Arc::clone(&self.link),
            queue: Arc::clone(&self.queue),
            action: action.to_string(),
            type_name: type_name.to_string(),
        }))
    }

    fn has_parameter(&self, name: &str) -> bool {
        self.parameters.lock().contains_key(name)
    }

    fn declare_parameter(&self, name: &str, default_value: Value) -> Result<(), MiddlewareError> {
        self.ensure_alive()?;
        self.parameters.lock().insert(name.to_string(), default_value);
        Ok(())
    }

    fn get_parameter(&self, name: &str) -> Option<Value> {
        self.parameters.lock().get(name).cloned()
    }

    async fn set_parameter(&self, name: &str, value: Value) -> Result<(), MiddlewareError> {
        self.ensure_alive()?;
        self.parameters.lock().insert(name.to_string(), value);
        Ok(())
    }

    fn spin_once(&self) -> usize {
        if !self.alive.load(Ordering::SeqCst) {
            return 0;
        }
        self.queue.drain()
    }

    fn destroy(&self) -> Result<(), MiddlewareError> {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut dropped = Vec::new();
        {
            let mut routes = self.link.routes.lock();
            for (topic, subscribers) in routes.topics.iter_mut() {
                subscribers.retain(|route| {
                    if route.node_id == self.id {
                        route.alive.store(false, Ordering::SeqCst);
                        dropped.push((route.id.clone(), topic.clone()));
                        false
                    } else {
                        true
                    }
                });
            }
            routes.topics.retain(|_, subscribers| !subscribers.is_empty());
            routes.calls.retain(|_, call| !Arc::ptr_eq(&call.queue, &self.queue));
            routes.goals.retain(|_, goal| !Arc::ptr_eq(&goal.queue, &self.queue));
        }
        // The link may already be gone during context teardown.
        for (id, topic) in dropped {
            let _ = self.link.send(frame::unsubscribe(&id, &topic));
        }
        for topic in self.advertised.lock().drain() {
            let _ = self.link.send(frame::unadvertise(&topic));
        }
        self.queue.clear();
        debug!(node = %self.name, "rosbridge node destroyed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

struct RosbridgePublisher {
    link: Arc<Link>,
    topic: String,
    node: String,
    alive: Arc<AtomicBool>,
}

impl RawPublisher for RosbridgePublisher {
    fn publish(&self, message: &Value) -> Result<(), MiddlewareError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(MiddlewareError::NodeDestroyed(self.node.clone()));
        }
        self.link.send(frame::publish(&self.topic, message))
    }
}

struct RosbridgeSubscription {
    link: Arc<Link>,
    id: String,
    topic: String,
    alive: Arc<AtomicBool>,
}

impl RosbridgeSubscription {
    /// Remove the local route without telling rosbridge.
    fn forget(&self) {
        self.alive.store(false, Ordering::SeqCst);
        let mut routes = self.link.routes.lock();
        if let Some(subscribers) = routes.topics.get_mut(&self.topic) {
            subscribers.retain(|route| route.id != self.id);
            if subscribers.is_empty() {
                routes.topics.remove(&self.topic);
            }
        }
    }
}

impl RawSubscription for RosbridgeSubscription {
    fn destroy(&self) -> Result<(), MiddlewareError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Ok(());
        }
        self.forget();
        self.link.send(frame::unsubscribe(&self.id, &self.topic))
    }
}

struct RosbridgeServiceClient {
    link: Arc<Link>,
    queue: Arc<ReadyQueue>,
    service: String,
    type_name: String,
}

#[async_trait]
impl RawServiceClient for RosbridgeServiceClient {
    async fn wait_for_service(&self, timeout: Duration) -> Result<bool, MiddlewareError> {
        let probe = poll_until(timeout, move || {
            self.link.rosapi_lists(
                &self.queue,
                ROSAPI_SERVICES,
                ROSAPI_SERVICES_TYPE,
                "services",
                &self.service,
            )
        });
        tokio::time::timeout(timeout + AVAILABILITY_POLL_INTERVAL, probe)
            .await
            .unwrap_or(Ok(false))
    }

    async fn call(&self, request: Value) -> Result<Value, MiddlewareError> {
        self.link.call(&self.queue, &self.service, &self.type_name, &request).await
    }
}

struct RosbridgeActionClient {
    link: Arc<Link>,
    queue: Arc<ReadyQueue>,
    action: String,
    type_name: String,
}

#[async_trait]
impl RawActionClient for RosbridgeActionClient {
    async fn wait_for_server(&self, timeout: Duration) -> Result<bool, MiddlewareError> {
        let probe = poll_until(timeout, move || {
            self.link.rosapi_lists(
                &self.queue,
                ROSAPI_ACTION_SERVERS,
                ROSAPI_ACTION_SERVERS_TYPE,
                "action_servers",
                &self.action,
            )
        });
        tokio::time::timeout(timeout + AVAILABILITY_POLL_INTERVAL, probe)
            .await
            .unwrap_or(Ok(false))
    }

    async fn send_goal(
        &self,
        goal: Value,
        feedback: Option<Arc<dyn MessageHandler>>,
    ) -> Result<Box<dyn RawGoalHandle>, MiddlewareError> {
        let id = format!("send_action_goal:{}:{}", self.action, Uuid::new_v4());
        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        self.link.routes.lock().goals.insert(
            id.clone(),
            PendingGoal {
                action: self.action.clone(),
                queue: Arc::clone(&self.queue),
                feedback,
                accepted: Some(accepted_tx),
                result: result_tx,
            },
        );
        let route = PendingRoute::goal(Arc::clone(&self.link), id.clone());
        self.link.send(frame::send_action_goal(&id, &self.action, &self.type_name, &goal))?;

        let accepted = accepted_rx.await.map_err(|_| {
            MiddlewareError::Transport(format!("rosbridge dropped the goal for '{}'", self.action))
        })?;
        Ok(Box::new(RosbridgeGoalHandle {
            accepted,
            action: self.action.clone(),
            result: result_rx,
            _route: route,
        }))
    }
}

struct RosbridgeGoalHandle {
    accepted: bool,
    action: String,
    result: oneshot::Receiver<Result<Value, MiddlewareError>>,
    _route: PendingRoute,
}

#[async_trait]
impl RawGoalHandle for RosbridgeGoalHandle {
    fn is_accepted(&self) -> bool {
        self.accepted
    }

    async fn result(self: Box<Self>) -> Result<Value, MiddlewareError> {
        let RosbridgeGoalHandle { action, result, _route, .. } = *self;
        result.await.map_err(|_| {
            MiddlewareError::Transport(format!("rosbridge dropped the result for '{action}'"))
        })?
    }
}
