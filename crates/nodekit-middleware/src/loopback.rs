//! In-process loopback middleware.
//!
//! [`Loopback`] is a complete [`Middleware`] whose "network" is a shared
//! in-memory graph.  Every node created from the same `Loopback` sees the
//! others' topics; services and action servers are registered on the
//! loopback itself with [`Loopback::serve`] and [`Loopback::serve_action`],
//! standing in for remote processes.
//!
//! Messages are fanned out to every subscription whose topic *and* type
//! match, mirroring DDS type matching.  All deliveries go through the
//! receiving node's [`ReadyQueue`], so nothing reaches a handler before the
//! node is spun.
//!
//! The loopback keeps per-name call counters ([`LoopbackStats`]) so callers
//! can assert which operations actually reached the middleware.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use nodekit_types::{MessageHandler, MiddlewareError};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, info};
use uuid::Uuid;

use crate::adapter::{
    Middleware, MiddlewareNode, RawActionClient, RawGoalHandle, RawPublisher, RawServiceClient,
    RawSubscription, poll_until,
};
use crate::ready_queue::ReadyQueue;

type ServiceFn = dyn Fn(&Value) -> Result<Value, String> + Send + Sync;
type ActionFn = dyn Fn(&Value) -> GoalOutcome + Send + Sync;

/// What a loopback action server does with a submitted goal.
#[derive(Debug, Clone, PartialEq)]
pub enum GoalOutcome {
    /// Decline the goal; no feedback or result follows.
    Rejected,
    /// Accept, stream `feedback` in order, then deliver `result`.
    Succeeded { feedback: Vec<Value>, result: Value },
    /// Accept, stream `feedback`, then fail with `reason`.
    Aborted { feedback: Vec<Value>, reason: String },
}

/// Counters of operations that reached the loopback graph, keyed by entity
/// name.
#[derive(Debug, Clone, Default)]
pub struct LoopbackStats {
    pub contexts_initialized: usize,
    pub nodes_created: usize,
    pub nodes_destroyed: usize,
    pub publishers_created: HashMap<String, usize>,
    pub subscriptions_created: HashMap<String, usize>,
    pub subscriptions_destroyed: HashMap<String, usize>,
    pub clients_created: HashMap<String, usize>,
    pub action_clients_created: HashMap<String, usize>,
    pub messages_published: HashMap<String, usize>,
    pub requests_sent: HashMap<String, usize>,
    pub goals_sent: HashMap<String, usize>,
    pub parameters_declared: HashMap<String, usize>,
    pub parameters_set: HashMap<String, usize>,
}

impl LoopbackStats {
    /// Read a counter, treating absent names as zero.
    pub fn count(map: &HashMap<String, usize>, name: &str) -> usize {
        map.get(name).copied().unwrap_or(0)
    }

    fn bump(map: &mut HashMap<String, usize>, name: &str) {
        *map.entry(name.to_string()).or_insert(0) += 1;
    }
}

struct SubscriptionEntry {
    topic: String,
    type_name: String,
    node_id: u64,
    handler: Arc<dyn MessageHandler>,
    queue: Arc<ReadyQueue>,
    alive: Arc<AtomicBool>,
}

struct ServiceEntry {
    type_name: String,
    handler: Arc<ServiceFn>,
}

struct ActionEntry {
    type_name: String,
    executor: Arc<ActionFn>,
}

#[derive(Default)]
struct Graph {
    active: bool,
    fail_context_init: Option<String>,
    fail_node_creation: Option<String>,
    next_node_id: u64,
    subscriptions: HashMap<Uuid, SubscriptionEntry>,
    services: HashMap<String, ServiceEntry>,
    actions: HashMap<String, ActionEntry>,
    stats: LoopbackStats,
}

impl Graph {
    fn ensure_active(&self) -> Result<(), MiddlewareError> {
        if self.active {
            Ok(())
        } else {
            Err(MiddlewareError::Context("loopback context is not initialized".to_string()))
        }
    }

    /// Queue `message` on every matching subscription.  Returns the number of
    /// subscriptions reached.
    fn fan_out(&self, topic: &str, type_name: &str, message: &Value) -> usize {
        let mut reached = 0;
        for entry in self.subscriptions.values() {
            if entry.topic != topic || entry.type_name != type_name {
                continue;
            }
            let handler = Arc::clone(&entry.handler);
            let alive = Arc::clone(&entry.alive);
            let message = message.clone();
            entry.queue.push(move || {
                if alive.load(Ordering::SeqCst) {
                    handler.on_message(&message);
                }
            });
            reached += 1;
        }
        reached
    }
}

/// In-process [`Middleware`].  Clones share the same graph.
#[derive(Clone, Default)]
pub struct Loopback {
    graph: Arc<Mutex<Graph>>,
}

impl Loopback {
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of the operation counters.
    pub fn stats(&self) -> LoopbackStats {
        self.graph.lock().stats.clone()
    }

    pub fn is_context_active(&self) -> bool {
        self.graph.lock().active
    }

    /// Make the next context initialisations fail with `reason` (or succeed
    /// again with `None`).
    pub fn fail_context_init(&self, reason: Option<&str>) {
        self.graph.lock().fail_context_init = reason.map(str::to_string);
    }

    /// Make node creation fail with `reason` (or succeed again with `None`).
    pub fn fail_node_creation(&self, reason: Option<&str>) {
        self.graph.lock().fail_node_creation = reason.map(str::to_string);
    }

    /// Register a service server.  Replaces any server with the same name.
    pub fn serve<F>(&self, service: &str, type_name: &str, handler: F)
    where
        F: Fn(&Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        self.graph.lock().services.insert(
            service.to_string(),
            ServiceEntry { type_name: type_name.to_string(), handler: Arc::new(handler) },
        );
    }

    pub fn withdraw_service(&self, service: &str) {
        self.graph.lock().services.remove(service);
    }

    /// Register an action server.  Replaces any server with the same name.
    pub fn serve_action<F>(&self, action: &str, type_name: &str, executor: F)
    where
        F: Fn(&Value) -> GoalOutcome + Send + Sync + 'static,
    {
        self.graph.lock().actions.insert(
            action.to_string(),
            ActionEntry { type_name: type_name.to_string(), executor: Arc::new(executor) },
        );
    }

    pub fn withdraw_action(&self, action: &str) {
        self.graph.lock().actions.remove(action);
    }

    /// Publish `message` from outside any node, as a remote peer would.
    ///
    /// Returns the number of subscriptions the message was queued for.
    pub fn inject(&self, topic: &str, type_name: &str, message: Value) -> usize {
        self.graph.lock().fan_out(topic, type_name, &message)
    }

    /// Number of live subscriptions on `topic` across all nodes.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.graph.lock().subscriptions.values().filter(|s| s.topic == topic).count()
    }
}

#[async_trait]
impl Middleware for Loopback {
    async fn init_context(&self) -> Result<(), MiddlewareError> {
        let mut graph = self.graph.lock();
        if let Some(reason) = &graph.fail_context_init {
            return Err(MiddlewareError::Context(reason.clone()));
        }
        graph.active = true;
        graph.stats.contexts_initialized += 1;
        info!("loopback context initialized");
        Ok(())
    }

    async fn shutdown_context(&self) -> Result<(), MiddlewareError> {
        let mut graph = self.graph.lock();
        graph.active = false;
        info!("loopback context shut down");
        Ok(())
    }

    fn create_node(
        &self,
        name: &str,
        namespace: &str,
    ) -> Result<Arc<dyn MiddlewareNode>, MiddlewareError> {
        let mut graph = self.graph.lock();
        graph.ensure_active()?;
        if let Some(reason) = &graph.fail_node_creation {
            return Err(MiddlewareError::Context(reason.clone()));
        }
        graph.next_node_id += 1;
        graph.stats.nodes_created += 1;
        debug!(node = name, namespace, "loopback node created");
        Ok(Arc::new(LoopbackNode {
            id: graph.next_node_id,
            name: name.to_string(),
            namespace: namespace.to_string(),
            graph: Arc::clone(&self.graph),
            queue: Arc::new(ReadyQueue::new()),
            alive: Arc::new(AtomicBool::new(true)),
            parameters: Mutex::new(HashMap::new()),
        }))
    }
}

// ---------------------------------------------------------------------------
// Node
// ---------------------------------------------------------------------------

struct LoopbackNode {
    id: u64,
    name: String,
    namespace: String,
    graph: Arc<Mutex<Graph>>,
    queue: Arc<ReadyQueue>,
    alive: Arc<AtomicBool>,
    parameters: Mutex<HashMap<String, Value>>,
}

impl LoopbackNode {
    fn ensure_alive(&self) -> Result<(), MiddlewareError> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(MiddlewareError::NodeDestroyed(self.name.clone()))
        }
    }

    fn link(&self) -> NodeLink {
        NodeLink {
            name: self.name.clone(),
            graph: Arc::clone(&self.graph),
            queue: Arc::clone(&self.queue),
            alive: Arc::clone(&self.alive),
        }
    }
}

/// What every entity needs to reach back into its node and the graph.
#[derive(Clone)]
struct NodeLink {
    name: String,
    graph: Arc<Mutex<Graph>>,
    queue: Arc<ReadyQueue>,
    alive: Arc<AtomicBool>,
}

impl NodeLink {
    fn ensure_usable(&self, graph: &Graph) -> Result<(), MiddlewareError> {
        if !self.alive.load(Ordering::SeqCst) {
            return Err(MiddlewareError::NodeDestroyed(self.name.clone()));
        }
        graph.ensure_active()
    }
}

#[async_trait]
impl MiddlewareNode for LoopbackNode {
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
        let mut graph = self.graph.lock();
        graph.ensure_active()?;
        LoopbackStats::bump(&mut graph.stats.publishers_created, topic);
        Ok(Arc::new(LoopbackPublisher {
            link: self.link(),
            topic: topic.to_string(),
            type_name: type_name.to_string(),
        }))
    }

    fn create_subscription(
        &self,
        topic: &str,
        type_name: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<Box<dyn RawSubscription>, MiddlewareError> {
        self.ensure_alive()?;
        let mut graph = self.graph.lock();
        graph.ensure_active()?;
        let id = Uuid::new_v4();
        let alive = Arc::new(AtomicBool::new(true));
        graph.subscriptions.insert(
            id,
            SubscriptionEntry {
                topic: topic.to_string(),
                type_name: type_name.to_string(),
                node_id: self.id,
                handler,
                queue: Arc::clone(&self.queue),
                alive: Arc::clone(&alive),
            },
        );
        LoopbackStats::bump(&mut graph.stats.subscriptions_created, topic);
        Ok(Box::new(LoopbackSubscription {
            id,
            topic: topic.to_string(),
            graph: Arc::clone(&self.graph),
            alive,
        }))
    }

    fn create_client(
        &self,
        service: &str,
        type_name: &str,
    ) -> Result<Arc<dyn RawServiceClient>, MiddlewareError> {
        self.ensure_alive()?;
        let mut graph = self.graph.lock();
        graph.ensure_active()?;
        LoopbackStats::bump(&mut graph.stats.clients_created, service);
        Ok(Arc::new(LoopbackServiceClient {
            link: self.link(),
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
        let mut graph = self.graph.lock();
        graph.ensure_active()?;
        LoopbackStats::bump(&mut graph.stats.action_clients_created, action);
        Ok(Arc::new(LoopbackActionClient {
            link: self.link(),
            action: action.to_string(),
            type_name: type_name.to_string(),
        }))
    }

    fn has_parameter(&self, name: &str) -> bool {
        self.parameters.lock().contains_key(name)
    }

    fn declare_parameter(&self, name: &str, default_value: Value) -> Result<(), MiddlewareError> {
        self.ensure_alive()?;
        LoopbackStats::bump(&mut self.graph.lock().stats.parameters_declared, name);
        self.parameters.lock().insert(name.to_string(), default_value);
        Ok(())
    }

    fn get_parameter(&self, name: &str) -> Option<Value> {
        self.parameters.lock().get(name).cloned()
    }

    async fn set_parameter(&self, name: &str, value: Value) -> Result<(), MiddlewareError> {
        self.ensure_alive()?;
        LoopbackStats::bump(&mut self.graph.lock().stats.parameters_set, name);
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
        let mut graph = self.graph.lock();
        graph.subscriptions.retain(|_, entry| {
            if entry.node_id == self.id {
                entry.alive.store(false, Ordering::SeqCst);
                false
            } else {
                true
            }
        });
        graph.stats.nodes_destroyed += 1;
        self.queue.clear();
        debug!(node = %self.name, "loopback node destroyed");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Entities
// ---------------------------------------------------------------------------

struct LoopbackPublisher {
    link: NodeLink,
    topic: String,
    type_name: String,
}

impl RawPublisher for LoopbackPublisher {
    fn publish(&self, message: &Value) -> Result<(), MiddlewareError> {
        let mut graph = self.link.graph.lock();
        self.link.ensure_usable(&graph)?;
        LoopbackStats::bump(&mut graph.stats.messages_published, &self.topic);
        graph.fan_out(&self.topic, &self.type_name, message);
        Ok(())
    }
}

struct LoopbackSubscription {
    id: Uuid,
    topic: String,
    graph: Arc<Mutex<Graph>>,
    alive: Arc<AtomicBool>,
}

impl RawSubscription for LoopbackSubscription {
    fn destroy(&self) -> Result<(), MiddlewareError> {
        if !self.alive.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        let mut graph = self.graph.lock();
        graph.subscriptions.remove(&self.id);
        LoopbackStats::bump(&mut graph.stats.subscriptions_destroyed, &self.topic);
        Ok(())
    }
}

struct LoopbackServiceClient {
    link: NodeLink,
    service: String,
    type_name: String,
}

impl LoopbackServiceClient {
    fn server_present(&self) -> bool {
        self.link
            .graph
            .lock()
            .services
            .get(&self.service)
            .is_some_and(|entry| entry.type_name == self.type_name)
    }
}

#[async_trait]
impl RawServiceClient for LoopbackServiceClient {
    async fn wait_for_service(&self, timeout: Duration) -> Result<bool, MiddlewareError> {
        poll_until(timeout, move || async move { Ok(self.server_present()) }).await
    }

    async fn call(&self, request: Value) -> Result<Value, MiddlewareError> {
        let handler = {
            let mut graph = self.link.graph.lock();
            self.link.ensure_usable(&graph)?;
            LoopbackStats::bump(&mut graph.stats.requests_sent, &self.service);
            graph.services.get(&self.service).map(|entry| Arc::clone(&entry.handler))
        };
        let reply = match handler {
            Some(handler) => handler(&request).map_err(|details| MiddlewareError::Service {
                service: self.service.clone(),
                details,
            }),
            None => Err(MiddlewareError::Service {
                service: self.service.clone(),
                details: "no server is serving this service".to_string(),
            }),
        };

        let (tx, rx) = oneshot::channel();
        self.link.queue.push(move || {
            let _ = tx.send(reply);
        });
        rx.await.map_err(|_| MiddlewareError::NodeDestroyed(self.link.name.clone()))?
    }
}

struct LoopbackActionClient {
    link: NodeLink,
    action: String,
    type_name: String,
}

impl LoopbackActionClient {
    fn server_present(&self) -> bool {
        self.link
            .graph
            .lock()
            .actions
            .get(&self.action)
            .is_some_and(|entry| entry.type_name == self.type_name)
    }
}

#[async_trait]
impl RawActionClient for LoopbackActionClient {
    async fn wait_for_server(&self, timeout: Duration) -> Result<bool, MiddlewareError> {
        poll_until(timeout, move || async move { Ok(self.server_present()) }).await
    }

    async fn send_goal(
        &self,
        goal: Value,
        feedback: Option<Arc<dyn MessageHandler>>,
    ) -> Result<Box<dyn RawGoalHandle>, MiddlewareError> {
        let executor = {
            let mut graph = self.link.graph.lock();
            self.link.ensure_usable(&graph)?;
            LoopbackStats::bump(&mut graph.stats.goals_sent, &self.action);
            graph.actions.get(&self.action).map(|entry| Arc::clone(&entry.executor))
        };
        let Some(executor) = executor else {
            return Err(MiddlewareError::Action {
                action: self.action.clone(),
                details: "no action server is running".to_string(),
            });
        };

        let (accepted_tx, accepted_rx) = oneshot::channel();
        let (result_tx, result_rx) = oneshot::channel();
        let queue = &self.link.queue;

        let (accepted, updates, terminal) = match executor(&goal) {
            GoalOutcome::Rejected => (false, Vec::new(), None),
            GoalOutcome::Succeeded { feedback, result } => (true, feedback, Some(Ok(result))),
            GoalOutcome::Aborted { feedback, reason } => (
                true,
                feedback,
                Some(Err(MiddlewareError::Action { action: self.action.clone(), details: reason })),
            ),
        };

        queue.push(move || {
            let _ = accepted_tx.send(accepted);
        });
        for update in updates {
            if let Some(handler) = &feedback {
                let handler = Arc::clone(handler);
                queue.push(move || handler.on_message(&update));
            }
        }
        if let Some(terminal) = terminal {
            queue.push(move || {
                let _ = result_tx.send(terminal);
            });
        }

        let accepted = accepted_rx
            .await
            .map_err(|_| MiddlewareError::NodeDestroyed(self.link.name.clone()))?;
        Ok(Box::new(LoopbackGoalHandle {
            accepted,
            node: self.link.name.clone(),
            result: result_rx,
        }))
    }
}

struct LoopbackGoalHandle {
    accepted: bool,
    node: String,
    result: oneshot::Receiver<Result<Value, MiddlewareError>>,
}

#[async_trait]
impl RawGoalHandle for LoopbackGoalHandle {
    fn is_accepted(&self) -> bool {
        self.accepted
    }

    async fn result(self: Box<Self>) -> Result<Value, MiddlewareError> {
        let node = self.node;
        self.result.await.map_err(move |_| MiddlewareError::NodeDestroyed(node))?
    }
}
