//! Behavioural contract of `NodeSession`, exercised against the loopback
//! middleware.

use std::sync::Arc;
use std::time::{Duration, Instant};

use nodekit_middleware::{GoalOutcome, Loopback, LoopbackStats};
use nodekit_session::{
    EntityKind, MessageHandler, MiddlewareError, NodeSession, SessionConfig, SessionError,
};
use parking_lot::Mutex;
use serde_json::{Value, json};

const STRING: &str = "std_msgs/msg/String";
const TRIGGER: &str = "std_srvs/srv/Trigger";
const FIBONACCI: &str = "example_interfaces/action/Fibonacci";

fn make_session(loopback: &Loopback) -> NodeSession {
    let config = SessionConfig::default()
        .with_node_name("contract")
        .with_spin_interval(Duration::from_millis(5));
    NodeSession::new(Arc::new(loopback.clone()), config)
}

async fn ready_session(loopback: &Loopback) -> NodeSession {
    let mut session = make_session(loopback);
    session.init().await.unwrap();
    session
}

fn recorder() -> (Arc<Mutex<Vec<Value>>>, impl MessageHandler + 'static) {
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    (seen, move |msg: &Value| sink.lock().push(msg.clone()))
}

/// Give the dispatch loop a few ticks.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(40)).await;
}

// ---------------------------------------------------------------------------
// Publishers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn publisher_is_created_once_and_reused() {
    let loopback = Loopback::new();
    let mut session = ready_session(&loopback).await;

    let first = session.create_publisher("/chatter", STRING).unwrap();
    let second = session.create_publisher("/chatter", STRING).unwrap();
    assert!(first.same_handle(&second));

    session.publish("/chatter", STRING, &json!({ "data": "a" })).unwrap();
    session.publish("/chatter", STRING, &json!({ "data": "b" })).unwrap();

    let stats = loopback.stats();
    assert_eq!(LoopbackStats::count(&stats.publishers_created, "/chatter"), 1);
    assert_eq!(LoopbackStats::count(&stats.messages_published, "/chatter"), 2);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn publisher_with_conflicting_type_is_refused() {
    let loopback = Loopback::new();
    let mut session = ready_session(&loopback).await;
    session.publish("/chatter", STRING, &json!({ "data": "a" })).unwrap();

    let err = session
        .publish("/chatter", "std_msgs/msg/Int32", &json!({ "data": 1 }))
        .unwrap_err();

    assert!(matches!(err, SessionError::TypeMismatch { kind: EntityKind::Publisher, .. }));
    assert_eq!(LoopbackStats::count(&loopback.stats().messages_published, "/chatter"), 1);
    session.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn operations_before_init_fail_without_side_effects() {
    let loopback = Loopback::new();
    let mut session = make_session(&loopback);

    assert!(matches!(
        session.create_publisher("/chatter", STRING),
        Err(SessionError::NotInitialized)
    ));
    assert!(matches!(
        session.publish("/chatter", STRING, &json!({})),
        Err(SessionError::NotInitialized)
    ));
    assert!(matches!(
        session.subscribe("/chatter", STRING, |_: &Value| {}),
        Err(SessionError::NotInitialized)
    ));
    assert!(matches!(
        session.call_service("/trigger", TRIGGER, json!({})).await,
        Err(SessionError::NotInitialized)
    ));
    assert!(matches!(
        session.send_action_goal("/fib", FIBONACCI, json!({ "order": 3 }), None).await,
        Err(SessionError::NotInitialized)
    ));
    assert!(matches!(
        session.declare_param("rate", json!(10)),
        Err(SessionError::NotInitialized)
    ));
    assert!(matches!(session.get_param("rate"), Err(SessionError::NotInitialized)));
    assert!(matches!(
        session.set_param("rate", json!(20)).await,
        Err(SessionError::NotInitialized)
    ));

    let stats = loopback.stats();
    assert_eq!(stats.contexts_initialized, 0);
    assert_eq!(stats.nodes_created, 0);
    assert!(stats.publishers_created.is_empty());
    assert!(stats.subscriptions_created.is_empty());
    assert!(stats.clients_created.is_empty());
    assert!(stats.action_clients_created.is_empty());
    assert!(stats.parameters_declared.is_empty());
    assert!(stats.parameters_set.is_empty());
}

#[tokio::test]
async fn operations_after_shutdown_fail_with_not_initialized() {
    let loopback = Loopback::new();
    let mut session = ready_session(&loopback).await;
    let handle = session.subscribe("/chatter", STRING, |_: &Value| {}).unwrap();
    session.shutdown().await.unwrap();

    assert!(matches!(session.unsubscribe("/chatter", handle), Err(SessionError::NotInitialized)));
    assert!(matches!(
        session.publish("/chatter", STRING, &json!({})),
        Err(SessionError::NotInitialized)
    ));
    assert!(loopback.stats().messages_published.is_empty());
}

#[tokio::test]
async fn shutdown_then_init_starts_with_empty_caches() {
    let loopback = Loopback::new();
    let mut session = ready_session(&loopback).await;
    session.publish("/chatter", STRING, &json!({ "data": "before" })).unwrap();
    session.subscribe("/chatter", STRING, |_: &Value| {}).unwrap();

    session.shutdown().await.unwrap();
    session.init().await.unwrap();

    assert!(!session.has_publisher("/chatter"));
    assert_eq!(session.subscription_count("/chatter"), 0);
    session.publish("/chatter", STRING, &json!({ "data": "after" })).unwrap();

    let stats = loopback.stats();
    assert_eq!(stats.nodes_created, 2);
    assert_eq!(LoopbackStats::count(&stats.publishers_created, "/chatter"), 2);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_context_init_leaves_session_uninitialized() {
    let loopback = Loopback::new();
    loopback.fail_context_init(Some("no network interface"));
    let mut session = make_session(&loopback);

    let err = session.init().await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::InitializationFailed(MiddlewareError::Context(ref reason)) if reason == "no network interface"
    ));
    assert!(!session.is_ready());

    loopback.fail_context_init(None);
    session.init().await.unwrap();
    assert!(session.is_ready());
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn failed_node_creation_tears_the_context_down() {
    let loopback = Loopback::new();
    loopback.fail_node_creation(Some("name already taken"));
    let mut session = make_session(&loopback);

    let err = session.init().await.unwrap_err();

    assert!(matches!(err, SessionError::InitializationFailed(_)));
    assert!(!session.is_ready());
    assert!(!loopback.is_context_active());
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unsubscribe_stops_only_the_selected_handler() {
    let loopback = Loopback::new();
    let mut session = ready_session(&loopback).await;
    let (seen_a, handler_a) = recorder();
    let (seen_b, handler_b) = recorder();

    let handle_a = session.subscribe("/chatter", STRING, handler_a).unwrap();
    let handle_b = session.subscribe("/chatter", STRING, handler_b).unwrap();
    assert_ne!(handle_a, handle_b);
    assert_eq!(session.subscription_count("/chatter"), 2);

    session.publish("/chatter", STRING, &json!({ "data": 1 })).unwrap();
    settle().await;
    assert_eq!(seen_a.lock().len(), 1);
    assert_eq!(seen_b.lock().len(), 1);

    session.unsubscribe("/chatter", handle_a).unwrap();
    session.publish("/chatter", STRING, &json!({ "data": 2 })).unwrap();
    settle().await;

    assert_eq!(*seen_a.lock(), vec![json!({ "data": 1 })]);
    assert_eq!(*seen_b.lock(), vec![json!({ "data": 1 }), json!({ "data": 2 })]);
    assert_eq!(session.subscription_count("/chatter"), 1);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn unsubscribe_is_idempotent() {
    let loopback = Loopback::new();
    let mut session = ready_session(&loopback).await;
    let handle = session.subscribe("/odom", "nav_msgs/msg/Odometry", |_: &Value| {}).unwrap();

    session.unsubscribe("/odom", handle).unwrap();
    session.unsubscribe("/odom", handle).unwrap();
    session.unsubscribe("/never_subscribed", handle).unwrap();

    assert_eq!(LoopbackStats::count(&loopback.stats().subscriptions_destroyed, "/odom"), 1);
    assert_eq!(session.subscription_count("/odom"), 0);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn remote_messages_reach_subscribers() {
    let loopback = Loopback::new();
    let mut session = ready_session(&loopback).await;
    let (seen, handler) = recorder();
    session.subscribe("/scan", "sensor_msgs/msg/LaserScan", handler).unwrap();

    loopback.inject("/scan", "sensor_msgs/msg/LaserScan", json!({ "ranges": [1.0, 2.0] }));
    settle().await;

    assert_eq!(*seen.lock(), vec![json!({ "ranges": [1.0, 2.0] })]);
    session.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Services
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unreachable_service_times_out_without_sending() {
    let loopback = Loopback::new();
    let mut session = ready_session(&loopback).await;
    let timeout = Duration::from_millis(100);

    let started = Instant::now();
    let err = session
        .call_service_with_timeout("/missing", TRIGGER, json!({}), timeout)
        .await
        .unwrap_err();
    let elapsed = started.elapsed();

    assert!(matches!(err, SessionError::ServiceUnavailable { ref service, .. } if service == "/missing"));
    assert!(elapsed >= timeout);
    assert!(elapsed < timeout + Duration::from_millis(500));
    assert_eq!(LoopbackStats::count(&loopback.stats().requests_sent, "/missing"), 0);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn service_call_returns_the_response() {
    let loopback = Loopback::new();
    loopback.serve("/trigger", TRIGGER, |_| Ok(json!({ "success": true, "message": "done" })));
    let mut session = ready_session(&loopback).await;

    let reply = session.call_service("/trigger", TRIGGER, json!({})).await.unwrap();
    let again = session.call_service("/trigger", TRIGGER, json!({})).await.unwrap();

    assert_eq!(reply["success"], json!(true));
    assert_eq!(again, reply);
    let stats = loopback.stats();
    assert_eq!(LoopbackStats::count(&stats.clients_created, "/trigger"), 1);
    assert_eq!(LoopbackStats::count(&stats.requests_sent, "/trigger"), 2);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn service_client_with_conflicting_type_is_refused() {
    let loopback = Loopback::new();
    loopback.serve("/trigger", TRIGGER, |_| Ok(json!({ "success": true })));
    let mut session = ready_session(&loopback).await;
    session.call_service("/trigger", TRIGGER, json!({})).await.unwrap();

    let err = session
        .call_service("/trigger", "std_srvs/srv/Empty", json!({}))
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::TypeMismatch { kind: EntityKind::ServiceClient, .. }));
    assert_eq!(LoopbackStats::count(&loopback.stats().requests_sent, "/trigger"), 1);
    session.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Actions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn feedback_arrives_before_the_result() {
    let loopback = Loopback::new();
    loopback.serve_action("/fib", FIBONACCI, |goal| {
        let order = goal["order"].as_u64().unwrap_or(0);
        let feedback = (1..=order).map(|n| json!({ "partial": n })).collect();
        GoalOutcome::Succeeded { feedback, result: json!({ "sequence": [0, 1, 1] }) }
    });
    let mut session = ready_session(&loopback).await;

    let log = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&log);
    let on_feedback: Arc<dyn MessageHandler> =
        Arc::new(move |fb: &Value| sink.lock().push(fb.clone()));

    let result = session
        .send_action_goal("/fib", FIBONACCI, json!({ "order": 3 }), Some(on_feedback))
        .await
        .unwrap();
    log.lock().push(json!("result"));

    assert_eq!(result, json!({ "sequence": [0, 1, 1] }));
    assert_eq!(
        *log.lock(),
        vec![
            json!({ "partial": 1 }),
            json!({ "partial": 2 }),
            json!({ "partial": 3 }),
            json!("result"),
        ]
    );
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn rejected_goal_produces_no_feedback_or_result() {
    let loopback = Loopback::new();
    loopback.serve_action("/fib", FIBONACCI, |_| GoalOutcome::Rejected);
    let mut session = ready_session(&loopback).await;
    let (seen, handler) = recorder();

    let err = session
        .send_action_goal("/fib", FIBONACCI, json!({ "order": 50 }), Some(Arc::new(handler)))
        .await
        .unwrap_err();
    settle().await;

    assert!(matches!(err, SessionError::GoalRejected { ref action } if action == "/fib"));
    assert!(seen.lock().is_empty());
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn aborted_goal_surfaces_the_middleware_error() {
    let loopback = Loopback::new();
    loopback.serve_action("/fib", FIBONACCI, |_| GoalOutcome::Aborted {
        feedback: Vec::new(),
        reason: "preempted".to_string(),
    });
    let mut session = ready_session(&loopback).await;

    let err = session
        .send_action_goal("/fib", FIBONACCI, json!({ "order": 2 }), None)
        .await
        .unwrap_err();

    assert!(matches!(
        err,
        SessionError::Middleware(MiddlewareError::Action { ref details, .. }) if details == "preempted"
    ));
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn missing_action_server_times_out_without_sending() {
    let loopback = Loopback::new();
    let mut session = ready_session(&loopback).await;

    let err = session
        .send_action_goal_with_timeout(
            "/fib",
            FIBONACCI,
            json!({ "order": 1 }),
            None,
            Duration::from_millis(30),
        )
        .await
        .unwrap_err();

    assert!(matches!(err, SessionError::ActionServerUnavailable { .. }));
    assert_eq!(LoopbackStats::count(&loopback.stats().goals_sent, "/fib"), 0);
    session.shutdown().await.unwrap();
}

// ---------------------------------------------------------------------------
// Parameters
// ---------------------------------------------------------------------------

#[tokio::test]
async fn declare_param_only_declares_once() {
    let loopback = Loopback::new();
    let mut session = ready_session(&loopback).await;

    session.declare_param("rate", json!(10)).unwrap();
    session.declare_param("rate", json!(99)).unwrap();

    assert_eq!(LoopbackStats::count(&loopback.stats().parameters_declared, "rate"), 1);
    assert_eq!(session.get_param("rate").unwrap(), Some(json!(10)));
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn undeclared_param_reads_as_none() {
    let loopback = Loopback::new();
    let mut session = ready_session(&loopback).await;

    assert_eq!(session.get_param("does_not_exist").unwrap(), None);
    session.shutdown().await.unwrap();
}

#[tokio::test]
async fn set_param_forwards_every_call() {
    let loopback = Loopback::new();
    let mut session = ready_session(&loopback).await;

    session.set_param("mode", json!("auto")).await.unwrap();
    session.set_param("mode", json!("auto")).await.unwrap();

    assert_eq!(LoopbackStats::count(&loopback.stats().parameters_set, "mode"), 2);
    assert_eq!(session.get_param("mode").unwrap(), Some(json!("auto")));
    session.shutdown().await.unwrap();
}
