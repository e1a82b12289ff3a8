//! The dispatch loop.
//!
//! A [`Dispatcher`] owns a Tokio task that calls
//! [`MiddlewareNode::spin_once`] on a fixed period.  Stopping it is
//! deterministic: [`Dispatcher::stop`] signals the task and waits for it to
//! exit, so no callback runs after it returns.

use std::sync::Arc;
use std::time::Duration;

use nodekit_middleware::MiddlewareNode;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, trace};

pub(crate) struct Dispatcher {
    stop: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl Dispatcher {
    /// Spawn the loop on the current Tokio runtime.
    pub(crate) fn start(node: Arc<dyn MiddlewareNode>, period: Duration) -> Self {
        let (stop_tx, mut stop_rx) = oneshot::channel::<()>();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    _ = ticker.tick() => {
                        let ran = node.spin_once();
                        if ran > 0 {
                            trace!(node = node.name(), ran, "dispatched ready callbacks");
                        }
                    }
                }
            }
        });
        Self { stop: Some(stop_tx), task: Some(task) }
    }

    /// Stop the loop and wait until it has exited.
    pub(crate) async fn stop(mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(task) = self.task.take() {
            if let Err(e) = task.await {
                error!(error = %e, "dispatch loop ended abnormally");
            }
        }
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use nodekit_middleware::{Loopback, Middleware};
    use serde_json::{Value, json};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn loop_delivers_until_stopped() {
        let loopback = Loopback::new();
        loopback.init_context().await.unwrap();
        let node = loopback.create_node("dispatch_test", "/").unwrap();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        let _sub = node
            .create_subscription(
                "/tick",
                "std_msgs/msg/Empty",
                Arc::new(move |_: &Value| {
                    counter.fetch_add(1, Ordering::SeqCst);
                }),
            )
            .unwrap();

        let dispatcher = Dispatcher::start(Arc::clone(&node), Duration::from_millis(2));
        loopback.inject("/tick", "std_msgs/msg/Empty", json!({}));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        dispatcher.stop().await;
        loopback.inject("/tick", "std_msgs/msg/Empty", json!({}));
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }
}
