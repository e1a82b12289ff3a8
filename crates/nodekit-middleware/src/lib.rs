//! `nodekit-middleware` – the boundary to the robotics middleware.
//!
//! nodekit does not implement a transport.  This crate defines what a
//! `NodeSession` needs from one and ships two adapters.
//!
//! # Modules
//!
//! - [`adapter`] – the [`Middleware`] / [`MiddlewareNode`] traits and the raw
//!   entity handles (publishers, subscriptions, clients, goal handles).
//! - [`ready_queue`] – [`ReadyQueue`], the FIFO of callbacks a node runs on
//!   every `spin_once`.
//! - [`loopback`] – [`Loopback`], an in-process graph with call counters,
//!   used for offline work and tests.
//! - [`rosbridge`] – [`Rosbridge`], a client of a `rosbridge_server`
//!   WebSocket endpoint.

pub mod adapter;
pub mod loopback;
pub mod ready_queue;
pub mod rosbridge;

pub use adapter::{
    Middleware, MiddlewareNode, RawActionClient, RawGoalHandle, RawPublisher, RawServiceClient,
    RawSubscription,
};
pub use loopback::{GoalOutcome, Loopback, LoopbackStats};
pub use ready_queue::ReadyQueue;
pub use rosbridge::{DEFAULT_ROSBRIDGE_URL, Rosbridge};
