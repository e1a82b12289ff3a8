//! `nodekit-session` – The Node Session Facade
//!
//! A single object that owns one middleware node and exposes topic, service,
//! action and parameter operations with lazily-created, cached entities.
//!
//! # Modules
//!
//! - [`config`] – [`SessionConfig`]: node identity and dispatch cadence.
//! - [`session`] – [`NodeSession`]: lifecycle, entity caches and every
//!   user-facing operation.
//!
//! The dispatch loop that delivers queued callbacks is private; it starts in
//! [`NodeSession::init`] and is stopped by [`NodeSession::shutdown`].
//!
//! # Lifecycle
//!
//! | State | Entered by | Operations |
//! |---|---|---|
//! | uninitialized | `new`, `shutdown`, failed `init` | `init`, `shutdown` (no-op) |
//! | ready | successful `init` | everything |

pub mod config;
mod dispatch;
pub mod session;

pub use config::{DEFAULT_CALL_TIMEOUT, SessionConfig};
pub use nodekit_types::{EntityKind, MessageHandler, MiddlewareError, SessionError};
pub use session::{NodeSession, Publisher, SubscriptionHandle};
