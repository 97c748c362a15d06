//! EMLX Callback - synchronous calls from native threads into the runtime
//!
//! Native worker threads sometimes need the managed runtime to evaluate a
//! function in the middle of a native computation. This crate lets such a
//! thread send the request to a single logical evaluator (the dispatcher)
//! and block until the correlated reply arrives.
//!
//! # Core Types
//!
//! - [`CallbackGateway`] - issues tokens, routes requests, delivers replies
//! - [`Inbox`] - the queue a dispatcher reads requests from
//! - [`Dispatcher`] - reference evaluator driven by a [`FunctionTable`]
//! - [`CallbackMessage`] - `(function, args, token)` as seen by a dispatcher
//!
//! # Protocol
//!
//! ```text
//! worker thread                gateway                    dispatcher
//!      │ call(target, f, args)    │                            │
//!      │────────────────────────▶ │ pending[token] = slot      │
//!      │                          │──── (f, args, token) ────▶ │
//!      │ parked on slot condvar   │                            │ evaluate f(args)
//!      │                          │ ◀──── complete(token, v) ──│
//!      │ ◀──── v ──────────────── │ slot: Pending → Completed  │
//!      │ slot: Completed → Consumed                            │
//! ```
//!
//! Each token is resolved at most once. A second `complete` reports
//! [`GatewayError::AlreadyCompleted`]; a token that was never issued (or
//! whose caller timed out) reports [`GatewayError::UnknownCorrelation`].
//!
//! Calls block indefinitely by default. See the [`gateway`] module for the
//! deadlock hazard this implies.
//!
//! # Example
//!
//! ```rust
//! use emlx_callback::{CallbackGateway, Dispatcher, DispatcherConfig, FunctionTable, GatewayConfig};
//!
//! let gateway = CallbackGateway::<i64>::new(GatewayConfig::default());
//!
//! let mut table = FunctionTable::new();
//! table.register("add", |args: &[i64]| Ok(args.iter().sum()));
//!
//! let dispatcher = Dispatcher::new(&gateway, "dispatcher-1", table)
//!     .unwrap()
//!     .spawn(&DispatcherConfig::default())
//!     .unwrap();
//!
//! let sum = std::thread::spawn({
//!     let gateway = gateway.clone();
//!     move || gateway.call("dispatcher-1", "add", vec![1, 2])
//! });
//! assert_eq!(sum.join().unwrap(), Ok(3));
//!
//! dispatcher.shutdown().unwrap();
//! ```

pub mod dispatcher;
pub mod error;
pub mod gateway;
pub mod request;

pub use dispatcher::{Dispatcher, DispatcherHandle, DispatcherStats, Function, FunctionTable};
pub use error::{GatewayError, GatewayResult};
pub use gateway::{CallbackGateway, Inbox};
pub use request::{CallbackMessage, CorrelationToken, FunctionRef, RequestState};

use std::time::Duration;

/// Configuration for a callback gateway.
///
/// The defaults reproduce the plain blocking bridge: unbounded inboxes and
/// no timeout.
#[derive(Debug, Clone, Default)]
pub struct GatewayConfig {
    /// Withdraw requests that get no reply within this time.
    ///
    /// Setting this is the only protection against a dispatcher that needs
    /// the blocked worker to make progress; with `None` such a call never
    /// returns.
    pub default_timeout: Option<Duration>,
    /// Capacity of each dispatcher inbox; `None` for unbounded.
    ///
    /// With a bound, `call` blocks while the inbox is full.
    pub inbox_capacity: Option<usize>,
    /// Most requests that may wait for a reply at once; `None` for no limit.
    ///
    /// A call beyond the limit fails with [`GatewayError::OutOfMemory`] and
    /// sends nothing.
    pub max_pending_requests: Option<usize>,
}

impl GatewayConfig {
    /// Create a new gateway configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the timeout applied by `call`.
    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = Some(timeout);
        self
    }

    /// Bound every dispatcher inbox.
    pub fn with_inbox_capacity(mut self, capacity: usize) -> Self {
        self.inbox_capacity = Some(capacity);
        self
    }

    /// Limit the number of requests waiting for a reply.
    pub fn with_max_pending_requests(mut self, limit: usize) -> Self {
        self.max_pending_requests = Some(limit);
        self
    }
}

/// Configuration for dispatcher threads.
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Name prefix for dispatcher threads
    pub thread_name_prefix: String,
    /// Stack size for dispatcher threads (bytes)
    pub stack_size: Option<usize>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            thread_name_prefix: "emlx-dispatcher".to_string(),
            stack_size: None,
        }
    }
}

impl DispatcherConfig {
    /// Create a new dispatcher configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the thread name prefix.
    pub fn with_thread_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.thread_name_prefix = prefix.into();
        self
    }

    /// Set the stack size for dispatcher threads.
    pub fn with_stack_size(mut self, size: usize) -> Self {
        self.stack_size = Some(size);
        self
    }
}
