//! EMLX Ops - the native operations exposed to the managed runtime
//!
//! This crate ties the [`emlx_arena`] handle arena and the
//! [`emlx_callback`] bridge to a table of array operations.
//!
//! # Core Types
//!
//! - [`EmlxContext`] - process-wide state with explicit init and shutdown
//! - [`OperationTable`] - name-indexed registry built from [`OPERATIONS`]
//! - [`Term`] - values crossing the runtime boundary
//! - [`HostArray`] - the array value stored behind every handle
//! - [`OpError`] - `{op, kind, message}` reported by every failed call
//!
//! # Example
//!
//! ```rust
//! use emlx_callback::FunctionTable;
//! use emlx_ops::{EmlxConfig, EmlxContext, Term};
//!
//! let mut runtime = FunctionTable::new();
//! runtime.register("double", |args: &[Term]| match args {
//!     [Term::Float(x)] => Ok(Term::Float(x * 2.0)),
//!     _ => Err("double/1 expects a float".to_string()),
//! });
//!
//! let ctx = EmlxContext::init(EmlxConfig::default(), runtime).unwrap();
//!
//! let x = ctx
//!     .invoke("scalar_tensor", &[Term::Float(1.5), Term::atom("float32")])
//!     .unwrap();
//! let y = ctx
//!     .submit("eval_scalar", vec![x.clone(), Term::atom("double")])
//!     .unwrap()
//!     .wait()
//!     .unwrap();
//!
//! let bytes = ctx.invoke("to_blob", &[y]).unwrap();
//! assert_eq!(bytes, Term::Binary(3.0f32.to_le_bytes().to_vec()));
//!
//! assert_eq!(ctx.invoke("deallocate", &[x]).unwrap(), Term::atom("ok"));
//! ctx.shutdown().unwrap();
//! ```

pub mod array;
pub mod context;
pub mod dtype;
pub mod error;
pub mod ops;
pub mod pool;
pub mod term;

pub use array::HostArray;
pub use context::{EmlxContext, PendingOp, ShutdownReport};
pub use dtype::DType;
pub use error::{ErrorKind, NativeError, NativeResult, OpError, OpResult, PoolError};
pub use ops::{OpEnv, Operation, OperationFn, OperationTable, OPERATIONS};
pub use term::{ArrayHandle, Term};

use std::thread;

use emlx_arena::ArenaConfig;
use emlx_callback::{DispatcherConfig, GatewayConfig};
use smol_str::SmolStr;

/// Configuration for an [`EmlxContext`].
#[derive(Debug, Clone)]
pub struct EmlxConfig {
    /// Array arena settings
    pub arena: ArenaConfig,
    /// Callback bridge settings
    pub gateway: GatewayConfig,
    /// Runtime dispatcher thread settings
    pub dispatcher: DispatcherConfig,
    /// Target name the runtime dispatcher registers under
    pub runtime_target: SmolStr,
    /// Number of native worker threads
    pub workers: usize,
    /// Name prefix for native worker threads
    pub worker_name_prefix: String,
}

impl Default for EmlxConfig {
    fn default() -> Self {
        Self {
            arena: ArenaConfig::default(),
            gateway: GatewayConfig::default(),
            dispatcher: DispatcherConfig::default(),
            runtime_target: SmolStr::new("emlx-runtime"),
            workers: thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            worker_name_prefix: "emlx-worker".to_string(),
        }
    }
}

impl EmlxConfig {
    /// Create a new configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the arena configuration.
    pub fn with_arena(mut self, arena: ArenaConfig) -> Self {
        self.arena = arena;
        self
    }

    /// Set the callback gateway configuration.
    pub fn with_gateway(mut self, gateway: GatewayConfig) -> Self {
        self.gateway = gateway;
        self
    }

    /// Set the dispatcher thread configuration.
    pub fn with_dispatcher(mut self, dispatcher: DispatcherConfig) -> Self {
        self.dispatcher = dispatcher;
        self
    }

    /// Set the target name callbacks are sent to.
    pub fn with_runtime_target(mut self, target: impl Into<SmolStr>) -> Self {
        self.runtime_target = target.into();
        self
    }

    /// Set the number of native worker threads.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    /// Set the worker thread name prefix.
    pub fn with_worker_name_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.worker_name_prefix = prefix.into();
        self
    }
}
