//! Process-wide binding state.
//!
//! An [`EmlxContext`] owns everything the binding needs between calls: the
//! array arena, the callback gateway with the runtime's dispatcher, the
//! operation table and the native worker pool. It is created once with
//! [`EmlxContext::init`] and torn down with [`EmlxContext::shutdown`];
//! clones share the same state.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;

use emlx_arena::{ArenaStats, ResourceArena};
use emlx_callback::{
    CallbackGateway, Dispatcher, DispatcherHandle, DispatcherStats, FunctionTable,
};
use parking_lot::Mutex;
use smol_str::SmolStr;
use tracing::{debug, trace, warn};

use crate::array::HostArray;
use crate::error::{ErrorKind, NativeError, OpError, OpResult, PoolError};
use crate::ops::{OpEnv, OperationTable};
use crate::pool::{panic_message, JobHandle, WorkerPool};
use crate::term::Term;
use crate::EmlxConfig;

struct ContextInner {
    env: OpEnv,
    operations: Arc<OperationTable>,
    pool: WorkerPool,
    dispatcher: Mutex<Option<DispatcherHandle<Term>>>,
}

/// Counters reported by [`EmlxContext::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// Arena counters after the last job finished
    pub arena: ArenaStats,
    /// What the runtime dispatcher answered
    pub dispatcher: DispatcherStats,
}

/// Handle to the binding's state.
#[derive(Clone)]
pub struct EmlxContext {
    inner: Arc<ContextInner>,
}

impl EmlxContext {
    /// Start the binding with the built-in operations.
    ///
    /// `runtime` is the set of functions the dispatcher evaluates when an
    /// operation calls back into the runtime.
    pub fn init(config: EmlxConfig, runtime: FunctionTable<Term>) -> OpResult<Self> {
        Self::init_with(config, runtime, OperationTable::new())
    }

    /// Start the binding with a custom operation table.
    pub fn init_with(
        config: EmlxConfig,
        runtime: FunctionTable<Term>,
        operations: OperationTable,
    ) -> OpResult<Self> {
        let arena = ResourceArena::new(config.arena.clone());
        let gateway = CallbackGateway::new(config.gateway.clone());

        let dispatcher = Dispatcher::new(&gateway, config.runtime_target.clone(), runtime)
            .and_then(|dispatcher| dispatcher.spawn(&config.dispatcher))
            .map_err(|err| OpError::from_native("init", NativeError::from(err)))?;

        let pool = WorkerPool::new(config.workers, &config.worker_name_prefix)
            .map_err(|err| OpError::new("init", ErrorKind::UnknownFailure, err.to_string()))?;

        debug!(
            arena = %arena.name(),
            runtime_target = %config.runtime_target,
            workers = config.workers,
            operations = operations.len(),
            "emlx context initialised"
        );

        Ok(Self {
            inner: Arc::new(ContextInner {
                env: OpEnv::new(arena, gateway, config.runtime_target),
                operations: Arc::new(operations),
                pool,
                dispatcher: Mutex::new(Some(dispatcher)),
            }),
        })
    }

    /// What operation bodies see.
    pub fn env(&self) -> &OpEnv {
        &self.inner.env
    }

    /// The array arena.
    pub fn arena(&self) -> &ResourceArena<HostArray> {
        self.inner.env.arena()
    }

    /// The operation table.
    pub fn operations(&self) -> &OperationTable {
        &self.inner.operations
    }

    /// Run operation `name` on the calling thread.
    pub fn invoke(&self, name: &str, args: &[Term]) -> OpResult<Term> {
        invoke_operation(&self.inner.env, &self.inner.operations, name, args)
    }

    /// Run operation `name` on a native worker thread.
    pub fn submit(&self, name: &str, args: Vec<Term>) -> OpResult<PendingOp> {
        let label = op_label(name, args.len());
        let env = self.inner.env.clone();
        let operations = Arc::clone(&self.inner.operations);
        let op = SmolStr::new(name);

        let job = self
            .inner
            .pool
            .spawn(move || invoke_operation(&env, &operations, &op, &args))
            .map_err(|err| pool_error(label.clone(), err))?;

        Ok(PendingOp { label, job })
    }

    /// Stop the worker pool, then the runtime dispatcher.
    ///
    /// Queued jobs run to completion first, so callbacks they make are still
    /// answered. Later `submit` calls fail; `invoke` keeps working on the
    /// caller's thread but callbacks report the dispatcher as unavailable.
    pub fn shutdown(&self) -> OpResult<ShutdownReport> {
        self.inner.pool.shutdown();

        let dispatcher = match self.inner.dispatcher.lock().take() {
            Some(handle) => handle
                .shutdown()
                .map_err(|err| OpError::from_native("shutdown", NativeError::from(err)))?,
            None => DispatcherStats::default(),
        };

        let report = ShutdownReport {
            arena: self.arena().stats(),
            dispatcher,
        };
        debug!(?report, "emlx context shut down");
        Ok(report)
    }
}

impl fmt::Debug for EmlxContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EmlxContext")
            .field("env", &self.inner.env)
            .field("operations", &self.inner.operations.len())
            .field("pool", &self.inner.pool)
            .finish()
    }
}

/// An operation running on the worker pool.
#[derive(Debug)]
pub struct PendingOp {
    label: SmolStr,
    job: JobHandle<OpResult<Term>>,
}

impl PendingOp {
    /// `name/arity` of the operation.
    pub fn label(&self) -> &str {
        &self.label
    }

    /// Whether the operation has finished.
    pub fn is_complete(&self) -> bool {
        self.job.is_complete()
    }

    /// Block until the operation finishes.
    pub fn wait(self) -> OpResult<Term> {
        let label = self.label;
        self.job.join().map_err(|err| pool_error(label, err))?
    }
}

fn op_label(name: &str, argc: usize) -> SmolStr {
    SmolStr::new(format!("{}/{}", name, argc))
}

fn pool_error(label: SmolStr, err: PoolError) -> OpError {
    let kind = match err {
        PoolError::Panicked(_) => ErrorKind::NativeComputationFailed,
        PoolError::Shutdown | PoolError::SpawnFailed(_) => ErrorKind::UnknownFailure,
    };
    OpError::new(label, kind, err.to_string())
}

fn invoke_operation(
    env: &OpEnv,
    operations: &OperationTable,
    name: &str,
    args: &[Term],
) -> OpResult<Term> {
    let label = op_label(name, args.len());

    let op = operations.get(name).ok_or_else(|| {
        OpError::new(
            label.clone(),
            ErrorKind::UnknownOperation,
            format!("unknown operation {}", name),
        )
    })?;
    if !op.accepts(args.len()) {
        let expected = if op.min_arity == op.max_arity {
            op.min_arity.to_string()
        } else {
            format!("{}..{}", op.min_arity, op.max_arity)
        };
        return Err(OpError::new(
            label,
            ErrorKind::BadArgument,
            format!("{} expects {} arguments, got {}", name, expected, args.len()),
        ));
    }

    match catch_unwind(AssertUnwindSafe(|| (op.run)(env, args))) {
        Ok(Ok(term)) => {
            trace!(op = %label, "operation succeeded");
            Ok(term)
        }
        Ok(Err(err)) => {
            debug!(op = %label, kind = %err.kind(), "operation failed: {}", err);
            Err(OpError::from_native(label, err))
        }
        Err(panic) => {
            let message = format!("{} in NIF.{}", panic_message(panic), label);
            warn!(op = %label, "native code panicked: {}", message);
            Err(OpError::new(
                label,
                ErrorKind::NativeComputationFailed,
                message,
            ))
        }
    }
}
