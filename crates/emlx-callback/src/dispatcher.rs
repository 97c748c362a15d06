//! Reference dispatcher for the managed-runtime side of the bridge.
//!
//! A [`Dispatcher`] owns one inbox and evaluates the requests in it one at
//! a time, looking functions up in a [`FunctionTable`]. Every message it
//! takes is answered exactly once: with the function's value, or with
//! [`GatewayError::DispatchFailed`] if the function is undefined, returns an
//! error, or panics.

use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::thread::{self, JoinHandle as StdJoinHandle};

use rustc_hash::FxHashMap;
use smol_str::SmolStr;
use tracing::{debug, instrument, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::gateway::{CallbackGateway, Inbox};
use crate::request::{CallbackMessage, CorrelationToken, FunctionRef};
use crate::DispatcherConfig;

/// A function value the dispatcher can evaluate.
pub type Function<V> = Arc<dyn Fn(&[V]) -> Result<V, String> + Send + Sync>;

/// Name-to-function table consulted for every request.
pub struct FunctionTable<V> {
    functions: FxHashMap<FunctionRef, Function<V>>,
}

impl<V> FunctionTable<V> {
    /// Create an empty table.
    pub fn new() -> Self {
        Self {
            functions: FxHashMap::default(),
        }
    }

    /// Build a table from `(name, function)` entries.
    pub fn from_entries<I, F>(entries: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, F)>,
        F: Fn(&[V]) -> Result<V, String> + Send + Sync + 'static,
    {
        let mut table = Self::new();
        for (name, function) in entries {
            table.register(name, function);
        }
        table
    }

    /// Add or replace a function.
    pub fn register<F>(&mut self, name: impl Into<FunctionRef>, function: F)
    where
        F: Fn(&[V]) -> Result<V, String> + Send + Sync + 'static,
    {
        self.functions.insert(name.into(), Arc::new(function));
    }

    /// Look up a function.
    pub fn get(&self, name: &FunctionRef) -> Option<&Function<V>> {
        self.functions.get(name)
    }

    /// Number of registered functions.
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Whether the table is empty.
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

impl<V> Default for FunctionTable<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Clone for FunctionTable<V> {
    fn clone(&self) -> Self {
        Self {
            functions: self.functions.clone(),
        }
    }
}

impl<V> fmt::Debug for FunctionTable<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.functions.keys()).finish()
    }
}

/// Counters reported when a dispatcher stops.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DispatcherStats {
    /// Requests answered with a value
    pub completed: u64,
    /// Requests answered with an error
    pub failed: u64,
    /// Replies the gateway refused (the caller had already given up)
    pub rejected: u64,
}

/// Single sequential evaluator for one target.
pub struct Dispatcher<V> {
    target: SmolStr,
    inbox: Inbox<V>,
    table: FunctionTable<V>,
    gateway: CallbackGateway<V>,
    stats: DispatcherStats,
}

impl<V: Send + 'static> Dispatcher<V> {
    /// Register `target` on the gateway and build a dispatcher for it.
    pub fn new(
        gateway: &CallbackGateway<V>,
        target: impl Into<SmolStr>,
        table: FunctionTable<V>,
    ) -> GatewayResult<Self> {
        let target = target.into();
        let inbox = gateway.register_target(target.clone())?;
        Ok(Self {
            target,
            inbox,
            table,
            gateway: gateway.clone(),
            stats: DispatcherStats::default(),
        })
    }

    /// The target this dispatcher serves.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Counters so far.
    pub fn stats(&self) -> DispatcherStats {
        self.stats
    }

    /// Wait for one request and answer it.
    ///
    /// Returns `None` once the target has been unregistered and drained.
    pub fn run_once(&mut self) -> Option<CorrelationToken> {
        let message = self.inbox.recv()?;
        Some(self.handle(message))
    }

    /// Answer one request if one is queued.
    pub fn try_run_once(&mut self) -> Option<CorrelationToken> {
        let message = self.inbox.try_recv()?;
        Some(self.handle(message))
    }

    /// Answer requests until the target is unregistered.
    #[instrument(skip_all, fields(target = %self.target))]
    pub fn run(mut self) -> DispatcherStats {
        debug!("dispatcher started");
        while self.run_once().is_some() {}
        debug!(stats = ?self.stats, "dispatcher stopped");
        self.stats
    }

    /// Run the dispatcher on its own thread.
    pub fn spawn(self, config: &DispatcherConfig) -> GatewayResult<DispatcherHandle<V>> {
        let target = self.target.clone();
        let gateway = self.gateway.clone();

        let mut builder =
            thread::Builder::new().name(format!("{}-{}", config.thread_name_prefix, target));
        if let Some(size) = config.stack_size {
            builder = builder.stack_size(size);
        }

        let thread = builder
            .spawn(move || self.run())
            .map_err(|e| GatewayError::UnknownFailure(format!("failed to spawn dispatcher: {}", e)))?;

        Ok(DispatcherHandle {
            target,
            gateway,
            thread: Some(thread),
        })
    }

    fn handle(&mut self, message: CallbackMessage<V>) -> CorrelationToken {
        let CallbackMessage {
            function,
            args,
            token,
        } = message;

        let outcome = match self.table.get(&function) {
            None => Err("undefined function".to_string()),
            Some(f) => match catch_unwind(AssertUnwindSafe(|| f(args.as_slice()))) {
                Ok(result) => result,
                Err(panic) => Err(panic_message(panic)),
            },
        };

        let delivered = match outcome {
            Ok(value) => {
                self.stats.completed += 1;
                self.gateway.complete(token, value)
            }
            Err(message) => {
                self.stats.failed += 1;
                let err = GatewayError::DispatchFailed {
                    function: function.clone(),
                    message,
                };
                self.gateway.fail(token, err)
            }
        };

        if let Err(err) = delivered {
            self.stats.rejected += 1;
            warn!(%token, %function, "reply not delivered: {}", err);
        }
        token
    }
}

impl<V> fmt::Debug for Dispatcher<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dispatcher")
            .field("target", &self.target)
            .field("functions", &self.table.len())
            .field("stats", &self.stats)
            .finish()
    }
}

fn panic_message(panic: Box<dyn std::any::Any + Send>) -> String {
    panic
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| panic.downcast_ref::<&str>().map(|s| s.to_string()))
        .unwrap_or_else(|| "unknown panic".to_string())
}

/// Handle to a dispatcher running on its own thread.
///
/// Dropping the handle shuts the dispatcher down and waits for it.
pub struct DispatcherHandle<V: Send + 'static> {
    target: SmolStr,
    gateway: CallbackGateway<V>,
    thread: Option<StdJoinHandle<DispatcherStats>>,
}

impl<V: Send + 'static> DispatcherHandle<V> {
    /// The target the dispatcher serves.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Unregister the target, let the dispatcher drain its queue, and wait
    /// for it to stop.
    pub fn shutdown(mut self) -> GatewayResult<DispatcherStats> {
        self.stop()
    }

    fn stop(&mut self) -> GatewayResult<DispatcherStats> {
        self.gateway.unregister_target(&self.target);
        match self.thread.take() {
            Some(thread) => thread.join().map_err(|panic| {
                GatewayError::UnknownFailure(format!(
                    "dispatcher '{}' panicked: {}",
                    self.target,
                    panic_message(panic)
                ))
            }),
            None => Ok(DispatcherStats::default()),
        }
    }
}

impl<V: Send + 'static> Drop for DispatcherHandle<V> {
    fn drop(&mut self) {
        if self.thread.is_some() {
            let _ = self.stop();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::GatewayConfig;
    use pretty_assertions::assert_eq;
    use std::thread;

    fn arithmetic() -> FunctionTable<i64> {
        let mut table = FunctionTable::new();
        table.register("add", |args: &[i64]| Ok(args.iter().sum()));
        table.register("neg", |args: &[i64]| {
            args.first()
                .map(|x| -x)
                .ok_or_else(|| "neg/1 expects an argument".to_string())
        });
        table.register("boom", |_: &[i64]| -> Result<i64, String> {
            panic!("evaluator crashed")
        });
        table
    }

    #[test]
    fn test_function_table_lookup() {
        let table = arithmetic();
        assert_eq!(table.len(), 3);
        let add = table.get(&FunctionRef::new("add")).unwrap();
        assert_eq!(add(&[1, 2, 3][..]), Ok(6));
        assert!(table.get(&FunctionRef::new("mul")).is_none());
    }

    #[test]
    fn test_run_once_answers_request() {
        let gateway = CallbackGateway::new(GatewayConfig::default());
        let mut dispatcher = Dispatcher::new(&gateway, "dispatcher-1", arithmetic()).unwrap();

        let worker = {
            let gateway = gateway.clone();
            thread::spawn(move || gateway.call("dispatcher-1", "add", vec![1, 2]))
        };

        assert!(dispatcher.run_once().is_some());
        assert_eq!(worker.join().unwrap(), Ok(3));
        assert_eq!(dispatcher.stats().completed, 1);
    }

    #[test]
    fn test_errors_and_panics_become_failures() {
        let gateway = CallbackGateway::new(GatewayConfig::default());
        let handle = Dispatcher::new(&gateway, "d", arithmetic())
            .unwrap()
            .spawn(&DispatcherConfig::default())
            .unwrap();

        let err = gateway.call("d", "neg", vec![]).unwrap_err();
        assert_eq!(err.kind(), "dispatch_failed");

        let err = gateway.call("d", "boom", vec![]).unwrap_err();
        assert_eq!(
            err,
            GatewayError::DispatchFailed {
                function: FunctionRef::new("boom"),
                message: "evaluator crashed".to_string(),
            }
        );

        let err = gateway.call("d", "missing", vec![]).unwrap_err();
        assert!(err.to_string().contains("undefined function"));

        // the dispatcher survives all of the above
        assert_eq!(gateway.call("d", "neg", vec![5]), Ok(-5));

        let stats = handle.shutdown().unwrap();
        assert_eq!(stats.completed, 1);
        assert_eq!(stats.failed, 3);
    }

    #[test]
    fn test_shutdown_unregisters_target() {
        let gateway = CallbackGateway::<i64>::new(GatewayConfig::default());
        let handle = Dispatcher::new(&gateway, "d", FunctionTable::new())
            .unwrap()
            .spawn(&DispatcherConfig::default())
            .unwrap();
        assert!(gateway.has_target("d"));

        handle.shutdown().unwrap();
        assert!(!gateway.has_target("d"));
        assert_eq!(
            gateway.call("d", "f", vec![]),
            Err(GatewayError::UnknownTarget(SmolStr::new("d")))
        );
    }
}
