//! The callback gateway.
//!
//! A native worker thread calls [`CallbackGateway::call`] to have the
//! managed runtime evaluate a function. The gateway publishes a pending
//! request under a fresh [`CorrelationToken`], sends the message to the
//! named dispatcher's inbox, and parks the worker until the dispatcher
//! answers through [`CallbackGateway::complete`] or
//! [`CallbackGateway::fail`].
//!
//! The target registry holds the only sender of each inbox channel, and
//! messages are sent while the registry is read-locked. Unregistering a
//! target therefore disconnects its channel, and once an inbox has been
//! unregistered nothing more can land in it.
//!
//! # Deadlock hazard
//!
//! The worker stays blocked for as long as the dispatcher takes. If the
//! dispatcher, while evaluating a request, needs more native work done on
//! the very worker that is waiting for that request, neither side can make
//! progress. The gateway does not detect this. Native work requested from
//! inside a callback must run on a different worker, or the call must use
//! a timeout (see [`GatewayConfig::default_timeout`]).

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use crossbeam_channel::{Receiver, SendTimeoutError, Sender};
use parking_lot::{Mutex, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use smol_str::SmolStr;
use tracing::{debug, trace, warn};

use crate::error::{GatewayError, GatewayResult};
use crate::request::{CallbackMessage, CallbackSlot, CorrelationToken, FunctionRef, Reply};
use crate::GatewayConfig;

/// How long a send into a full inbox holds the registry lock before
/// letting writers in and retrying.
const SEND_SLICE: Duration = Duration::from_millis(1);

/// A registered dispatcher inbox.
struct Registration<V> {
    id: u64,
    sender: Sender<CallbackMessage<V>>,
}

struct GatewayInner<V> {
    config: GatewayConfig,
    /// Next token to hand out; tokens start at 1.
    next_token: AtomicU64,
    next_registration: AtomicU64,
    targets: RwLock<FxHashMap<SmolStr, Registration<V>>>,
    pending: Mutex<FxHashMap<CorrelationToken, Arc<CallbackSlot<V>>>>,
    /// Tokens whose caller stopped waiting before a reply arrived.
    withdrawn: Mutex<FxHashSet<CorrelationToken>>,
}

impl<V> GatewayInner<V> {
    fn issue_token(&self) -> CorrelationToken {
        CorrelationToken::from_raw(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Remove a pending request whose caller gave up.
    ///
    /// Returns `false` if a resolver already claimed it.
    fn withdraw(&self, token: CorrelationToken) -> bool {
        if self.pending.lock().remove(&token).is_none() {
            return false;
        }
        self.withdrawn.lock().insert(token);
        true
    }

    fn missing(&self, token: CorrelationToken) -> GatewayError {
        let issued = token.as_u64() > 0 && token.as_u64() < self.next_token.load(Ordering::Acquire);
        if !issued || self.withdrawn.lock().contains(&token) {
            GatewayError::UnknownCorrelation(token)
        } else {
            GatewayError::AlreadyCompleted(token)
        }
    }

    fn resolve(&self, token: CorrelationToken, reply: Reply<V>) -> GatewayResult<()> {
        let slot = self.pending.lock().remove(&token);
        match slot {
            Some(slot) => {
                let ok = reply.is_ok();
                slot.resolve(reply)?;
                trace!(%token, function = %slot.function(), ok, "request resolved");
                Ok(())
            }
            None => {
                let err = self.missing(token);
                debug!(%token, "rejected resolution: {}", err);
                Err(err)
            }
        }
    }

    /// Send `message` to the inbox registered as `target`.
    ///
    /// The registry stays read-locked while the message goes in, so the
    /// inbox cannot be unregistered and drained in between.
    fn deliver(&self, target: &str, mut message: CallbackMessage<V>) -> GatewayResult<()> {
        loop {
            let sent = {
                let targets = self.targets.read();
                let Some(registration) = targets.get(target) else {
                    return Err(GatewayError::UnknownTarget(SmolStr::new(target)));
                };
                registration.sender.send_timeout(message, SEND_SLICE)
            };
            match sent {
                Ok(()) => return Ok(()),
                // full inbox: release the lock so the target can go away
                Err(SendTimeoutError::Timeout(returned)) => message = returned,
                Err(SendTimeoutError::Disconnected(_)) => {
                    return Err(GatewayError::DispatcherUnavailable(SmolStr::new(target)))
                }
            }
        }
    }

    fn unregister(&self, target: &str) -> bool {
        self.targets.write().remove(target).is_some()
    }

    /// Unregister `target` only if it still belongs to registration `id`.
    fn unregister_if(&self, target: &str, id: u64) -> bool {
        let mut targets = self.targets.write();
        if targets.get(target).map_or(false, |registration| registration.id == id) {
            targets.remove(target);
            true
        } else {
            false
        }
    }
}

/// Bridge from native worker threads to named dispatchers.
///
/// Cloning the gateway shares the same token space, pending table and
/// target registry.
pub struct CallbackGateway<V> {
    inner: Arc<GatewayInner<V>>,
}

impl<V: Send + 'static> CallbackGateway<V> {
    /// Create a gateway with no registered targets.
    pub fn new(config: GatewayConfig) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                config,
                next_token: AtomicU64::new(1),
                next_registration: AtomicU64::new(1),
                targets: RwLock::new(FxHashMap::default()),
                pending: Mutex::new(FxHashMap::default()),
                withdrawn: Mutex::new(FxHashSet::default()),
            }),
        }
    }

    /// The gateway's configuration.
    pub fn config(&self) -> &GatewayConfig {
        &self.inner.config
    }

    /// Open the inbox for a dispatcher addressed as `target`.
    pub fn register_target(&self, target: impl Into<SmolStr>) -> GatewayResult<Inbox<V>> {
        let target = target.into();
        let mut targets = self.inner.targets.write();
        if targets.contains_key(&target) {
            return Err(GatewayError::TargetExists(target));
        }

        let (sender, receiver) = match self.inner.config.inbox_capacity {
            Some(capacity) => crossbeam_channel::bounded(capacity),
            None => crossbeam_channel::unbounded(),
        };
        let id = self.inner.next_registration.fetch_add(1, Ordering::Relaxed);
        targets.insert(target.clone(), Registration { id, sender });
        debug!(%target, registration = id, "registered dispatcher target");

        Ok(Inbox {
            target,
            registration: id,
            receiver,
            gateway: Arc::downgrade(&self.inner),
        })
    }

    /// Stop routing requests to `target`.
    ///
    /// The dispatcher still receives whatever was queued before this call.
    pub fn unregister_target(&self, target: &str) -> bool {
        let removed = self.inner.unregister(target);
        if removed {
            debug!(%target, "unregistered dispatcher target");
        }
        removed
    }

    /// Whether a dispatcher is registered as `target`.
    pub fn has_target(&self, target: &str) -> bool {
        self.inner.targets.read().contains_key(target)
    }

    /// Number of requests waiting for a reply.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().len()
    }

    /// Evaluate `function(args)` on the dispatcher `target`, blocking the
    /// calling thread until the reply arrives.
    ///
    /// Blocks indefinitely unless [`GatewayConfig::default_timeout`] is set.
    ///
    /// [`GatewayError::OutOfMemory`] is reported when the pending table is at
    /// [`GatewayConfig::max_pending_requests`] or cannot grow. The request
    /// slot itself is an ordinary heap allocation; if that fails the process
    /// aborts before the table is consulted.
    pub fn call(
        &self,
        target: &str,
        function: impl Into<FunctionRef>,
        args: Vec<V>,
    ) -> GatewayResult<V> {
        match self.inner.config.default_timeout {
            Some(timeout) => self.call_timeout(target, function, args, timeout),
            None => {
                let slot = self.publish(target, function.into(), args)?;
                slot.wait()
            }
        }
    }

    /// Like [`call`](Self::call), but withdraw the request after `timeout`.
    ///
    /// A reply that arrives after the withdrawal is rejected with
    /// [`GatewayError::UnknownCorrelation`].
    pub fn call_timeout(
        &self,
        target: &str,
        function: impl Into<FunctionRef>,
        args: Vec<V>,
        timeout: Duration,
    ) -> GatewayResult<V> {
        let slot = self.publish(target, function.into(), args)?;
        if let Some(reply) = slot.wait_for(timeout) {
            return reply;
        }

        let token = slot.token();
        if self.inner.withdraw(token) {
            warn!(%token, %target, ?timeout, "bridged call timed out");
            return Err(GatewayError::Timeout { token, timeout });
        }
        // A resolver removed the request first; its reply is about to land.
        slot.wait()
    }

    /// Deliver the reply for `token` and wake its caller.
    pub fn complete(&self, token: CorrelationToken, value: V) -> GatewayResult<()> {
        self.inner.resolve(token, Ok(value))
    }

    /// Resolve `token` with an error instead of a value.
    pub fn fail(&self, token: CorrelationToken, error: GatewayError) -> GatewayResult<()> {
        self.inner.resolve(token, Err(error))
    }

    /// Publish a pending request and send it to the target's inbox.
    fn publish(
        &self,
        target: &str,
        function: FunctionRef,
        args: Vec<V>,
    ) -> GatewayResult<Arc<CallbackSlot<V>>> {
        if !self.has_target(target) {
            return Err(GatewayError::UnknownTarget(SmolStr::new(target)));
        }

        let slot = {
            let mut pending = self.inner.pending.lock();
            let full = self
                .inner
                .config
                .max_pending_requests
                .map_or(false, |limit| pending.len() >= limit);
            if full || pending.try_reserve(1).is_err() {
                warn!(%target, pending = pending.len(), "callback request refused");
                return Err(GatewayError::OutOfMemory {
                    context: "publishing a callback request",
                });
            }
            let token = self.inner.issue_token();
            let slot = Arc::new(CallbackSlot::new(token, function.clone()));
            pending.insert(token, Arc::clone(&slot));
            slot
        };

        let token = slot.token();
        let message = CallbackMessage {
            function,
            args,
            token,
        };
        if let Err(err) = self.inner.deliver(target, message) {
            // never sent, so no resolver can know the token
            self.inner.pending.lock().remove(&token);
            debug!(%token, %target, "request not delivered: {}", err);
            return Err(err);
        }

        trace!(%token, %target, function = %slot.function(), "request published");
        Ok(slot)
    }
}

impl<V> Clone for CallbackGateway<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Send + 'static> Default for CallbackGateway<V> {
    fn default() -> Self {
        Self::new(GatewayConfig::default())
    }
}

impl<V> fmt::Debug for CallbackGateway<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackGateway")
            .field("config", &self.inner.config)
            .field("pending", &self.inner.pending.lock().len())
            .field("targets", &self.inner.targets.read().len())
            .finish()
    }
}

/// Receiving end of a dispatcher target.
///
/// Dropping the inbox unregisters the target and fails every request still
/// queued in it with [`GatewayError::DispatcherUnavailable`], so no caller
/// is left waiting on a message nobody will read.
pub struct Inbox<V> {
    target: SmolStr,
    registration: u64,
    receiver: Receiver<CallbackMessage<V>>,
    gateway: Weak<GatewayInner<V>>,
}

impl<V> Inbox<V> {
    /// The name this inbox is registered under.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Wait for the next request.
    ///
    /// Returns `None` once the target is unregistered and the queue is empty.
    pub fn recv(&self) -> Option<CallbackMessage<V>> {
        self.receiver.recv().ok()
    }

    /// Wait up to `timeout` for the next request.
    pub fn recv_timeout(&self, timeout: Duration) -> Option<CallbackMessage<V>> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Take the next request if one is queued.
    pub fn try_recv(&self) -> Option<CallbackMessage<V>> {
        self.receiver.try_recv().ok()
    }

    /// Number of queued requests.
    pub fn len(&self) -> usize {
        self.receiver.len()
    }

    /// Whether no requests are queued.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Whether the gateway still routes requests to this inbox.
    pub fn is_registered(&self) -> bool {
        let Some(gateway) = self.gateway.upgrade() else {
            return false;
        };
        let targets = gateway.targets.read();
        targets
            .get(&self.target)
            .map_or(false, |registration| registration.id == self.registration)
    }
}

impl<V> Drop for Inbox<V> {
    fn drop(&mut self) {
        let Some(gateway) = self.gateway.upgrade() else {
            return;
        };

        // after this no sender is left, so the drain below sees everything
        gateway.unregister_if(&self.target, self.registration);

        for message in self.receiver.try_iter() {
            let err = GatewayError::DispatcherUnavailable(self.target.clone());
            if gateway.resolve(message.token, Err(err)).is_ok() {
                warn!(token = %message.token, target = %self.target, "dropped undelivered request");
            }
        }
    }
}

impl<V> fmt::Debug for Inbox<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Inbox")
            .field("target", &self.target)
            .field("registration", &self.registration)
            .field("queued", &self.receiver.len())
            .finish()
    }
}
