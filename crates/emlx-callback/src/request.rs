//! Request types for bridged calls.
//!
//! A request moves through `Pending -> Completed -> Consumed`. The reply
//! and the state live under the same mutex the completion condvar waits
//! on, so a waiter can never see a reply before it is signalled, and the
//! signal never fires before the reply is stored.

use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use smol_str::SmolStr;

use crate::error::{GatewayError, GatewayResult};

/// Identifier pairing one blocking call with its single reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CorrelationToken(u64);

impl CorrelationToken {
    /// Build a token from its raw value.
    ///
    /// Tokens are issued by the gateway; this exists for dispatchers that
    /// carry tokens across a serialization boundary.
    pub fn from_raw(raw: u64) -> Self {
        CorrelationToken(raw)
    }

    /// Get the raw token value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for CorrelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Token({})", self.0)
    }
}

/// Name of a function value the dispatcher knows how to evaluate.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FunctionRef(SmolStr);

impl FunctionRef {
    /// Create a function reference.
    pub fn new(name: impl Into<SmolStr>) -> Self {
        FunctionRef(name.into())
    }

    /// The function's name.
    pub fn name(&self) -> &str {
        &self.0
    }
}

impl From<&str> for FunctionRef {
    fn from(name: &str) -> Self {
        FunctionRef::new(name)
    }
}

impl fmt::Display for FunctionRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What a dispatcher inbox receives for every bridged call.
#[derive(Debug, Clone, PartialEq)]
pub struct CallbackMessage<V> {
    /// Function to evaluate
    pub function: FunctionRef,
    /// Arguments for the function
    pub args: Vec<V>,
    /// Token to pass back to `complete`
    pub token: CorrelationToken,
}

/// Lifecycle of one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// Sent to the dispatcher, no reply yet.
    Pending,
    /// Reply written and signalled, not yet read.
    Completed,
    /// The waiter has taken the reply.
    Consumed,
}

pub(crate) type Reply<V> = GatewayResult<V>;

struct SlotInner<V> {
    state: RequestState,
    reply: Option<Reply<V>>,
}

/// The requesting thread's side of one bridged call.
pub(crate) struct CallbackSlot<V> {
    token: CorrelationToken,
    function: FunctionRef,
    inner: Mutex<SlotInner<V>>,
    ready: Condvar,
}

impl<V> CallbackSlot<V> {
    pub(crate) fn new(token: CorrelationToken, function: FunctionRef) -> Self {
        Self {
            token,
            function,
            inner: Mutex::new(SlotInner {
                state: RequestState::Pending,
                reply: None,
            }),
            ready: Condvar::new(),
        }
    }

    pub(crate) fn token(&self) -> CorrelationToken {
        self.token
    }

    pub(crate) fn function(&self) -> &FunctionRef {
        &self.function
    }

    pub(crate) fn state(&self) -> RequestState {
        self.inner.lock().state
    }

    /// Store the reply and wake the waiter. Only the first call succeeds.
    pub(crate) fn resolve(&self, reply: Reply<V>) -> GatewayResult<()> {
        let mut inner = self.inner.lock();
        if inner.state != RequestState::Pending {
            return Err(GatewayError::AlreadyCompleted(self.token));
        }
        inner.reply = Some(reply);
        inner.state = RequestState::Completed;
        self.ready.notify_one();
        Ok(())
    }

    /// Block until the reply exists, then take it.
    pub(crate) fn wait(&self) -> Reply<V> {
        let mut inner = self.inner.lock();
        while inner.state == RequestState::Pending {
            self.ready.wait(&mut inner);
        }
        self.consume(&mut inner)
    }

    /// Like [`wait`](Self::wait), but give up at the timeout.
    ///
    /// Returns `None` if the request is still pending when time runs out;
    /// the slot is left untouched in that case.
    pub(crate) fn wait_for(&self, timeout: Duration) -> Option<Reply<V>> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.inner.lock();
        while inner.state == RequestState::Pending {
            if self.ready.wait_until(&mut inner, deadline).timed_out()
                && inner.state == RequestState::Pending
            {
                return None;
            }
        }
        Some(self.consume(&mut inner))
    }

    fn consume(&self, inner: &mut SlotInner<V>) -> Reply<V> {
        inner.state = RequestState::Consumed;
        inner.reply.take().unwrap_or_else(|| {
            Err(GatewayError::UnknownFailure(format!(
                "request {} was consumed twice",
                self.token
            )))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;
    use std::thread;

    fn slot() -> CallbackSlot<i64> {
        CallbackSlot::new(CorrelationToken(1), FunctionRef::new("f"))
    }

    #[test]
    fn test_token_display() {
        assert_eq!(format!("{}", CorrelationToken(42)), "Token(42)");
    }

    #[test]
    fn test_state_transitions() {
        let slot = slot();
        assert_eq!(slot.state(), RequestState::Pending);

        slot.resolve(Ok(3)).unwrap();
        assert_eq!(slot.state(), RequestState::Completed);

        assert_eq!(slot.wait(), Ok(3));
        assert_eq!(slot.state(), RequestState::Consumed);
    }

    #[test]
    fn test_second_resolve_rejected() {
        let slot = slot();
        slot.resolve(Ok(3)).unwrap();
        assert_eq!(
            slot.resolve(Ok(4)),
            Err(GatewayError::AlreadyCompleted(CorrelationToken(1)))
        );
        assert_eq!(slot.wait(), Ok(3));
    }

    #[test]
    fn test_wait_blocks_until_resolved() {
        let slot = Arc::new(slot());
        let resolver = {
            let slot = Arc::clone(&slot);
            thread::spawn(move || {
                thread::sleep(Duration::from_millis(20));
                slot.resolve(Ok(99)).unwrap();
            })
        };
        assert_eq!(slot.wait(), Ok(99));
        resolver.join().unwrap();
    }

    #[test]
    fn test_wait_for_times_out_without_consuming() {
        let slot = slot();
        assert!(slot.wait_for(Duration::from_millis(10)).is_none());
        assert_eq!(slot.state(), RequestState::Pending);

        slot.resolve(Ok(5)).unwrap();
        assert_eq!(slot.wait_for(Duration::from_millis(10)), Some(Ok(5)));
    }
}
