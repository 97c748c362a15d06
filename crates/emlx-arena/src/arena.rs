//! The arena that hands out native array handles.
//!
//! One arena exists per payload type. It is constructed once at startup and
//! passed to every component that creates or consumes handles; cloning a
//! [`ResourceArena`] shares the same accounting.

use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use smol_str::SmolStr;
use tracing::{trace, warn};

use crate::error::{ArenaError, ArenaResult};
use crate::handle::{Borrowed, HandleId, Lease, ResourceHandle};
use crate::ArenaConfig;

/// Accounting shared by an arena and every handle it produced.
pub(crate) struct ArenaShared {
    name: SmolStr,
    max_live_handles: Option<usize>,
    live: AtomicUsize,
    allocated: AtomicU64,
    destroyed: AtomicU64,
}

impl ArenaShared {
    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    /// Reserve room for one more live handle.
    fn reserve(&self) -> ArenaResult<()> {
        let limit = match self.max_live_handles {
            Some(limit) => limit,
            None => {
                self.live.fetch_add(1, Ordering::AcqRel);
                return Ok(());
            }
        };

        self.live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                if live < limit {
                    Some(live + 1)
                } else {
                    None
                }
            })
            .map(|_| ())
            .map_err(|_| ArenaError::OutOfMemory {
                arena: self.name.to_string(),
                limit,
            })
    }

    pub(crate) fn record_destroyed(&self) {
        self.live.fetch_sub(1, Ordering::AcqRel);
        self.destroyed.fetch_add(1, Ordering::Relaxed);
    }
}

/// Snapshot of an arena's counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ArenaStats {
    /// Handles whose payload has not been destroyed yet
    pub live: usize,
    /// Handles ever allocated
    pub allocated: u64,
    /// Payloads destroyed so far
    pub destroyed: u64,
}

/// Allocator and lifetime authority for native array handles.
pub struct ResourceArena<T> {
    shared: Arc<ArenaShared>,
    _payload: PhantomData<fn(T)>,
}

impl<T> ResourceArena<T> {
    /// Create a new arena.
    pub fn new(config: ArenaConfig) -> Self {
        Self {
            shared: Arc::new(ArenaShared {
                name: config.name,
                max_live_handles: config.max_live_handles,
                live: AtomicUsize::new(0),
                allocated: AtomicU64::new(0),
                destroyed: AtomicU64::new(0),
            }),
            _payload: PhantomData,
        }
    }

    /// The arena's resource-type name.
    pub fn name(&self) -> &str {
        self.shared.name()
    }

    /// Wrap a native value in a new handle with a reference count of one.
    ///
    /// On [`ArenaError::OutOfMemory`] no handle is registered and the value
    /// is dropped.
    pub fn allocate(&self, value: T) -> ArenaResult<ResourceHandle<T>> {
        if let Err(err) = self.shared.reserve() {
            warn!(arena = %self.shared.name, "allocation refused: {}", err);
            return Err(err);
        }

        let id = HandleId::from_raw(self.shared.allocated.fetch_add(1, Ordering::Relaxed) + 1);
        let handle = ResourceHandle::new(id, value, Arc::clone(&self.shared));
        trace!(arena = %self.shared.name, handle = %handle.id(), "allocated");
        Ok(handle)
    }

    /// Borrow a handle's payload for the duration of a call.
    pub fn borrow<'h>(&self, handle: &'h ResourceHandle<T>) -> ArenaResult<Borrowed<'h, T>> {
        debug_assert!(handle.belongs_to(&self.shared), "handle from another arena");
        handle.borrow()
    }

    /// Take a counted reference that outlives the current call.
    pub fn lease(&self, handle: &ResourceHandle<T>) -> ArenaResult<Lease<T>> {
        debug_assert!(handle.belongs_to(&self.shared), "handle from another arena");
        handle.lease()
    }

    /// Relinquish the user-visible owner reference.
    pub fn retire(&self, handle: &ResourceHandle<T>) -> bool {
        debug_assert!(handle.belongs_to(&self.shared), "handle from another arena");
        handle.retire()
    }

    /// Current counters.
    pub fn stats(&self) -> ArenaStats {
        ArenaStats {
            live: self.shared.live.load(Ordering::Acquire),
            allocated: self.shared.allocated.load(Ordering::Relaxed),
            destroyed: self.shared.destroyed.load(Ordering::Relaxed),
        }
    }
}

impl<T> Clone for ResourceArena<T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
            _payload: PhantomData,
        }
    }
}

impl<T> Default for ResourceArena<T> {
    fn default() -> Self {
        Self::new(ArenaConfig::default())
    }
}

impl<T> fmt::Debug for ResourceArena<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceArena")
            .field("name", &self.shared.name)
            .field("stats", &self.stats())
            .finish()
    }
}
