//! Reference-counted handles to native array payloads.
//!
//! A [`ResourceHandle`] is what the managed runtime holds for one native
//! array. Cloning the handle creates another alias (another term pointing
//! at the same resource) and leaves the reference count alone. The count
//! tracks *holders*:
//!
//! - the logical owner reference, present from allocation until [`retire`]
//! - one reference per outstanding [`Borrowed`] guard or [`Lease`]
//!
//! The payload is destroyed on the decrement that moves the count from one
//! to zero. Once the count is zero it never rises again, so a destroyed
//! payload cannot be resurrected by a late borrow.
//!
//! If every alias is dropped while the owner reference is still held (the
//! runtime collected the term without an explicit deallocate), the payload
//! is destroyed at that point instead.
//!
//! [`retire`]: ResourceHandle::retire

use std::cell::UnsafeCell;
use std::fmt;
use std::mem::ManuallyDrop;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, trace};

use crate::arena::ArenaShared;
use crate::error::{ArenaError, ArenaResult};

/// Identifier of a handle, unique within the arena that issued it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandleId(u64);

impl HandleId {
    pub(crate) fn from_raw(id: u64) -> Self {
        HandleId(id)
    }

    /// Get the raw ID value.
    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Handle({})", self.0)
    }
}

/// Outcome of dropping one reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Release {
    /// Other holders remain.
    Retained {
        /// References left after this release
        remaining: usize,
    },
    /// This release was the last one and destroyed the payload.
    Destroyed,
}

impl Release {
    /// Whether this release destroyed the payload.
    pub fn destroyed(&self) -> bool {
        matches!(self, Release::Destroyed)
    }
}

/// Shared state behind every alias of a handle.
struct Slot<T> {
    id: HandleId,
    refcount: AtomicUsize,
    retired: AtomicBool,
    payload: UnsafeCell<ManuallyDrop<T>>,
    arena: Arc<ArenaShared>,
}

// SAFETY: the payload is only read through `&T` while a counted reference
// is held, and only dropped by the single thread whose decrement moved the
// count from one to zero (or by `Drop`, which has exclusive access).
unsafe impl<T: Send> Send for Slot<T> {}
unsafe impl<T: Send + Sync> Sync for Slot<T> {}

impl<T> Slot<T> {
    /// Take one more reference unless the payload is already gone.
    fn acquire(&self) -> ArenaResult<usize> {
        self.refcount
            .fetch_update(Ordering::Acquire, Ordering::Relaxed, |count| {
                if count == 0 {
                    None
                } else {
                    Some(count + 1)
                }
            })
            .map(|previous| previous + 1)
            .map_err(|_| ArenaError::AlreadyRetired)
    }

    /// Drop one reference. The caller must own the reference it drops.
    fn release(&self) -> Release {
        let previous = self.refcount.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(previous > 0, "released a reference that was never held");

        if previous == 1 {
            // SAFETY: we performed the 1 -> 0 transition, so no guard or
            // lease can exist and `acquire` refuses to revive the count.
            unsafe { self.destroy() };
            Release::Destroyed
        } else {
            Release::Retained {
                remaining: previous - 1,
            }
        }
    }

    /// # Safety
    ///
    /// Must be called at most once, and only when no reference remains.
    unsafe fn destroy(&self) {
        ManuallyDrop::drop(&mut *self.payload.get());
        self.arena.record_destroyed();
        trace!(arena = %self.arena.name(), handle = %self.id, "destroyed payload");
    }

    /// # Safety
    ///
    /// The caller must hold a counted reference for the lifetime of the
    /// returned borrow.
    unsafe fn payload(&self) -> &T {
        &*self.payload.get()
    }
}

impl<T> Drop for Slot<T> {
    fn drop(&mut self) {
        // Every alias is gone. Leases and guards keep an alias alive, so
        // only the owner reference can still be counted here.
        if *self.refcount.get_mut() > 0 {
            debug!(
                arena = %self.arena.name(),
                handle = %self.id,
                "collected without retire"
            );
            *self.refcount.get_mut() = 0;
            // SAFETY: `&mut self` gives exclusive access and the count was
            // non-zero, so the payload has not been destroyed yet.
            unsafe { self.destroy() };
        }
    }
}

/// A managed-runtime reference to one native payload.
pub struct ResourceHandle<T> {
    slot: Arc<Slot<T>>,
}

impl<T> ResourceHandle<T> {
    pub(crate) fn new(id: HandleId, value: T, arena: Arc<ArenaShared>) -> Self {
        Self {
            slot: Arc::new(Slot {
                id,
                refcount: AtomicUsize::new(1),
                retired: AtomicBool::new(false),
                payload: UnsafeCell::new(ManuallyDrop::new(value)),
                arena,
            }),
        }
    }

    /// Get the handle's unique identifier.
    pub fn id(&self) -> HandleId {
        self.slot.id
    }

    /// Current number of counted references.
    pub fn refcount(&self) -> usize {
        self.slot.refcount.load(Ordering::Acquire)
    }

    /// Whether explicit deallocation has been requested.
    pub fn is_retired(&self) -> bool {
        self.slot.retired.load(Ordering::Acquire)
    }

    /// Whether the payload has been destroyed.
    pub fn is_destroyed(&self) -> bool {
        self.refcount() == 0
    }

    /// Borrow the payload for the duration of a call.
    ///
    /// Fails with [`ArenaError::AlreadyRetired`] once the payload has been
    /// destroyed. The reference is released when the guard is dropped,
    /// including on early returns and unwinding.
    pub fn borrow(&self) -> ArenaResult<Borrowed<'_, T>> {
        let count = self.slot.acquire()?;
        trace!(handle = %self.slot.id, refcount = count, "borrowed");
        Ok(Borrowed {
            slot: self.slot.as_ref(),
            released: false,
        })
    }

    /// Take a counted reference that can outlive the current call.
    pub fn lease(&self) -> ArenaResult<Lease<T>> {
        let count = self.slot.acquire()?;
        trace!(handle = %self.slot.id, refcount = count, "leased");
        Ok(Lease {
            handle: self.clone(),
            released: false,
        })
    }

    /// Relinquish the owner reference.
    ///
    /// Returns `true` only for the call that performed the retirement.
    /// Later calls observe the flag already set and do nothing.
    pub fn retire(&self) -> bool {
        if self.slot.retired.swap(true, Ordering::AcqRel) {
            debug!(handle = %self.slot.id, "already retired");
            return false;
        }
        let outcome = self.slot.release();
        trace!(handle = %self.slot.id, ?outcome, "retired");
        true
    }

    /// Whether two handles alias the same resource.
    pub fn ptr_eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }

    pub(crate) fn belongs_to(&self, arena: &Arc<ArenaShared>) -> bool {
        Arc::ptr_eq(&self.slot.arena, arena)
    }
}

impl<T> Clone for ResourceHandle<T> {
    fn clone(&self) -> Self {
        Self {
            slot: Arc::clone(&self.slot),
        }
    }
}

impl<T> fmt::Debug for ResourceHandle<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("id", &self.slot.id)
            .field("refcount", &self.refcount())
            .field("retired", &self.is_retired())
            .finish()
    }
}

/// Scoped borrow of a handle's payload.
pub struct Borrowed<'a, T> {
    slot: &'a Slot<T>,
    released: bool,
}

impl<'a, T> Borrowed<'a, T> {
    /// Release the borrow now and report what happened.
    pub fn release(mut self) -> Release {
        self.released = true;
        self.slot.release()
    }
}

impl<'a, T> Deref for Borrowed<'a, T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this guard holds a counted reference until it is dropped.
        unsafe { self.slot.payload() }
    }
}

impl<'a, T> Drop for Borrowed<'a, T> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.slot.release();
        }
    }
}

/// An owned counted reference, movable across threads.
pub struct Lease<T> {
    handle: ResourceHandle<T>,
    released: bool,
}

impl<T> Lease<T> {
    /// The handle this lease keeps alive.
    pub fn handle(&self) -> &ResourceHandle<T> {
        &self.handle
    }

    /// Release the lease now and report what happened.
    pub fn release(mut self) -> Release {
        self.released = true;
        self.handle.slot.release()
    }
}

impl<T> Deref for Lease<T> {
    type Target = T;

    fn deref(&self) -> &T {
        // SAFETY: this lease holds a counted reference until it is dropped.
        unsafe { self.handle.slot.payload() }
    }
}

impl<T> Drop for Lease<T> {
    fn drop(&mut self) {
        if !self.released {
            self.released = true;
            self.handle.slot.release();
        }
    }
}

impl<T> fmt::Debug for Lease<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Lease").field(&self.handle.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arena::ResourceArena;
    use crate::ArenaConfig;
    use pretty_assertions::assert_eq;

    /// Payload that counts how many times it was dropped.
    struct Tracked(Arc<AtomicUsize>);

    impl Drop for Tracked {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn tracked_handle() -> (ResourceHandle<Tracked>, Arc<AtomicUsize>) {
        let drops = Arc::new(AtomicUsize::new(0));
        let arena = ResourceArena::new(ArenaConfig::default());
        let handle = arena.allocate(Tracked(Arc::clone(&drops))).unwrap();
        (handle, drops)
    }

    #[test]
    fn test_handle_ids_are_per_arena() {
        let first = ResourceArena::new(ArenaConfig::default());
        let second = ResourceArena::new(ArenaConfig::default());

        let a = first.allocate(1u8).unwrap();
        let b = first.allocate(2u8).unwrap();
        let c = second.allocate(3u8).unwrap();

        assert_eq!(a.id(), HandleId::from_raw(1));
        assert_eq!(b.id(), HandleId::from_raw(2));
        // a fresh arena does not continue another arena's sequence
        assert_eq!(c.id(), HandleId::from_raw(1));
    }

    #[test]
    fn test_handle_id_display() {
        let id = HandleId(7);
        assert_eq!(format!("{}", id), "Handle(7)");
    }

    #[test]
    fn test_borrow_guard_releases_on_drop() {
        let (handle, drops) = tracked_handle();
        {
            let _guard = handle.borrow().unwrap();
            assert_eq!(handle.refcount(), 2);
        }
        assert_eq!(handle.refcount(), 1);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_explicit_release_is_not_repeated_by_drop() {
        let (handle, _drops) = tracked_handle();
        let guard = handle.borrow().unwrap();
        assert_eq!(guard.release(), Release::Retained { remaining: 1 });
        assert_eq!(handle.refcount(), 1);
    }

    #[test]
    fn test_retire_once() {
        let (handle, drops) = tracked_handle();
        assert!(handle.retire());
        assert!(!handle.retire());
        assert!(handle.is_retired());
        assert!(handle.is_destroyed());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_retire_with_outstanding_borrow_defers_destruction() {
        let (handle, drops) = tracked_handle();
        let guard = handle.borrow().unwrap();
        assert!(handle.retire());
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(guard.release(), Release::Destroyed);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_borrow_after_destroy_fails() {
        let (handle, _drops) = tracked_handle();
        handle.retire();
        assert_eq!(handle.borrow().err(), Some(ArenaError::AlreadyRetired));
        assert_eq!(handle.lease().err(), Some(ArenaError::AlreadyRetired));
        assert_eq!(handle.refcount(), 0);
    }

    #[test]
    fn test_collected_without_retire_destroys_once() {
        let (handle, drops) = tracked_handle();
        let alias = handle.clone();
        drop(handle);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        drop(alias);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_collect_after_retire_does_not_double_free() {
        let (handle, drops) = tracked_handle();
        handle.retire();
        drop(handle);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_lease_keeps_payload_after_aliases_drop() {
        let (handle, drops) = tracked_handle();
        let lease = handle.lease().unwrap();
        handle.retire();
        drop(handle);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(lease.handle().refcount(), 1);
        drop(lease);
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }
}
