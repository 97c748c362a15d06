//! EMLX Arena - reference-counted native array handles
//!
//! Every array the bridge exposes to the managed runtime is a native
//! allocation whose lifetime is shared between the runtime's collector and
//! explicit `deallocate` calls. This crate guarantees that such a payload:
//!
//! - is never destroyed while a borrow or lease still holds it
//! - is destroyed exactly once, however many threads race to release it
//! - cannot be borrowed again once destroyed
//!
//! # Core Types
//!
//! - [`ResourceArena`] - allocates handles and keeps per-arena accounting
//! - [`ResourceHandle`] - the runtime's (cloneable) reference to one payload
//! - [`Borrowed`] - scoped borrow, released on drop
//! - [`Lease`] - owned borrow that may cross threads
//!
//! # Example
//!
//! ```rust
//! use emlx_arena::{ArenaConfig, ResourceArena};
//!
//! let arena = ResourceArena::new(ArenaConfig::default());
//! let handle = arena.allocate(vec![1.0f32, 2.0, 3.0]).unwrap();
//!
//! {
//!     let data = handle.borrow().unwrap();
//!     assert_eq!(data.len(), 3);
//!     assert_eq!(handle.refcount(), 2);
//! }
//!
//! assert!(handle.retire());
//! assert!(handle.is_destroyed());
//! assert!(handle.borrow().is_err());
//! ```

pub mod arena;
pub mod error;
pub mod handle;

pub use arena::{ArenaStats, ResourceArena};
pub use error::{ArenaError, ArenaResult};
pub use handle::{Borrowed, HandleId, Lease, Release, ResourceHandle};

use smol_str::SmolStr;

/// Configuration for an arena.
#[derive(Debug, Clone)]
pub struct ArenaConfig {
    /// Resource-type name used in logs and errors
    pub name: SmolStr,
    /// Upper bound on live handles; `None` means only the host allocator limits it
    pub max_live_handles: Option<usize>,
}

impl Default for ArenaConfig {
    fn default() -> Self {
        Self {
            name: SmolStr::new_inline("MLXArray"),
            max_live_handles: None,
        }
    }
}

impl ArenaConfig {
    /// Create a new arena configuration with default settings.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the resource-type name.
    pub fn with_name(mut self, name: impl Into<SmolStr>) -> Self {
        self.name = name.into();
        self
    }

    /// Limit the number of live handles.
    pub fn with_max_live_handles(mut self, limit: usize) -> Self {
        self.max_live_handles = Some(limit);
        self
    }
}
