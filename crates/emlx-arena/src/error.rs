//! Error types for the resource arena.

use thiserror::Error;

/// Result type for arena operations.
pub type ArenaResult<T> = Result<T, ArenaError>;

/// Errors reported at the arena boundary.
///
/// These are the only two failure kinds an arena operation can produce.
/// Both are returned to the caller; neither is fatal to the process.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ArenaError {
    /// No backing storage could be obtained for a new handle.
    #[error("out of memory: arena '{arena}' cannot hold more than {limit} live handles")]
    OutOfMemory {
        /// Name of the arena that refused the allocation
        arena: String,
        /// The configured live-handle limit
        limit: usize,
    },

    /// The handle's payload has already been destroyed.
    #[error("array has been deallocated")]
    AlreadyRetired,
}

impl ArenaError {
    /// Short, stable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            ArenaError::OutOfMemory { .. } => "out_of_memory",
            ArenaError::AlreadyRetired => "already_retired",
        }
    }
}
