//! Error types for the operation layer.
//!
//! Operations fail with a [`NativeError`]; [`crate::EmlxContext::invoke`]
//! attaches the operation name and reports an [`OpError`]. Every failure is
//! returned to the caller as a value.

use std::fmt;

use emlx_arena::ArenaError;
use emlx_callback::GatewayError;
use smol_str::SmolStr;
use thiserror::Error;

/// Result type inside operation bodies.
pub type NativeResult<T> = Result<T, NativeError>;

/// Result type of an invoked operation.
pub type OpResult<T> = Result<T, OpError>;

/// Failure inside an operation body.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NativeError {
    /// Handle lifetime error.
    #[error(transparent)]
    Arena(#[from] ArenaError),

    /// Callback bridge error.
    #[error(transparent)]
    Gateway(#[from] GatewayError),

    /// An argument had the wrong shape or type.
    #[error("{0}")]
    BadArgument(String),

    /// The array library rejected the computation.
    #[error("{0}")]
    Computation(String),

    /// Array memory could not be allocated.
    #[error("{0}")]
    OutOfMemory(String),
}

impl NativeError {
    /// Shorthand for a bad-argument error.
    pub fn bad_argument(message: impl Into<String>) -> Self {
        NativeError::BadArgument(message.into())
    }

    /// Shorthand for a computation error.
    pub fn computation(message: impl Into<String>) -> Self {
        NativeError::Computation(message.into())
    }

    /// Shorthand for an allocation failure.
    pub fn out_of_memory(message: impl Into<String>) -> Self {
        NativeError::OutOfMemory(message.into())
    }

    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            NativeError::Arena(ArenaError::OutOfMemory { .. }) => ErrorKind::OutOfMemory,
            NativeError::Arena(ArenaError::AlreadyRetired) => ErrorKind::AlreadyRetired,
            NativeError::Gateway(err) => match err {
                GatewayError::OutOfMemory { .. } => ErrorKind::OutOfMemory,
                GatewayError::UnknownCorrelation(_) => ErrorKind::UnknownCorrelation,
                GatewayError::AlreadyCompleted(_) => ErrorKind::AlreadyCompleted,
                GatewayError::UnknownTarget(_)
                | GatewayError::TargetExists(_)
                | GatewayError::DispatcherUnavailable(_) => ErrorKind::DispatcherUnavailable,
                GatewayError::Timeout { .. } => ErrorKind::Timeout,
                GatewayError::DispatchFailed { .. } => ErrorKind::CallbackFailed,
                GatewayError::UnknownFailure(_) => ErrorKind::UnknownFailure,
            },
            NativeError::BadArgument(_) => ErrorKind::BadArgument,
            NativeError::Computation(_) => ErrorKind::NativeComputationFailed,
            NativeError::OutOfMemory(_) => ErrorKind::OutOfMemory,
        }
    }
}

/// Errors from the native worker pool.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// The pool no longer accepts jobs.
    #[error("worker pool has been shut down")]
    Shutdown,

    /// A worker thread could not be started.
    #[error("failed to spawn worker: {0}")]
    SpawnFailed(String),

    /// The job panicked.
    #[error("job panicked: {0}")]
    Panicked(String),
}

/// What went wrong, independent of which operation it happened in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Allocation failed
    OutOfMemory,
    /// The array has been deallocated
    AlreadyRetired,
    /// A callback reply arrived twice
    AlreadyCompleted,
    /// A callback reply named no in-flight request
    UnknownCorrelation,
    /// The array library failed or panicked
    NativeComputationFailed,
    /// The runtime function called back into failed
    CallbackFailed,
    /// No dispatcher is serving callbacks
    DispatcherUnavailable,
    /// A callback got no reply in time
    Timeout,
    /// An argument was malformed
    BadArgument,
    /// No operation by that name
    UnknownOperation,
    /// Anything else
    UnknownFailure,
}

impl ErrorKind {
    /// The atom the runtime sees for this kind.
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::OutOfMemory => "out_of_memory",
            ErrorKind::AlreadyRetired => "already_retired",
            ErrorKind::AlreadyCompleted => "already_completed",
            ErrorKind::UnknownCorrelation => "unknown_correlation",
            ErrorKind::NativeComputationFailed => "native_computation_failed",
            ErrorKind::CallbackFailed => "callback_failed",
            ErrorKind::DispatcherUnavailable => "dispatcher_unavailable",
            ErrorKind::Timeout => "timeout",
            ErrorKind::BadArgument => "bad_argument",
            ErrorKind::UnknownOperation => "unknown_operation",
            ErrorKind::UnknownFailure => "unknown_failure",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failed operation: which one, what kind of failure, and the details.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{op}: {kind}: {message}")]
pub struct OpError {
    /// Operation name and arity, e.g. `to_type/2`
    pub op: SmolStr,
    /// Failure classification
    pub kind: ErrorKind,
    /// Human-readable description
    pub message: String,
}

impl OpError {
    /// Build an error for operation `op`.
    pub fn new(op: impl Into<SmolStr>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            op: op.into(),
            kind,
            message: message.into(),
        }
    }

    /// Attach an operation name to a body error.
    pub fn from_native(op: impl Into<SmolStr>, err: NativeError) -> Self {
        Self::new(op, err.kind(), err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_kind_from_arena_error() {
        let err = NativeError::from(ArenaError::AlreadyRetired);
        assert_eq!(err.kind(), ErrorKind::AlreadyRetired);
    }

    #[test]
    fn test_gateway_kinds() {
        let err = NativeError::from(GatewayError::UnknownTarget(SmolStr::new("emlx-runtime")));
        assert_eq!(err.kind(), ErrorKind::DispatcherUnavailable);
        assert_eq!(err.kind().as_str(), "dispatcher_unavailable");
    }

    #[test]
    fn test_out_of_memory_kinds() {
        let err = NativeError::from(GatewayError::OutOfMemory {
            context: "publishing a callback request",
        });
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert_eq!(err.to_string(), "out of memory while publishing a callback request");

        let err = NativeError::out_of_memory("failed to allocate 64 bytes for array data");
        assert_eq!(err.kind(), ErrorKind::OutOfMemory);
        assert_eq!(
            OpError::from_native("zeros/1", err).to_string(),
            "zeros/1: out_of_memory: failed to allocate 64 bytes for array data"
        );
    }

    #[test]
    fn test_op_error_display() {
        let err = OpError::from_native(
            "from_blob/3",
            NativeError::bad_argument("Binary size is too small for the requested shape"),
        );
        assert_eq!(
            err.to_string(),
            "from_blob/3: bad_argument: Binary size is too small for the requested shape"
        );
    }
}
