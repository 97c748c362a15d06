//! Error types for the callback gateway.

use std::time::Duration;

use smol_str::SmolStr;
use thiserror::Error;

use crate::request::{CorrelationToken, FunctionRef};

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Errors reported by the callback gateway and the dispatcher boundary.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum GatewayError {
    /// A request could not be constructed; nothing was sent.
    #[error("out of memory while {context}")]
    OutOfMemory {
        /// What the gateway was allocating
        context: &'static str,
    },

    /// No in-flight request carries this token.
    #[error("unknown correlation token {0}")]
    UnknownCorrelation(CorrelationToken),

    /// The request was already resolved.
    #[error("request {0} has already been completed")]
    AlreadyCompleted(CorrelationToken),

    /// No dispatcher inbox is registered under this name.
    #[error("no dispatcher registered as '{0}'")]
    UnknownTarget(SmolStr),

    /// A dispatcher inbox is already registered under this name.
    #[error("dispatcher '{0}' is already registered")]
    TargetExists(SmolStr),

    /// The dispatcher's inbox is closed.
    #[error("dispatcher '{0}' is unavailable")]
    DispatcherUnavailable(SmolStr),

    /// No reply arrived in time; the request was withdrawn.
    #[error("request {token} timed out after {timeout:?}")]
    Timeout {
        /// The withdrawn request
        token: CorrelationToken,
        /// How long the caller waited
        timeout: Duration,
    },

    /// The dispatcher failed while evaluating the function.
    #[error("evaluation of '{function}' failed: {message}")]
    DispatchFailed {
        /// The function that was evaluated
        function: FunctionRef,
        /// Error reported by the evaluator
        message: String,
    },

    /// A condition that fits no other kind.
    #[error("unknown failure: {0}")]
    UnknownFailure(String),
}

impl GatewayError {
    /// Short, stable name of the error kind.
    pub fn kind(&self) -> &'static str {
        match self {
            GatewayError::OutOfMemory { .. } => "out_of_memory",
            GatewayError::UnknownCorrelation(_) => "unknown_correlation",
            GatewayError::AlreadyCompleted(_) => "already_completed",
            GatewayError::UnknownTarget(_) => "unknown_target",
            GatewayError::TargetExists(_) => "target_exists",
            GatewayError::DispatcherUnavailable(_) => "dispatcher_unavailable",
            GatewayError::Timeout { .. } => "timeout",
            GatewayError::DispatchFailed { .. } => "dispatch_failed",
            GatewayError::UnknownFailure(_) => "unknown_failure",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = GatewayError::AlreadyCompleted(CorrelationToken::from_raw(3));
        assert_eq!(err.to_string(), "request Token(3) has already been completed");

        let err = GatewayError::DispatchFailed {
            function: FunctionRef::new("shape_of"),
            message: "badarg".to_string(),
        };
        assert_eq!(err.to_string(), "evaluation of 'shape_of' failed: badarg");
        assert_eq!(err.kind(), "dispatch_failed");
    }
}
