//! Error types for the dispatcher and its collaborators.

use std::time::Duration;

use uuid::Uuid;

/// Top-level error wrapping the domain-specific kinds.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Dispatch(#[from] DispatchError),
}

/// Configuration loading and validation failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// A recognized option carried a value outside its allowed range.
    #[error("invalid value for '{key}': {message}")]
    InvalidValue { key: String, message: String },

    /// The configuration document could not be parsed. Unknown options
    /// are rejected here as well.
    #[error("failed to parse configuration: {reason}")]
    Parse { reason: String },
}

/// Failures surfaced by a transport session.
///
/// `Tool` is a structured failure reported by the tool itself; from the
/// worker's view it is a normal completion, not a session fault.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The session or its backing process is gone.
    #[error("transport closed: {reason}")]
    Closed { reason: String },

    /// The peer sent something that does not decode as a response frame.
    #[error("decode error: {reason}")]
    Decode { reason: String },

    /// The tool reported a structured failure.
    #[error("tool error: {message}")]
    Tool { message: String },
}

/// Errors observable through the dispatcher façade.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    /// The dispatcher is not running (never started, or stopped).
    #[error("dispatcher is stopped")]
    Stopped,

    /// Two successive placement attempts raced into retiring workers,
    /// or admission is saturated.
    #[error("task placement failed: {reason}")]
    PlacementFailed { reason: String },

    /// No slot exists for this task id.
    #[error("unknown task {id}")]
    UnknownTask { id: Uuid },

    /// The task has not completed yet (non-blocking reads only).
    #[error("task {id} is still pending")]
    Pending { id: Uuid },

    /// The blocking-read deadline expired. The slot stays in place.
    #[error("timed out after {timeout:?} waiting for task {id}")]
    Timeout { id: Uuid, timeout: Duration },

    /// The worker's transport died mid-call and the task could not be
    /// salvaged in time.
    #[error("transport failed: {reason}")]
    TransportFailed { reason: String },

    /// The tool reported a structured failure.
    #[error("tool failed: {message}")]
    ToolFailed { message: String },

    /// The task's replacement host died as well; terminal.
    #[error("salvage failed for task {id}")]
    SalvageFailed { id: Uuid },
}

/// Numeric code for callers that want the classic convention: zero and
/// positives are success, dispatcher faults are a contiguous negative
/// range.
pub const CODE_SUCCESS: i32 = 0;

impl DispatchError {
    pub fn code(&self) -> i32 {
        match self {
            DispatchError::Timeout { .. } => -1001,
            DispatchError::TransportFailed { .. } => -1002,
            DispatchError::ToolFailed { .. } => -1003,
            DispatchError::UnknownTask { .. } => -1004,
            DispatchError::Pending { .. } => -1005,
            DispatchError::SalvageFailed { .. } => -1006,
            DispatchError::Stopped => -1007,
            DispatchError::PlacementFailed { .. } => -1008,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_negative_and_distinct() {
        let id = Uuid::new_v4();
        let errors = [
            DispatchError::Timeout {
                id,
                timeout: Duration::from_secs(1),
            },
            DispatchError::TransportFailed {
                reason: "x".into(),
            },
            DispatchError::ToolFailed {
                message: "x".into(),
            },
            DispatchError::UnknownTask { id },
            DispatchError::Pending { id },
            DispatchError::SalvageFailed { id },
            DispatchError::Stopped,
            DispatchError::PlacementFailed {
                reason: "x".into(),
            },
        ];
        let mut seen = std::collections::HashSet::new();
        for e in &errors {
            assert!(e.code() < CODE_SUCCESS);
            assert!(seen.insert(e.code()), "duplicate code {}", e.code());
        }
    }

    #[test]
    fn reserved_codes_match_convention() {
        assert_eq!(
            DispatchError::Timeout {
                id: Uuid::new_v4(),
                timeout: Duration::from_secs(1)
            }
            .code(),
            -1001
        );
        assert_eq!(
            DispatchError::TransportFailed {
                reason: String::new()
            }
            .code(),
            -1002
        );
        assert_eq!(
            DispatchError::ToolFailed {
                message: String::new()
            }
            .code(),
            -1003
        );
    }
}
