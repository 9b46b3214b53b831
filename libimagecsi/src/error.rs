//! CSI error types.
//!
//! All errors in the `libimagecsi` crate are represented by the [`CsiError`]
//! enum, which derives [`thiserror::Error`] for ergonomic error handling and
//! also implements [`Serialize`]/[`Deserialize`] so errors can travel across
//! the QUIC transport layer.
//!
//! Callers only see two categories, exposed through [`CsiError::code`]:
//! [`ErrorCode::InvalidArgument`] for malformed requests and
//! [`ErrorCode::Internal`] for everything else.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::runner::RunError;

/// Unified error type for CSI operations.
#[derive(Debug, Error, Serialize, Deserialize, Clone)]
pub enum CsiError {
    /// The caller supplied an invalid or missing argument.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// An external tool exited unsuccessfully.
    #[error("{program} failed ({status}): {output}")]
    CommandFailed {
        /// Executable that was run.
        program: String,
        /// Exit status as reported by the OS.
        status: String,
        /// Combined stdout and stderr of the tool.
        output: String,
    },

    /// An external tool did not finish before its deadline.
    #[error("{program} timed out after {timeout_ms}ms")]
    CommandTimeout {
        /// Executable that was run.
        program: String,
        /// Configured deadline in milliseconds.
        timeout_ms: u64,
    },

    /// A marker that a prior publish should have left behind is missing.
    #[error("inconsistent volume state: {0}")]
    InconsistentState(String),

    /// A filesystem operation under the store root failed.
    #[error("{op} {path}: {reason}")]
    Io {
        /// Short name of the operation, e.g. `"symlink"`.
        op: String,
        /// Path the operation was applied to.
        path: String,
        /// Underlying OS error.
        reason: String,
    },

    /// A QUIC / transport-level error.
    #[error("transport error: {0}")]
    TransportError(String),

    /// An unclassified internal error.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Error category reported to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    /// The request itself was malformed; retrying it unchanged will not help.
    InvalidArgument,
    /// Any other failure, carrying the underlying message.
    Internal,
}

impl CsiError {
    /// Create a [`CsiError::Io`] for a failed operation on `path`.
    pub fn io(op: &str, path: impl AsRef<Path>, err: std::io::Error) -> Self {
        Self::Io {
            op: op.to_owned(),
            path: path.as_ref().display().to_string(),
            reason: err.to_string(),
        }
    }

    /// Create a [`CsiError::TransportError`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn transport<E: std::fmt::Display>(e: E) -> Self {
        Self::TransportError(e.to_string())
    }

    /// Create a [`CsiError::Internal`] from anything that implements
    /// [`std::fmt::Display`].
    pub fn internal<E: std::fmt::Display>(e: E) -> Self {
        Self::Internal(e.to_string())
    }

    /// The category surfaced to the caller.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::InvalidArgument(_) => ErrorCode::InvalidArgument,
            _ => ErrorCode::Internal,
        }
    }
}

impl From<RunError> for CsiError {
    fn from(err: RunError) -> Self {
        match err {
            RunError::Spawn { program, source } => Self::Internal(format!("spawn {program}: {source}")),
            RunError::Failed {
                program,
                status,
                output,
            } => Self::CommandFailed {
                program,
                status: status.to_string(),
                output,
            },
            RunError::Timeout { program, timeout } => Self::CommandTimeout {
                program,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            },
            RunError::Io { program, source } => Self::Internal(format!("{program}: {source}")),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn error_display() {
        let err = CsiError::InvalidArgument("Volume ID missing in request".into());
        assert_eq!(err.to_string(), "invalid argument: Volume ID missing in request");
    }

    #[test]
    fn only_invalid_argument_is_caller_error() {
        assert_eq!(
            CsiError::InvalidArgument("x".into()).code(),
            ErrorCode::InvalidArgument
        );
        assert_eq!(
            CsiError::InconsistentState("x".into()).code(),
            ErrorCode::Internal
        );
        assert_eq!(
            CsiError::CommandTimeout {
                program: "skopeo".into(),
                timeout_ms: 1
            }
            .code(),
            ErrorCode::Internal
        );
    }

    #[test]
    fn timeout_is_kept_distinct() {
        let err: CsiError = RunError::Timeout {
            program: "skopeo".into(),
            timeout: Duration::from_secs(3),
        }
        .into();
        assert!(matches!(
            err,
            CsiError::CommandTimeout { timeout_ms: 3000, .. }
        ));
    }

    #[test]
    fn error_serde_roundtrip() {
        let err = CsiError::CommandFailed {
            program: "oci-image-tool".into(),
            status: "exit status: 1".into(),
            output: "no such ref".into(),
        };
        let json = serde_json::to_string(&err).expect("serialize");
        let de: CsiError = serde_json::from_str(&json).expect("deserialize");
        assert_eq!(err.to_string(), de.to_string());
    }
}
