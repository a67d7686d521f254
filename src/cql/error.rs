//! Error types for the CQL driver.
//!
//! Two layers exist:
//! - `CqlError`: returned synchronously by codec, binding and decoding calls.
//! - `FutureError`: attached to a future when an asynchronous operation fails.
//!
//! Both map onto the process-wide `StatusCode` used at the handle boundary.

use std::fmt;
use std::io;

use thiserror::Error;

/// Result type for CQL operations.
pub type CqlResult<T> = Result<T, CqlError>;

// ============================================================================
// Status Codes
// ============================================================================

/// Status value returned across the handle boundary.
///
/// Library codes are local to the driver; server codes mirror the error codes
/// carried in an ERROR frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,

    // Library errors
    LibBadParams,
    LibIndexOutOfBounds,
    LibTypeMismatch,
    LibUnboundParameter,
    LibNullValue,
    LibInvalidState,
    LibProtocolError,
    LibNoConnection,
    LibRequestTimedOut,
    LibRequestAbandoned,
    LibInternal,

    // Server errors
    ServerError,
    ServerProtocolError,
    ServerBadCredentials,
    ServerUnavailable,
    ServerOverloaded,
    ServerIsBootstrapping,
    ServerTruncateError,
    ServerWriteTimeout,
    ServerReadTimeout,
    ServerSyntaxError,
    ServerUnauthorized,
    ServerInvalid,
    ServerConfigError,
    ServerAlreadyExists,
    ServerUnprepared,
    /// A server code this driver does not know about.
    ServerOther(i32),
}

impl StatusCode {
    /// Map the error code of an ERROR frame.
    pub fn from_server(code: i32) -> Self {
        match code {
            0x0000 => StatusCode::ServerError,
            0x000A => StatusCode::ServerProtocolError,
            0x0100 => StatusCode::ServerBadCredentials,
            0x1000 => StatusCode::ServerUnavailable,
            0x1001 => StatusCode::ServerOverloaded,
            0x1002 => StatusCode::ServerIsBootstrapping,
            0x1003 => StatusCode::ServerTruncateError,
            0x1100 => StatusCode::ServerWriteTimeout,
            0x1200 => StatusCode::ServerReadTimeout,
            0x2000 => StatusCode::ServerSyntaxError,
            0x2100 => StatusCode::ServerUnauthorized,
            0x2200 => StatusCode::ServerInvalid,
            0x2300 => StatusCode::ServerConfigError,
            0x2400 => StatusCode::ServerAlreadyExists,
            0x2500 => StatusCode::ServerUnprepared,
            other => StatusCode::ServerOther(other),
        }
    }

    #[inline]
    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }

    /// Whether the code originates from the server.
    pub fn is_server(self) -> bool {
        matches!(
            self,
            StatusCode::ServerError
                | StatusCode::ServerProtocolError
                | StatusCode::ServerBadCredentials
                | StatusCode::ServerUnavailable
                | StatusCode::ServerOverloaded
                | StatusCode::ServerIsBootstrapping
                | StatusCode::ServerTruncateError
                | StatusCode::ServerWriteTimeout
                | StatusCode::ServerReadTimeout
                | StatusCode::ServerSyntaxError
                | StatusCode::ServerUnauthorized
                | StatusCode::ServerInvalid
                | StatusCode::ServerConfigError
                | StatusCode::ServerAlreadyExists
                | StatusCode::ServerUnprepared
                | StatusCode::ServerOther(_)
        )
    }
}

// ============================================================================
// Synchronous Errors
// ============================================================================

/// Errors that can occur during CQL operations.
#[derive(Error, Debug)]
pub enum CqlError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Truncated frame: needed {needed} bytes, {remaining} remaining")]
    Truncated { needed: usize, remaining: usize },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Index {index} out of bounds (count {count})")]
    IndexOutOfBounds { index: usize, count: usize },

    #[error("Type mismatch: expected {expected}, found {actual}")]
    TypeMismatch { expected: String, actual: String },

    #[error("Parameter {0} is not bound")]
    UnboundParameter(usize),

    #[error("Value is null")]
    NullValue,

    #[error("Invalid iterator state: {0}")]
    IteratorState(&'static str),

    #[error("Future has already been completed")]
    AlreadyCompleted,

    #[error("Invalid or released handle")]
    InvalidHandle,

    #[error("Authentication failed: {0}")]
    Auth(String),

    #[error("Server error {code:#06x}: {message}")]
    Server { code: i32, message: String },

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection is closed")]
    ConnectionClosed,

    #[error("Session is not connected")]
    NotConnected,

    #[error("Session is already connected")]
    AlreadyConnected,

    #[error("Operation timed out")]
    Timeout,
}

impl CqlError {
    pub(crate) fn protocol(msg: impl Into<String>) -> Self {
        CqlError::Protocol(msg.into())
    }

    pub(crate) fn type_mismatch(expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        CqlError::TypeMismatch {
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }

    /// The status code reported for this error at the handle boundary.
    pub fn code(&self) -> StatusCode {
        match self {
            CqlError::Io(_) | CqlError::ConnectionClosed | CqlError::NotConnected => {
                StatusCode::LibNoConnection
            }
            CqlError::Truncated { .. } | CqlError::Protocol(_) => StatusCode::LibProtocolError,
            CqlError::IndexOutOfBounds { .. } => StatusCode::LibIndexOutOfBounds,
            CqlError::TypeMismatch { .. } => StatusCode::LibTypeMismatch,
            CqlError::UnboundParameter(_) => StatusCode::LibUnboundParameter,
            CqlError::NullValue => StatusCode::LibNullValue,
            CqlError::IteratorState(_)
            | CqlError::AlreadyCompleted
            | CqlError::AlreadyConnected => StatusCode::LibInvalidState,
            CqlError::InvalidHandle | CqlError::Config(_) => StatusCode::LibBadParams,
            CqlError::Auth(_) => StatusCode::ServerBadCredentials,
            CqlError::Server { code, .. } => StatusCode::from_server(*code),
            CqlError::Timeout => StatusCode::LibRequestTimedOut,
        }
    }
}

// ============================================================================
// Asynchronous Errors
// ============================================================================

/// Where an asynchronous failure originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// The driver itself (I/O, decoding, timeouts).
    Lib,
    /// An ERROR frame returned by the server.
    Server,
}

/// Error attached to a future that completed unsuccessfully.
///
/// Immutable once set.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FutureError {
    pub code: StatusCode,
    pub source: ErrorSource,
    pub message: String,
}

impl FutureError {
    pub fn new(code: StatusCode, source: ErrorSource, message: impl Into<String>) -> Self {
        Self {
            code,
            source,
            message: message.into(),
        }
    }

    /// The error for a promise dropped before it produced a value.
    pub(crate) fn abandoned() -> Self {
        Self::new(
            StatusCode::LibRequestAbandoned,
            ErrorSource::Lib,
            "Request was abandoned before completion",
        )
    }
}

impl fmt::Display for FutureError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let source = match self.source {
            ErrorSource::Lib => "lib",
            ErrorSource::Server => "server",
        };
        write!(f, "[{}] {:?}: {}", source, self.code, self.message)
    }
}

impl std::error::Error for FutureError {}

impl From<CqlError> for FutureError {
    fn from(err: CqlError) -> Self {
        let code = err.code();
        let source = match err {
            CqlError::Server { .. } | CqlError::Auth(_) => ErrorSource::Server,
            _ => ErrorSource::Lib,
        };
        FutureError::new(code, source, err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_code_mapping() {
        assert_eq!(StatusCode::from_server(0x2000), StatusCode::ServerSyntaxError);
        assert_eq!(StatusCode::from_server(0x2500), StatusCode::ServerUnprepared);
        assert_eq!(StatusCode::from_server(0x7777), StatusCode::ServerOther(0x7777));
        assert!(StatusCode::ServerInvalid.is_server());
        assert!(!StatusCode::LibBadParams.is_server());
    }

    #[test]
    fn test_future_error_from_server_error() {
        let err = CqlError::Server {
            code: 0x2200,
            message: "unconfigured table".to_string(),
        };
        let future_err = FutureError::from(err);

        assert_eq!(future_err.code, StatusCode::ServerInvalid);
        assert_eq!(future_err.source, ErrorSource::Server);
        assert!(future_err.message.contains("unconfigured table"));
    }

    #[test]
    fn test_future_error_from_lib_error() {
        let future_err = FutureError::from(CqlError::Timeout);
        assert_eq!(future_err.code, StatusCode::LibRequestTimedOut);
        assert_eq!(future_err.source, ErrorSource::Lib);
    }

    #[test]
    fn test_local_error_codes() {
        let err = CqlError::IndexOutOfBounds { index: 3, count: 2 };
        assert_eq!(err.code(), StatusCode::LibIndexOutOfBounds);
        assert_eq!(CqlError::UnboundParameter(1).code(), StatusCode::LibUnboundParameter);
        assert_eq!(
            CqlError::IteratorState("no current row").code(),
            StatusCode::LibInvalidState
        );
    }
}
