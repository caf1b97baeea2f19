//! Error types for the transfer engine.
//!
//! # Design
//! Configuration errors (`UnknownOption`, `TypeMismatch`, `InvalidValue`,
//! `InvalidState`) are returned to the caller at the point of misuse.
//! Runtime errors (`Transport`, `Callback`, `Timeout`) never escape the
//! executor; they are recorded on the `TransferResult` of the handle that
//! failed.

use std::fmt;
use std::time::Duration;

use serde::Serialize;

use crate::options::{OptionKey, ValueKind};

/// Errors produced while configuring or running a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, thiserror::Error)]
pub enum TransferError {
    /// No option exists with this numeric id or name.
    #[error("unknown option: {0}")]
    UnknownOption(String),

    /// The value's kind does not match the kind the option expects.
    #[error("option {key} expects a {expected} value, got {found}")]
    TypeMismatch {
        key: OptionKey,
        expected: ValueKind,
        found: ValueKind,
    },

    /// The value has the right kind but is out of range for the option.
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: OptionKey, reason: String },

    /// The operation is not allowed in the handle's current lifecycle state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// Network or protocol failure reported by the transport.
    #[error("transport error ({code}): {detail}")]
    Transport { code: TransportCode, detail: String },

    /// A sink raised an error or returned an abort signal.
    #[error("callback error: {0}")]
    Callback(String),

    /// The transfer's deadline elapsed.
    #[error("timed out after {}ms", .0.as_millis())]
    Timeout(Duration),
}

impl TransferError {
    pub(crate) fn transport(code: TransportCode, detail: impl Into<String>) -> Self {
        TransferError::Transport {
            code,
            detail: detail.into(),
        }
    }

    /// True for errors that are reported synchronously while configuring.
    pub fn is_config_error(&self) -> bool {
        matches!(
            self,
            TransferError::UnknownOption(_)
                | TransferError::TypeMismatch { .. }
                | TransferError::InvalidValue { .. }
                | TransferError::InvalidState(_)
        )
    }
}

/// Failure category carried by `TransferError::Transport`.
///
/// `native()` gives the stable integer exposed through the C ABI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransportCode {
    BadUrl,
    Resolve,
    Connect,
    Io,
    Protocol,
    TooManyRedirects,
    /// The server answered with an error status and `FAIL_ON_ERROR` was set.
    HttpStatus(u16),
    /// The transport stopped without reporting an outcome.
    Disconnected,
    Other,
}

impl TransportCode {
    pub fn native(self) -> i32 {
        match self {
            TransportCode::BadUrl => 3,
            TransportCode::Resolve => 6,
            TransportCode::Connect => 7,
            TransportCode::Io => 55,
            TransportCode::Protocol => 8,
            TransportCode::TooManyRedirects => 47,
            TransportCode::HttpStatus(_) => 22,
            TransportCode::Disconnected => 52,
            TransportCode::Other => 1,
        }
    }
}

impl fmt::Display for TransportCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportCode::BadUrl => write!(f, "bad url"),
            TransportCode::Resolve => write!(f, "could not resolve host"),
            TransportCode::Connect => write!(f, "could not connect"),
            TransportCode::Io => write!(f, "i/o failure"),
            TransportCode::Protocol => write!(f, "protocol error"),
            TransportCode::TooManyRedirects => write!(f, "too many redirects"),
            TransportCode::HttpStatus(status) => write!(f, "HTTP {status}"),
            TransportCode::Disconnected => write!(f, "transport disconnected"),
            TransportCode::Other => write!(f, "transport failure"),
        }
    }
}

/// Signal a sink returns instead of a byte count.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SinkError {
    /// Not ready yet; the same bytes are offered again later.
    #[error("sink paused")]
    Pause,

    /// Stop the transfer.
    #[error("{0}")]
    Abort(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_errors_are_classified() {
        assert!(TransferError::UnknownOption("X".into()).is_config_error());
        assert!(TransferError::InvalidState("running".into()).is_config_error());
        assert!(!TransferError::Callback("boom".into()).is_config_error());
        assert!(!TransferError::Timeout(Duration::from_millis(5)).is_config_error());
    }

    #[test]
    fn display_includes_details() {
        let err = TransferError::TypeMismatch {
            key: OptionKey::Url,
            expected: ValueKind::String,
            found: ValueKind::Integer,
        };
        assert_eq!(err.to_string(), "option URL expects a string value, got integer");

        let err = TransferError::transport(TransportCode::HttpStatus(503), "fail on error");
        assert_eq!(err.to_string(), "transport error (HTTP 503): fail on error");

        let err = TransferError::Timeout(Duration::from_millis(250));
        assert_eq!(err.to_string(), "timed out after 250ms");
    }
}
