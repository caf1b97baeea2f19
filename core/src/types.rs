//! Identifiers, lifecycle states and transfer outcomes.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use uuid::Uuid;

use crate::error::TransferError;

/// Identity of a transfer handle, stable across `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct HandleId(Uuid);

impl HandleId {
    pub fn new() -> Self {
        HandleId(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for HandleId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for HandleId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Lifecycle of a handle.
///
/// `Configuring -> Running -> {Completed, Failed, Cancelled}`; a terminal
/// handle goes back to `Configuring` only through `reset`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferState {
    Configuring,
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl TransferState {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferState::Completed | TransferState::Failed | TransferState::Cancelled
        )
    }
}

/// Terminal status carried by a `TransferResult`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Completed,
    Failed,
    Cancelled,
}

impl From<TransferStatus> for TransferState {
    fn from(status: TransferStatus) -> Self {
        match status {
            TransferStatus::Completed => TransferState::Completed,
            TransferStatus::Failed => TransferState::Failed,
            TransferStatus::Cancelled => TransferState::Cancelled,
        }
    }
}

/// Outcome of one transfer.
///
/// Byte counts cover everything sinks accepted up to the point the transfer
/// stopped, whatever the status.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransferResult {
    pub status: TransferStatus,
    /// HTTP status of the final response, if one arrived.
    pub response_code: Option<u16>,
    pub body_bytes: u64,
    pub header_bytes: u64,
    pub upload_bytes: u64,
    pub elapsed: Duration,
    /// `Timeout` for a deadline, the failure cause for `Failed`, `None`
    /// otherwise.
    pub error: Option<TransferError>,
}

impl TransferResult {
    pub fn is_success(&self) -> bool {
        self.status == TransferStatus::Completed
    }
}

/// Byte counts handed to a progress sink.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TransferProgress {
    pub downloaded: u64,
    /// From the response's `content-length`, when it sent one.
    pub download_total: Option<u64>,
    pub uploaded: u64,
    /// From `POST_FIELDS` or `UPLOAD_SIZE`.
    pub upload_total: Option<u64>,
}

impl TransferProgress {
    /// Download progress between 0 and 1, if the total is known.
    pub fn fraction(&self) -> Option<f64> {
        match self.download_total {
            Some(0) => Some(1.0),
            Some(total) => Some((self.downloaded as f64 / total as f64).min(1.0)),
            None => None,
        }
    }
}

/// Cooperative cancellation flag shared between a handle and its holders.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the executor to stop the transfer at its next step.
    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    pub(crate) fn clear(&self) {
        self.0.store(false, Ordering::Release);
    }
}
