//! `#[repr(C)]` types for the FFI boundary.
//!
//! # Design
//! Handles, multi runs and cancel tokens are opaque boxes the C caller only
//! passes back. Results are plain `#[repr(C)]` data with owned C strings.
//! C data callbacks are adapted to the core's `WriteSink` / `ReadSource`
//! traits here, so `lib.rs` stays focused on the `extern "C"` surface.

use std::ffi::{c_void, CString};
use std::os::raw::c_char;

use transfer_core::{
    CallbackContext, CancelToken, Executor, ProgressSink, ReadSource, SinkError, TransferError,
    TransferHandle, TransferProgress, TransferResult, TransferState, TransferStatus, Transfers,
    WriteSink,
};

/// Returned by a data callback to pause the transfer; the same bytes are
/// offered again later.
pub const XFER_FUNC_PAUSE: usize = 0xFFFF_FFFF;

/// Returned by a data callback to abort the transfer.
pub const XFER_FUNC_ABORT: usize = 0xFFFF_FFFE;

/// Data callback: `size * nmemb` bytes at `ptr`, caller context in `userdata`.
///
/// Write callbacks return how many bytes they consumed; fewer than offered
/// pauses the transfer until the callback is called again with the rest.
/// Read callbacks fill `ptr` and return the byte count, `0` at end of data.
pub type XferDataCallback =
    extern "C" fn(ptr: *mut c_char, size: usize, nmemb: usize, userdata: *mut c_void) -> usize;

/// Progress callback: totals are -1 while unknown. Return 0 to continue;
/// any other value aborts the transfer.
pub type XferProgressCallback = extern "C" fn(
    userdata: *mut c_void,
    download_total: i64,
    downloaded: i64,
    upload_total: i64,
    uploaded: i64,
) -> i32;

/// Opaque transfer handle.
pub struct FfiHandle {
    pub(crate) inner: TransferHandle,
}

/// Opaque multiplexed run. Owns the handles added to it.
pub struct FfiMulti {
    pub(crate) executor: Executor,
    pub(crate) queued: Vec<TransferHandle>,
    pub(crate) transfers: Option<Transfers>,
}

/// Opaque cancel token. Safe to use from any thread.
pub struct FfiCancelToken {
    pub(crate) inner: CancelToken,
}

// ---------------------------------------------------------------------------
// Codes
// ---------------------------------------------------------------------------

/// Status codes returned by every fallible entry point.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiCode {
    Ok = 0,
    /// `xfer_multi_next` has no more results.
    Done = 1,
    NullArg = 2,
    UnknownOption = 3,
    TypeMismatch = 4,
    InvalidValue = 5,
    InvalidState = 6,
    Transport = 7,
    Callback = 8,
    Timeout = 9,
    InvalidUtf8 = 10,
    Panic = 11,
}

impl From<&TransferError> for FfiCode {
    fn from(err: &TransferError) -> Self {
        match err {
            TransferError::UnknownOption(_) => FfiCode::UnknownOption,
            TransferError::TypeMismatch { .. } => FfiCode::TypeMismatch,
            TransferError::InvalidValue { .. } => FfiCode::InvalidValue,
            TransferError::InvalidState(_) => FfiCode::InvalidState,
            TransferError::Transport { .. } => FfiCode::Transport,
            TransferError::Callback(_) => FfiCode::Callback,
            TransferError::Timeout(_) => FfiCode::Timeout,
        }
    }
}

/// Lifecycle state of a handle.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiState {
    Configuring = 0,
    Running = 1,
    Completed = 2,
    Failed = 3,
    Cancelled = 4,
}

impl From<TransferState> for FfiState {
    fn from(state: TransferState) -> Self {
        match state {
            TransferState::Configuring => FfiState::Configuring,
            TransferState::Running => FfiState::Running,
            TransferState::Completed => FfiState::Completed,
            TransferState::Failed => FfiState::Failed,
            TransferState::Cancelled => FfiState::Cancelled,
        }
    }
}

/// Terminal status of a transfer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FfiStatus {
    Completed = 0,
    Failed = 1,
    Cancelled = 2,
}

impl From<TransferStatus> for FfiStatus {
    fn from(status: TransferStatus) -> Self {
        match status {
            TransferStatus::Completed => FfiStatus::Completed,
            TransferStatus::Failed => FfiStatus::Failed,
            TransferStatus::Cancelled => FfiStatus::Cancelled,
        }
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Outcome of one transfer, owned by the caller until `xfer_free_result`.
///
/// `response_code` is 0 when no response arrived. On error `error_code`
/// names the category, `transport_code` carries the transport's numeric
/// code for transport errors, and `error_message` is a C string; otherwise
/// `error_code` is `Ok` and `error_message` is null.
#[repr(C)]
pub struct FfiTransferResult {
    pub handle_id: *mut c_char,
    pub status: FfiStatus,
    pub response_code: u16,
    pub body_bytes: u64,
    pub header_bytes: u64,
    pub upload_bytes: u64,
    pub elapsed_ms: u64,
    pub error_code: FfiCode,
    pub transport_code: i32,
    pub error_message: *mut c_char,
}

impl FfiTransferResult {
    /// Heap-allocate a result for `id`.
    pub(crate) fn from_core(id: &str, result: &TransferResult) -> *mut Self {
        let (error_code, transport_code, error_message) = match &result.error {
            Some(err) => {
                let transport_code = match err {
                    TransferError::Transport { code, .. } => code.native(),
                    _ => 0,
                };
                (FfiCode::from(err), transport_code, c_string(&err.to_string()))
            }
            None => (FfiCode::Ok, 0, std::ptr::null_mut()),
        };
        Box::into_raw(Box::new(FfiTransferResult {
            handle_id: c_string(id),
            status: result.status.into(),
            response_code: result.response_code.unwrap_or(0),
            body_bytes: result.body_bytes,
            header_bytes: result.header_bytes,
            upload_bytes: result.upload_bytes,
            elapsed_ms: result.elapsed.as_millis() as u64,
            error_code,
            transport_code,
            error_message,
        }))
    }

    /// Free the struct and its strings.
    ///
    /// # Safety
    /// `ptr` must come from `from_core` and not have been freed.
    pub(crate) unsafe fn free(ptr: *mut Self) {
        let result = unsafe { Box::from_raw(ptr) };
        for s in [result.handle_id, result.error_message] {
            if !s.is_null() {
                drop(unsafe { CString::from_raw(s) });
            }
        }
    }
}

/// An owned C string, with interior NULs replaced so conversion cannot fail.
pub(crate) fn c_string(s: &str) -> *mut c_char {
    CString::new(s.replace('\0', " "))
        .unwrap_or_default()
        .into_raw()
}

// ---------------------------------------------------------------------------
// Callback adapters
// ---------------------------------------------------------------------------

pub(crate) struct CWriteSink(pub(crate) XferDataCallback);

impl WriteSink for CWriteSink {
    fn write(&mut self, data: &[u8], ctx: CallbackContext) -> Result<usize, SinkError> {
        let n = (self.0)(data.as_ptr() as *mut c_char, 1, data.len(), ctx.as_ptr());
        match n {
            XFER_FUNC_PAUSE => Err(SinkError::Pause),
            XFER_FUNC_ABORT => Err(SinkError::Abort("write callback returned XFER_FUNC_ABORT".into())),
            n => Ok(n),
        }
    }
}

pub(crate) struct CReadSource(pub(crate) XferDataCallback);

impl ReadSource for CReadSource {
    fn read(&mut self, buf: &mut [u8], ctx: CallbackContext) -> Result<usize, SinkError> {
        let n = (self.0)(buf.as_mut_ptr() as *mut c_char, 1, buf.len(), ctx.as_ptr());
        match n {
            XFER_FUNC_PAUSE => Err(SinkError::Pause),
            XFER_FUNC_ABORT => Err(SinkError::Abort("read callback returned XFER_FUNC_ABORT".into())),
            n => Ok(n),
        }
    }
}

pub(crate) struct CProgressSink(pub(crate) XferProgressCallback);

impl ProgressSink for CProgressSink {
    fn progress(&mut self, progress: TransferProgress, ctx: CallbackContext) -> Result<(), SinkError> {
        let total = |t: Option<u64>| t.map_or(-1, |t| t as i64);
        let rc = (self.0)(
            ctx.as_ptr(),
            total(progress.download_total),
            progress.downloaded as i64,
            total(progress.upload_total),
            progress.uploaded as i64,
        );
        match rc {
            0 => Ok(()),
            rc => Err(SinkError::Abort(format!("progress callback returned {rc}"))),
        }
    }
}
