//! C-ABI wrapper around `transfer-core`.
//!
//! # Overview
//! Exposes transfer handles, typed option setters, blocking `perform` and
//! the multiplexed run through `extern "C"` functions, so a C caller can
//! drive HTTP transfers with plain data callbacks and context pointers.
//!
//! # Design
//! - Every `extern "C"` function wraps its body in `catch_unwind` so panics
//!   never cross the FFI boundary.
//! - Options are addressed by numeric id (`xfer_option_id` maps names) and
//!   set through one function per value kind: string, long, bool, function
//!   and pointer. A value of the wrong kind is rejected with
//!   `FfiCode::TypeMismatch`, never coerced.
//! - Fallible calls return an `FfiCode`; results come back through an out
//!   pointer as an `FfiTransferResult`.
//! - The C caller owns all returned pointers and must call the matching
//!   `xfer_*_free` / `xfer_free_*` function to release them.
//! - Handles and multi runs are not thread-safe. Cancel tokens are.

pub mod types;

use std::ffi::{c_void, CStr};
use std::os::raw::c_char;
use std::panic::{catch_unwind, AssertUnwindSafe};

use tracing::debug;
use transfer_core::global;
use transfer_core::{
    progress_callback, read_callback, write_callback, CallbackContext, Executor, ExecutorConfig,
    OptionKey, TransferError, TransferHandle, ValueKind,
};

use types::*;

/// Read a C string argument. `None` when it is not valid UTF-8.
///
/// # Safety
/// `ptr` must be non-null and point to a NUL-terminated string.
unsafe fn read_str<'a>(ptr: *const c_char) -> Option<&'a str> {
    unsafe { CStr::from_ptr(ptr) }.to_str().ok()
}

fn code_of(result: Result<(), TransferError>) -> FfiCode {
    match result {
        Ok(()) => FfiCode::Ok,
        Err(err) => {
            debug!(error = %err, "ffi call failed");
            FfiCode::from(&err)
        }
    }
}

// ---------------------------------------------------------------------------
// Library lifecycle
// ---------------------------------------------------------------------------

/// Initialize the library. Every call must be matched by one
/// `xfer_global_cleanup`; transfers refuse to run while uninitialized.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_global_init() -> FfiCode {
    catch_unwind(|| {
        global::acquire();
        FfiCode::Ok
    })
    .unwrap_or(FfiCode::Panic)
}

/// Release one initialization reference.
///
/// Returns `InvalidState` when there was no matching `xfer_global_init`.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_global_cleanup() -> FfiCode {
    catch_unwind(|| {
        if global::release() {
            FfiCode::Ok
        } else {
            FfiCode::InvalidState
        }
    })
    .unwrap_or(FfiCode::Panic)
}

// ---------------------------------------------------------------------------
// Handle lifecycle
// ---------------------------------------------------------------------------

/// Create a new transfer handle with no options set.
///
/// The caller must free the returned pointer with `xfer_handle_free`.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_handle_new() -> *mut FfiHandle {
    catch_unwind(|| {
        Box::into_raw(Box::new(FfiHandle {
            inner: TransferHandle::new(),
        }))
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Free a handle created by `xfer_handle_new` or `xfer_handle_duplicate`.
/// Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_handle_free(handle: *mut FfiHandle) {
    if !handle.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(handle) });
        }));
    }
}

/// Return a finished handle to the configuring state, keeping its options.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_handle_reset(handle: *mut FfiHandle) -> FfiCode {
    catch_unwind(AssertUnwindSafe(|| {
        if handle.is_null() {
            return FfiCode::NullArg;
        }
        let handle = unsafe { &mut *handle };
        code_of(handle.inner.reset())
    }))
    .unwrap_or(FfiCode::Panic)
}

/// Copy a handle's options into a new, independent handle. Callbacks and
/// context pointers are shared with the source.
///
/// Returns null if `handle` is null.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_handle_duplicate(handle: *const FfiHandle) -> *mut FfiHandle {
    catch_unwind(AssertUnwindSafe(|| {
        if handle.is_null() {
            return std::ptr::null_mut();
        }
        let handle = unsafe { &*handle };
        Box::into_raw(Box::new(FfiHandle {
            inner: handle.inner.duplicate(),
        }))
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// The handle's id as a string. Free with `xfer_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_handle_id(handle: *const FfiHandle) -> *mut c_char {
    catch_unwind(AssertUnwindSafe(|| {
        if handle.is_null() {
            return std::ptr::null_mut();
        }
        let handle = unsafe { &*handle };
        c_string(&handle.inner.id().to_string())
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Current lifecycle state. A null handle reads as `Configuring`.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_handle_state(handle: *const FfiHandle) -> FfiState {
    catch_unwind(AssertUnwindSafe(|| {
        if handle.is_null() {
            return FfiState::Configuring;
        }
        let handle = unsafe { &*handle };
        handle.inner.state().into()
    }))
    .unwrap_or(FfiState::Configuring)
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Numeric id for an option name such as `"URL"` (case-insensitive).
///
/// Returns 0 for a null or unknown name.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_option_id(name: *const c_char) -> u32 {
    catch_unwind(|| {
        if name.is_null() {
            return 0;
        }
        unsafe { read_str(name) }
            .and_then(|name| name.parse::<OptionKey>().ok())
            .map_or(0, OptionKey::id)
    })
    .unwrap_or(0)
}

/// Set a string option. A null `value` unsets the option.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_setopt_string(
    handle: *mut FfiHandle,
    option: u32,
    value: *const c_char,
) -> FfiCode {
    catch_unwind(AssertUnwindSafe(|| {
        if handle.is_null() {
            return FfiCode::NullArg;
        }
        let handle = unsafe { &mut *handle };
        if value.is_null() {
            return unset(handle, option, ValueKind::String);
        }
        match unsafe { read_str(value) } {
            Some(value) => code_of(handle.inner.set_by_id(option, value)),
            None => FfiCode::InvalidUtf8,
        }
    }))
    .unwrap_or(FfiCode::Panic)
}

/// Set an integer option.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_setopt_long(handle: *mut FfiHandle, option: u32, value: i64) -> FfiCode {
    catch_unwind(AssertUnwindSafe(|| {
        if handle.is_null() {
            return FfiCode::NullArg;
        }
        let handle = unsafe { &mut *handle };
        code_of(handle.inner.set_by_id(option, value))
    }))
    .unwrap_or(FfiCode::Panic)
}

/// Set a boolean option.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_setopt_bool(handle: *mut FfiHandle, option: u32, value: bool) -> FfiCode {
    catch_unwind(AssertUnwindSafe(|| {
        if handle.is_null() {
            return FfiCode::NullArg;
        }
        let handle = unsafe { &mut *handle };
        code_of(handle.inner.set_by_id(option, value))
    }))
    .unwrap_or(FfiCode::Panic)
}

/// Set a data callback option. Sinks (`HEADER_SINK`, `BODY_SINK`) and the
/// `READ_SOURCE` share the `XferDataCallback` signature; the option decides
/// which way data flows. A null `func` unsets the option. `PROGRESS_SINK`
/// takes `xfer_setopt_progress_func` instead.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_setopt_func(
    handle: *mut FfiHandle,
    option: u32,
    func: Option<XferDataCallback>,
) -> FfiCode {
    catch_unwind(AssertUnwindSafe(|| {
        if handle.is_null() {
            return FfiCode::NullArg;
        }
        let handle = unsafe { &mut *handle };
        let key = match OptionKey::from_id(option) {
            Ok(key) => key,
            Err(err) => return FfiCode::from(&err),
        };
        let kind = key.kind();
        if !matches!(kind, ValueKind::WriteCallback | ValueKind::ReadCallback) {
            debug!(option = %key, %kind, "function given for a non-callback option");
            return FfiCode::TypeMismatch;
        }
        let Some(func) = func else {
            return unset(handle, option, kind);
        };
        let result = if kind == ValueKind::WriteCallback {
            handle.inner.set(key, write_callback(CWriteSink(func)))
        } else {
            handle.inner.set(key, read_callback(CReadSource(func)))
        };
        code_of(result)
    }))
    .unwrap_or(FfiCode::Panic)
}

/// Set the `PROGRESS_SINK` option. Progress callbacks have their own
/// signature, so they do not go through `xfer_setopt_func`. A null `func`
/// unsets the option.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_setopt_progress_func(
    handle: *mut FfiHandle,
    option: u32,
    func: Option<XferProgressCallback>,
) -> FfiCode {
    catch_unwind(AssertUnwindSafe(|| {
        if handle.is_null() {
            return FfiCode::NullArg;
        }
        let handle = unsafe { &mut *handle };
        let key = match OptionKey::from_id(option) {
            Ok(key) => key,
            Err(err) => return FfiCode::from(&err),
        };
        if key.kind() != ValueKind::ProgressCallback {
            debug!(option = %key, kind = %key.kind(), "progress function given for another option");
            return FfiCode::TypeMismatch;
        }
        match func {
            Some(func) => code_of(handle.inner.set(key, progress_callback(CProgressSink(func)))),
            None => unset(handle, option, ValueKind::ProgressCallback),
        }
    }))
    .unwrap_or(FfiCode::Panic)
}

/// Set a context pointer option. The pointer is passed unchanged to the
/// matching callback and never dereferenced; it may be null.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_setopt_pointer(
    handle: *mut FfiHandle,
    option: u32,
    value: *mut c_void,
) -> FfiCode {
    catch_unwind(AssertUnwindSafe(|| {
        if handle.is_null() {
            return FfiCode::NullArg;
        }
        let handle = unsafe { &mut *handle };
        code_of(handle.inner.set_by_id(option, CallbackContext::from_ptr(value)))
    }))
    .unwrap_or(FfiCode::Panic)
}

/// Apply a JSON object of option names to values. All or nothing.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_setopt_json(handle: *mut FfiHandle, json: *const c_char) -> FfiCode {
    catch_unwind(AssertUnwindSafe(|| {
        if handle.is_null() || json.is_null() {
            return FfiCode::NullArg;
        }
        let handle = unsafe { &mut *handle };
        let Some(json) = (unsafe { read_str(json) }) else {
            return FfiCode::InvalidUtf8;
        };
        match serde_json::from_str::<serde_json::Map<String, serde_json::Value>>(json) {
            Ok(doc) => code_of(handle.inner.apply_json(&doc)),
            Err(err) => {
                debug!(error = %err, "option document is not a JSON object");
                FfiCode::InvalidValue
            }
        }
    }))
    .unwrap_or(FfiCode::Panic)
}

fn unset(handle: &mut FfiHandle, option: u32, kind: ValueKind) -> FfiCode {
    let key = match OptionKey::from_id(option) {
        Ok(key) => key,
        Err(err) => return FfiCode::from(&err),
    };
    if key.kind() != kind {
        return FfiCode::TypeMismatch;
    }
    code_of(handle.inner.unset(key).map(drop))
}

// ---------------------------------------------------------------------------
// Cancellation
// ---------------------------------------------------------------------------

/// A cancel token for `handle`, usable from any thread while the transfer
/// runs. Free with `xfer_cancel_token_free`.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_cancel_token_new(handle: *const FfiHandle) -> *mut FfiCancelToken {
    catch_unwind(AssertUnwindSafe(|| {
        if handle.is_null() {
            return std::ptr::null_mut();
        }
        let handle = unsafe { &*handle };
        Box::into_raw(Box::new(FfiCancelToken {
            inner: handle.inner.cancel_token(),
        }))
    }))
    .unwrap_or(std::ptr::null_mut())
}

/// Ask the transfer to stop at its next step.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_cancel(token: *const FfiCancelToken) -> FfiCode {
    catch_unwind(|| {
        if token.is_null() {
            return FfiCode::NullArg;
        }
        unsafe { &*token }.inner.cancel();
        FfiCode::Ok
    })
    .unwrap_or(FfiCode::Panic)
}

/// Free a cancel token. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_cancel_token_free(token: *mut FfiCancelToken) {
    if !token.is_null() {
        let _ = catch_unwind(|| {
            drop(unsafe { Box::from_raw(token) });
        });
    }
}

// ---------------------------------------------------------------------------
// Execution
// ---------------------------------------------------------------------------

/// Run `handle` to completion on the calling thread.
///
/// On `Ok`, `*out` holds the result (free with `xfer_free_result`); the
/// transfer itself may still have failed or been cancelled, see its
/// `status`. Any other code means the transfer never started.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_perform(handle: *mut FfiHandle, out: *mut *mut FfiTransferResult) -> FfiCode {
    catch_unwind(AssertUnwindSafe(|| {
        if handle.is_null() || out.is_null() {
            return FfiCode::NullArg;
        }
        let handle = unsafe { &mut *handle };
        let executor = match Executor::new(ExecutorConfig::default()) {
            Ok(executor) => executor,
            Err(err) => return FfiCode::from(&err),
        };
        match executor.run(&mut handle.inner) {
            Ok(result) => {
                let id = handle.inner.id().to_string();
                unsafe { *out = FfiTransferResult::from_core(&id, &result) };
                FfiCode::Ok
            }
            Err(err) => code_of(Err(err)),
        }
    }))
    .unwrap_or(FfiCode::Panic)
}

/// Create a multiplexed run. `config_json` is an optional executor
/// configuration object; null uses the defaults.
///
/// Returns null if the library is not initialized or the configuration
/// does not parse. Free with `xfer_multi_free`.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_multi_new(config_json: *const c_char) -> *mut FfiMulti {
    catch_unwind(|| {
        let config = if config_json.is_null() {
            ExecutorConfig::default()
        } else {
            let parsed = unsafe { read_str(config_json) }.map(ExecutorConfig::from_json);
            match parsed {
                Some(Ok(config)) => config,
                _ => return std::ptr::null_mut(),
            }
        };
        match Executor::new(config) {
            Ok(executor) => Box::into_raw(Box::new(FfiMulti {
                executor,
                queued: Vec::new(),
                transfers: None,
            })),
            Err(_) => std::ptr::null_mut(),
        }
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Move `handle` into the run. The multi owns it from here on: `handle`
/// must not be used or freed by the caller afterwards.
///
/// Returns `InvalidState` once results have started coming out.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_multi_add(multi: *mut FfiMulti, handle: *mut FfiHandle) -> FfiCode {
    catch_unwind(AssertUnwindSafe(|| {
        if multi.is_null() || handle.is_null() {
            return FfiCode::NullArg;
        }
        let multi = unsafe { &mut *multi };
        if multi.transfers.is_some() {
            return FfiCode::InvalidState;
        }
        let handle = unsafe { Box::from_raw(handle) };
        multi.queued.push(handle.inner);
        FfiCode::Ok
    }))
    .unwrap_or(FfiCode::Panic)
}

/// Block until the next transfer finishes and store its result in `*out`.
///
/// Results come out in completion order. Returns `Done` when every
/// transfer has been reported. The first call starts the run; if any
/// handle's options are invalid nothing starts and that error is returned.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_multi_next(multi: *mut FfiMulti, out: *mut *mut FfiTransferResult) -> FfiCode {
    catch_unwind(AssertUnwindSafe(|| {
        if multi.is_null() || out.is_null() {
            return FfiCode::NullArg;
        }
        let multi = unsafe { &mut *multi };
        if multi.transfers.is_none() {
            let handles = std::mem::take(&mut multi.queued);
            match multi.executor.run_many(handles) {
                Ok(transfers) => multi.transfers = Some(transfers),
                Err(err) => return code_of(Err(err)),
            }
        }
        match multi.transfers.as_mut().and_then(Iterator::next) {
            Some((id, result)) => {
                unsafe { *out = FfiTransferResult::from_core(&id.to_string(), &result) };
                FfiCode::Ok
            }
            None => FfiCode::Done,
        }
    }))
    .unwrap_or(FfiCode::Panic)
}

/// Free a multi run and every handle it owns. Transfers still running are
/// cancelled. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_multi_free(multi: *mut FfiMulti) {
    if !multi.is_null() {
        let _ = catch_unwind(AssertUnwindSafe(|| {
            drop(unsafe { Box::from_raw(multi) });
        }));
    }
}

// ---------------------------------------------------------------------------
// Results
// ---------------------------------------------------------------------------

/// Serialize a result as a JSON object. Free with `xfer_free_string`.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_result_json(result: *const FfiTransferResult) -> *mut c_char {
    catch_unwind(|| {
        if result.is_null() {
            return std::ptr::null_mut();
        }
        let result = unsafe { &*result };
        let text = |ptr: *mut c_char| {
            if ptr.is_null() {
                None
            } else {
                unsafe { CStr::from_ptr(ptr) }.to_str().ok()
            }
        };
        let json = serde_json::json!({
            "handle_id": text(result.handle_id),
            "status": format!("{:?}", result.status),
            "response_code": (result.response_code != 0).then_some(result.response_code),
            "body_bytes": result.body_bytes,
            "header_bytes": result.header_bytes,
            "upload_bytes": result.upload_bytes,
            "elapsed_ms": result.elapsed_ms,
            "error": text(result.error_message),
        });
        c_string(&json.to_string())
    })
    .unwrap_or(std::ptr::null_mut())
}

/// Free a result. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_free_result(result: *mut FfiTransferResult) {
    if !result.is_null() {
        let _ = catch_unwind(|| unsafe { FfiTransferResult::free(result) });
    }
}

/// Free a string returned by this library. Safe to call with null.
#[unsafe(no_mangle)]
pub extern "C" fn xfer_free_string(s: *mut c_char) {
    if !s.is_null() {
        let _ = catch_unwind(|| {
            drop(unsafe { std::ffi::CString::from_raw(s) });
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
