//! Typed option registry for a transfer handle.
//!
//! # Design
//! Every `OptionKey` carries the `ValueKind` it accepts, so a value of the
//! wrong kind is rejected at `set` time instead of being handed to the
//! transport. Keys have a stable numeric id for the C ABI and a stable
//! upper-snake name for JSON configuration. A failed `set` never mutates the
//! registry.

use std::collections::HashMap;
use std::ffi::c_void;
use std::fmt;
use std::rc::Rc;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::bridge::{ProgressCallback, ReadCallback, WriteCallback};
use crate::error::TransferError;

/// Largest accepted `BUFFER_SIZE`.
pub const MAX_BUFFER_SIZE: i64 = 1 << 20;

/// Identifier of a configurable transfer option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u32)]
pub enum OptionKey {
    Url = 1,
    Method = 2,
    /// Request headers, one `Name: value` per line.
    Headers = 3,
    UserAgent = 4,
    /// Request body given inline; implies `POST` unless `METHOD` is set.
    PostFields = 5,
    /// Whole-transfer deadline. `0` disables it.
    TimeoutMs = 10,
    ConnectTimeoutMs = 11,
    MaxRedirects = 12,
    /// Largest chunk handed to a sink or pulled from the read source.
    BufferSize = 13,
    /// Declared request body length for `UPLOAD`; sent as `content-length`.
    UploadSize = 14,
    FollowLocation = 20,
    /// Send a request body pulled from `READ_SOURCE`; implies `PUT`.
    Upload = 21,
    /// Treat a response status of 400 or above as a transport error.
    FailOnError = 22,
    Verbose = 23,
    HeaderSink = 30,
    BodySink = 31,
    ReadSource = 32,
    /// Called with the byte counts after every accepted body or upload chunk.
    ProgressSink = 33,
    HeaderContext = 40,
    BodyContext = 41,
    ReadContext = 42,
    ProgressContext = 43,
}

impl OptionKey {
    pub const ALL: [OptionKey; 22] = [
        OptionKey::Url,
        OptionKey::Method,
        OptionKey::Headers,
        OptionKey::UserAgent,
        OptionKey::PostFields,
        OptionKey::TimeoutMs,
        OptionKey::ConnectTimeoutMs,
        OptionKey::MaxRedirects,
        OptionKey::BufferSize,
        OptionKey::UploadSize,
        OptionKey::FollowLocation,
        OptionKey::Upload,
        OptionKey::FailOnError,
        OptionKey::Verbose,
        OptionKey::HeaderSink,
        OptionKey::BodySink,
        OptionKey::ReadSource,
        OptionKey::ProgressSink,
        OptionKey::HeaderContext,
        OptionKey::BodyContext,
        OptionKey::ReadContext,
        OptionKey::ProgressContext,
    ];

    /// The kind of value this option accepts.
    pub fn kind(self) -> ValueKind {
        match self {
            OptionKey::Url
            | OptionKey::Method
            | OptionKey::Headers
            | OptionKey::UserAgent
            | OptionKey::PostFields => ValueKind::String,
            OptionKey::TimeoutMs
            | OptionKey::ConnectTimeoutMs
            | OptionKey::MaxRedirects
            | OptionKey::BufferSize
            | OptionKey::UploadSize => ValueKind::Integer,
            OptionKey::FollowLocation
            | OptionKey::Upload
            | OptionKey::FailOnError
            | OptionKey::Verbose => ValueKind::Boolean,
            OptionKey::HeaderSink | OptionKey::BodySink => ValueKind::WriteCallback,
            OptionKey::ReadSource => ValueKind::ReadCallback,
            OptionKey::ProgressSink => ValueKind::ProgressCallback,
            OptionKey::HeaderContext
            | OptionKey::BodyContext
            | OptionKey::ReadContext
            | OptionKey::ProgressContext => ValueKind::Pointer,
        }
    }

    pub fn id(self) -> u32 {
        self as u32
    }

    pub fn from_id(id: u32) -> Result<Self, TransferError> {
        OptionKey::ALL
            .iter()
            .copied()
            .find(|key| key.id() == id)
            .ok_or_else(|| TransferError::UnknownOption(format!("#{id}")))
    }

    pub fn name(self) -> &'static str {
        match self {
            OptionKey::Url => "URL",
            OptionKey::Method => "METHOD",
            OptionKey::Headers => "HEADERS",
            OptionKey::UserAgent => "USER_AGENT",
            OptionKey::PostFields => "POST_FIELDS",
            OptionKey::TimeoutMs => "TIMEOUT_MS",
            OptionKey::ConnectTimeoutMs => "CONNECT_TIMEOUT_MS",
            OptionKey::MaxRedirects => "MAX_REDIRECTS",
            OptionKey::BufferSize => "BUFFER_SIZE",
            OptionKey::UploadSize => "UPLOAD_SIZE",
            OptionKey::FollowLocation => "FOLLOW_LOCATION",
            OptionKey::Upload => "UPLOAD",
            OptionKey::FailOnError => "FAIL_ON_ERROR",
            OptionKey::Verbose => "VERBOSE",
            OptionKey::HeaderSink => "HEADER_SINK",
            OptionKey::BodySink => "BODY_SINK",
            OptionKey::ReadSource => "READ_SOURCE",
            OptionKey::ProgressSink => "PROGRESS_SINK",
            OptionKey::HeaderContext => "HEADER_CONTEXT",
            OptionKey::BodyContext => "BODY_CONTEXT",
            OptionKey::ReadContext => "READ_CONTEXT",
            OptionKey::ProgressContext => "PROGRESS_CONTEXT",
        }
    }

    /// Range checks for values that already have the right kind.
    fn validate(self, value: &OptionValue) -> Result<(), TransferError> {
        let invalid = |reason: &str| TransferError::InvalidValue {
            key: self,
            reason: reason.to_string(),
        };
        match (self, value) {
            (OptionKey::Url, OptionValue::String(url)) if url.trim().is_empty() => {
                Err(invalid("url is empty"))
            }
            (OptionKey::Method, OptionValue::String(method)) if !is_token(method) => {
                Err(invalid("method must be a non-empty HTTP token"))
            }
            (OptionKey::Headers, OptionValue::String(lines)) => {
                for line in lines.lines().filter(|l| !l.trim().is_empty()) {
                    match line.split_once(':') {
                        Some((name, _)) if is_token(name.trim()) => {}
                        _ => return Err(invalid(&format!("malformed header line {line:?}"))),
                    }
                }
                Ok(())
            }
            (
                OptionKey::TimeoutMs | OptionKey::ConnectTimeoutMs | OptionKey::UploadSize,
                OptionValue::Integer(n),
            ) if *n < 0 => Err(invalid("must not be negative")),
            (OptionKey::MaxRedirects, OptionValue::Integer(n))
                if *n < 0 || *n > i64::from(u32::MAX) =>
            {
                Err(invalid("out of range"))
            }
            (OptionKey::BufferSize, OptionValue::Integer(n))
                if *n < 1 || *n > MAX_BUFFER_SIZE =>
            {
                Err(invalid(&format!("must be between 1 and {MAX_BUFFER_SIZE}")))
            }
            _ => Ok(()),
        }
    }
}

fn is_token(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"!#$%&'*+-.^_`|~".contains(&b))
}

impl fmt::Display for OptionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for OptionKey {
    type Err = TransferError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        OptionKey::ALL
            .iter()
            .copied()
            .find(|key| key.name().eq_ignore_ascii_case(s))
            .ok_or_else(|| TransferError::UnknownOption(s.to_string()))
    }
}

/// The kind of value an option accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueKind {
    String,
    Integer,
    Boolean,
    WriteCallback,
    ReadCallback,
    ProgressCallback,
    Pointer,
}

impl fmt::Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ValueKind::String => "string",
            ValueKind::Integer => "integer",
            ValueKind::Boolean => "boolean",
            ValueKind::WriteCallback => "write callback",
            ValueKind::ReadCallback => "read callback",
            ValueKind::ProgressCallback => "progress callback",
            ValueKind::Pointer => "pointer",
        };
        f.write_str(name)
    }
}

/// Opaque caller pointer passed unchanged to every call of a sink.
///
/// The engine stores and forwards it but never dereferences it; whatever it
/// points to stays owned by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CallbackContext(*mut c_void);

impl CallbackContext {
    pub const fn null() -> Self {
        CallbackContext(std::ptr::null_mut())
    }

    pub fn from_ptr(ptr: *mut c_void) -> Self {
        CallbackContext(ptr)
    }

    pub fn as_ptr(self) -> *mut c_void {
        self.0
    }

    pub fn is_null(self) -> bool {
        self.0.is_null()
    }
}

impl Default for CallbackContext {
    fn default() -> Self {
        CallbackContext::null()
    }
}

/// A value stored in the registry.
#[derive(Clone)]
pub enum OptionValue {
    String(String),
    Integer(i64),
    Boolean(bool),
    WriteCallback(WriteCallback),
    ReadCallback(ReadCallback),
    ProgressCallback(ProgressCallback),
    Pointer(CallbackContext),
}

impl OptionValue {
    pub fn kind(&self) -> ValueKind {
        match self {
            OptionValue::String(_) => ValueKind::String,
            OptionValue::Integer(_) => ValueKind::Integer,
            OptionValue::Boolean(_) => ValueKind::Boolean,
            OptionValue::WriteCallback(_) => ValueKind::WriteCallback,
            OptionValue::ReadCallback(_) => ValueKind::ReadCallback,
            OptionValue::ProgressCallback(_) => ValueKind::ProgressCallback,
            OptionValue::Pointer(_) => ValueKind::Pointer,
        }
    }

    fn from_json(key: OptionKey, value: &serde_json::Value) -> Result<Self, TransferError> {
        match value {
            serde_json::Value::String(s) => Ok(OptionValue::String(s.clone())),
            serde_json::Value::Bool(b) => Ok(OptionValue::Boolean(*b)),
            serde_json::Value::Number(n) => {
                n.as_i64()
                    .map(OptionValue::Integer)
                    .ok_or_else(|| TransferError::InvalidValue {
                        key,
                        reason: format!("{n} is not an integer"),
                    })
            }
            other => Err(TransferError::InvalidValue {
                key,
                reason: format!("unsupported JSON value {other}"),
            }),
        }
    }
}

impl From<&str> for OptionValue {
    fn from(s: &str) -> Self {
        OptionValue::String(s.to_string())
    }
}

impl From<String> for OptionValue {
    fn from(s: String) -> Self {
        OptionValue::String(s)
    }
}

impl From<i64> for OptionValue {
    fn from(n: i64) -> Self {
        OptionValue::Integer(n)
    }
}

impl From<bool> for OptionValue {
    fn from(b: bool) -> Self {
        OptionValue::Boolean(b)
    }
}

impl From<WriteCallback> for OptionValue {
    fn from(cb: WriteCallback) -> Self {
        OptionValue::WriteCallback(cb)
    }
}

impl From<ReadCallback> for OptionValue {
    fn from(cb: ReadCallback) -> Self {
        OptionValue::ReadCallback(cb)
    }
}

impl From<ProgressCallback> for OptionValue {
    fn from(cb: ProgressCallback) -> Self {
        OptionValue::ProgressCallback(cb)
    }
}

impl From<CallbackContext> for OptionValue {
    fn from(ctx: CallbackContext) -> Self {
        OptionValue::Pointer(ctx)
    }
}

// Callbacks compare by identity; comparing the data pointers ignores vtables.
impl PartialEq for OptionValue {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (OptionValue::String(a), OptionValue::String(b)) => a == b,
            (OptionValue::Integer(a), OptionValue::Integer(b)) => a == b,
            (OptionValue::Boolean(a), OptionValue::Boolean(b)) => a == b,
            (OptionValue::WriteCallback(a), OptionValue::WriteCallback(b)) => {
                std::ptr::eq(Rc::as_ptr(a).cast::<()>(), Rc::as_ptr(b).cast::<()>())
            }
            (OptionValue::ReadCallback(a), OptionValue::ReadCallback(b)) => {
                std::ptr::eq(Rc::as_ptr(a).cast::<()>(), Rc::as_ptr(b).cast::<()>())
            }
            (OptionValue::ProgressCallback(a), OptionValue::ProgressCallback(b)) => {
                std::ptr::eq(Rc::as_ptr(a).cast::<()>(), Rc::as_ptr(b).cast::<()>())
            }
            (OptionValue::Pointer(a), OptionValue::Pointer(b)) => a == b,
            _ => false,
        }
    }
}

impl fmt::Debug for OptionValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionValue::String(s) => f.debug_tuple("String").field(s).finish(),
            OptionValue::Integer(n) => f.debug_tuple("Integer").field(n).finish(),
            OptionValue::Boolean(b) => f.debug_tuple("Boolean").field(b).finish(),
            OptionValue::WriteCallback(cb) => {
                f.debug_tuple("WriteCallback").field(&Rc::as_ptr(cb).cast::<()>()).finish()
            }
            OptionValue::ReadCallback(cb) => {
                f.debug_tuple("ReadCallback").field(&Rc::as_ptr(cb).cast::<()>()).finish()
            }
            OptionValue::ProgressCallback(cb) => {
                f.debug_tuple("ProgressCallback").field(&Rc::as_ptr(cb).cast::<()>()).finish()
            }
            OptionValue::Pointer(ctx) => f.debug_tuple("Pointer").field(&ctx.as_ptr()).finish(),
        }
    }
}

/// Key → value store with last-write-wins semantics.
#[derive(Debug, Clone, Default)]
pub struct OptionRegistry {
    values: HashMap<OptionKey, OptionValue>,
}

impl OptionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store `value` under `key`, replacing any previous value.
    pub fn set(&mut self, key: OptionKey, value: impl Into<OptionValue>) -> Result<(), TransferError> {
        let value = value.into();
        let found = value.kind();
        if found != key.kind() {
            return Err(TransferError::TypeMismatch {
                key,
                expected: key.kind(),
                found,
            });
        }
        key.validate(&value)?;
        self.values.insert(key, value);
        Ok(())
    }

    /// `set` addressed by the numeric id used across the C ABI.
    pub fn set_by_id(&mut self, id: u32, value: impl Into<OptionValue>) -> Result<(), TransferError> {
        self.set(OptionKey::from_id(id)?, value)
    }

    /// Apply a JSON object keyed by option name. All or nothing: on error the
    /// registry is left as it was.
    pub fn apply_json(
        &mut self,
        doc: &serde_json::Map<String, serde_json::Value>,
    ) -> Result<(), TransferError> {
        let mut staged = self.clone();
        for (name, value) in doc {
            let key: OptionKey = name.parse()?;
            staged.set(key, OptionValue::from_json(key, value)?)?;
        }
        *self = staged;
        Ok(())
    }

    pub fn get(&self, key: OptionKey) -> Option<&OptionValue> {
        self.values.get(&key)
    }

    pub fn remove(&mut self, key: OptionKey) -> Option<OptionValue> {
        self.values.remove(&key)
    }

    pub fn contains(&self, key: OptionKey) -> bool {
        self.values.contains_key(&key)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (OptionKey, &OptionValue)> {
        self.values.iter().map(|(k, v)| (*k, v))
    }

    pub fn get_str(&self, key: OptionKey) -> Option<&str> {
        match self.values.get(&key) {
            Some(OptionValue::String(s)) => Some(s),
            _ => None,
        }
    }

    pub fn get_int(&self, key: OptionKey) -> Option<i64> {
        match self.values.get(&key) {
            Some(OptionValue::Integer(n)) => Some(*n),
            _ => None,
        }
    }

    pub fn get_bool(&self, key: OptionKey) -> Option<bool> {
        match self.values.get(&key) {
            Some(OptionValue::Boolean(b)) => Some(*b),
            _ => None,
        }
    }

    pub fn write_callback(&self, key: OptionKey) -> Option<WriteCallback> {
        match self.values.get(&key) {
            Some(OptionValue::WriteCallback(cb)) => Some(Rc::clone(cb)),
            _ => None,
        }
    }

    pub fn read_callback(&self, key: OptionKey) -> Option<ReadCallback> {
        match self.values.get(&key) {
            Some(OptionValue::ReadCallback(cb)) => Some(Rc::clone(cb)),
            _ => None,
        }
    }

    pub fn progress_callback(&self, key: OptionKey) -> Option<ProgressCallback> {
        match self.values.get(&key) {
            Some(OptionValue::ProgressCallback(cb)) => Some(Rc::clone(cb)),
            _ => None,
        }
    }

    /// The context pointer stored under `key`, null when unset.
    pub fn context(&self, key: OptionKey) -> CallbackContext {
        match self.values.get(&key) {
            Some(OptionValue::Pointer(ctx)) => *ctx,
            _ => CallbackContext::null(),
        }
    }
}
