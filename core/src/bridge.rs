//! Streaming bridge between transport events and caller sinks.
//!
//! # Design
//! The transport pushes header lines and body chunks; the bridge hands them to
//! the header sink and the body sink in pieces of at most `BUFFER_SIZE` bytes.
//! A sink that accepts fewer bytes than offered (or returns
//! `SinkError::Pause`) pauses the transfer: the unaccepted tail stays in the
//! bridge and is offered again on the next executor step, starting at the
//! first byte the sink did not take. Uploads run the other way, pulling
//! chunks from the read source (or from `POST_FIELDS`).
//!
//! Every sink call holds an exclusive `RefCell` borrow of the sink, so a call
//! that would re-enter a sink already on the stack fails instead of running.
//! Once any sink aborts, the bridge is poisoned and no further sink calls
//! happen for that transfer. A sink that panics counts as an abort.
//!
//! After every accepted body or upload chunk the progress sink, if set, sees
//! the running byte counts. The download total comes from the response's
//! `content-length` header line as it passes through.

use std::any::Any;
use std::cell::RefCell;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;

use tracing::{debug, trace, warn};

use crate::error::{SinkError, TransferError};
use crate::options::{CallbackContext, OptionKey, OptionRegistry};
use crate::types::{HandleId, TransferProgress};

/// Receives downloaded bytes (response headers or body).
///
/// Returns how many bytes of `data` were taken. See the module docs for how
/// short counts and errors are treated.
pub trait WriteSink {
    fn write(&mut self, data: &[u8], ctx: CallbackContext) -> Result<usize, SinkError>;
}

/// Produces request body bytes for an upload.
///
/// Fills the front of `buf` and returns the byte count; `Ok(0)` ends the
/// upload.
pub trait ReadSource {
    fn read(&mut self, buf: &mut [u8], ctx: CallbackContext) -> Result<usize, SinkError>;
}

/// Observes transfer progress.
///
/// `Err(SinkError::Abort)` stops the transfer; `Err(SinkError::Pause)` is
/// ignored, progress calls never hold data back.
pub trait ProgressSink {
    fn progress(&mut self, progress: TransferProgress, ctx: CallbackContext) -> Result<(), SinkError>;
}

/// Shared reference to a write sink as stored in the option registry.
pub type WriteCallback = Rc<RefCell<dyn WriteSink>>;

/// Shared reference to a read source as stored in the option registry.
pub type ReadCallback = Rc<RefCell<dyn ReadSource>>;

pub type ProgressCallback = Rc<RefCell<dyn ProgressSink>>;

struct FnSink<F>(F);

impl<F> WriteSink for FnSink<F>
where
    F: FnMut(&[u8], CallbackContext) -> Result<usize, SinkError>,
{
    fn write(&mut self, data: &[u8], ctx: CallbackContext) -> Result<usize, SinkError> {
        (self.0)(data, ctx)
    }
}

struct FnSource<F>(F);

impl<F> ReadSource for FnSource<F>
where
    F: FnMut(&mut [u8], CallbackContext) -> Result<usize, SinkError>,
{
    fn read(&mut self, buf: &mut [u8], ctx: CallbackContext) -> Result<usize, SinkError> {
        (self.0)(buf, ctx)
    }
}

struct FnProgress<F>(F);

impl<F> ProgressSink for FnProgress<F>
where
    F: FnMut(TransferProgress, CallbackContext) -> Result<(), SinkError>,
{
    fn progress(&mut self, progress: TransferProgress, ctx: CallbackContext) -> Result<(), SinkError> {
        (self.0)(progress, ctx)
    }
}

/// Wrap a closure as a write sink.
pub fn sink_fn<F>(f: F) -> WriteCallback
where
    F: FnMut(&[u8], CallbackContext) -> Result<usize, SinkError> + 'static,
{
    Rc::new(RefCell::new(FnSink(f)))
}

/// Wrap a closure as a read source.
pub fn source_fn<F>(f: F) -> ReadCallback
where
    F: FnMut(&mut [u8], CallbackContext) -> Result<usize, SinkError> + 'static,
{
    Rc::new(RefCell::new(FnSource(f)))
}

/// Wrap a closure as a progress sink.
pub fn progress_fn<F>(f: F) -> ProgressCallback
where
    F: FnMut(TransferProgress, CallbackContext) -> Result<(), SinkError> + 'static,
{
    Rc::new(RefCell::new(FnProgress(f)))
}

/// Wrap a `WriteSink` implementation.
pub fn write_callback<S: WriteSink + 'static>(sink: S) -> WriteCallback {
    Rc::new(RefCell::new(sink))
}

/// Wrap a `ReadSource` implementation.
pub fn read_callback<S: ReadSource + 'static>(source: S) -> ReadCallback {
    Rc::new(RefCell::new(source))
}

/// Wrap a `ProgressSink` implementation.
pub fn progress_callback<S: ProgressSink + 'static>(sink: S) -> ProgressCallback {
    Rc::new(RefCell::new(sink))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Stream {
    Header,
    Body,
}

/// Outcome of handing bytes to a write sink.
#[derive(Debug)]
pub(crate) enum Delivery {
    Done,
    Paused,
    Aborted(TransferError),
}

/// Outcome of pulling bytes from the upload side.
#[derive(Debug)]
pub(crate) enum Upload {
    Data(Vec<u8>),
    Paused,
    Eof,
    Aborted(TransferError),
}

/// Bytes accepted by each sink so far.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct ByteCounters {
    pub header: u64,
    pub body: u64,
    pub uploaded: u64,
}

struct Pending {
    stream: Stream,
    data: Vec<u8>,
    offset: usize,
}

enum UploadSource {
    Callback(ReadCallback, CallbackContext),
    Fixed { data: Vec<u8>, offset: usize },
}

enum Offer {
    Accepted(usize),
    Pause,
    Abort(TransferError),
}

pub(crate) struct CallbackBridge {
    id: HandleId,
    header: Option<(WriteCallback, CallbackContext)>,
    body: Option<(WriteCallback, CallbackContext)>,
    upload: Option<UploadSource>,
    progress: Option<(ProgressCallback, CallbackContext)>,
    download_total: Option<u64>,
    upload_total: Option<u64>,
    pending: Option<Pending>,
    chunk_size: usize,
    poisoned: bool,
    verbose: bool,
    pub(crate) counters: ByteCounters,
}

impl CallbackBridge {
    pub(crate) fn from_options(id: HandleId, options: &OptionRegistry, chunk_size: usize) -> Self {
        let header = options
            .write_callback(OptionKey::HeaderSink)
            .map(|cb| (cb, options.context(OptionKey::HeaderContext)));
        let body = options
            .write_callback(OptionKey::BodySink)
            .map(|cb| (cb, options.context(OptionKey::BodyContext)));

        let upload = if let Some(fields) = options.get_str(OptionKey::PostFields) {
            Some(UploadSource::Fixed {
                data: fields.as_bytes().to_vec(),
                offset: 0,
            })
        } else if options.get_bool(OptionKey::Upload) == Some(true) {
            options
                .read_callback(OptionKey::ReadSource)
                .map(|cb| UploadSource::Callback(cb, options.context(OptionKey::ReadContext)))
        } else {
            None
        };
        let upload_total = match options.get_str(OptionKey::PostFields) {
            Some(fields) => Some(fields.len() as u64),
            None => options.get_int(OptionKey::UploadSize).map(|n| n as u64),
        };
        let progress = options
            .progress_callback(OptionKey::ProgressSink)
            .map(|cb| (cb, options.context(OptionKey::ProgressContext)));

        Self {
            id,
            header,
            body,
            upload,
            progress,
            download_total: None,
            upload_total,
            pending: None,
            chunk_size: chunk_size.max(1),
            poisoned: false,
            verbose: options.get_bool(OptionKey::Verbose).unwrap_or(false),
            counters: ByteCounters::default(),
        }
    }

    pub(crate) fn has_upload(&self) -> bool {
        self.upload.is_some()
    }

    /// True while a sink holds back part of an earlier delivery.
    pub(crate) fn is_paused(&self) -> bool {
        self.pending.is_some()
    }

    /// Hand a transport chunk to the sink for `stream`.
    ///
    /// Must not be called while paused; call `flush` until it returns
    /// `Delivery::Done` first.
    pub(crate) fn deliver(&mut self, stream: Stream, data: Vec<u8>) -> Delivery {
        if self.poisoned {
            return Delivery::Aborted(TransferError::Callback("transfer already aborted".into()));
        }
        debug_assert!(self.pending.is_none(), "deliver while paused");
        if stream == Stream::Header {
            let line = String::from_utf8_lossy(&data);
            if self.verbose {
                debug!(handle = %self.id, header = %line.trim_end(), "received header");
            } else {
                trace!(handle = %self.id, header = %line.trim_end(), "received header");
            }
            if line.starts_with("HTTP/") {
                // A new response, e.g. after a redirect.
                self.download_total = None;
            } else if let Some(total) = content_length(&line) {
                self.download_total = Some(total);
            }
        }
        self.pending = Some(Pending {
            stream,
            data,
            offset: 0,
        });
        self.flush()
    }

    /// Retry whatever a sink held back.
    pub(crate) fn flush(&mut self) -> Delivery {
        let Some(mut pending) = self.pending.take() else {
            return Delivery::Done;
        };
        while pending.offset < pending.data.len() {
            let end = (pending.offset + self.chunk_size).min(pending.data.len());
            let offered = end - pending.offset;
            match self.offer(pending.stream, &pending.data[pending.offset..end]) {
                Offer::Accepted(n) => {
                    pending.offset += n;
                    match pending.stream {
                        Stream::Header => self.counters.header += n as u64,
                        Stream::Body => {
                            self.counters.body += n as u64;
                            if let Err(err) = self.report_progress() {
                                self.poisoned = true;
                                return Delivery::Aborted(err);
                            }
                        }
                    }
                    if n < offered {
                        self.log_pause(pending.stream, offered - n);
                        self.pending = Some(pending);
                        return Delivery::Paused;
                    }
                }
                Offer::Pause => {
                    self.log_pause(pending.stream, offered);
                    self.pending = Some(pending);
                    return Delivery::Paused;
                }
                Offer::Abort(err) => {
                    self.poisoned = true;
                    return Delivery::Aborted(err);
                }
            }
        }
        Delivery::Done
    }

    fn offer(&mut self, stream: Stream, chunk: &[u8]) -> Offer {
        let slot = match stream {
            Stream::Header => self.header.as_ref(),
            Stream::Body => self.body.as_ref(),
        };
        let Some((sink, ctx)) = slot.map(|(cb, ctx)| (Rc::clone(cb), *ctx)) else {
            return Offer::Accepted(chunk.len());
        };
        let result = match sink.try_borrow_mut() {
            Ok(mut sink) => guarded(|| sink.write(chunk, ctx)),
            Err(_) => {
                return Offer::Abort(TransferError::Callback(format!(
                    "reentrant call into the {stream:?} sink"
                )))
            }
        };
        let result = match result {
            Ok(result) => result,
            Err(msg) => {
                warn!(handle = %self.id, ?stream, panic = %msg, "sink panicked");
                return Offer::Abort(TransferError::Callback(format!("{stream:?} sink panicked: {msg}")));
            }
        };
        match result {
            Ok(0) if !chunk.is_empty() => Offer::Abort(TransferError::Callback(format!(
                "{stream:?} sink accepted 0 of {} bytes",
                chunk.len()
            ))),
            Ok(n) if n > chunk.len() => Offer::Abort(TransferError::Callback(format!(
                "{stream:?} sink claimed {n} of {} bytes",
                chunk.len()
            ))),
            Ok(n) => Offer::Accepted(n),
            Err(SinkError::Pause) => Offer::Pause,
            Err(SinkError::Abort(msg)) => Offer::Abort(TransferError::Callback(msg)),
        }
    }

    /// Pull the next request-body chunk.
    pub(crate) fn pull_upload(&mut self) -> Upload {
        if self.poisoned {
            return Upload::Aborted(TransferError::Callback("transfer already aborted".into()));
        }
        let chunk_size = self.chunk_size;
        let (source, ctx) = match self.upload.as_mut() {
            None => return Upload::Eof,
            Some(UploadSource::Fixed { data, offset }) => {
                if *offset >= data.len() {
                    return Upload::Eof;
                }
                let end = (*offset + chunk_size).min(data.len());
                let chunk = data[*offset..end].to_vec();
                *offset = end;
                return Upload::Data(chunk);
            }
            Some(UploadSource::Callback(cb, ctx)) => (Rc::clone(cb), *ctx),
        };

        let mut buf = vec![0u8; chunk_size];
        let result = match source.try_borrow_mut() {
            Ok(mut source) => guarded(|| source.read(&mut buf, ctx)).unwrap_or_else(|msg| {
                warn!(handle = %self.id, panic = %msg, "read source panicked");
                Err(SinkError::Abort(format!("read source panicked: {msg}")))
            }),
            Err(_) => Err(SinkError::Abort("reentrant call into the read source".into())),
        };
        match result {
            Ok(0) => Upload::Eof,
            Ok(n) if n > buf.len() => {
                self.poisoned = true;
                Upload::Aborted(TransferError::Callback(format!(
                    "read source claimed {n} of {} bytes",
                    buf.len()
                )))
            }
            Ok(n) => {
                buf.truncate(n);
                Upload::Data(buf)
            }
            Err(SinkError::Pause) => Upload::Paused,
            Err(SinkError::Abort(msg)) => {
                self.poisoned = true;
                Upload::Aborted(TransferError::Callback(msg))
            }
        }
    }

    /// Count upload bytes the transport took and report progress.
    pub(crate) fn record_upload(&mut self, len: u64) -> Result<(), TransferError> {
        self.counters.uploaded += len;
        let reported = self.report_progress();
        if reported.is_err() {
            self.poisoned = true;
        }
        reported
    }

    fn report_progress(&self) -> Result<(), TransferError> {
        let Some((sink, ctx)) = &self.progress else {
            return Ok(());
        };
        let progress = TransferProgress {
            downloaded: self.counters.body,
            download_total: self.download_total,
            uploaded: self.counters.uploaded,
            upload_total: self.upload_total,
        };
        let result = match sink.try_borrow_mut() {
            Ok(mut sink) => guarded(|| sink.progress(progress, *ctx)),
            Err(_) => return Err(TransferError::Callback("reentrant call into the progress sink".into())),
        };
        match result {
            Ok(Ok(())) | Ok(Err(SinkError::Pause)) => Ok(()),
            Ok(Err(SinkError::Abort(msg))) => Err(TransferError::Callback(msg)),
            Err(msg) => {
                warn!(handle = %self.id, panic = %msg, "progress sink panicked");
                Err(TransferError::Callback(format!("progress sink panicked: {msg}")))
            }
        }
    }

    /// Stop all further sink calls.
    pub(crate) fn close(&mut self) {
        self.poisoned = true;
        self.pending = None;
    }

    fn log_pause(&self, stream: Stream, held: usize) {
        if self.verbose {
            debug!(handle = %self.id, ?stream, held, "sink paused");
        } else {
            trace!(handle = %self.id, ?stream, held, "sink paused");
        }
    }
}

/// Run a sink call, turning a panic into its message.
fn guarded<T>(call: impl FnOnce() -> T) -> Result<T, String> {
    panic::catch_unwind(AssertUnwindSafe(call)).map_err(panic_message)
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn content_length(line: &str) -> Option<u64> {
    let (name, value) = line.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::c_void;

    fn bridge_with(options: &OptionRegistry, chunk: usize) -> CallbackBridge {
        CallbackBridge::from_options(HandleId::new(), options, chunk)
    }

    fn collector() -> (WriteCallback, Rc<RefCell<Vec<u8>>>) {
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink_out = Rc::clone(&out);
        let sink = sink_fn(move |data, _| {
            sink_out.borrow_mut().extend_from_slice(data);
            Ok(data.len())
        });
        (sink, out)
    }

    #[test]
    fn delivers_in_chunks_of_buffer_size() {
        let calls = Rc::new(RefCell::new(Vec::new()));
        let seen = Rc::clone(&calls);
        let mut options = OptionRegistry::new();
        options
            .set(
                OptionKey::BodySink,
                sink_fn(move |data, _| {
                    seen.borrow_mut().push(data.len());
                    Ok(data.len())
                }),
            )
            .unwrap();
        let mut bridge = bridge_with(&options, 4);
        assert!(matches!(bridge.deliver(Stream::Body, b"0123456789".to_vec()), Delivery::Done));
        assert_eq!(*calls.borrow(), vec![4, 4, 2]);
        assert_eq!(bridge.counters.body, 10);
    }

    #[test]
    fn short_accept_pauses_and_resumes_without_loss() {
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink_out = Rc::clone(&out);
        let mut options = OptionRegistry::new();
        options
            .set(
                OptionKey::BodySink,
                sink_fn(move |data, _| {
                    let n = data.len().min(3);
                    sink_out.borrow_mut().extend_from_slice(&data[..n]);
                    Ok(n)
                }),
            )
            .unwrap();
        let mut bridge = bridge_with(&options, 64);

        let mut delivery = bridge.deliver(Stream::Body, b"hello world".to_vec());
        let mut rounds = 0;
        while matches!(delivery, Delivery::Paused) {
            assert!(bridge.is_paused());
            delivery = bridge.flush();
            rounds += 1;
        }
        assert!(matches!(delivery, Delivery::Done));
        assert_eq!(rounds, 3);
        assert_eq!(out.borrow().as_slice(), b"hello world");
        assert_eq!(bridge.counters.body, 11);
    }

    #[test]
    fn pause_signal_keeps_bytes_for_later() {
        let ready = Rc::new(RefCell::new(false));
        let gate = Rc::clone(&ready);
        let mut options = OptionRegistry::new();
        options
            .set(
                OptionKey::HeaderSink,
                sink_fn(move |data, _| if *gate.borrow() { Ok(data.len()) } else { Err(SinkError::Pause) }),
            )
            .unwrap();
        let mut bridge = bridge_with(&options, 64);

        assert!(matches!(bridge.deliver(Stream::Header, b"HTTP/1.1 200 OK\r\n".to_vec()), Delivery::Paused));
        assert_eq!(bridge.counters.header, 0);
        *ready.borrow_mut() = true;
        assert!(matches!(bridge.flush(), Delivery::Done));
        assert_eq!(bridge.counters.header, 17);
    }

    #[test]
    fn abort_poisons_the_bridge() {
        let calls = Rc::new(RefCell::new(0));
        let counter = Rc::clone(&calls);
        let mut options = OptionRegistry::new();
        options
            .set(
                OptionKey::BodySink,
                sink_fn(move |_, _| {
                    *counter.borrow_mut() += 1;
                    Err(SinkError::Abort("disk full".into()))
                }),
            )
            .unwrap();
        let mut bridge = bridge_with(&options, 64);

        match bridge.deliver(Stream::Body, b"abc".to_vec()) {
            Delivery::Aborted(TransferError::Callback(msg)) => assert_eq!(msg, "disk full"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(bridge.deliver(Stream::Body, b"def".to_vec()), Delivery::Aborted(_)));
        assert_eq!(*calls.borrow(), 1);
    }

    #[test]
    fn zero_accept_aborts() {
        let mut options = OptionRegistry::new();
        options.set(OptionKey::BodySink, sink_fn(|_, _| Ok(0))).unwrap();
        let mut bridge = bridge_with(&options, 64);
        assert!(matches!(
            bridge.deliver(Stream::Body, b"abc".to_vec()),
            Delivery::Aborted(TransferError::Callback(_))
        ));
    }

    #[test]
    fn overclaiming_sink_aborts() {
        let mut options = OptionRegistry::new();
        options.set(OptionKey::BodySink, sink_fn(|data, _| Ok(data.len() + 1))).unwrap();
        let mut bridge = bridge_with(&options, 64);
        assert!(matches!(bridge.deliver(Stream::Body, b"abc".to_vec()), Delivery::Aborted(_)));
    }

    #[test]
    fn reentrant_call_is_refused() {
        let (sink, _out) = collector();
        let mut options = OptionRegistry::new();
        options.set(OptionKey::BodySink, Rc::clone(&sink)).unwrap();
        let mut bridge = bridge_with(&options, 64);

        // Simulate a call already on the stack.
        let _held = sink.borrow_mut();
        match bridge.deliver(Stream::Body, b"abc".to_vec()) {
            Delivery::Aborted(TransferError::Callback(msg)) => assert!(msg.contains("reentrant")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn missing_sinks_discard_but_count() {
        let options = OptionRegistry::new();
        let mut bridge = bridge_with(&options, 64);
        assert!(matches!(bridge.deliver(Stream::Body, vec![0; 100]), Delivery::Done));
        assert_eq!(bridge.counters.body, 100);
    }

    #[test]
    fn context_pointer_is_passed_through() {
        let mut marker = 0u32;
        let ptr = &mut marker as *mut u32 as *mut c_void;
        let seen = Rc::new(RefCell::new(None));
        let seen_in = Rc::clone(&seen);
        let mut options = OptionRegistry::new();
        options
            .set(
                OptionKey::HeaderSink,
                sink_fn(move |data, ctx| {
                    *seen_in.borrow_mut() = Some(ctx);
                    Ok(data.len())
                }),
            )
            .unwrap();
        options.set(OptionKey::HeaderContext, CallbackContext::from_ptr(ptr)).unwrap();
        let mut bridge = bridge_with(&options, 64);
        bridge.deliver(Stream::Header, b"\r\n".to_vec());
        assert_eq!(seen.borrow().map(|c| c.as_ptr()), Some(ptr));
    }

    #[test]
    fn upload_pulls_from_source_until_eof() {
        let mut remaining = b"payload".to_vec();
        let mut options = OptionRegistry::new();
        options.set(OptionKey::Upload, true).unwrap();
        options
            .set(
                OptionKey::ReadSource,
                source_fn(move |buf, _| {
                    let n = remaining.len().min(buf.len());
                    buf[..n].copy_from_slice(&remaining[..n]);
                    remaining.drain(..n);
                    Ok(n)
                }),
            )
            .unwrap();
        let mut bridge = bridge_with(&options, 4);
        assert!(bridge.has_upload());

        let mut sent = Vec::new();
        loop {
            match bridge.pull_upload() {
                Upload::Data(chunk) => sent.extend(chunk),
                Upload::Eof => break,
                other => panic!("unexpected {other:?}"),
            }
        }
        assert_eq!(sent, b"payload");
    }

    #[test]
    fn post_fields_upload_without_source() {
        let mut options = OptionRegistry::new();
        options.set(OptionKey::PostFields, "a=1&b=2").unwrap();
        let mut bridge = bridge_with(&options, 64);
        assert!(matches!(bridge.pull_upload(), Upload::Data(ref d) if d == b"a=1&b=2"));
        assert!(matches!(bridge.pull_upload(), Upload::Eof));
    }

    #[test]
    fn panicking_sink_becomes_a_callback_error() {
        let mut options = OptionRegistry::new();
        options
            .set(OptionKey::BodySink, sink_fn(|_, _| panic!("sink exploded")))
            .unwrap();
        let mut bridge = bridge_with(&options, 64);

        match bridge.deliver(Stream::Body, b"abc".to_vec()) {
            Delivery::Aborted(TransferError::Callback(msg)) => assert!(msg.contains("sink exploded"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(bridge.counters.body, 0);
        assert!(matches!(bridge.deliver(Stream::Body, b"def".to_vec()), Delivery::Aborted(_)));
    }

    #[test]
    fn panicking_read_source_aborts_the_upload() {
        let mut options = OptionRegistry::new();
        options.set(OptionKey::Upload, true).unwrap();
        options
            .set(OptionKey::ReadSource, source_fn(|_, _| panic!("source exploded")))
            .unwrap();
        let mut bridge = bridge_with(&options, 64);

        match bridge.pull_upload() {
            Upload::Aborted(TransferError::Callback(msg)) => assert!(msg.contains("source exploded"), "{msg}"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(bridge.pull_upload(), Upload::Aborted(_)));
    }

    #[test]
    fn progress_follows_accepted_body_bytes() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in = Rc::clone(&seen);
        let mut options = OptionRegistry::new();
        options
            .set(
                OptionKey::ProgressSink,
                progress_fn(move |progress, _| {
                    seen_in.borrow_mut().push(progress);
                    Ok(())
                }),
            )
            .unwrap();
        let mut bridge = bridge_with(&options, 4);

        bridge.deliver(Stream::Header, b"HTTP/1.1 200 OK\r\n".to_vec());
        bridge.deliver(Stream::Header, b"Content-Length: 10\r\n".to_vec());
        assert!(seen.borrow().is_empty());
        assert!(matches!(bridge.deliver(Stream::Body, b"0123456789".to_vec()), Delivery::Done));

        let downloaded: Vec<u64> = seen.borrow().iter().map(|p| p.downloaded).collect();
        assert_eq!(downloaded, vec![4, 8, 10]);
        let last = *seen.borrow().last().unwrap();
        assert_eq!(last.download_total, Some(10));
        assert_eq!(last.fraction(), Some(1.0));
        assert_eq!(last.upload_total, None);
    }

    #[test]
    fn progress_counts_uploads_against_their_total() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let seen_in = Rc::clone(&seen);
        let mut options = OptionRegistry::new();
        options.set(OptionKey::PostFields, "a=1&b=2").unwrap();
        options
            .set(
                OptionKey::ProgressSink,
                progress_fn(move |progress, _| {
                    seen_in.borrow_mut().push((progress.uploaded, progress.upload_total));
                    Ok(())
                }),
            )
            .unwrap();
        let mut bridge = bridge_with(&options, 4);

        bridge.record_upload(4).unwrap();
        bridge.record_upload(3).unwrap();
        assert_eq!(*seen.borrow(), vec![(4, Some(7)), (7, Some(7))]);
        assert_eq!(bridge.counters.uploaded, 7);
    }

    #[test]
    fn progress_abort_stops_delivery() {
        let (sink, out) = collector();
        let mut options = OptionRegistry::new();
        options.set(OptionKey::BodySink, sink).unwrap();
        options
            .set(
                OptionKey::ProgressSink,
                progress_fn(|progress, _| {
                    if progress.downloaded >= 4 {
                        Err(SinkError::Abort("enough".into()))
                    } else {
                        Ok(())
                    }
                }),
            )
            .unwrap();
        let mut bridge = bridge_with(&options, 4);

        match bridge.deliver(Stream::Body, b"0123456789".to_vec()) {
            Delivery::Aborted(TransferError::Callback(msg)) => assert_eq!(msg, "enough"),
            other => panic!("unexpected {other:?}"),
        }
        assert_eq!(out.borrow().as_slice(), b"0123");
        assert!(matches!(bridge.deliver(Stream::Body, b"x".to_vec()), Delivery::Aborted(_)));
    }
}
