//! HTTP transport backed by `ureq`.
//!
//! # Design
//! `ureq` is a blocking client, so each transfer runs its request on a
//! dedicated I/O thread. Events come back through a bounded channel: while a
//! sink is paused the executor stops draining it, the channel fills, and the
//! I/O thread blocks on its next send, which stops reads from the socket.
//! Upload chunks travel the other way through a second bounded channel that
//! the request body reader drains.

use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::thread;

use tracing::{debug, trace};
use ureq::{http, Agent, SendBody};

use super::{Connector, Readiness, Transport, TransportEvent};
use crate::error::{TransferError, TransportCode};
use crate::http::{RequestBody, TransferRequest};

const EVENT_QUEUE_DEPTH: usize = 8;
const UPLOAD_QUEUE_DEPTH: usize = 4;

/// Opens transfers over HTTP(S) with `ureq`.
///
/// Aborting a transfer stops event delivery at once, but an I/O thread
/// blocked inside `ureq` (connecting, or waiting for response headers) only
/// exits once that call returns. Without `TIMEOUT_MS` or
/// `CONNECT_TIMEOUT_MS` that is whenever the server answers or the
/// connection drops.
#[derive(Debug, Clone, Copy, Default)]
pub struct HttpConnector;

impl Connector for HttpConnector {
    fn open(
        &self,
        request: &TransferRequest,
        ready: Readiness,
    ) -> Result<Box<dyn Transport>, TransferError> {
        let (event_tx, event_rx) = mpsc::sync_channel(EVENT_QUEUE_DEPTH);
        let (upload_tx, upload_rx) = match request.body {
            RequestBody::Streamed { .. } => {
                let (tx, rx) = mpsc::sync_channel(UPLOAD_QUEUE_DEPTH);
                (Some(tx), Some(rx))
            }
            RequestBody::Empty => (None, None),
        };
        let abort = Arc::new(AtomicBool::new(false));

        let worker = Worker {
            request: request.clone(),
            events: EventSender {
                tx: event_tx,
                ready: ready.clone(),
            },
            uploads: upload_rx,
            ready,
            abort: Arc::clone(&abort),
        };
        thread::Builder::new()
            .name("transfer-io".to_string())
            .spawn(move || worker.run())
            .map_err(|e| TransferError::transport(TransportCode::Other, format!("spawning I/O thread: {e}")))?;

        Ok(Box::new(HttpTransport {
            events: event_rx,
            uploads: upload_tx,
            abort,
            finished: false,
        }))
    }
}

struct HttpTransport {
    events: Receiver<TransportEvent>,
    uploads: Option<SyncSender<Vec<u8>>>,
    abort: Arc<AtomicBool>,
    finished: bool,
}

impl Transport for HttpTransport {
    fn poll_event(&mut self) -> Option<TransportEvent> {
        if self.finished {
            return None;
        }
        match self.events.try_recv() {
            Ok(event) => {
                if matches!(event, TransportEvent::Done | TransportEvent::Failed(_)) {
                    self.finished = true;
                }
                Some(event)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.finished = true;
                Some(TransportEvent::Failed(TransferError::transport(
                    TransportCode::Disconnected,
                    "I/O thread exited without a result",
                )))
            }
        }
    }

    fn send_upload(&mut self, chunk: Vec<u8>) -> Result<(), Vec<u8>> {
        let Some(tx) = &self.uploads else {
            return Ok(());
        };
        match tx.try_send(chunk) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(chunk)) => Err(chunk),
            // The request already ended; its outcome arrives as an event.
            Err(TrySendError::Disconnected(_)) => Ok(()),
        }
    }

    fn finish_upload(&mut self) {
        self.uploads = None;
    }

    fn abort(&mut self) {
        self.abort.store(true, Ordering::Release);
        self.uploads = None;
        self.finished = true;
    }
}

impl Drop for HttpTransport {
    fn drop(&mut self) {
        self.abort.store(true, Ordering::Release);
    }
}

struct EventSender {
    tx: SyncSender<TransportEvent>,
    ready: Readiness,
}

impl EventSender {
    /// Blocks while the queue is full. False once the executor hung up.
    fn emit(&self, event: TransportEvent) -> bool {
        if self.tx.send(event).is_err() {
            return false;
        }
        self.ready.notify();
        true
    }
}

struct Worker {
    request: TransferRequest,
    events: EventSender,
    uploads: Option<Receiver<Vec<u8>>>,
    ready: Readiness,
    abort: Arc<AtomicBool>,
}

impl Worker {
    fn run(self) {
        let Worker {
            request,
            events,
            uploads,
            ready,
            abort,
        } = self;
        let handle = ready.handle();
        debug!(%handle, method = %request.method, url = %request.url, "performing request");
        if let Err(err) = perform(&request, &events, uploads, ready, &abort) {
            if !abort.load(Ordering::Acquire) {
                debug!(%handle, error = %err, "request failed");
                events.emit(TransportEvent::Failed(err));
            }
        }
    }
}

fn perform(
    request: &TransferRequest,
    events: &EventSender,
    uploads: Option<Receiver<Vec<u8>>>,
    ready: Readiness,
    abort: &AtomicBool,
) -> Result<(), TransferError> {
    let agent: Agent = Agent::config_builder()
        .http_status_as_error(false)
        .timeout_global(request.timeout)
        .timeout_connect(request.connect_timeout)
        .max_redirects(request.max_redirects)
        .build()
        .new_agent();

    let mut builder = http::Request::builder()
        .method(request.method.as_str())
        .uri(request.url.as_str());
    for (name, value) in &request.headers {
        builder = builder.header(name.as_str(), value.as_str());
    }

    let mut empty = io::empty();
    let mut reader = uploads.map(|rx| UploadReader {
        rx,
        chunk: Vec::new(),
        pos: 0,
        ready,
        abort,
    });
    let body = match reader.as_mut() {
        Some(reader) => SendBody::from_reader(reader),
        None => SendBody::from_reader(&mut empty),
    };
    let http_request = builder
        .body(body)
        .map_err(|e| TransferError::transport(TransportCode::BadUrl, e.to_string()))?;

    let response = agent
        .run(http_request)
        .map_err(|e| map_ureq_error(e, request))?;

    let (parts, body) = response.into_parts();
    let code = parts.status.as_u16();
    if !events.emit(TransportEvent::Status(code)) {
        return Ok(());
    }
    let status_line = format!(
        "{:?} {} {}\r\n",
        parts.version,
        code,
        parts.status.canonical_reason().unwrap_or("")
    );
    if !events.emit(TransportEvent::Header(status_line.into_bytes())) {
        return Ok(());
    }
    for (name, value) in parts.headers.iter() {
        let line = format!("{}: {}\r\n", name.as_str(), String::from_utf8_lossy(value.as_bytes()));
        if !events.emit(TransportEvent::Header(line.into_bytes())) {
            return Ok(());
        }
    }
    if !events.emit(TransportEvent::Header(b"\r\n".to_vec())) {
        return Ok(());
    }

    let mut body = body.into_reader();
    let mut buf = vec![0u8; request.buffer_size.max(1)];
    loop {
        if abort.load(Ordering::Acquire) {
            return Ok(());
        }
        let n = match body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(map_io_error(e, request)),
        };
        trace!(bytes = n, "read body chunk");
        if !events.emit(TransportEvent::Data(buf[..n].to_vec())) {
            return Ok(());
        }
    }
    events.emit(TransportEvent::Done);
    Ok(())
}

/// Request body fed by the executor through the upload channel.
struct UploadReader<'a> {
    rx: Receiver<Vec<u8>>,
    chunk: Vec<u8>,
    pos: usize,
    ready: Readiness,
    abort: &'a AtomicBool,
}

impl Read for UploadReader<'_> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        while self.pos >= self.chunk.len() {
            match self.rx.recv() {
                Ok(chunk) => {
                    self.chunk = chunk;
                    self.pos = 0;
                    // Room in the queue again.
                    self.ready.notify();
                }
                Err(_) if self.abort.load(Ordering::Acquire) => {
                    return Err(io::Error::other("transfer aborted"));
                }
                Err(_) => return Ok(0),
            }
        }
        let n = buf.len().min(self.chunk.len() - self.pos);
        buf[..n].copy_from_slice(&self.chunk[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }
}

fn map_ureq_error(err: ureq::Error, request: &TransferRequest) -> TransferError {
    let code = match &err {
        ureq::Error::Timeout(_) => {
            return TransferError::Timeout(request.timeout.unwrap_or_default());
        }
        ureq::Error::HostNotFound => TransportCode::Resolve,
        ureq::Error::ConnectionFailed => TransportCode::Connect,
        ureq::Error::TooManyRedirects => TransportCode::TooManyRedirects,
        ureq::Error::BadUri(_) => TransportCode::BadUrl,
        ureq::Error::Io(e) if e.kind() == io::ErrorKind::TimedOut => {
            return TransferError::Timeout(request.timeout.unwrap_or_default());
        }
        ureq::Error::Io(_) => TransportCode::Io,
        _ => TransportCode::Other,
    };
    TransferError::transport(code, err.to_string())
}

fn map_io_error(err: io::Error, request: &TransferRequest) -> TransferError {
    if err.kind() == io::ErrorKind::TimedOut {
        return TransferError::Timeout(request.timeout.unwrap_or_default());
    }
    // ureq reports its own failures while reading a body wrapped in io::Error.
    if let Some(inner) = err.get_ref().and_then(|e| e.downcast_ref::<ureq::Error>()) {
        if matches!(inner, ureq::Error::Timeout(_)) {
            return TransferError::Timeout(request.timeout.unwrap_or_default());
        }
    }
    TransferError::transport(TransportCode::Io, err.to_string())
}
