//! Scripted in-process transport.
//!
//! A `Script` lists what a transfer to one URL produces: a status, header
//! lines, body chunks, idle polls, a stall, a failure. Tests use it to pin
//! down completion order and sink behavior without a socket; embedders can
//! use it for canned responses.

use std::cell::RefCell;
use std::collections::{HashMap, VecDeque};
use std::rc::Rc;

use super::{Connector, Readiness, Transport, TransportEvent};
use crate::error::{TransferError, TransportCode};
use crate::http::TransferRequest;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Step {
    Status(u16),
    Header(Vec<u8>),
    Body(Vec<u8>),
    /// Produce nothing for this many polls, waking the executor each time.
    Idle(u32),
    /// Produce nothing, ever, without waking anyone.
    Stall,
    /// Hold until the executor finished sending the request body.
    AwaitUpload,
    Fail(TransferError),
    Done,
}

/// What a scripted transfer produces, in order.
#[derive(Debug, Clone, Default)]
pub struct Script {
    steps: Vec<Step>,
    headers_open: bool,
    upload_capacity: Option<usize>,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// `200` with a `content-length` header and `body`.
    pub fn ok(body: impl Into<Vec<u8>>) -> Self {
        let body = body.into();
        Self::new()
            .status(200)
            .header("content-length", &body.len().to_string())
            .body(body)
            .done()
    }

    /// Final response status, followed by its status line.
    pub fn status(mut self, code: u16) -> Self {
        self.steps.push(Step::Status(code));
        self.steps
            .push(Step::Header(format!("HTTP/1.1 {code}\r\n").into_bytes()));
        self.headers_open = true;
        self
    }

    pub fn header(mut self, name: &str, value: &str) -> Self {
        self.steps
            .push(Step::Header(format!("{name}: {value}\r\n").into_bytes()));
        self
    }

    /// A body chunk. The header block is closed first if still open.
    pub fn body(mut self, chunk: impl Into<Vec<u8>>) -> Self {
        self.close_headers();
        self.steps.push(Step::Body(chunk.into()));
        self
    }

    pub fn idle(mut self, polls: u32) -> Self {
        self.steps.push(Step::Idle(polls));
        self
    }

    pub fn stall(mut self) -> Self {
        self.steps.push(Step::Stall);
        self
    }

    pub fn await_upload(mut self) -> Self {
        self.steps.push(Step::AwaitUpload);
        self
    }

    pub fn fail(mut self, err: TransferError) -> Self {
        self.steps.push(Step::Fail(err));
        self
    }

    pub fn done(mut self) -> Self {
        self.close_headers();
        self.steps.push(Step::Done);
        self
    }

    /// Accept at most `chunks` upload chunks between two polls.
    pub fn upload_capacity(mut self, chunks: usize) -> Self {
        self.upload_capacity = Some(chunks);
        self
    }

    fn close_headers(&mut self) {
        if self.headers_open {
            self.steps.push(Step::Header(b"\r\n".to_vec()));
            self.headers_open = false;
        }
    }
}

/// Connector serving `Script`s keyed by URL.
///
/// Clones share routes, recorded requests and uploaded bytes.
#[derive(Debug, Clone, Default)]
pub struct MemoryConnector {
    routes: Rc<RefCell<HashMap<String, Script>>>,
    uploads: Rc<RefCell<HashMap<String, Vec<u8>>>>,
    requests: Rc<RefCell<Vec<TransferRequest>>>,
}

impl MemoryConnector {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route(self, url: &str, script: Script) -> Self {
        self.routes.borrow_mut().insert(url.to_string(), script);
        self
    }

    /// Request body bytes received for `url` so far.
    pub fn uploaded(&self, url: &str) -> Vec<u8> {
        self.uploads.borrow().get(url).cloned().unwrap_or_default()
    }

    /// Every request opened, in order.
    pub fn requests(&self) -> Vec<TransferRequest> {
        self.requests.borrow().clone()
    }
}

impl Connector for MemoryConnector {
    fn open(
        &self,
        request: &TransferRequest,
        ready: Readiness,
    ) -> Result<Box<dyn Transport>, TransferError> {
        self.requests.borrow_mut().push(request.clone());
        let script = self
            .routes
            .borrow()
            .get(&request.url)
            .cloned()
            .ok_or_else(|| {
                TransferError::transport(TransportCode::Resolve, format!("no route for {}", request.url))
            })?;
        self.uploads.borrow_mut().insert(request.url.clone(), Vec::new());
        Ok(Box::new(MemoryTransport {
            url: request.url.clone(),
            steps: script.steps.into(),
            upload_capacity: script.upload_capacity,
            accepted_since_poll: 0,
            upload_finished: false,
            uploads: Rc::clone(&self.uploads),
            ready,
            finished: false,
        }))
    }
}

struct MemoryTransport {
    url: String,
    steps: VecDeque<Step>,
    upload_capacity: Option<usize>,
    accepted_since_poll: usize,
    upload_finished: bool,
    uploads: Rc<RefCell<HashMap<String, Vec<u8>>>>,
    ready: Readiness,
    finished: bool,
}

impl Transport for MemoryTransport {
    fn poll_event(&mut self) -> Option<TransportEvent> {
        self.accepted_since_poll = 0;
        if self.finished {
            return None;
        }
        loop {
            let Some(step) = self.steps.front_mut() else {
                self.finished = true;
                return Some(TransportEvent::Failed(TransferError::transport(
                    TransportCode::Disconnected,
                    "script ended without a result",
                )));
            };
            match step {
                Step::Idle(0) => {
                    self.steps.pop_front();
                }
                Step::Idle(n) => {
                    *n -= 1;
                    self.ready.notify();
                    return None;
                }
                Step::Stall => return None,
                Step::AwaitUpload if self.upload_finished => {
                    self.steps.pop_front();
                }
                Step::AwaitUpload => return None,
                _ => break,
            }
        }
        let event = match self.steps.pop_front()? {
            Step::Status(code) => TransportEvent::Status(code),
            Step::Header(line) => TransportEvent::Header(line),
            Step::Body(chunk) => TransportEvent::Data(chunk),
            Step::Fail(err) => {
                self.finished = true;
                TransportEvent::Failed(err)
            }
            Step::Done => {
                self.finished = true;
                TransportEvent::Done
            }
            Step::Idle(_) | Step::Stall | Step::AwaitUpload => return None,
        };
        Some(event)
    }

    fn send_upload(&mut self, chunk: Vec<u8>) -> Result<(), Vec<u8>> {
        if let Some(capacity) = self.upload_capacity {
            if self.accepted_since_poll >= capacity {
                return Err(chunk);
            }
        }
        self.accepted_since_poll += 1;
        self.uploads
            .borrow_mut()
            .entry(self.url.clone())
            .or_default()
            .extend_from_slice(&chunk);
        Ok(())
    }

    fn finish_upload(&mut self) {
        self.upload_finished = true;
    }

    fn abort(&mut self) {
        self.finished = true;
        self.steps.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::{OptionKey, OptionRegistry};
    use crate::types::HandleId;
    use std::sync::mpsc;

    fn open(connector: &MemoryConnector, url: &str) -> (Box<dyn Transport>, mpsc::Receiver<HandleId>) {
        let mut options = OptionRegistry::new();
        options.set(OptionKey::Url, url).unwrap();
        let request = TransferRequest::from_options(&options, None).unwrap();
        let (tx, rx) = mpsc::channel();
        let transport = connector.open(&request, Readiness::new(HandleId::new(), tx)).unwrap();
        (transport, rx)
    }

    fn drain(transport: &mut dyn Transport) -> Vec<TransportEvent> {
        let mut events = Vec::new();
        for _ in 0..64 {
            if let Some(event) = transport.poll_event() {
                events.push(event);
            }
        }
        events
    }

    #[test]
    fn ok_script_closes_the_header_block() {
        let connector = MemoryConnector::new().route("mem://a", Script::ok("hi"));
        let (mut transport, _rx) = open(&connector, "mem://a");
        let events = drain(transport.as_mut());
        assert_eq!(
            events,
            vec![
                TransportEvent::Status(200),
                TransportEvent::Header(b"HTTP/1.1 200\r\n".to_vec()),
                TransportEvent::Header(b"content-length: 2\r\n".to_vec()),
                TransportEvent::Header(b"\r\n".to_vec()),
                TransportEvent::Data(b"hi".to_vec()),
                TransportEvent::Done,
            ]
        );
    }

    #[test]
    fn idle_polls_wake_the_executor() {
        let connector = MemoryConnector::new().route("mem://a", Script::new().idle(2).status(204).done());
        let (mut transport, rx) = open(&connector, "mem://a");
        assert_eq!(transport.poll_event(), None);
        assert_eq!(transport.poll_event(), None);
        assert_eq!(rx.try_iter().count(), 2);
        assert_eq!(transport.poll_event(), Some(TransportEvent::Status(204)));
    }

    #[test]
    fn unknown_url_fails_to_open() {
        let connector = MemoryConnector::new();
        let mut options = OptionRegistry::new();
        options.set(OptionKey::Url, "mem://missing").unwrap();
        let request = TransferRequest::from_options(&options, None).unwrap();
        let (tx, _rx) = mpsc::channel();
        let err = connector
            .open(&request, Readiness::new(HandleId::new(), tx))
            .err()
            .unwrap();
        assert!(matches!(err, TransferError::Transport { code: TransportCode::Resolve, .. }));
        assert_eq!(connector.requests().len(), 1);
    }

    #[test]
    fn upload_capacity_refuses_until_polled() {
        let connector = MemoryConnector::new().route(
            "mem://up",
            Script::new().await_upload().status(201).done().upload_capacity(1),
        );
        let (mut transport, _rx) = open(&connector, "mem://up");
        assert!(transport.send_upload(b"ab".to_vec()).is_ok());
        assert_eq!(transport.send_upload(b"cd".to_vec()), Err(b"cd".to_vec()));
        assert_eq!(transport.poll_event(), None);
        assert!(transport.send_upload(b"cd".to_vec()).is_ok());
        transport.finish_upload();
        assert_eq!(transport.poll_event(), Some(TransportEvent::Status(201)));
        assert_eq!(connector.uploaded("mem://up"), b"abcd");
    }

    #[test]
    fn script_without_done_reports_disconnect_once() {
        let connector = MemoryConnector::new().route("mem://cut", Script::new().status(200).body("x"));
        let (mut transport, _rx) = open(&connector, "mem://cut");
        let events = drain(transport.as_mut());
        let failures = events
            .iter()
            .filter(|e| matches!(e, TransportEvent::Failed(_)))
            .count();
        assert_eq!(failures, 1);
    }
}
