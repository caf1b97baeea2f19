//! Drives transfers to completion.
//!
//! # Design
//! Everything runs on the caller's thread. Each running transfer is stepped
//! in turn: check its cancel flag and deadline, retry data a paused sink held
//! back, push upload chunks, then handle a bounded number of transport
//! events. When a full sweep makes no progress the executor sleeps on the
//! readiness channel, bounded by the idle wait and the nearest deadline.
//!
//! `run` drives one handle and blocks. `run_many` returns `Transfers`, an
//! iterator that yields each result as soon as its transfer finishes, so the
//! order of results is the order of completion, not of submission.

use std::fmt;
use std::iter::FusedIterator;
use std::rc::Rc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use crate::bridge::{ByteCounters, CallbackBridge, Delivery, Stream, Upload};
use crate::config::ExecutorConfig;
use crate::error::{TransferError, TransportCode};
use crate::global::{self, ActiveTransfer};
use crate::handle::TransferHandle;
use crate::http::TransferRequest;
use crate::transport::{Connector, HttpConnector, Readiness, Transport, TransportEvent};
use crate::types::{CancelToken, HandleId, TransferResult, TransferStatus};

/// Runs transfers over a connector.
pub struct Executor {
    config: ExecutorConfig,
    connector: Rc<dyn Connector>,
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor").field("config", &self.config).finish_non_exhaustive()
    }
}

impl Executor {
    /// An executor that performs real HTTP transfers.
    pub fn new(config: ExecutorConfig) -> Result<Self, TransferError> {
        Self::with_connector(config, Rc::new(HttpConnector))
    }

    pub fn with_connector(config: ExecutorConfig, connector: Rc<dyn Connector>) -> Result<Self, TransferError> {
        if !global::is_initialized() {
            return Err(TransferError::InvalidState(
                "library is not initialized; call global::init first".into(),
            ));
        }
        Ok(Self { config, connector })
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Perform one transfer, blocking until it ends.
    ///
    /// `Err` means the handle could not start and is unchanged. Every outcome
    /// of a started transfer, failures included, is an `Ok` result that is
    /// also stored on the handle.
    pub fn run(&self, handle: &mut TransferHandle) -> Result<TransferResult, TransferError> {
        let request = handle.prepare(self.config.default_timeout())?;
        let (tx, rx) = mpsc::channel();
        handle.begin();
        let mut active = Active::start(handle, &request, self.connector.as_ref(), tx);
        let result = loop {
            match active.step(self.config.events_per_step()) {
                Progress::Finished(result) => break result,
                Progress::Busy => {}
                Progress::Idle => wait(&rx, self.config.idle_wait(), active.deadline),
            }
        };
        handle.finish(result.clone());
        Ok(result)
    }

    /// Start a multiplexed run over `handles`.
    ///
    /// Every handle is validated first; if any cannot start, none does and
    /// the error is returned. Transfers begin lazily as the returned iterator
    /// is advanced.
    pub fn run_many(&self, handles: Vec<TransferHandle>) -> Result<Transfers, TransferError> {
        let mut requests = Vec::with_capacity(handles.len());
        for handle in &handles {
            let request = handle.prepare(self.config.default_timeout()).map_err(|err| {
                debug!(handle = %handle.id(), error = %err, "rejected multiplexed run");
                err
            })?;
            requests.push(request);
        }

        let slots = handles
            .into_iter()
            .zip(requests)
            .map(|(mut handle, request)| {
                handle.begin();
                Slot {
                    handle,
                    state: SlotState::Queued(request),
                }
            })
            .collect();
        let (tx, rx) = mpsc::channel();
        Ok(Transfers {
            config: self.config.clone(),
            connector: Rc::clone(&self.connector),
            slots,
            cursor: 0,
            tx,
            rx,
        })
    }
}

/// Results of a multiplexed run, in completion order.
pub struct Transfers {
    config: ExecutorConfig,
    connector: Rc<dyn Connector>,
    slots: Vec<Slot>,
    cursor: usize,
    tx: Sender<HandleId>,
    rx: Receiver<HandleId>,
}

struct Slot {
    handle: TransferHandle,
    state: SlotState,
}

enum SlotState {
    Queued(TransferRequest),
    Running(Box<Active>),
    Finished,
}

impl Transfers {
    /// Read-only view of a handle in this run.
    pub fn handle(&self, id: HandleId) -> Option<&TransferHandle> {
        self.slots.iter().map(|s| &s.handle).find(|h| h.id() == id)
    }

    /// Transfers that have not produced a result yet.
    pub fn remaining(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| !matches!(s.state, SlotState::Finished))
            .count()
    }

    /// Stop the run and give the handles back in submission order.
    ///
    /// Transfers that have not finished are cancelled and carry a
    /// `Cancelled` result.
    pub fn into_handles(mut self) -> Vec<TransferHandle> {
        self.shutdown();
        std::mem::take(&mut self.slots)
            .into_iter()
            .map(|slot| slot.handle)
            .collect()
    }

    fn running(&self) -> usize {
        self.slots
            .iter()
            .filter(|s| matches!(s.state, SlotState::Running(_)))
            .count()
    }

    fn start_queued(&mut self) {
        let cap = match self.config.max_concurrent {
            0 => usize::MAX,
            n => n,
        };
        let mut running = self.running();
        for slot in &mut self.slots {
            if running >= cap {
                break;
            }
            if !matches!(slot.state, SlotState::Queued(_)) {
                continue;
            }
            if let SlotState::Queued(request) = std::mem::replace(&mut slot.state, SlotState::Finished) {
                let active = Active::start(&slot.handle, &request, self.connector.as_ref(), self.tx.clone());
                slot.state = SlotState::Running(Box::new(active));
                running += 1;
            }
        }
    }

    fn wait(&self) {
        let deadline = self
            .slots
            .iter()
            .filter_map(|s| match &s.state {
                SlotState::Running(active) => active.deadline,
                _ => None,
            })
            .min();
        wait(&self.rx, self.config.idle_wait(), deadline);
    }

    fn shutdown(&mut self) {
        for slot in &mut self.slots {
            let result = match std::mem::replace(&mut slot.state, SlotState::Finished) {
                SlotState::Running(mut active) => active.finish(TransferStatus::Cancelled, None),
                SlotState::Queued(_) => TransferResult {
                    status: TransferStatus::Cancelled,
                    response_code: None,
                    body_bytes: 0,
                    header_bytes: 0,
                    upload_bytes: 0,
                    elapsed: Duration::ZERO,
                    error: None,
                },
                SlotState::Finished => continue,
            };
            slot.handle.finish(result);
        }
    }
}

impl Iterator for Transfers {
    type Item = (HandleId, TransferResult);

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.start_queued();
            if self.running() == 0 {
                return None;
            }

            let mut progressed = false;
            let count = self.slots.len();
            for offset in 0..count {
                let index = (self.cursor + offset) % count;
                let slot = &mut self.slots[index];
                let SlotState::Running(active) = &mut slot.state else {
                    continue;
                };
                match active.step(self.config.events_per_step()) {
                    Progress::Busy => progressed = true,
                    Progress::Idle => {}
                    Progress::Finished(result) => {
                        slot.state = SlotState::Finished;
                        slot.handle.finish(result.clone());
                        // Resume the sweep after this slot so no transfer starves.
                        self.cursor = (index + 1) % count;
                        return Some((slot.handle.id(), result));
                    }
                }
            }
            if !progressed {
                self.wait();
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        (0, Some(self.remaining()))
    }
}

impl FusedIterator for Transfers {}

impl Drop for Transfers {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Transfers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transfers")
            .field("transfers", &self.slots.len())
            .field("remaining", &self.remaining())
            .finish_non_exhaustive()
    }
}

fn wait(rx: &Receiver<HandleId>, idle: Duration, deadline: Option<Instant>) {
    let timeout = match deadline {
        Some(deadline) => idle.min(deadline.saturating_duration_since(Instant::now())),
        None => idle,
    };
    if rx.recv_timeout(timeout).is_ok() {
        while rx.try_recv().is_ok() {}
    }
}

enum Progress {
    Busy,
    Idle,
    Finished(TransferResult),
}

/// How a transfer ended, before its result is built.
type Ended = (TransferStatus, Option<TransferError>);

/// One running transfer.
struct Active {
    id: HandleId,
    cancel: CancelToken,
    bridge: CallbackBridge,
    transport: Option<Box<dyn Transport>>,
    startup_error: Option<TransferError>,
    started: Instant,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    fail_on_error: bool,
    response_code: Option<u16>,
    uploading: bool,
    held_chunk: Option<Vec<u8>>,
    _counted: ActiveTransfer,
}

impl Active {
    fn start(
        handle: &TransferHandle,
        request: &TransferRequest,
        connector: &dyn Connector,
        tx: Sender<HandleId>,
    ) -> Self {
        let id = handle.id();
        let started = Instant::now();
        debug!(handle = %id, method = %request.method, url = %request.url, "starting transfer");

        let bridge = CallbackBridge::from_options(id, handle.options(), request.buffer_size);
        let (mut transport, startup_error) = match connector.open(request, Readiness::new(id, tx)) {
            Ok(transport) => (Some(transport), None),
            Err(err) => (None, Some(err)),
        };
        let uploading = bridge.has_upload();
        if !uploading {
            if let Some(transport) = transport.as_mut() {
                transport.finish_upload();
            }
        }

        Self {
            id,
            cancel: handle.cancel_token(),
            bridge,
            transport,
            startup_error,
            started,
            timeout: request.timeout,
            deadline: request.timeout.map(|t| started + t),
            fail_on_error: request.fail_on_error,
            response_code: None,
            uploading,
            held_chunk: None,
            _counted: ActiveTransfer::start(),
        }
    }

    fn step(&mut self, budget: usize) -> Progress {
        if let Some(err) = self.startup_error.take() {
            return Progress::Finished(self.finish(TransferStatus::Failed, Some(err)));
        }
        if self.cancel.is_cancelled() {
            return Progress::Finished(self.finish(TransferStatus::Cancelled, None));
        }
        if let Some(deadline) = self.deadline {
            if Instant::now() >= deadline {
                let err = TransferError::Timeout(self.timeout.unwrap_or_default());
                return Progress::Finished(self.finish(TransferStatus::Cancelled, Some(err)));
            }
        }
        let Some(mut transport) = self.transport.take() else {
            let err = TransferError::transport(TransportCode::Disconnected, "transport already closed");
            return Progress::Finished(self.finish(TransferStatus::Failed, Some(err)));
        };
        let outcome = self.advance(transport.as_mut(), budget);
        self.transport = Some(transport);
        match outcome {
            Ok(progress) => progress,
            Err((status, err)) => Progress::Finished(self.finish(status, err)),
        }
    }

    /// One scheduling step against a live transport. `Err` ends the transfer,
    /// successfully or not.
    fn advance(
        &mut self,
        transport: &mut dyn Transport,
        budget: usize,
    ) -> Result<Progress, Ended> {
        let before = self.bridge.counters;
        let mut progressed = false;

        if self.bridge.is_paused() {
            match self.bridge.flush() {
                Delivery::Done => {}
                Delivery::Paused => return Ok(self.idle_unless_moved(before, false)),
                Delivery::Aborted(err) => return Err(self.callback_failure(err)),
            }
        }

        if self.uploading {
            progressed |= self.pump_upload(transport, budget)?;
        }

        for _ in 0..budget {
            let Some(event) = transport.poll_event() else {
                break;
            };
            progressed = true;
            let delivery = match event {
                TransportEvent::Status(code) => {
                    self.response_code = Some(code);
                    if self.fail_on_error && code >= 400 {
                        let err = TransferError::transport(
                            TransportCode::HttpStatus(code),
                            format!("server responded with {code}"),
                        );
                        return Err((TransferStatus::Failed, Some(err)));
                    }
                    continue;
                }
                TransportEvent::Header(line) => self.bridge.deliver(Stream::Header, line),
                TransportEvent::Data(chunk) => self.bridge.deliver(Stream::Body, chunk),
                TransportEvent::Done => return Err((TransferStatus::Completed, None)),
                TransportEvent::Failed(err @ TransferError::Timeout(_)) => {
                    return Err((TransferStatus::Cancelled, Some(err)));
                }
                TransportEvent::Failed(err) => return Err((TransferStatus::Failed, Some(err))),
            };
            match delivery {
                Delivery::Done => {}
                // Leave further events queued in the transport until the sink catches up.
                Delivery::Paused => break,
                Delivery::Aborted(err) => return Err(self.callback_failure(err)),
            }
        }

        Ok(self.idle_unless_moved(before, progressed))
    }

    /// Push request-body chunks until the transport or the source pushes back.
    fn pump_upload(
        &mut self,
        transport: &mut dyn Transport,
        budget: usize,
    ) -> Result<bool, Ended> {
        let mut progressed = false;
        for _ in 0..budget {
            let chunk = match self.held_chunk.take() {
                Some(chunk) => chunk,
                None => match self.bridge.pull_upload() {
                    Upload::Data(chunk) => chunk,
                    Upload::Paused => break,
                    Upload::Eof => {
                        transport.finish_upload();
                        self.uploading = false;
                        debug!(handle = %self.id, bytes = self.bridge.counters.uploaded, "upload complete");
                        return Ok(true);
                    }
                    Upload::Aborted(err) => return Err(self.callback_failure(err)),
                },
            };
            let len = chunk.len() as u64;
            match transport.send_upload(chunk) {
                Ok(()) => {
                    progressed = true;
                    if let Err(err) = self.bridge.record_upload(len) {
                        return Err(self.callback_failure(err));
                    }
                }
                Err(chunk) => {
                    self.held_chunk = Some(chunk);
                    break;
                }
            }
        }
        Ok(progressed)
    }

    fn idle_unless_moved(&self, before: ByteCounters, progressed: bool) -> Progress {
        let moved = self.bridge.counters.header != before.header
            || self.bridge.counters.body != before.body
            || self.bridge.counters.uploaded != before.uploaded;
        if progressed || moved {
            Progress::Busy
        } else {
            Progress::Idle
        }
    }

    fn callback_failure(&self, err: TransferError) -> Ended {
        warn!(handle = %self.id, error = %err, "sink aborted transfer");
        (TransferStatus::Failed, Some(err))
    }

    /// Close the transfer and build its result.
    fn finish(&mut self, status: TransferStatus, error: Option<TransferError>) -> TransferResult {
        if let Some(mut transport) = self.transport.take() {
            if status != TransferStatus::Completed {
                transport.abort();
            }
        }
        self.bridge.close();

        let counters = self.bridge.counters;
        let result = TransferResult {
            status,
            response_code: self.response_code,
            body_bytes: counters.body,
            header_bytes: counters.header,
            upload_bytes: counters.uploaded,
            elapsed: self.started.elapsed(),
            error,
        };
        debug!(
            handle = %self.id,
            status = ?result.status,
            response_code = ?result.response_code,
            body_bytes = result.body_bytes,
            elapsed_ms = result.elapsed.as_millis() as u64,
            error = ?result.error,
            "transfer finished"
        );
        result
    }
}
