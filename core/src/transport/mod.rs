//! The seam between the executor and whatever moves bytes on the wire.
//!
//! # Design
//! A `Connector` turns a `TransferRequest` into a running `Transport`. The
//! executor polls each transport without blocking, so one thread can drive
//! many transfers. A transport that has work in flight elsewhere (an I/O
//! thread, a socket) calls `Readiness::notify` when something changes; the
//! executor sleeps on those notifications when no transfer can progress.
//!
//! Implementations:
//! - [`http::HttpConnector`] runs requests through `ureq`.
//! - [`memory::MemoryConnector`] plays back scripted responses.

pub mod http;
pub mod memory;

use std::sync::mpsc::Sender;

use crate::error::TransferError;
use crate::http::TransferRequest;
use crate::types::HandleId;

pub use self::http::HttpConnector;
pub use self::memory::{MemoryConnector, Script};

/// Something the transport produced for the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportEvent {
    /// Status code of the final response; precedes its header lines.
    Status(u16),
    /// One header line including its CRLF; an empty line ends the block.
    Header(Vec<u8>),
    /// A chunk of response body.
    Data(Vec<u8>),
    /// End of stream with no error.
    Done,
    Failed(TransferError),
}

/// One in-flight exchange.
pub trait Transport {
    /// Next event if one is ready. Never blocks.
    fn poll_event(&mut self) -> Option<TransportEvent>;

    /// Queue a request-body chunk, or hand it back if there is no room yet.
    fn send_upload(&mut self, chunk: Vec<u8>) -> Result<(), Vec<u8>>;

    /// No more request body follows.
    fn finish_upload(&mut self);

    /// Stop the exchange. No events are produced afterwards.
    fn abort(&mut self);
}

/// Opens transports for requests.
pub trait Connector {
    fn open(
        &self,
        request: &TransferRequest,
        ready: Readiness,
    ) -> Result<Box<dyn Transport>, TransferError>;
}

/// Wakes the executor when a transport has something new.
#[derive(Debug, Clone)]
pub struct Readiness {
    id: HandleId,
    tx: Sender<HandleId>,
}

impl Readiness {
    pub(crate) fn new(id: HandleId, tx: Sender<HandleId>) -> Self {
        Self { id, tx }
    }

    pub fn handle(&self) -> HandleId {
        self.id
    }

    pub fn notify(&self) {
        // The executor may already be gone; nothing to wake then.
        let _ = self.tx.send(self.id);
    }
}
