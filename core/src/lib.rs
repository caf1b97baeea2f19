//! HTTP transfer engine with typed options and streaming sinks.
//!
//! # Overview
//! A `TransferHandle` holds the options for one transfer in a typed
//! `OptionRegistry`: every option key accepts exactly one kind of value, so a
//! string can never be passed where a callback is expected. An `Executor`
//! runs handles, one at a time with `run` or many at once with `run_many`,
//! and streams response headers and body to caller sinks as they arrive.
//!
//! # Design
//! - Options are translated into a plain `TransferRequest` before anything
//!   touches the network; transports only see that struct.
//! - Sinks return how many bytes they took. Taking fewer pauses the transfer
//!   until the sink catches up; nothing is lost or delivered twice.
//! - The executor is single threaded. Sinks run on the caller's thread and
//!   are shared as `Rc<RefCell<..>>`, so one sink can serve many handles.
//! - Transports plug in through the `Connector` trait: `HttpConnector` uses
//!   `ureq`, `MemoryConnector` plays back scripts.
//! - Library state is initialized explicitly with `global::init`.

pub mod bridge;
pub mod config;
pub mod error;
pub mod executor;
pub mod global;
pub mod handle;
pub mod http;
pub mod options;
pub mod transport;
pub mod types;

pub use bridge::{
    progress_callback, progress_fn, read_callback, sink_fn, source_fn, write_callback, ProgressCallback,
    ProgressSink, ReadCallback, ReadSource, WriteCallback, WriteSink,
};
pub use config::ExecutorConfig;
pub use error::{SinkError, TransferError, TransportCode};
pub use executor::{Executor, Transfers};
pub use handle::TransferHandle;
pub use http::TransferRequest;
pub use options::{CallbackContext, OptionKey, OptionRegistry, OptionValue, ValueKind};
pub use transport::{Connector, HttpConnector, MemoryConnector, Script};
pub use types::{CancelToken, HandleId, TransferProgress, TransferResult, TransferState, TransferStatus};
