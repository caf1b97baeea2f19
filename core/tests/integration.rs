//! Transfers over real HTTP against the live mock server.
//!
//! # Design
//! Each test starts the mock server on a random port, then drives handles
//! through an `Executor` backed by the `ureq` connector. Sinks collect what
//! arrives so the bytes can be compared with what the server sent.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::time::{Duration, Instant};

use transfer_core::global::{self, GlobalGuard};
use transfer_core::{
    sink_fn, source_fn, Executor, ExecutorConfig, OptionKey, TransferError, TransferHandle, TransferStatus,
    TransportCode, WriteCallback,
};

/// Start the mock server on a random port and return its address.
fn start_server() -> SocketAddr {
    let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = std_listener.local_addr().unwrap();
    std_listener.set_nonblocking(true).unwrap();

    std::thread::spawn(move || {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        rt.block_on(async {
            let listener = tokio::net::TcpListener::from_std(std_listener).unwrap();
            mock_server::run(listener).await
        })
        .unwrap();
    });
    addr
}

fn executor() -> (Executor, GlobalGuard) {
    let guard = global::init();
    (Executor::new(ExecutorConfig::default()).unwrap(), guard)
}

fn handle(addr: SocketAddr, path: &str) -> TransferHandle {
    let mut handle = TransferHandle::new();
    handle.set(OptionKey::Url, format!("http://{addr}{path}")).unwrap();
    handle
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
fn download_streams_body_and_headers() {
    let addr = start_server();
    let (executor, _guard) = executor();

    let mut h = handle(addr, "/bytes/100000");
    let (body_sink, body) = collector();
    let (header_sink, headers) = collector();
    h.set(OptionKey::BodySink, body_sink).unwrap();
    h.set(OptionKey::HeaderSink, header_sink).unwrap();
    h.set(OptionKey::BufferSize, 4096i64).unwrap();

    let result = executor.run(&mut h).unwrap();
    assert_eq!(result.status, TransferStatus::Completed, "{:?}", result.error);
    assert_eq!(result.response_code, Some(200));
    assert_eq!(result.body_bytes, 100_000);
    assert_eq!(body.borrow().as_slice(), mock_server::pattern(100_000).as_slice());

    let headers = String::from_utf8(headers.borrow().clone()).unwrap();
    assert!(headers.starts_with("HTTP/1.1 200 OK\r\n"), "{headers}");
    assert!(headers.contains("content-length: 100000\r\n"), "{headers}");
    assert!(headers.ends_with("\r\n\r\n"));
    assert_eq!(result.header_bytes, headers.len() as u64);
}

#[test]
fn post_fields_are_sent_as_a_form() {
    let addr = start_server();
    let (executor, _guard) = executor();

    let mut h = handle(addr, "/echo");
    let (sink, body) = collector();
    h.set(OptionKey::PostFields, "name=transfer&lang=rust").unwrap();
    h.set(OptionKey::BodySink, sink).unwrap();

    let result = executor.run(&mut h).unwrap();
    assert_eq!(result.status, TransferStatus::Completed, "{:?}", result.error);
    assert_eq!(result.upload_bytes, 23);
    assert_eq!(body.borrow().as_slice(), b"name=transfer&lang=rust");

    let mut log = handle(addr, "/uploads");
    let (sink, uploads) = collector();
    log.set(OptionKey::BodySink, sink).unwrap();
    executor.run(&mut log).unwrap();
    let uploads: Vec<mock_server::Upload> = serde_json::from_slice(&uploads.borrow()).unwrap();
    assert_eq!(uploads.len(), 1);
    assert_eq!(uploads[0].method, "POST");
    assert_eq!(uploads[0].content_type.as_deref(), Some("application/x-www-form-urlencoded"));
}

#[test]
fn upload_streams_from_read_source() {
    let addr = start_server();
    let (executor, _guard) = executor();

    let payload = mock_server::pattern(50_000);
    let mut remaining = payload.clone();
    let mut h = handle(addr, "/echo");
    let (sink, echoed) = collector();
    h.set(OptionKey::Upload, true).unwrap();
    h.set(OptionKey::UploadSize, payload.len() as i64).unwrap();
    h.set(
        OptionKey::ReadSource,
        source_fn(move |buf, _| {
            let n = remaining.len().min(buf.len());
            buf[..n].copy_from_slice(&remaining[..n]);
            remaining.drain(..n);
            Ok(n)
        }),
    )
    .unwrap();
    h.set(OptionKey::BodySink, sink).unwrap();

    let result = executor.run(&mut h).unwrap();
    assert_eq!(result.status, TransferStatus::Completed, "{:?}", result.error);
    assert_eq!(result.upload_bytes, 50_000);
    assert_eq!(echoed.borrow().as_slice(), payload.as_slice());
}

#[test]
fn error_status_is_data_unless_fail_on_error() {
    let addr = start_server();
    let (executor, _guard) = executor();

    let mut h = handle(addr, "/status/503");
    let (sink, body) = collector();
    h.set(OptionKey::BodySink, sink).unwrap();
    let result = executor.run(&mut h).unwrap();
    assert_eq!(result.status, TransferStatus::Completed);
    assert_eq!(result.response_code, Some(503));
    assert_eq!(body.borrow().as_slice(), b"status 503");

    h.reset().unwrap();
    h.set(OptionKey::FailOnError, true).unwrap();
    let result = executor.run(&mut h).unwrap();
    assert_eq!(result.status, TransferStatus::Failed);
    assert_eq!(result.response_code, Some(503));
    assert!(matches!(
        result.error,
        Some(TransferError::Transport { code: TransportCode::HttpStatus(503), .. })
    ));
}

#[test]
fn redirects_follow_only_when_asked() {
    let addr = start_server();
    let (executor, _guard) = executor();

    let mut h = handle(addr, "/redirect/2");
    let result = executor.run(&mut h).unwrap();
    assert_eq!(result.status, TransferStatus::Completed);
    assert_eq!(result.response_code, Some(302));

    h.reset().unwrap();
    h.set(OptionKey::FollowLocation, true).unwrap();
    let result = executor.run(&mut h).unwrap();
    assert_eq!(result.response_code, Some(200));
    assert_eq!(result.body_bytes, 8);

    h.reset().unwrap();
    h.set(OptionKey::MaxRedirects, 1i64).unwrap();
    let result = executor.run(&mut h).unwrap();
    assert_eq!(result.status, TransferStatus::Failed);
    assert!(matches!(
        result.error,
        Some(TransferError::Transport { code: TransportCode::TooManyRedirects, .. })
    ));
}

#[test]
fn timeout_cancels_a_slow_transfer() {
    let addr = start_server();
    let (executor, _guard) = executor();

    let mut h = handle(addr, "/slow/2000");
    h.set(OptionKey::TimeoutMs, 100i64).unwrap();
    let started = Instant::now();
    let result = executor.run(&mut h).unwrap();

    assert_eq!(result.status, TransferStatus::Cancelled);
    assert_eq!(result.error, Some(TransferError::Timeout(Duration::from_millis(100))));
    assert!(started.elapsed() < Duration::from_millis(1500));
}

#[test]
fn cancel_token_stops_a_transfer_from_another_thread() {
    let addr = start_server();
    let (executor, _guard) = executor();

    let mut h = handle(addr, "/slow/2000");
    let token = h.cancel_token();
    std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(50));
        token.cancel();
    });

    let result = executor.run(&mut h).unwrap();
    assert_eq!(result.status, TransferStatus::Cancelled);
    assert_eq!(result.error, None);
    assert!(result.elapsed < Duration::from_millis(1500));
}

#[test]
fn unreachable_host_is_a_failed_result() {
    let (executor, _guard) = executor();

    // Bind and drop to get a port nothing listens on.
    let addr = std::net::TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap();
    let mut h = handle(addr, "/");
    let result = executor.run(&mut h).unwrap();
    assert_eq!(result.status, TransferStatus::Failed);
    assert!(matches!(result.error, Some(TransferError::Transport { .. })));
    assert_eq!(result.response_code, None);
}

#[test]
fn multiplexed_http_results_arrive_in_completion_order() {
    let addr = start_server();
    let (executor, _guard) = executor();

    let a = handle(addr, "/slow/400");
    let b = handle(addr, "/slow/10");
    let c = handle(addr, "/slow/200");
    let (a_id, b_id, c_id) = (a.id(), b.id(), c.id());

    let order: Vec<_> = executor
        .run_many(vec![a, b, c])
        .unwrap()
        .map(|(id, result)| {
            assert_eq!(result.status, TransferStatus::Completed, "{:?}", result.error);
            id
        })
        .collect();
    assert_eq!(order, vec![b_id, c_id, a_id]);
}
