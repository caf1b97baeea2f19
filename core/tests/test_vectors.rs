//! Check option handling against JSON test vectors stored in `test-vectors/`.
//!
//! Each case applies an option document to a fresh registry, then translates
//! the registry into a `TransferRequest`. A case expects either `"ok"` with
//! the resulting request, or the name of the error kind either step fails
//! with.

use std::time::Duration;

use transfer_core::{OptionRegistry, TransferError, TransferRequest};

fn error_kind(err: &TransferError) -> &'static str {
    match err {
        TransferError::UnknownOption(_) => "UnknownOption",
        TransferError::TypeMismatch { .. } => "TypeMismatch",
        TransferError::InvalidValue { .. } => "InvalidValue",
        TransferError::InvalidState(_) => "InvalidState",
        TransferError::Transport { .. } => "Transport",
        TransferError::Callback(_) => "Callback",
        TransferError::Timeout(_) => "Timeout",
    }
}

fn build(options: &serde_json::Value) -> Result<TransferRequest, TransferError> {
    let mut registry = OptionRegistry::new();
    registry.apply_json(options.as_object().unwrap())?;
    TransferRequest::from_options(&registry, None)
}

#[test]
fn option_test_vectors() {
    let raw = include_str!("../../test-vectors/options.json");
    let vectors: serde_json::Value = serde_json::from_str(raw).unwrap();

    for case in vectors["cases"].as_array().unwrap() {
        let name = case["name"].as_str().unwrap();
        let expected = case["expected"].as_str().unwrap();

        let req = match build(&case["options"]) {
            Ok(req) => {
                assert_eq!(expected, "ok", "{name}: expected {expected}, got a request");
                req
            }
            Err(err) => {
                assert_eq!(error_kind(&err), expected, "{name}: {err}");
                assert!(err.is_config_error(), "{name}: {err} should be a config error");
                continue;
            }
        };

        let expected_req = &case["expected_request"];
        assert_eq!(req.method, expected_req["method"].as_str().unwrap(), "{name}: method");

        let expected_headers: Vec<(String, String)> = expected_req["headers"]
            .as_array()
            .unwrap()
            .iter()
            .map(|h| {
                let arr = h.as_array().unwrap();
                (arr[0].as_str().unwrap().to_string(), arr[1].as_str().unwrap().to_string())
            })
            .collect();
        assert_eq!(req.headers, expected_headers, "{name}: headers");

        let timeout = expected_req["timeout_ms"].as_u64().map(Duration::from_millis);
        assert_eq!(req.timeout, timeout, "{name}: timeout");
        assert_eq!(
            u64::from(req.max_redirects),
            expected_req["max_redirects"].as_u64().unwrap(),
            "{name}: max_redirects"
        );
        assert_eq!(
            req.buffer_size as u64,
            expected_req["buffer_size"].as_u64().unwrap(),
            "{name}: buffer_size"
        );
    }
}

#[test]
fn vectors_cover_every_config_error_kind() {
    let raw = include_str!("../../test-vectors/options.json");
    let vectors: serde_json::Value = serde_json::from_str(raw).unwrap();
    let kinds: Vec<&str> = vectors["cases"]
        .as_array()
        .unwrap()
        .iter()
        .map(|case| case["expected"].as_str().unwrap())
        .collect();
    for kind in ["ok", "UnknownOption", "TypeMismatch", "InvalidValue", "InvalidState"] {
        assert!(kinds.contains(&kind), "no vector expects {kind}");
    }
}
