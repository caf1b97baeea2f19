//! Option translation: the request a transport is asked to perform.
//!
//! # Design
//! `TransferRequest` is plain data derived from a handle's option registry.
//! Transports only ever see this struct, never the registry, so each
//! transport maps the same validated values onto its own native
//! configuration calls. Owned fields keep it free of lifetimes so it can
//! move onto a transport's I/O thread.

use std::time::Duration;

use crate::error::TransferError;
use crate::options::{OptionKey, OptionRegistry};

/// Chunk size used when `BUFFER_SIZE` is not set.
pub const DEFAULT_BUFFER_SIZE: usize = 16 * 1024;

/// Redirect limit used when `FOLLOW_LOCATION` is on and `MAX_REDIRECTS` is not set.
pub const DEFAULT_MAX_REDIRECTS: u32 = 10;

const FORM_CONTENT_TYPE: &str = "application/x-www-form-urlencoded";

/// Shape of the request body.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RequestBody {
    Empty,
    /// Body bytes are streamed by the executor through `Transport::send_upload`.
    Streamed { length: Option<u64> },
}

/// A transfer described as plain data.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferRequest {
    pub url: String,
    pub method: String,
    pub headers: Vec<(String, String)>,
    pub body: RequestBody,
    pub timeout: Option<Duration>,
    pub connect_timeout: Option<Duration>,
    /// Zero when redirects must not be followed.
    pub max_redirects: u32,
    pub buffer_size: usize,
    pub fail_on_error: bool,
}

impl TransferRequest {
    /// Build a request from a handle's options.
    ///
    /// Fails with `InvalidState` when a required option is missing: `URL`
    /// always, and a body source when `UPLOAD` is on.
    pub fn from_options(
        options: &OptionRegistry,
        default_timeout: Option<Duration>,
    ) -> Result<Self, TransferError> {
        let url = options
            .get_str(OptionKey::Url)
            .ok_or_else(|| TransferError::InvalidState("URL is not set".into()))?
            .trim()
            .to_string();

        let post_fields = options.get_str(OptionKey::PostFields);
        let upload = options.get_bool(OptionKey::Upload).unwrap_or(false);
        if upload && post_fields.is_none() && options.read_callback(OptionKey::ReadSource).is_none() {
            return Err(TransferError::InvalidState(
                "UPLOAD is set but neither READ_SOURCE nor POST_FIELDS is".into(),
            ));
        }

        let method = match options.get_str(OptionKey::Method) {
            Some(method) => method.to_ascii_uppercase(),
            None if post_fields.is_some() => "POST".to_string(),
            None if upload => "PUT".to_string(),
            None => "GET".to_string(),
        };

        let mut headers = parse_header_lines(options.get_str(OptionKey::Headers).unwrap_or(""));
        if let Some(agent) = options.get_str(OptionKey::UserAgent) {
            set_default_header(&mut headers, "user-agent", agent);
        }

        let body = if let Some(fields) = post_fields {
            set_default_header(&mut headers, "content-type", FORM_CONTENT_TYPE);
            set_default_header(&mut headers, "content-length", &fields.len().to_string());
            RequestBody::Streamed {
                length: Some(fields.len() as u64),
            }
        } else if upload {
            let length = options.get_int(OptionKey::UploadSize).map(|n| n as u64);
            if let Some(length) = length {
                set_default_header(&mut headers, "content-length", &length.to_string());
            }
            RequestBody::Streamed { length }
        } else {
            RequestBody::Empty
        };

        let timeout = match options.get_int(OptionKey::TimeoutMs) {
            Some(ms) => millis(ms),
            None => default_timeout,
        };
        let connect_timeout = options.get_int(OptionKey::ConnectTimeoutMs).and_then(millis);

        let max_redirects = if options.get_bool(OptionKey::FollowLocation).unwrap_or(false) {
            options
                .get_int(OptionKey::MaxRedirects)
                .map(|n| n as u32)
                .unwrap_or(DEFAULT_MAX_REDIRECTS)
        } else {
            0
        };

        let buffer_size = options
            .get_int(OptionKey::BufferSize)
            .map(|n| n as usize)
            .unwrap_or(DEFAULT_BUFFER_SIZE);

        Ok(TransferRequest {
            url,
            method,
            headers,
            body,
            timeout,
            connect_timeout,
            max_redirects,
            buffer_size,
            fail_on_error: options.get_bool(OptionKey::FailOnError).unwrap_or(false),
        })
    }

    /// Case-insensitive header lookup.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// `0` disables a timeout.
fn millis(ms: i64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms as u64))
}

fn parse_header_lines(lines: &str) -> Vec<(String, String)> {
    lines
        .lines()
        .filter_map(|line| line.split_once(':'))
        .map(|(name, value)| (name.trim().to_ascii_lowercase(), value.trim().to_string()))
        .collect()
}

fn set_default_header(headers: &mut Vec<(String, String)>, name: &str, value: &str) {
    if !headers.iter().any(|(k, _)| k.eq_ignore_ascii_case(name)) {
        headers.push((name.to_string(), value.to_string()));
    }
}
