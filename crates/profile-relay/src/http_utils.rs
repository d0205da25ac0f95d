// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use core::time::Duration;
use http_body_util::Full;
use hyper::{
    header::{HeaderMap, HeaderName, HeaderValue},
    http, Response, StatusCode,
};
use std::collections::HashMap;
use tracing::{debug, error};

pub type HttpResponse = Response<Full<Bytes>>;

/// Does two things:
/// 1. Logs the given message. A success status code (within 200-299) will cause a debug log to
///    be written, otherwise error will be written.
/// 2. Returns an empty response with the given status code. Callers relaying profiles only look
///    at the status.
pub fn log_and_create_http_response(
    message: &str,
    status: StatusCode,
) -> http::Result<HttpResponse> {
    if status.is_success() {
        debug!("{message}");
    } else {
        error!("{message}");
    }
    Response::builder()
        .status(status)
        .body(Full::new(Bytes::new()))
}

/// Builds the reqwest client used to reach the remote endpoint. Uses rustls for TLS.
pub fn build_client(
    timeout: Duration,
    max_idle_per_host: usize,
) -> Result<reqwest::Client, reqwest::Error> {
    reqwest::Client::builder()
        .use_rustls_tls()
        .timeout(timeout)
        .pool_max_idle_per_host(max_idle_per_host)
        .build()
}

/// Parses a JSON object of static headers, e.g. `{"X-Team":"profiling"}`.
///
/// Malformed JSON, or entries that are not valid header names or values, are logged and
/// skipped. This never fails: the relay runs with whatever headers could be parsed.
pub fn parse_headers_json(raw: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    if raw.trim().is_empty() {
        return headers;
    }
    let parsed: HashMap<String, String> = match serde_json::from_str(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            error!("Failed to parse headers json: {e}");
            return headers;
        }
    };
    for (name, value) in parsed {
        match (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(&value),
        ) {
            (Ok(name), Ok(value)) => {
                headers.insert(name, value);
            }
            _ => error!("Ignoring invalid static header {name:?}"),
        }
    }
    headers
}
