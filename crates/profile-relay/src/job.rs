// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use hyper::{header, HeaderMap, Method, Uri};

/// One buffered inbound request waiting to be relayed to the remote endpoint.
///
/// The body is fully materialized. Cloning a `Job` shares the body buffer, so the
/// copy handed to the queue and the copy kept by the inbound request read back the
/// same bytes independently.
#[derive(Clone, Debug)]
pub struct Job {
    pub method: Method,
    pub uri: Uri,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl Job {
    pub fn new(method: Method, uri: Uri, headers: HeaderMap, body: Bytes) -> Self {
        Job {
            method,
            uri,
            headers,
            body,
        }
    }

    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    /// The `Host` header the function addressed, before any rewrite.
    pub fn host(&self) -> Option<&str> {
        self.headers
            .get(header::HOST)
            .and_then(|value| value.to_str().ok())
    }
}
