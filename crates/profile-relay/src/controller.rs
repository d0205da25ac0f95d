// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::{body::Body, http, Request, StatusCode};
use std::fmt::Display;
use std::sync::Arc;
use tracing::debug;

use crate::http_utils::{log_and_create_http_response, HttpResponse};
use crate::job::Job;
use crate::remote_queue::RemoteQueue;

/// Accepts profile uploads from the function and hands a copy to the remote queue.
pub struct Controller {
    queue: Arc<RemoteQueue>,
}

impl Controller {
    pub fn new(queue: Arc<RemoteQueue>) -> Self {
        Controller { queue }
    }

    /// Handles one inbound request. The caller is acknowledged with 200 whatever the queue
    /// does with the job; only an unreadable body turns into a 500.
    pub async fn relay_request<B>(&self, req: Request<B>) -> http::Result<HttpResponse>
    where
        B: Body,
        B::Error: Display,
    {
        let (_original, job) = match duplicate_request(req).await {
            Ok(duplicated) => duplicated,
            Err(e) => {
                return log_and_create_http_response(
                    &format!("Failed to read a request for relay. Error: {e}"),
                    StatusCode::INTERNAL_SERVER_ERROR,
                )
            }
        };

        self.enqueue(job).await;
        log_and_create_http_response("Buffered profile to be relayed", StatusCode::OK)
    }

    /// Queue outcomes stay here: a full or stopped queue is logged, never reported upstream.
    async fn enqueue(&self, job: Job) {
        let path = job.path().to_string();
        if let Err(e) = self.queue.send(job).await {
            debug!(path = %path, "Profile not queued: {e}");
        }
    }
}

/// Reads the body once and returns the request with a replayable copy of it, together with a
/// [`Job`] carrying the same method, URI, headers and bytes.
pub async fn duplicate_request<B>(req: Request<B>) -> Result<(Request<Full<Bytes>>, Job), B::Error>
where
    B: Body,
{
    let (parts, body) = req.into_parts();
    let body = body.collect().await?.to_bytes();
    let job = Job::new(
        parts.method.clone(),
        parts.uri.clone(),
        parts.headers.clone(),
        body.clone(),
    );
    Ok((Request::from_parts(parts, Full::new(body)), job))
}
