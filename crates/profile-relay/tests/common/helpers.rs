// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use bytes::Bytes;
use hyper::{header, HeaderMap, Method, Uri};
use profile_relay::job::Job;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A profile upload as the function's profiler would send it.
pub fn ingest_job(name: &str) -> Job {
    let mut headers = HeaderMap::new();
    headers.insert(header::HOST, "localhost:4040".parse().unwrap());
    Job::new(
        Method::POST,
        format!("/ingest?name={name}&spyName=gospy").parse::<Uri>().unwrap(),
        headers,
        Bytes::from(format!("profile of {name}")),
    )
}

/// Gives spawned tasks a chance to make progress.
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

/// Asserts the task is still blocked after it has had time to run.
pub async fn assert_pending<T>(task: &JoinHandle<T>, what: &str) {
    settle().await;
    assert!(!task.is_finished(), "{what} returned too early");
}

/// Waits for the task to finish, failing the test instead of hanging.
pub async fn finishes<F: Future>(fut: F, what: &str) -> F::Output {
    tokio::time::timeout(Duration::from_secs(2), fut)
        .await
        .unwrap_or_else(|_| panic!("{what} did not return"))
}
