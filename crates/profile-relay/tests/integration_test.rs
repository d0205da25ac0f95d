// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

mod common;

use common::helpers::finishes;
use mockito::Matcher;
use profile_relay::{
    controller::Controller,
    orchestrator::Orchestrator,
    remote_client::{RemoteClient, RemoteClientConfig},
    remote_queue::{RemoteQueue, RemoteQueueConfig},
    self_profiler::{SelfProfiler, SelfProfilerConfig},
    server::Server,
    session::SessionId,
};
use std::sync::Arc;

struct Relay {
    queue: Arc<RemoteQueue>,
    orchestrator: Arc<Orchestrator>,
    addr: std::net::SocketAddr,
}

async fn start_relay(remote: RemoteClientConfig) -> Relay {
    let client = Arc::new(RemoteClient::new(remote));
    let queue = Arc::new(RemoteQueue::new(RemoteQueueConfig::default(), client));
    let controller = Arc::new(Controller::new(queue.clone()));
    let server = Arc::new(Server::bind("127.0.0.1:0", controller).await.unwrap());
    let addr = server.local_addr();
    let profiler = Arc::new(SelfProfiler::new(SelfProfilerConfig::default()));

    let orchestrator = Arc::new(Orchestrator::new(queue.clone(), profiler, server));
    tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move { orchestrator.start().await }
    });

    Relay {
        queue,
        orchestrator,
        addr,
    }
}

#[tokio::test]
async fn test_upload_is_relayed_to_remote() {
    let mut remote = mockito::Server::new_async().await;
    let session = SessionId::new(0x00c0_ffee_0000_0001);
    let mock = remote
        .mock("POST", "/pyroscope/ingest")
        .match_query(Matcher::AllOf(vec![
            Matcher::UrlEncoded(
                "name".to_string(),
                format!("my.function{{__session_id__={session}}}"),
            ),
            Matcher::UrlEncoded("spyName".to_string(), "gospy".to_string()),
        ]))
        .match_header("authorization", "Bearer secret-token")
        .match_header("x-scope-orgid", "tenant-a")
        .match_header("x-forwarded-host", Matcher::Any)
        .match_body("pprof-payload")
        .with_status(200)
        .expect(1)
        .create_async()
        .await;

    let relay = start_relay(RemoteClientConfig {
        address: format!("{}/pyroscope", remote.url()),
        auth_token: Some("secret-token".to_string()),
        tenant_id: Some("tenant-a".to_string()),
        session_id: Some(session),
        ..Default::default()
    })
    .await;

    let response = reqwest::Client::new()
        .post(format!(
            "http://{}/ingest?name=my.function%7B%7D&spyName=gospy",
            relay.addr
        ))
        .body("pprof-payload")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);

    finishes(relay.queue.flush(), "flush").await;
    mock.assert_async().await;

    finishes(relay.orchestrator.shutdown(), "shutdown")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_remote_failure_is_invisible_to_caller() {
    let mut remote = mockito::Server::new_async().await;
    let mock = remote
        .mock("POST", "/ingest")
        .match_query(Matcher::Any)
        .with_status(500)
        .with_body("ingester unavailable")
        .expect(2)
        .create_async()
        .await;

    let relay = start_relay(RemoteClientConfig {
        address: remote.url(),
        ..Default::default()
    })
    .await;

    let client = reqwest::Client::new();
    for _ in 0..2 {
        let response = client
            .post(format!("http://{}/ingest?name=app", relay.addr))
            .body("pprof")
            .send()
            .await
            .unwrap();
        assert_eq!(response.status(), 200);
    }

    finishes(relay.queue.flush(), "flush").await;
    mock.assert_async().await;
    assert_eq!(relay.queue.outstanding(), 0);

    finishes(relay.orchestrator.shutdown(), "shutdown")
        .await
        .unwrap();
}

#[tokio::test]
async fn test_shutdown_drains_queued_uploads() {
    let mut remote = mockito::Server::new_async().await;
    let mock = remote
        .mock("POST", "/ingest")
        .match_query(Matcher::Any)
        .with_status(200)
        .expect(3)
        .create_async()
        .await;

    let relay = start_relay(RemoteClientConfig {
        address: remote.url(),
        ..Default::default()
    })
    .await;

    let client = reqwest::Client::new();
    for i in 0..3 {
        client
            .post(format!("http://{}/ingest?name=app{i}", relay.addr))
            .body("pprof")
            .send()
            .await
            .unwrap();
    }

    finishes(relay.orchestrator.shutdown(), "shutdown")
        .await
        .unwrap();
    mock.assert_async().await;
}
