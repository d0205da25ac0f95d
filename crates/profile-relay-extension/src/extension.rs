// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Client for the host runtime's extension API: register once, then long-poll lifecycle events.

use anyhow::{anyhow, Context};
use profile_relay::remote_queue::RemoteQueue;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

const API_VERSION: &str = "2020-01-01";
const EXTENSION_NAME_HEADER: &str = "Lambda-Extension-Name";
const EXTENSION_ID_HEADER: &str = "Lambda-Extension-Identifier";

#[derive(Debug, Deserialize, PartialEq)]
#[serde(tag = "eventType")]
pub enum NextEvent {
    #[serde(rename = "INVOKE")]
    Invoke {
        #[serde(rename = "deadlineMs")]
        deadline_ms: i64,
        #[serde(rename = "requestId")]
        request_id: String,
    },
    #[serde(rename = "SHUTDOWN")]
    Shutdown {
        #[serde(rename = "deadlineMs")]
        deadline_ms: i64,
        #[serde(rename = "shutdownReason", default)]
        shutdown_reason: Option<String>,
    },
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterResponse {
    #[serde(default)]
    pub function_name: Option<String>,
    #[serde(default)]
    pub function_version: Option<String>,
}

pub struct ExtensionClient {
    base_url: String,
    client: reqwest::Client,
    extension_id: Option<String>,
}

impl ExtensionClient {
    /// `runtime_api` is the `host:port` the host runtime exposes to extensions.
    pub fn new(runtime_api: &str) -> anyhow::Result<Self> {
        // no request timeout: next-event is a long poll that can block for the sandbox lifetime
        let client = reqwest::Client::builder()
            .use_rustls_tls()
            .build()
            .context("failed to build extension API client")?;
        Ok(ExtensionClient {
            base_url: format!("http://{runtime_api}/{API_VERSION}/extension"),
            client,
            extension_id: None,
        })
    }

    /// Subscribes to INVOKE and SHUTDOWN events. The name must match the extension's file name.
    pub async fn register(&mut self, extension_name: &str) -> anyhow::Result<RegisterResponse> {
        let response = self
            .client
            .post(format!("{}/register", self.base_url))
            .header(EXTENSION_NAME_HEADER, extension_name)
            .json(&serde_json::json!({ "events": ["INVOKE", "SHUTDOWN"] }))
            .send()
            .await
            .context("failed to register extension")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "extension registration failed with status {status}: {body}"
            ));
        }

        let extension_id = response
            .headers()
            .get(EXTENSION_ID_HEADER)
            .and_then(|id| id.to_str().ok())
            .ok_or_else(|| anyhow!("registration response has no {EXTENSION_ID_HEADER} header"))?
            .to_string();
        debug!("Registered extension {extension_name} with id {extension_id}");
        self.extension_id = Some(extension_id);

        let registration = response
            .json::<RegisterResponse>()
            .await
            .unwrap_or_default();
        Ok(registration)
    }

    /// Blocks until the host runtime delivers the next lifecycle event.
    pub async fn next_event(&self) -> anyhow::Result<NextEvent> {
        let extension_id = self
            .extension_id
            .as_deref()
            .ok_or_else(|| anyhow!("extension is not registered"))?;

        let response = self
            .client
            .get(format!("{}/event/next", self.base_url))
            .header(EXTENSION_ID_HEADER, extension_id)
            .send()
            .await
            .context("failed to poll next event")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("next event failed with status {status}: {body}"));
        }
        response
            .json::<NextEvent>()
            .await
            .context("failed to decode next event")
    }
}

/// Handles lifecycle events until SHUTDOWN, a polling error, or `shutdown` being cancelled.
/// With `flush_queue` set, every INVOKE waits for the queued profiles to be relayed before the
/// next event is requested.
pub async fn process_events(
    extension: &ExtensionClient,
    flush_queue: Option<&RemoteQueue>,
    shutdown: &CancellationToken,
) {
    loop {
        debug!("Waiting for event...");
        let event = tokio::select! {
            () = shutdown.cancelled() => return,
            event = extension.next_event() => event,
        };

        match event {
            Ok(NextEvent::Invoke {
                request_id,
                deadline_ms,
            }) => {
                debug!(deadline_ms, "Received INVOKE event for request {request_id}");
                if let Some(queue) = flush_queue {
                    queue.flush().await;
                }
            }
            Ok(NextEvent::Shutdown {
                shutdown_reason,
                deadline_ms,
            }) => {
                info!(
                    deadline_ms,
                    "Received SHUTDOWN event ({}). Exiting.",
                    shutdown_reason.as_deref().unwrap_or("unknown")
                );
                return;
            }
            Err(e) => {
                error!("{e:#}. Exiting");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::{Matcher, Mock, Server, ServerGuard};
    use profile_relay::job::Job;
    use profile_relay::remote_client::{RemoteClient, RemoteClientConfig};
    use profile_relay::remote_queue::RemoteQueueConfig;
    use reqwest::{header::HeaderMap, Method};
    use std::sync::Arc;
    use std::time::Duration;

    const INVOKE_EVENT: &str = r#"{"eventType":"INVOKE","deadlineMs":1700000000000,"requestId":"req-1"}"#;
    const SHUTDOWN_EVENT: &str =
        r#"{"eventType":"SHUTDOWN","deadlineMs":1700000002000,"shutdownReason":"spindown"}"#;

    async fn registered_client(server: &mut ServerGuard) -> ExtensionClient {
        server
            .mock("POST", "/2020-01-01/extension/register")
            .with_status(200)
            .with_header("lambda-extension-identifier", "ext-1")
            .create_async()
            .await;
        let mut client = ExtensionClient::new(&server.host_with_port()).unwrap();
        client.register("ext").await.unwrap();
        client
    }

    /// Queues one event on the next-event endpoint. Events are served in creation order.
    async fn next_event_mock(server: &mut ServerGuard, body: &str) -> Mock {
        server
            .mock("GET", "/2020-01-01/extension/event/next")
            .with_status(200)
            .with_body(body)
            .expect(1)
            .create_async()
            .await
    }

    async fn finishes<F: std::future::Future>(fut: F, what: &str) -> F::Output {
        tokio::time::timeout(Duration::from_secs(2), fut)
            .await
            .unwrap_or_else(|_| panic!("{what} did not finish"))
    }

    #[tokio::test]
    async fn test_register_keeps_extension_id() {
        let mut server = Server::new_async().await;
        let register = server
            .mock("POST", "/2020-01-01/extension/register")
            .match_header("lambda-extension-name", "profile-relay-extension")
            .match_body(Matcher::Json(
                serde_json::json!({ "events": ["INVOKE", "SHUTDOWN"] }),
            ))
            .with_status(200)
            .with_header("lambda-extension-identifier", "ext-1234")
            .with_body(r#"{"functionName":"my-function","functionVersion":"$LATEST","handler":"main"}"#)
            .create_async()
            .await;
        let next = server
            .mock("GET", "/2020-01-01/extension/event/next")
            .match_header("lambda-extension-identifier", "ext-1234")
            .with_status(200)
            .with_body(
                r#"{"eventType":"INVOKE","deadlineMs":1700000000000,"requestId":"req-1","invokedFunctionArn":"arn:aws:lambda:us-east-1:123:function:my-function","tracing":{"type":"X-Amzn-Trace-Id","value":"Root=1"}}"#,
            )
            .create_async()
            .await;

        let mut client = ExtensionClient::new(&server.host_with_port()).unwrap();
        let registration = client.register("profile-relay-extension").await.unwrap();
        assert_eq!(registration.function_name.as_deref(), Some("my-function"));

        let event = client.next_event().await.unwrap();
        assert_eq!(
            event,
            NextEvent::Invoke {
                deadline_ms: 1_700_000_000_000,
                request_id: "req-1".to_string(),
            }
        );
        register.assert_async().await;
        next.assert_async().await;
    }

    #[tokio::test]
    async fn test_shutdown_event() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/2020-01-01/extension/register")
            .with_status(200)
            .with_header("lambda-extension-identifier", "ext-1")
            .create_async()
            .await;
        server
            .mock("GET", "/2020-01-01/extension/event/next")
            .with_status(200)
            .with_body(
                r#"{"eventType":"SHUTDOWN","deadlineMs":1700000002000,"shutdownReason":"spindown"}"#,
            )
            .create_async()
            .await;

        let mut client = ExtensionClient::new(&server.host_with_port()).unwrap();
        client.register("ext").await.unwrap();
        assert_eq!(
            client.next_event().await.unwrap(),
            NextEvent::Shutdown {
                deadline_ms: 1_700_000_002_000,
                shutdown_reason: Some("spindown".to_string()),
            }
        );
    }

    #[tokio::test]
    async fn test_register_failure() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/2020-01-01/extension/register")
            .with_status(403)
            .with_body("forbidden")
            .create_async()
            .await;

        let mut client = ExtensionClient::new(&server.host_with_port()).unwrap();
        let err = client.register("ext").await.unwrap_err();
        assert!(err.to_string().contains("403"), "{err}");
    }

    #[tokio::test]
    async fn test_register_without_identifier_fails() {
        let mut server = Server::new_async().await;
        server
            .mock("POST", "/2020-01-01/extension/register")
            .with_status(200)
            .create_async()
            .await;

        let mut client = ExtensionClient::new(&server.host_with_port()).unwrap();
        assert!(client.register("ext").await.is_err());
    }

    #[tokio::test]
    async fn test_invoke_flushes_before_next_poll() {
        let mut remote = Server::new_async().await;
        let ingest = remote
            .mock("POST", "/ingest")
            .match_query(Matcher::Any)
            .with_status(200)
            .expect(1)
            .create_async()
            .await;
        let queue = Arc::new(RemoteQueue::new(
            RemoteQueueConfig::default(),
            Arc::new(RemoteClient::new(RemoteClientConfig {
                address: remote.url(),
                ..Default::default()
            })),
        ));
        // workers are not started yet, so the job stays outstanding
        queue
            .send(Job::new(
                Method::POST,
                "/ingest?name=app".parse().unwrap(),
                HeaderMap::new(),
                "pprof".into(),
            ))
            .await
            .unwrap();

        let mut api = Server::new_async().await;
        let extension = registered_client(&mut api).await;
        let invoke = next_event_mock(&mut api, INVOKE_EVENT).await;
        let shutdown_event = next_event_mock(&mut api, SHUTDOWN_EVENT).await;

        let events = tokio::spawn({
            let queue = queue.clone();
            async move {
                let shutdown = CancellationToken::new();
                process_events(&extension, Some(queue.as_ref()), &shutdown).await;
            }
        });

        finishes(
            async {
                while !invoke.matched_async().await {
                    tokio::time::sleep(Duration::from_millis(10)).await;
                }
            },
            "INVOKE delivery",
        )
        .await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!events.is_finished());
        assert!(!shutdown_event.matched_async().await);

        queue.start();
        finishes(events, "event loop").await.unwrap();
        shutdown_event.assert_async().await;
        ingest.assert_async().await;
        assert_eq!(queue.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_event_ends_event_loop() {
        let mut api = Server::new_async().await;
        let extension = registered_client(&mut api).await;
        let invoke = next_event_mock(&mut api, INVOKE_EVENT).await;
        let shutdown_event = next_event_mock(&mut api, SHUTDOWN_EVENT).await;

        finishes(
            process_events(&extension, None, &CancellationToken::new()),
            "event loop",
        )
        .await;
        invoke.assert_async().await;
        shutdown_event.assert_async().await;
    }

    #[tokio::test]
    async fn test_poll_error_ends_event_loop() {
        let mut api = Server::new_async().await;
        let extension = registered_client(&mut api).await;
        let next = api
            .mock("GET", "/2020-01-01/extension/event/next")
            .with_status(500)
            .expect(1)
            .create_async()
            .await;

        finishes(
            process_events(&extension, None, &CancellationToken::new()),
            "event loop",
        )
        .await;
        next.assert_async().await;
    }

    #[tokio::test]
    async fn test_cancelled_token_ends_event_loop() {
        let mut api = Server::new_async().await;
        let extension = registered_client(&mut api).await;
        let shutdown = CancellationToken::new();
        shutdown.cancel();

        finishes(process_events(&extension, None, &shutdown), "event loop").await;
    }

    #[tokio::test]
    async fn test_next_event_requires_registration() {
        let client = ExtensionClient::new("127.0.0.1:9").unwrap();
        assert!(client.next_event().await.is_err());
    }
}
