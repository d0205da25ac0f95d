// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use core::time::Duration;
use hyper::header::{self, HeaderMap, HeaderName, HeaderValue};
use reqwest::{StatusCode, Url};
use tracing::{debug, error};

use crate::http_utils::{build_client, parse_headers_json};
use crate::job::Job;
use crate::session::{inject_label, SessionId};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_MAX_IDLE_CONNS_PER_HOST: usize = 5;

const TENANT_HEADER: &str = "x-scope-orgid";
const FORWARDED_HOST_HEADER: &str = "x-forwarded-host";

/// Headers describing the inbound connection rather than the payload.
const HOP_HEADERS: [HeaderName; 4] = [
    header::HOST,
    header::CONTENT_LENGTH,
    header::CONNECTION,
    header::TRANSFER_ENCODING,
];

#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// The request could not be built or did not complete: bad destination, network error,
    /// timeout.
    #[error("failed to make request: {0}")]
    Request(String),
    /// The remote answered with a status outside 200-299.
    #[error("response not ok: status code: '{status}'. body: '{body}'")]
    NotOk { status: StatusCode, body: String },
}

/// Delivers one job to the remote endpoint.
#[async_trait]
pub trait Relayer: Send + Sync {
    async fn send(&self, job: Job) -> Result<(), RelayError>;
}

#[derive(Clone, Debug)]
pub struct RemoteClientConfig {
    /// Base address of the remote endpoint. May carry userinfo and a path prefix.
    pub address: String,
    pub auth_token: Option<String>,
    pub basic_auth_user: Option<String>,
    pub basic_auth_password: Option<String>,
    pub tenant_id: Option<String>,
    /// JSON object of headers added to every relayed request.
    pub http_headers_json: Option<String>,
    pub timeout: Duration,
    pub max_idle_conns_per_host: usize,
    /// When set, profile keys are tagged with this session label.
    pub session_id: Option<SessionId>,
}

impl Default for RemoteClientConfig {
    fn default() -> Self {
        RemoteClientConfig {
            address: String::new(),
            auth_token: None,
            basic_auth_user: None,
            basic_auth_password: None,
            tenant_id: None,
            http_headers_json: None,
            timeout: DEFAULT_TIMEOUT,
            max_idle_conns_per_host: DEFAULT_MAX_IDLE_CONNS_PER_HOST,
            session_id: None,
        }
    }
}

enum Auth {
    Bearer(String),
    Basic { user: String, password: String },
    Passthrough,
}

/// Relays jobs to the configured remote address over a pooled HTTP client.
pub struct RemoteClient {
    remote: Result<Url, String>,
    auth: Auth,
    tenant_id: Option<HeaderValue>,
    static_headers: HeaderMap,
    session_id: Option<String>,
    client: reqwest::Client,
}

impl RemoteClient {
    pub fn new(config: RemoteClientConfig) -> Self {
        let timeout = if config.timeout.is_zero() {
            DEFAULT_TIMEOUT
        } else {
            config.timeout
        };
        let max_idle = if config.max_idle_conns_per_host == 0 {
            DEFAULT_MAX_IDLE_CONNS_PER_HOST
        } else {
            config.max_idle_conns_per_host
        };
        let client = build_client(timeout, max_idle).unwrap_or_else(|e| {
            error!("Unable to build relay client: {e}, falling back to defaults");
            reqwest::Client::new()
        });

        let remote = Url::parse(&config.address)
            .map_err(|e| format!("invalid remote address '{}': {e}", config.address));
        if let Err(e) = &remote {
            error!("{e}");
        }

        let auth = match (
            config.auth_token,
            config.basic_auth_user,
            config.basic_auth_password,
        ) {
            (Some(token), _, _) if !token.is_empty() => Auth::Bearer(token),
            (_, Some(user), Some(password)) if !user.is_empty() && !password.is_empty() => {
                Auth::Basic { user, password }
            }
            _ => Auth::Passthrough,
        };

        let tenant_id = config
            .tenant_id
            .filter(|tenant| !tenant.is_empty())
            .and_then(|tenant| match HeaderValue::from_str(&tenant) {
                Ok(value) => Some(value),
                Err(e) => {
                    error!("Ignoring invalid tenant id: {e}");
                    None
                }
            });

        RemoteClient {
            remote,
            auth,
            tenant_id,
            static_headers: config
                .http_headers_json
                .as_deref()
                .map(parse_headers_json)
                .unwrap_or_default(),
            session_id: config.session_id.map(|id| id.to_string()),
            client,
        }
    }

    /// Rewrites scheme and host to the remote, joins the remote path prefix with the job's path
    /// and tags the profile key with the session label.
    fn destination(&self, remote: &Url, job: &Job) -> Url {
        let mut url = remote.clone();
        url.set_path(&join_path(remote.path(), job.path()));
        let query = match (job.query(), &self.session_id) {
            (Some(query), Some(session_id)) => Some(inject_label(query, session_id)),
            (query, _) => query.map(str::to_string),
        };
        url.set_query(query.as_deref());
        url
    }

    fn outbound_headers(&self, mut headers: HeaderMap) -> HeaderMap {
        let forwarded_host = headers.get(header::HOST).cloned();
        for name in HOP_HEADERS {
            headers.remove(name);
        }
        // configured credentials replace whatever the function sent
        if !matches!(self.auth, Auth::Passthrough) {
            headers.remove(header::AUTHORIZATION);
        }
        if let Some(host) = forwarded_host {
            headers.insert(FORWARDED_HOST_HEADER, host);
        }
        if let Some(tenant_id) = &self.tenant_id {
            headers.insert(TENANT_HEADER, tenant_id.clone());
        }
        for (name, value) in &self.static_headers {
            headers.insert(name.clone(), value.clone());
        }
        headers
    }
}

#[async_trait]
impl Relayer for RemoteClient {
    async fn send(&self, job: Job) -> Result<(), RelayError> {
        let remote = self.remote.as_ref().map_err(|e| RelayError::Request(e.clone()))?;
        let url = self.destination(remote, &job);
        let headers = self.outbound_headers(job.headers);

        debug!("Making request to {url}");
        let mut request = self
            .client
            .request(job.method, url)
            .headers(headers)
            .body(job.body);
        request = match &self.auth {
            Auth::Bearer(token) => request.bearer_auth(token),
            Auth::Basic { user, password } => request.basic_auth(user, Some(password)),
            Auth::Passthrough => request,
        };

        let response = request
            .send()
            .await
            .map_err(|e| RelayError::Request(e.to_string()))?;

        let status = response.status();
        // always read the body so the connection goes back to the pool
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(RelayError::NotOk { status, body });
        }
        Ok(())
    }
}

/// Joins a remote path prefix with a request path. Empty segments collapse and the result has
/// no trailing slash unless it is the root.
pub fn join_path(prefix: &str, path: &str) -> String {
    let segments = prefix
        .split('/')
        .chain(path.split('/'))
        .filter(|segment| !segment.is_empty())
        .collect::<Vec<_>>();
    format!("/{}", segments.join("/"))
}
