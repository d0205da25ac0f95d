// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::env;
use std::time::Duration;
use tracing::error;

use profile_relay::remote_client::{RemoteClientConfig, DEFAULT_TIMEOUT};
use profile_relay::remote_queue::{
    RemoteQueueConfig, StopPolicy, DEFAULT_NUM_WORKERS, DEFAULT_QUEUE_SIZE,
};
use profile_relay::self_profiler::SelfProfilerConfig;
use profile_relay::server::DEFAULT_SERVER_ADDRESS;
use profile_relay::session::SessionId;

pub const DEFAULT_REMOTE_ADDRESS: &str = "https://ingest.pyroscope.cloud";

#[derive(Clone, Debug)]
pub struct Config {
    pub remote_address: String,
    pub auth_token: Option<String>,
    pub basic_auth_user: Option<String>,
    pub basic_auth_password: Option<String>,
    pub tenant_id: Option<String>,
    pub http_headers_json: Option<String>,
    pub timeout: Duration,
    pub num_workers: usize,
    pub queue_size: usize,
    pub self_profiling: bool,
    pub flush_on_invoke: bool,
    pub dev_mode: bool,
    pub server_address: String,
    pub drain_on_stop: bool,
    /// `host:port` of the host runtime's extension API. Only needed outside dev mode.
    pub runtime_api: Option<String>,
}

impl Config {
    /// Reads the configuration from the environment. Values that cannot be parsed are logged
    /// and replaced by their default.
    pub fn from_env() -> Config {
        Config {
            remote_address: env_string("PYROSCOPE_REMOTE_ADDRESS")
                .unwrap_or_else(|| DEFAULT_REMOTE_ADDRESS.to_string()),
            auth_token: env_string("PYROSCOPE_AUTH_TOKEN"),
            basic_auth_user: env_string("PYROSCOPE_BASIC_AUTH_USER"),
            basic_auth_password: env_string("PYROSCOPE_BASIC_AUTH_PASSWORD"),
            tenant_id: env_string("PYROSCOPE_SCOPE_ORGID"),
            http_headers_json: env_string("PYROSCOPE_HTTP_HEADERS"),
            timeout: env_parse("PYROSCOPE_TIMEOUT", DEFAULT_TIMEOUT, parse_duration),
            num_workers: env_parse("PYROSCOPE_NUM_WORKERS", DEFAULT_NUM_WORKERS, parse_count),
            queue_size: env_parse("PYROSCOPE_QUEUE_SIZE", DEFAULT_QUEUE_SIZE, parse_count),
            self_profiling: env_parse("PYROSCOPE_SELF_PROFILING", false, parse_bool),
            flush_on_invoke: env_parse("PYROSCOPE_FLUSH_ON_INVOKE", false, parse_bool),
            dev_mode: env_parse("PYROSCOPE_DEV_MODE", false, parse_bool),
            server_address: env_string("PYROSCOPE_SERVER_ADDRESS")
                .unwrap_or_else(|| DEFAULT_SERVER_ADDRESS.to_string()),
            drain_on_stop: env_parse("PYROSCOPE_DRAIN_ON_STOP", true, parse_bool),
            runtime_api: env_string("AWS_LAMBDA_RUNTIME_API"),
        }
    }

    pub fn remote_client_config(&self, session_id: Option<SessionId>) -> RemoteClientConfig {
        RemoteClientConfig {
            address: self.remote_address.clone(),
            auth_token: self.auth_token.clone(),
            basic_auth_user: self.basic_auth_user.clone(),
            basic_auth_password: self.basic_auth_password.clone(),
            tenant_id: self.tenant_id.clone(),
            http_headers_json: self.http_headers_json.clone(),
            timeout: self.timeout,
            session_id,
            ..Default::default()
        }
    }

    pub fn queue_config(&self) -> RemoteQueueConfig {
        RemoteQueueConfig {
            num_workers: self.num_workers,
            capacity: self.queue_size,
            stop_policy: if self.drain_on_stop {
                StopPolicy::DrainQueued
            } else {
                StopPolicy::AbandonQueued
            },
        }
    }

    pub fn self_profiler_config(&self) -> SelfProfilerConfig {
        SelfProfilerConfig {
            enabled: self.self_profiling,
            remote_address: self.remote_address.clone(),
            auth_token: self.auth_token.clone(),
            ..Default::default()
        }
    }
}

/// Unset and empty variables both read as `None`.
fn env_string(key: &str) -> Option<String> {
    env::var(key).ok().filter(|val| !val.trim().is_empty())
}

fn env_parse<T>(key: &str, default: T, parse: fn(&str) -> Option<T>) -> T {
    match env_string(key) {
        None => default,
        Some(raw) => parse(raw.trim()).unwrap_or_else(|| {
            error!("Invalid value '{raw}' for {key}, using the default");
            default
        }),
    }
}

pub fn parse_bool(raw: &str) -> Option<bool> {
    match raw.to_lowercase().as_str() {
        "1" | "t" | "true" => Some(true),
        "0" | "f" | "false" => Some(false),
        _ => None,
    }
}

/// Accepts `500ms`, `10s`, `1m`, or a plain number of seconds.
pub fn parse_duration(raw: &str) -> Option<Duration> {
    let duration = if let Some(ms) = raw.strip_suffix("ms") {
        Duration::from_millis(ms.trim().parse().ok()?)
    } else if let Some(secs) = raw.strip_suffix('s') {
        Duration::try_from_secs_f64(secs.trim().parse().ok()?).ok()?
    } else if let Some(mins) = raw.strip_suffix('m') {
        Duration::from_secs(mins.trim().parse::<u64>().ok()?.checked_mul(60)?)
    } else {
        Duration::try_from_secs_f64(raw.parse().ok()?).ok()?
    };
    (!duration.is_zero()).then_some(duration)
}

fn parse_count(raw: &str) -> Option<usize> {
    raw.parse().ok().filter(|count| *count > 0)
}
