// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Optional profiling of the relay process itself.
//!
//! The profiler library does its own sampling and uploading on background threads, so the
//! backend seam is synchronous; stopping it flushes the last profile and may block, which is
//! why [`SelfProfiler`] runs it on the blocking pool under the shutdown deadline.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::time::{timeout_at, Instant};
use tracing::debug;

use crate::lifecycle::{Lifecycle, LifecycleError};

pub const DEFAULT_APPLICATION_NAME: &str = "pyroscope.lambda.extension";

pub trait ProfilerBackend: Send + Sync {
    fn start(&self) -> Result<(), String>;
    fn stop(&self) -> Result<(), String>;
}

#[derive(Clone, Debug)]
pub struct SelfProfilerConfig {
    pub enabled: bool,
    pub remote_address: String,
    pub auth_token: Option<String>,
    pub application_name: String,
}

impl Default for SelfProfilerConfig {
    fn default() -> Self {
        SelfProfilerConfig {
            enabled: false,
            remote_address: String::new(),
            auth_token: None,
            application_name: DEFAULT_APPLICATION_NAME.to_string(),
        }
    }
}

pub struct SelfProfiler {
    enabled: bool,
    backend: Arc<dyn ProfilerBackend>,
    running: AtomicBool,
}

impl SelfProfiler {
    pub fn new(config: SelfProfilerConfig) -> Self {
        let enabled = config.enabled;
        SelfProfiler::with_backend(enabled, default_backend(config))
    }

    pub fn with_backend(enabled: bool, backend: Arc<dyn ProfilerBackend>) -> Self {
        SelfProfiler {
            enabled,
            backend,
            running: AtomicBool::new(false),
        }
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Lifecycle for SelfProfiler {
    fn name(&self) -> &'static str {
        "self-profiler"
    }

    async fn start(&self) -> Result<(), LifecycleError> {
        if !self.enabled {
            return Ok(());
        }
        self.backend.start().map_err(LifecycleError::Profiler)?;
        self.running.store(true, Ordering::SeqCst);
        debug!("Self profiler started");
        Ok(())
    }

    async fn stop(&self, deadline: Instant) -> Result<(), LifecycleError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Flushing self profiler data");

        let backend = Arc::clone(&self.backend);
        match timeout_at(deadline, tokio::task::spawn_blocking(move || backend.stop())).await {
            Ok(Ok(result)) => result.map_err(LifecycleError::Profiler),
            Ok(Err(e)) => Err(LifecycleError::Profiler(e.to_string())),
            Err(_) => Err(LifecycleError::Timeout {
                component: "self-profiler",
            }),
        }
    }
}

#[cfg(not(feature = "pyroscope"))]
fn default_backend(_config: SelfProfilerConfig) -> Arc<dyn ProfilerBackend> {
    Arc::new(UnavailableBackend)
}

#[cfg(feature = "pyroscope")]
fn default_backend(config: SelfProfilerConfig) -> Arc<dyn ProfilerBackend> {
    Arc::new(pyroscope_backend::PyroscopeBackend::new(config))
}

/// Backend used when the crate is built without a profiler library.
pub struct UnavailableBackend;

impl ProfilerBackend for UnavailableBackend {
    fn start(&self) -> Result<(), String> {
        Err("self profiling requires the `pyroscope` feature".to_string())
    }

    fn stop(&self) -> Result<(), String> {
        Ok(())
    }
}

#[cfg(feature = "pyroscope")]
mod pyroscope_backend {
    use pyroscope::pyroscope::PyroscopeAgentRunning;
    use pyroscope::PyroscopeAgent;
    use pyroscope_pprofrs::{pprof_backend, PprofConfig};
    use std::sync::{Mutex, PoisonError};

    use super::{ProfilerBackend, SelfProfilerConfig};

    const SAMPLE_RATE: u32 = 100;

    pub struct PyroscopeBackend {
        config: SelfProfilerConfig,
        agent: Mutex<Option<PyroscopeAgent<PyroscopeAgentRunning>>>,
    }

    impl PyroscopeBackend {
        pub fn new(config: SelfProfilerConfig) -> Self {
            PyroscopeBackend {
                config,
                agent: Mutex::new(None),
            }
        }
    }

    impl ProfilerBackend for PyroscopeBackend {
        fn start(&self) -> Result<(), String> {
            let mut builder = PyroscopeAgent::builder(
                self.config.remote_address.as_str(),
                self.config.application_name.as_str(),
            )
            .backend(pprof_backend(PprofConfig::new().sample_rate(SAMPLE_RATE)));
            if let Some(token) = &self.config.auth_token {
                builder = builder.auth_token(token.clone());
            }
            let agent = builder.build().map_err(|e| e.to_string())?;
            let running = agent.start().map_err(|e| e.to_string())?;
            *self.agent.lock().unwrap_or_else(PoisonError::into_inner) = Some(running);
            Ok(())
        }

        fn stop(&self) -> Result<(), String> {
            let running = self
                .agent
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take();
            if let Some(running) = running {
                let ready = running.stop().map_err(|e| e.to_string())?;
                ready.shutdown();
            }
            Ok(())
        }
    }
}
