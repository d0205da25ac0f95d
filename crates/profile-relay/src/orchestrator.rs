// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error};

use crate::lifecycle::{Lifecycle, LifecycleError};

/// Budget the host runtime leaves an extension between SHUTDOWN and being killed.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(2);

/// Every component that failed to stop cleanly.
#[derive(Debug, thiserror::Error)]
#[error("shutdown failed: {}", describe_failures(.failures))]
pub struct ShutdownError {
    pub failures: Vec<(&'static str, LifecycleError)>,
}

fn describe_failures(failures: &[(&'static str, LifecycleError)]) -> String {
    failures
        .iter()
        .map(|(component, e)| format!("{component}: {e}"))
        .collect::<Vec<_>>()
        .join("; ")
}

pub struct Orchestrator {
    queue: Arc<dyn Lifecycle>,
    self_profiler: Arc<dyn Lifecycle>,
    server: Arc<dyn Lifecycle>,
    shutdown_timeout: Duration,
}

impl Orchestrator {
    pub fn new(
        queue: Arc<dyn Lifecycle>,
        self_profiler: Arc<dyn Lifecycle>,
        server: Arc<dyn Lifecycle>,
    ) -> Self {
        Orchestrator {
            queue,
            self_profiler,
            server,
            shutdown_timeout: DEFAULT_SHUTDOWN_TIMEOUT,
        }
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    /// Starts the queue, then the self profiler, then serves until the server is stopped.
    /// A self profiler that fails to start is logged and otherwise ignored.
    pub async fn start(&self) -> Result<(), LifecycleError> {
        self.queue.start().await?;

        if let Err(e) = self.self_profiler.start().await {
            error!("Failed to start {}: {e}", self.self_profiler.name());
        }

        debug!("Starting relay server");
        self.server.start().await
    }

    /// Stops all three components concurrently, so the total wait is bounded by the slowest
    /// one rather than their sum.
    pub async fn shutdown(&self) -> Result<(), ShutdownError> {
        let deadline = Instant::now() + self.shutdown_timeout;
        let components = [&self.self_profiler, &self.server, &self.queue];

        let (profiler, server, queue) = tokio::join!(
            components[0].stop(deadline),
            components[1].stop(deadline),
            components[2].stop(deadline),
        );

        let failures: Vec<_> = components
            .iter()
            .map(|c| c.name())
            .zip([profiler, server, queue])
            .filter_map(|(name, result)| result.err().map(|e| (name, e)))
            .collect();

        if failures.is_empty() {
            debug!("Shutdown complete");
            Ok(())
        } else {
            for (component, e) in &failures {
                error!(component = *component, "Failed to stop: {e}");
            }
            Err(ShutdownError { failures })
        }
    }
}
