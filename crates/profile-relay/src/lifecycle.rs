// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use tokio::time::Instant;

use crate::server::ServerError;

#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("{component} did not stop before the shutdown deadline")]
    Timeout { component: &'static str },
    #[error(transparent)]
    Server(#[from] ServerError),
    #[error("self profiler: {0}")]
    Profiler(String),
}

/// A component the orchestrator can start and stop without knowing its concrete type.
#[async_trait]
pub trait Lifecycle: Send + Sync {
    /// Short name used in logs and aggregated shutdown errors.
    fn name(&self) -> &'static str;

    /// Starts the component. Serving components block here until they are stopped.
    async fn start(&self) -> Result<(), LifecycleError>;

    /// Stops the component, giving up once `deadline` passes.
    async fn stop(&self, deadline: Instant) -> Result<(), LifecycleError>;
}
