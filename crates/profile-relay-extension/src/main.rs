// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

mod config;
mod extension;

use anyhow::Context;
use std::{env, path::Path, process, sync::Arc};
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use profile_relay::{
    controller::Controller,
    orchestrator::Orchestrator,
    remote_client::RemoteClient,
    remote_queue::RemoteQueue,
    self_profiler::SelfProfiler,
    server::Server,
    session::{SeedSource, SessionIdGenerator},
};

use crate::config::Config;
use crate::extension::{process_events, ExtensionClient};

const DEFAULT_EXTENSION_NAME: &str = "profile-relay-extension";

#[tokio::main]
pub async fn main() {
    let log_level = env::var("PYROSCOPE_LOG_LEVEL")
        .map(|val| val.to_lowercase())
        .unwrap_or("info".to_string());

    let env_filter = format!("h2=off,hyper=off,rustls=off,{}", log_level);

    let filter = EnvFilter::try_new(env_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(filter)
        .with_level(true)
        .with_thread_names(false)
        .with_thread_ids(false)
        .with_line_number(false)
        .with_file(false)
        .with_target(true)
        .without_time()
        .finish();

    if let Err(e) = tracing::subscriber::set_global_default(subscriber) {
        eprintln!("setting default subscriber failed: {e}");
    }

    debug!("Logging subsystem enabled");

    if let Err(e) = run(Config::from_env()).await {
        error!("{e:#}");
        process::exit(1);
    }
}

async fn run(config: Config) -> anyhow::Result<()> {
    let session_ids = SessionIdGenerator::new(&SeedSource::detect());
    let session_id = session_ids.next_id();
    debug!("Relaying profiles with session id {session_id}");

    let client = Arc::new(RemoteClient::new(
        config.remote_client_config(Some(session_id)),
    ));
    let queue = Arc::new(RemoteQueue::new(config.queue_config(), client));
    let controller = Arc::new(Controller::new(queue.clone()));
    let server = Arc::new(
        Server::bind(&config.server_address, controller)
            .await
            .context("unable to start the relay server")?,
    );
    let self_profiler = Arc::new(SelfProfiler::new(config.self_profiler_config()));
    let orchestrator = Arc::new(Orchestrator::new(queue.clone(), self_profiler, server));

    let shutdown = CancellationToken::new();
    tokio::spawn(wait_for_signal(shutdown.clone()));

    tokio::spawn({
        let orchestrator = orchestrator.clone();
        async move {
            info!("Starting relay server");
            if let Err(e) = orchestrator.start().await {
                error!("Relay server stopped: {e}");
            }
        }
    });

    let result = if config.dev_mode {
        // no registration in dev mode, handy for running locally
        shutdown.cancelled().await;
        Ok(())
    } else {
        run_prod_mode(&config, &queue, &shutdown).await
    };

    if let Err(e) = orchestrator.shutdown().await {
        error!("{e}");
    }
    result
}

/// Registers with the host runtime and handles lifecycle events until SHUTDOWN, a signal, or
/// a polling error.
async fn run_prod_mode(
    config: &Config,
    queue: &RemoteQueue,
    shutdown: &CancellationToken,
) -> anyhow::Result<()> {
    let runtime_api = config
        .runtime_api
        .as_deref()
        .context("AWS_LAMBDA_RUNTIME_API is not set")?;
    let mut extension = ExtensionClient::new(runtime_api)?;
    let registration = extension.register(&extension_name()).await?;
    debug!(
        "Registered for function {} version {}",
        registration.function_name.as_deref().unwrap_or("unknown"),
        registration.function_version.as_deref().unwrap_or("unknown")
    );

    let flush_queue = config.flush_on_invoke.then_some(queue);
    process_events(&extension, flush_queue, shutdown).await;
    Ok(())
}

/// The host runtime requires the registered name to match the extension's file name.
fn extension_name() -> String {
    env::args()
        .next()
        .as_deref()
        .and_then(|arg0| Path::new(arg0).file_name())
        .and_then(|name| name.to_str())
        .map(str::to_string)
        .unwrap_or_else(|| DEFAULT_EXTENSION_NAME.to_string())
}

async fn wait_for_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to listen for SIGINT: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => info!("Received signal: 'interrupt'. Exiting"),
        () = terminate => info!("Received signal: 'terminated'. Exiting"),
    }
    shutdown.cancel();
}
