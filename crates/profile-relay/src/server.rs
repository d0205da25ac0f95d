// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use hyper::{body::Incoming, service::service_fn, Request};
use hyper_util::{rt::TokioIo, server::graceful::GracefulShutdown};
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

use crate::controller::Controller;
use crate::lifecycle::{Lifecycle, LifecycleError};

pub const DEFAULT_SERVER_ADDRESS: &str = "0.0.0.0:4040";

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("server error: {0}")]
    Serve(#[source] io::Error),
    #[error("server is already serving")]
    AlreadyServing,
    #[error("open connections did not finish before the shutdown deadline")]
    Timeout,
}

/// Front server: accepts any request on the bound address and hands it to the [`Controller`].
pub struct Server {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    controller: Arc<Controller>,
    cancel: CancellationToken,
    stopped: watch::Sender<bool>,
}

impl Server {
    /// Binds the listening socket. Failing here is fatal for the extension.
    pub async fn bind(addr: &str, controller: Arc<Controller>) -> Result<Self, ServerError> {
        let bind_err = |source| ServerError::Bind {
            addr: addr.to_string(),
            source,
        };
        let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
        let local_addr = listener.local_addr().map_err(bind_err)?;
        let (stopped, _) = watch::channel(false);

        Ok(Server {
            listener: Mutex::new(Some(listener)),
            local_addr,
            controller,
            cancel: CancellationToken::new(),
            stopped,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves connections until [`Server::shutdown`] is called. Returns once every open
    /// connection has finished its in-flight response.
    pub async fn serve(&self) -> Result<(), ServerError> {
        let listener = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(ServerError::AlreadyServing)?;
        debug!("Profile relay listening on {}", self.local_addr);

        let server = hyper::server::conn::http1::Builder::new();
        let graceful = GracefulShutdown::new();

        let result = loop {
            let conn = tokio::select! {
                () = self.cancel.cancelled() => break Ok(()),
                con_res = listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Server error: {e}");
                        break Err(ServerError::Serve(e));
                    }
                    Ok((conn, _)) => conn,
                },
            };

            let controller = Arc::clone(&self.controller);
            let service = service_fn(move |req: Request<Incoming>| {
                let controller = Arc::clone(&controller);
                async move { controller.relay_request(req).await }
            });
            let conn = graceful.watch(server.serve_connection(TokioIo::new(conn), service));
            tokio::spawn(async move {
                if let Err(e) = conn.await {
                    debug!("Connection error: {e}");
                }
            });
        };

        drop(listener);
        graceful.shutdown().await;
        self.stopped.send_replace(true);
        debug!("Profile relay server stopped");
        result
    }

    /// Stops accepting connections and waits, until `deadline`, for open ones to finish.
    pub async fn shutdown(&self, deadline: Instant) -> Result<(), ServerError> {
        self.cancel.cancel();
        let never_served = self
            .listener
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .is_some();
        if never_served {
            self.stopped.send_replace(true);
        }

        let mut stopped = self.stopped.subscribe();
        let finished = timeout_at(deadline, stopped.wait_for(|stopped| *stopped))
            .await
            .is_ok();
        if finished {
            Ok(())
        } else {
            Err(ServerError::Timeout)
        }
    }
}

#[async_trait]
impl Lifecycle for Server {
    fn name(&self) -> &'static str {
        "server"
    }

    async fn start(&self) -> Result<(), LifecycleError> {
        Ok(self.serve().await?)
    }

    async fn stop(&self, deadline: Instant) -> Result<(), LifecycleError> {
        Ok(self.shutdown(deadline).await?)
    }
}
