// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bounded queue of jobs waiting to be relayed, drained by a fixed pool of workers.
//!
//! `send` never waits for room: a full queue drops the job. `flush` is a barrier that returns
//! once every job accepted before it has been handed to the relayer and the relayer returned.
//! Both take the same gate, and `flush` keeps it for its whole wait, so a `send` issued during a
//! flush only returns after the flush does and can never join the batch being flushed.

use async_trait::async_trait;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::{watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use crate::job::Job;
use crate::lifecycle::{Lifecycle, LifecycleError};
use crate::remote_client::Relayer;

pub const DEFAULT_NUM_WORKERS: usize = 5;
pub const DEFAULT_QUEUE_SIZE: usize = 20;

/// What happens to jobs still buffered when the queue is stopped.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum StopPolicy {
    /// Workers keep pulling until the buffer is empty before exiting.
    #[default]
    DrainQueued,
    /// Workers exit once their current job is done; buffered jobs are discarded.
    AbandonQueued,
}

#[derive(Clone, Debug)]
pub struct RemoteQueueConfig {
    pub num_workers: usize,
    pub capacity: usize,
    pub stop_policy: StopPolicy,
}

impl Default for RemoteQueueConfig {
    fn default() -> Self {
        RemoteQueueConfig {
            num_workers: DEFAULT_NUM_WORKERS,
            capacity: DEFAULT_QUEUE_SIZE,
            stop_policy: StopPolicy::default(),
        }
    }
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum QueueError {
    #[error("request queue is full")]
    Full,
    #[error("request queue is stopped")]
    Stopped,
}

/// State shared between the queue handle and its workers.
struct Shared {
    relayer: Arc<dyn Relayer>,
    rx: TokioMutex<mpsc::Receiver<Job>>,
    /// Jobs accepted by `send` whose relay call has not returned yet.
    outstanding: watch::Sender<usize>,
    /// Jobs currently inside a relay call.
    in_flight: AtomicUsize,
    done: CancellationToken,
    stop_policy: StopPolicy,
}

pub struct RemoteQueue {
    num_workers: usize,
    tx: mpsc::Sender<Job>,
    flush_guard: TokioMutex<()>,
    /// Cleared by `stop`. Held by `send` from its check to the enqueue, so once `stop` has
    /// cleared it no job can land in the buffer behind the final sweep.
    accepting: Mutex<bool>,
    shared: Arc<Shared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl RemoteQueue {
    pub fn new(config: RemoteQueueConfig, relayer: Arc<dyn Relayer>) -> Self {
        let num_workers = if config.num_workers == 0 {
            DEFAULT_NUM_WORKERS
        } else {
            config.num_workers
        };
        let capacity = if config.capacity == 0 {
            DEFAULT_QUEUE_SIZE
        } else {
            config.capacity
        };
        let (tx, rx) = mpsc::channel(capacity);
        let (outstanding, _) = watch::channel(0);

        RemoteQueue {
            num_workers,
            tx,
            flush_guard: TokioMutex::new(()),
            accepting: Mutex::new(true),
            shared: Arc::new(Shared {
                relayer,
                rx: TokioMutex::new(rx),
                outstanding,
                in_flight: AtomicUsize::new(0),
                done: CancellationToken::new(),
                stop_policy: config.stop_policy,
            }),
            workers: Mutex::new(Vec::new()),
        }
    }

    /// Spawns the worker pool. Must be called once, from within a tokio runtime.
    pub fn start(&self) {
        trace!("Starting job queue with {} workers", self.num_workers);
        let mut workers = self.workers.lock().unwrap_or_else(PoisonError::into_inner);
        for worker_id in 0..self.num_workers {
            let shared = Arc::clone(&self.shared);
            workers.push(tokio::spawn(shared.handle_jobs(worker_id)));
        }
    }

    /// Adds a job to the queue to be relayed later. Waits only while a flush is in progress.
    pub async fn send(&self, job: Job) -> Result<(), QueueError> {
        let _gate = self.flush_guard.lock().await;
        let accepting = self.accepting.lock().unwrap_or_else(PoisonError::into_inner);
        if !*accepting {
            return Err(QueueError::Stopped);
        }

        self.shared.outstanding.send_modify(|n| *n += 1);
        match self.tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                self.shared.release(1);
                error!("Request queue is full, dropping a profile job.");
                Err(QueueError::Full)
            }
            Err(TrySendError::Closed(_)) => {
                self.shared.release(1);
                Err(QueueError::Stopped)
            }
        }
    }

    /// Blocks until every job accepted so far has been relayed (or failed). Returns
    /// immediately when nothing is outstanding. Only makes progress once the workers are
    /// started.
    pub async fn flush(&self) {
        debug!("Flush: waiting for enqueued jobs to finish");
        let _gate = self.flush_guard.lock().await;
        let mut outstanding = self.shared.outstanding.subscribe();
        // the sender lives as long as `self`, so this only returns once the count hits zero
        let _ = outstanding.wait_for(|n| *n == 0).await;
        debug!("Flush: done");
    }

    /// Signals the workers to stop taking jobs, then waits for the ones already relaying,
    /// plus the buffered ones under [`StopPolicy::DrainQueued`], until `deadline`.
    pub async fn stop(&self, deadline: Instant) -> Result<(), LifecycleError> {
        *self.accepting.lock().unwrap_or_else(PoisonError::into_inner) = false;
        self.shared.done.cancel();

        let workers = std::mem::take(
            &mut *self.workers.lock().unwrap_or_else(PoisonError::into_inner),
        );
        debug!(
            "Waiting for {} in-flight and {} queued jobs...",
            self.in_flight(),
            self.queued()
        );

        let joined = timeout_at(deadline, async {
            for worker in workers {
                if let Err(e) = worker.await {
                    error!("Queue worker failed: {e}");
                }
            }
        })
        .await;
        if joined.is_err() {
            warn!("Queue did not drain before the shutdown deadline");
            return Err(LifecycleError::Timeout { component: "queue" });
        }

        let abandoned = self.shared.discard_queued().await;
        if abandoned > 0 {
            warn!("Dropped {abandoned} queued profile jobs on shutdown");
        }
        debug!("Requests finished.");
        Ok(())
    }

    /// Jobs accepted but not yet relayed.
    pub fn outstanding(&self) -> usize {
        *self.shared.outstanding.borrow()
    }

    /// Jobs currently inside a relay call.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Jobs sitting in the buffer.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }
}

impl Shared {
    fn release(&self, jobs: usize) {
        self.outstanding.send_modify(|n| *n = n.saturating_sub(jobs));
    }

    async fn handle_jobs(self: Arc<Self>, worker_id: usize) {
        loop {
            let job = {
                let mut rx = self.rx.lock().await;
                let next = tokio::select! {
                    biased;
                    () = self.done.cancelled() => None,
                    job = rx.recv() => Some(job),
                };
                match next {
                    Some(Some(job)) => job,
                    Some(None) => return,
                    None => match self.stop_policy {
                        StopPolicy::DrainQueued => match rx.try_recv() {
                            Ok(job) => job,
                            Err(_) => {
                                trace!("Worker #{worker_id} closing. Queue drained");
                                return;
                            }
                        },
                        StopPolicy::AbandonQueued => {
                            trace!("Worker #{worker_id} closing. Not taking any more jobs");
                            return;
                        }
                    },
                }
            };
            self.dispatch(worker_id, job).await;
        }
    }

    async fn dispatch(&self, worker_id: usize, job: Job) {
        let path = job.path().to_string();
        trace!(worker_id, path = %path, "Relaying request to remote");

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let result = self.relayer.send(job).await;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.release(1);

        match result {
            Ok(()) => trace!(worker_id, path = %path, "Successfully relayed request to remote"),
            Err(e) => error!(worker_id, path = %path, "Failed to relay request: {e}"),
        }
    }

    /// Empties the buffer without relaying, releasing each job's outstanding count so a
    /// later flush cannot wait on them.
    async fn discard_queued(&self) -> usize {
        let mut rx = self.rx.lock().await;
        let mut discarded = 0;
        while let Ok(job) = rx.try_recv() {
            debug!(path = job.path(), "Discarding queued job");
            discarded += 1;
        }
        self.release(discarded);
        discarded
    }
}

#[async_trait]
impl Lifecycle for RemoteQueue {
    fn name(&self) -> &'static str {
        "queue"
    }

    async fn start(&self) -> Result<(), LifecycleError> {
        RemoteQueue::start(self);
        Ok(())
    }

    async fn stop(&self, deadline: Instant) -> Result<(), LifecycleError> {
        RemoteQueue::stop(self, deadline).await
    }
}
