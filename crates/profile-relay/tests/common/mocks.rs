// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use async_trait::async_trait;
use profile_relay::job::Job;
use profile_relay::remote_client::{RelayError, Relayer};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::Semaphore;

/// Relayer whose calls block until the test releases them, one permit per call.
pub struct BlockingRelayer {
    gate: Semaphore,
    started: AtomicUsize,
    delivered: Mutex<Vec<Job>>,
}

impl BlockingRelayer {
    pub fn new() -> Self {
        BlockingRelayer {
            gate: Semaphore::new(0),
            started: AtomicUsize::new(0),
            delivered: Mutex::new(Vec::new()),
        }
    }

    pub fn release(&self, calls: usize) {
        self.gate.add_permits(calls);
    }

    /// Relay calls that have begun, released or not.
    pub fn started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }

    /// Relay calls that have returned.
    pub fn delivered(&self) -> usize {
        self.delivered.lock().unwrap().len()
    }

    pub fn delivered_paths(&self) -> Vec<String> {
        self.delivered
            .lock()
            .unwrap()
            .iter()
            .map(|job| job.uri.to_string())
            .collect()
    }
}

#[async_trait]
impl Relayer for BlockingRelayer {
    async fn send(&self, job: Job) -> Result<(), RelayError> {
        self.started.fetch_add(1, Ordering::SeqCst);
        self.gate.acquire().await.unwrap().forget();
        self.delivered.lock().unwrap().push(job);
        Ok(())
    }
}
