// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod controller;
pub mod http_utils;
pub mod job;
pub mod lifecycle;
pub mod orchestrator;
pub mod remote_client;
pub mod remote_queue;
pub mod self_profiler;
pub mod server;
pub mod session;
