// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Roadside-unit edge core: V2X telemetry ingestion, admission control, classification and
//! traffic-control feedback.

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

pub mod admission;
pub mod config;
pub mod errors;
pub mod feedback;
pub mod listener;
pub mod message;
pub mod metrics;
pub mod rate_limit;
pub mod reporter;
pub mod services;
pub mod signal;
pub mod sink;
pub mod status;
pub mod worker;

pub use config::RsuConfig;
pub use errors::{DecodeError, RsuError};
pub use metrics::{Counter, MetricsRegistry, MetricsSnapshot};
pub use services::{RsuServices, ServiceStatus, ServicesHandle};
pub use signal::SignalLevel;
