// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::net::SocketAddr;
use std::path::PathBuf;

/// Errors that prevent the RSU services from starting or stopping cleanly.
///
/// Everything here is fatal at startup. Steady-state failures (receive errors, malformed
/// payloads, control send failures) are counted in the metrics registry instead.
#[derive(Debug, thiserror::Error)]
pub enum RsuError {
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Failed to load configuration: {0}")]
    ConfigLoad(String),

    #[error("Failed to bind {role} socket on {addr}: {source}")]
    Bind {
        role: &'static str,
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect control channel to {addr}: {source}")]
    ControlChannel {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to open log sink {}: {source}", path.display())]
    LogSink {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Shutdown timeout exceeded")]
    ShutdownTimeout,
}

/// Reasons an inbound datagram could not be turned into a V2X message.
#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("empty payload")]
    Empty,

    #[error("malformed JSON payload: {0}")]
    Json(#[from] serde_json::Error),
}
