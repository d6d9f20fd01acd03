// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! UDP ingestion of V2X telemetry.
//!
//! The listener receives one datagram at a time into a reusable buffer, copies the payload into
//! an owned work item and hands it to admission control. Receive errors are counted and skipped
//! without logging each one, so a misbehaving sender cannot flood the log.

use crate::admission::AdmissionController;
use crate::errors::RsuError;
use crate::metrics::{Counter, MetricsRegistry};
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

pub const DEFAULT_MAX_DATAGRAM_SIZE: usize = 65_535;

/// Configuration for the ingestion socket
#[derive(Debug, Clone)]
pub struct ListenerConfig {
    /// Host to bind the UDP socket to (e.g., "0.0.0.0")
    pub host: String,
    /// Port to bind the UDP socket to, 0 for an ephemeral port
    pub port: u16,
    /// Receive buffer size; longer datagrams are truncated by the OS
    pub max_datagram_size: usize,
    /// Whether payload bytes are added to `bytes_received`
    pub count_bytes: bool,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 9999,
            max_datagram_size: DEFAULT_MAX_DATAGRAM_SIZE,
            count_bytes: true,
        }
    }
}

// BufferReader abstracts the datagram source.
enum BufferReader {
    UdpSocket(tokio::net::UdpSocket),

    /// Replays a fixed payload
    #[cfg(test)]
    MirrorTest(Vec<u8>),

    /// Fails every read
    #[cfg(test)]
    FailingTest,
}

impl BufferReader {
    /// Reads one datagram into `buf`, returning the payload length.
    async fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            BufferReader::UdpSocket(socket) => {
                let (amt, src) = socket.recv_from(buf).await?;
                trace!("Received {} bytes from {}", amt, src);
                Ok(amt)
            }
            #[cfg(test)]
            BufferReader::MirrorTest(data) => {
                let amt = data.len().min(buf.len());
                buf[..amt].copy_from_slice(&data[..amt]);
                Ok(amt)
            }
            #[cfg(test)]
            BufferReader::FailingTest => Err(io::Error::new(
                io::ErrorKind::ConnectionReset,
                "connection reset",
            )),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            BufferReader::UdpSocket(socket) => socket.local_addr().ok(),
            #[cfg(test)]
            BufferReader::MirrorTest(_) | BufferReader::FailingTest => None,
        }
    }
}

/// UDP server that feeds the admission controller.
pub struct Listener {
    cancel_token: CancellationToken,
    buffer_reader: BufferReader,
    admission: AdmissionController,
    metrics: Arc<MetricsRegistry>,
    buf: Vec<u8>,
    count_bytes: bool,
}

impl Listener {
    pub async fn bind(
        config: &ListenerConfig,
        admission: AdmissionController,
        metrics: Arc<MetricsRegistry>,
        cancel_token: CancellationToken,
    ) -> Result<Listener, RsuError> {
        let addr = format!("{}:{}", config.host, config.port);
        let socket = tokio::net::UdpSocket::bind(&addr)
            .await
            .map_err(|source| RsuError::Bind {
                role: "ingest",
                addr,
                source,
            })?;

        Ok(Listener {
            cancel_token,
            buffer_reader: BufferReader::UdpSocket(socket),
            admission,
            metrics,
            buf: vec![0; config.max_datagram_size.clamp(1, DEFAULT_MAX_DATAGRAM_SIZE)],
            count_bytes: config.count_bytes,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.buffer_reader.local_addr()
    }

    /// Main loop. Returns once the cancel token fires, dropping the admission controller and with
    /// it the producer side of the work queue.
    pub async fn spin(mut self) {
        if let Some(addr) = self.local_addr() {
            debug!("Listening for V2X telemetry on {}", addr);
        }
        loop {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                result = self.buffer_reader.read(&mut self.buf) => self.ingest(result),
            }
        }
        debug!("Ingestion listener stopped");
    }

    /// Receive and admit a single datagram.
    #[cfg(test)]
    async fn consume_datagram(&mut self) {
        let result = self.buffer_reader.read(&mut self.buf).await;
        self.ingest(result);
    }

    fn ingest(&mut self, result: io::Result<usize>) {
        match result {
            Ok(amt) => {
                self.metrics.incr(Counter::Received);
                if self.count_bytes {
                    self.metrics.add(Counter::BytesReceived, amt as u64);
                }
                let item = self.buf[..amt].to_vec();
                self.admission.admit(item);
            }
            Err(e) => {
                self.metrics.incr(Counter::ReceiveErrors);
                trace!("Receive error: {}", e);
            }
        }
    }
}
