// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Traffic-control feedback.
//!
//! The feedback loop periodically takes the shared signal level and turns it into fire-and-forget
//! UDP commands for the downstream controller. A preemption request wakes the loop immediately
//! instead of waiting for the next tick. Failed sends are logged and counted, never retried.

use crate::errors::RsuError;
use crate::message::ControlCommand;
use crate::metrics::{Counter, MetricsRegistry};
use crate::signal::SignalLevel;
use crate::sink::{EventRecord, SharedEventSink};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug)]
pub enum ShippingError {
    Payload(String),
    Destination(SocketAddr, std::io::Error),
}

impl fmt::Display for ShippingError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ShippingError::Payload(msg) => write!(f, "failed to encode command: {msg}"),
            ShippingError::Destination(addr, e) => write!(f, "failed to send to {addr}: {e}"),
        }
    }
}

/// Connected UDP socket to the traffic controller.
#[derive(Debug)]
pub struct ControlChannel {
    socket: UdpSocket,
    peer: SocketAddr,
}

impl ControlChannel {
    pub async fn connect(peer: SocketAddr) -> Result<ControlChannel, RsuError> {
        let local: SocketAddr = if peer.is_ipv4() {
            SocketAddr::from(([0, 0, 0, 0], 0))
        } else {
            SocketAddr::from(([0u16; 8], 0))
        };
        let control_error = |source| RsuError::ControlChannel { addr: peer, source };

        let socket = UdpSocket::bind(local).await.map_err(control_error)?;
        socket.connect(peer).await.map_err(control_error)?;
        Ok(ControlChannel { socket, peer })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer
    }

    pub async fn send(&self, command: &ControlCommand) -> Result<(), ShippingError> {
        let payload = command
            .encode()
            .map_err(|e| ShippingError::Payload(e.to_string()))?;
        self.socket
            .send(&payload)
            .await
            .map_err(|e| ShippingError::Destination(self.peer, e))?;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FeedbackSettings {
    pub interval: Duration,
    /// Pause between the two commands of a congestion response.
    pub control_spacing: Duration,
}

impl Default for FeedbackSettings {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(1),
            control_spacing: Duration::from_millis(100),
        }
    }
}

pub struct FeedbackLoop {
    channel: ControlChannel,
    settings: FeedbackSettings,
    metrics: Arc<MetricsRegistry>,
    events: SharedEventSink,
    cancel_token: CancellationToken,
}

impl FeedbackLoop {
    pub fn new(
        channel: ControlChannel,
        settings: FeedbackSettings,
        metrics: Arc<MetricsRegistry>,
        events: SharedEventSink,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            channel,
            settings,
            metrics,
            events,
            cancel_token,
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.settings.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        ticker.tick().await;

        debug!(
            "Feedback loop sending to {} every {:?}",
            self.channel.peer_addr(),
            self.settings.interval
        );
        loop {
            tokio::select! {
                biased;
                () = self.cancel_token.cancelled() => break,
                () = self.metrics.signal().preempted() => {}
                _ = ticker.tick() => {}
            }
            let level = self.metrics.signal().take();
            self.act(level).await;
        }
        debug!("Feedback loop stopped");
    }

    /// Sends the commands for `level` and returns how many were delivered to the socket.
    pub async fn act(&self, level: SignalLevel) -> usize {
        let commands = ControlCommand::for_level(level);
        match level {
            SignalLevel::Preemption => info!("Emergency vehicle detected, preempting signals"),
            SignalLevel::Congestion => {
                info!("Congestion detected, lowering speed limit and flushing traffic")
            }
            SignalLevel::None => return 0,
        }

        let mut sent = 0;
        for (i, command) in commands.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.settings.control_spacing).await;
            }
            if self.dispatch(command).await {
                sent += 1;
            }
        }
        sent
    }

    async fn dispatch(&self, command: &ControlCommand) -> bool {
        self.metrics.incr(Counter::ControlAttempts);
        match self.channel.send(command).await {
            Ok(()) => {
                self.metrics.incr(Counter::ControlSent);
                let event = EventRecord::new("CONTROL_SENT", "SYSTEM", 0.0, command.to_string());
                if let Err(e) = self.events.record(&event) {
                    warn!("Failed to record control event: {}", e);
                }
                true
            }
            Err(e) => {
                self.metrics.incr(Counter::ControlFailures);
                warn!("Control command {} not delivered: {}", command, e);
                false
            }
        }
    }
}
