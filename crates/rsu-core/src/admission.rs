// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Admission control in front of the bounded work queue.
//!
//! The listener hands every datagram to an [`AdmissionController`], which either enqueues it or
//! drops it. Drops come from two early-warning bands that shed load probabilistically as the queue
//! fills up, and from a non-blocking enqueue that fails when the queue is full. Intake never waits
//! on the workers.

use crate::metrics::{Counter, MetricsRegistry};
use crate::rate_limit::RateLimitedSink;
use crate::sink::EventRecord;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;
use tracing::debug;

/// Raw, undecoded datagram payload.
pub type WorkItem = Vec<u8>;

pub fn bounded(capacity: usize) -> (flume::Sender<WorkItem>, flume::Receiver<WorkItem>) {
    flume::bounded(capacity)
}

/// Read-only view of queue occupancy for the reporter and the status endpoint.
#[derive(Debug, Clone)]
pub struct QueueProbe {
    rx: flume::Receiver<WorkItem>,
    capacity: usize,
}

impl QueueProbe {
    pub fn new(rx: flume::Receiver<WorkItem>, capacity: usize) -> Self {
        Self { rx, capacity }
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn load(&self) -> f64 {
        occupancy(self.len(), self.capacity)
    }
}

fn occupancy(len: usize, capacity: usize) -> f64 {
    if capacity == 0 {
        1.0
    } else {
        len as f64 / capacity as f64
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DropReason {
    /// Occupancy above the critical threshold.
    Critical,
    /// Occupancy above the warning threshold (random early detection).
    Early,
    /// The queue was full when the enqueue was attempted.
    BufferFull,
}

impl DropReason {
    pub const fn as_str(self) -> &'static str {
        match self {
            DropReason::Critical => "Queue_Critical",
            DropReason::Early => "RED_Algo",
            DropReason::BufferFull => "Buffer_Full",
        }
    }

    pub const fn counter(self) -> Counter {
        match self {
            DropReason::Critical => Counter::DroppedCritical,
            DropReason::Early => Counter::DroppedEarly,
            DropReason::BufferFull => Counter::DroppedBufferFull,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AdmissionPolicy {
    pub load_warn: f64,
    pub load_crit: f64,
    pub warn_drop_probability: f64,
    pub crit_drop_probability: f64,
}

impl Default for AdmissionPolicy {
    fn default() -> Self {
        Self {
            load_warn: 0.6,
            load_crit: 0.9,
            warn_drop_probability: 0.5,
            crit_drop_probability: 0.9,
        }
    }
}

impl AdmissionPolicy {
    /// Band the given occupancy falls in, with its drop probability.
    pub fn pressure(&self, load: f64) -> Option<(DropReason, f64)> {
        if load > self.load_crit {
            Some((DropReason::Critical, self.crit_drop_probability))
        } else if load > self.load_warn {
            Some((DropReason::Early, self.warn_drop_probability))
        } else {
            None
        }
    }

    /// Early drop decision for a uniform `roll` in `[0, 1)`.
    pub fn evaluate(&self, load: f64, roll: f64) -> Option<DropReason> {
        let (reason, probability) = self.pressure(load)?;
        (roll < probability).then_some(reason)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Enqueued,
    Dropped(DropReason),
}

/// Producer side of the work queue. Dropping it closes the queue once every clone of the sender
/// is gone, which lets the workers drain and exit.
pub struct AdmissionController<R: Rng = StdRng> {
    tx: flume::Sender<WorkItem>,
    capacity: usize,
    policy: AdmissionPolicy,
    rng: R,
    metrics: Arc<MetricsRegistry>,
    drop_events: Arc<RateLimitedSink>,
}

impl AdmissionController<StdRng> {
    pub fn new(
        tx: flume::Sender<WorkItem>,
        policy: AdmissionPolicy,
        metrics: Arc<MetricsRegistry>,
        drop_events: Arc<RateLimitedSink>,
    ) -> Self {
        Self::with_rng(tx, policy, metrics, drop_events, StdRng::from_entropy())
    }
}

impl<R: Rng> AdmissionController<R> {
    pub fn with_rng(
        tx: flume::Sender<WorkItem>,
        policy: AdmissionPolicy,
        metrics: Arc<MetricsRegistry>,
        drop_events: Arc<RateLimitedSink>,
        rng: R,
    ) -> Self {
        let capacity = tx.capacity().unwrap_or(usize::MAX);
        Self {
            tx,
            capacity,
            policy,
            rng,
            metrics,
            drop_events,
        }
    }

    pub fn admit(&mut self, item: WorkItem) -> Admission {
        let load = occupancy(self.tx.len(), self.capacity);
        if let Some((reason, probability)) = self.policy.pressure(load) {
            if self.rng.gen::<f64>() < probability {
                return self.reject(reason);
            }
        }

        match self.tx.try_send(item) {
            Ok(()) => Admission::Enqueued,
            // A closed queue only happens during shutdown, account for it like a full one.
            Err(flume::TrySendError::Full(_) | flume::TrySendError::Disconnected(_)) => {
                self.reject(DropReason::BufferFull)
            }
        }
    }

    fn reject(&self, reason: DropReason) -> Admission {
        self.metrics.incr(Counter::Dropped);
        self.metrics.incr(reason.counter());

        let event = EventRecord::new("PACKET_DROP", "SYSTEM", 0.0, reason.as_str());
        if let Err(e) = self.drop_events.offer(&event) {
            debug!("Failed to record packet drop: {}", e);
        }
        Admission::Dropped(reason)
    }
}
