// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process-wide pipeline counters.
//!
//! The registry is built once at startup and shared through an `Arc`. Each counter is an
//! independent atomic: increments are never lost, but a snapshot taken while the pipeline is busy
//! may show small skew between counters.

use crate::signal::SharedSignal;
use std::sync::atomic::{AtomicU64, Ordering};

const COUNTER_COUNT: usize = 16;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    Received,
    BytesReceived,
    ReceiveErrors,
    Decoded,
    DecodeErrors,
    Processed,
    Dropped,
    DroppedCritical,
    DroppedEarly,
    DroppedBufferFull,
    NoiseFiltered,
    RoiFiltered,
    Emergency,
    ControlAttempts,
    ControlSent,
    ControlFailures,
}

impl Counter {
    pub const ALL: [Counter; COUNTER_COUNT] = [
        Counter::Received,
        Counter::BytesReceived,
        Counter::ReceiveErrors,
        Counter::Decoded,
        Counter::DecodeErrors,
        Counter::Processed,
        Counter::Dropped,
        Counter::DroppedCritical,
        Counter::DroppedEarly,
        Counter::DroppedBufferFull,
        Counter::NoiseFiltered,
        Counter::RoiFiltered,
        Counter::Emergency,
        Counter::ControlAttempts,
        Counter::ControlSent,
        Counter::ControlFailures,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Counter::Received => "received",
            Counter::BytesReceived => "bytes_received",
            Counter::ReceiveErrors => "receive_errors",
            Counter::Decoded => "decoded",
            Counter::DecodeErrors => "decode_errors",
            Counter::Processed => "processed",
            Counter::Dropped => "dropped",
            Counter::DroppedCritical => "dropped_critical",
            Counter::DroppedEarly => "dropped_early",
            Counter::DroppedBufferFull => "dropped_buffer_full",
            Counter::NoiseFiltered => "noise_filtered",
            Counter::RoiFiltered => "roi_filtered",
            Counter::Emergency => "emergency",
            Counter::ControlAttempts => "control_attempts",
            Counter::ControlSent => "control_sent",
            Counter::ControlFailures => "control_failures",
        }
    }

    const fn index(self) -> usize {
        self as usize
    }
}

#[derive(Debug, Default)]
pub struct MetricsRegistry {
    counters: [AtomicU64; COUNTER_COUNT],
    signal: SharedSignal,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn incr(&self, counter: Counter) {
        self.add(counter, 1);
    }

    #[inline]
    pub fn add(&self, counter: Counter, value: u64) {
        self.counters[counter.index()].fetch_add(value, Ordering::Relaxed);
    }

    pub fn get(&self, counter: Counter) -> u64 {
        self.counters[counter.index()].load(Ordering::Relaxed)
    }

    pub fn signal(&self) -> &SharedSignal {
        &self.signal
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        let mut values = [0; COUNTER_COUNT];
        for counter in Counter::ALL {
            values[counter.index()] = self.get(counter);
        }
        MetricsSnapshot { values }
    }
}

/// Point-in-time copy of every counter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    values: [u64; COUNTER_COUNT],
}

impl MetricsSnapshot {
    pub fn get(&self, counter: Counter) -> u64 {
        self.values[counter.index()]
    }

    /// Per-counter increase since `previous`.
    pub fn delta_since(&self, previous: &MetricsSnapshot) -> MetricsSnapshot {
        let mut values = [0; COUNTER_COUNT];
        for (i, value) in values.iter_mut().enumerate() {
            *value = self.values[i].saturating_sub(previous.values[i]);
        }
        MetricsSnapshot { values }
    }

    pub fn iter(&self) -> impl Iterator<Item = (Counter, u64)> + '_ {
        Counter::ALL.into_iter().map(|counter| (counter, self.get(counter)))
    }
}
