// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Time-window gating for event records that would otherwise flood the log.

use crate::sink::{EventRecord, SharedEventSink};
use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::trace;

/// Admits at most one caller per wall-clock window.
///
/// Windows are aligned to the Unix epoch, so a one-second gate opens once per calendar second.
/// The gate only moves forward: a caller carrying an older timestamp than the latest admitted one
/// is rejected.
#[derive(Debug)]
pub struct WindowGate {
    window_ms: u64,
    // Index of the last admitted window plus one, zero before the first admission.
    next: AtomicU64,
}

impl WindowGate {
    pub fn new(window: Duration) -> Self {
        Self {
            window_ms: u64::try_from(window.as_millis()).unwrap_or(u64::MAX).max(1),
            next: AtomicU64::new(0),
        }
    }

    pub fn per_second() -> Self {
        Self::new(Duration::from_secs(1))
    }

    pub fn try_acquire(&self) -> bool {
        self.try_acquire_at(SystemTime::now())
    }

    pub fn try_acquire_at(&self, now: SystemTime) -> bool {
        let elapsed_ms = now
            .duration_since(UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            .unwrap_or(0);
        let marker = (elapsed_ms / self.window_ms).saturating_add(1);
        self.next.fetch_max(marker, Ordering::AcqRel) < marker
    }
}

/// Wraps any [`crate::sink::EventSink`] and forwards at most one record per gate window.
pub struct RateLimitedSink {
    inner: SharedEventSink,
    gate: WindowGate,
    suppressed: AtomicU64,
}

impl RateLimitedSink {
    pub fn new(inner: SharedEventSink, gate: WindowGate) -> Self {
        Self {
            inner,
            gate,
            suppressed: AtomicU64::new(0),
        }
    }

    /// Offers a record. Returns whether it was forwarded to the inner sink.
    pub fn offer(&self, event: &EventRecord) -> io::Result<bool> {
        self.offer_at(event, SystemTime::now())
    }

    pub fn offer_at(&self, event: &EventRecord, now: SystemTime) -> io::Result<bool> {
        if !self.gate.try_acquire_at(now) {
            self.suppressed.fetch_add(1, Ordering::Relaxed);
            return Ok(false);
        }
        let suppressed = self.suppressed.swap(0, Ordering::Relaxed);
        if suppressed > 0 {
            trace!("Suppressed {} {} records", suppressed, event.event_type);
        }
        self.inner.record(event)?;
        Ok(true)
    }

    /// Records suppressed since the last forwarded one.
    pub fn suppressed(&self) -> u64 {
        self.suppressed.load(Ordering::Relaxed)
    }
}
