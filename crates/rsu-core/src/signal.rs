// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Shared traffic-control signal.
//!
//! Workers raise the level when they observe something action-worthy and the feedback loop
//! reads-and-resets it. Writers merge with an atomic max, so a congestion report can never
//! overwrite a pending preemption before the feedback loop has acted on it.

use std::sync::atomic::{AtomicU8, Ordering};
use tokio::sync::Notify;

/// Highest-priority unacknowledged condition, ordered by priority.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum SignalLevel {
    None = 0,
    /// Slow traffic, accident or warning: reduce speed limit and flush traffic.
    Congestion = 1,
    /// Emergency vehicle: preempt signals for a green wave.
    Preemption = 2,
}

impl SignalLevel {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => SignalLevel::None,
            1 => SignalLevel::Congestion,
            _ => SignalLevel::Preemption,
        }
    }
}

#[derive(Debug, Default)]
pub struct SharedSignal {
    level: AtomicU8,
    preempt: Notify,
}

impl SharedSignal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Raises the level to at least `level`. Never lowers it.
    ///
    /// The transition into [`SignalLevel::Preemption`] wakes the feedback loop so it does not
    /// wait for its next tick.
    pub fn raise(&self, level: SignalLevel) {
        if level == SignalLevel::None {
            return;
        }
        let previous = self.level.fetch_max(level as u8, Ordering::AcqRel);
        if level == SignalLevel::Preemption && previous < SignalLevel::Preemption as u8 {
            self.preempt.notify_one();
        }
    }

    pub fn peek(&self) -> SignalLevel {
        SignalLevel::from_raw(self.level.load(Ordering::Acquire))
    }

    /// Atomically reads the current level and resets it to [`SignalLevel::None`].
    pub fn take(&self) -> SignalLevel {
        SignalLevel::from_raw(self.level.swap(SignalLevel::None as u8, Ordering::AcqRel))
    }

    /// Completes once a preemption has been raised since the last wake-up.
    pub async fn preempted(&self) {
        self.preempt.notified().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_raise_keeps_maximum() {
        let signal = SharedSignal::new();
        signal.raise(SignalLevel::Preemption);
        signal.raise(SignalLevel::Congestion);
        signal.raise(SignalLevel::None);
        assert_eq!(signal.peek(), SignalLevel::Preemption);
    }

    #[test]
    fn test_take_resets_level() {
        let signal = SharedSignal::new();
        signal.raise(SignalLevel::Congestion);
        assert_eq!(signal.take(), SignalLevel::Congestion);
        assert_eq!(signal.take(), SignalLevel::None);
        assert_eq!(signal.peek(), SignalLevel::None);
    }

    #[test]
    fn test_concurrent_writers_never_lose_preemption() {
        let signal = Arc::new(SharedSignal::new());
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let signal = Arc::clone(&signal);
                std::thread::spawn(move || {
                    for _ in 0..1_000 {
                        if i == 0 {
                            signal.raise(SignalLevel::Preemption);
                        } else {
                            signal.raise(SignalLevel::Congestion);
                        }
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(signal.take(), SignalLevel::Preemption);
    }

    #[tokio::test]
    async fn test_preemption_wakes_waiter() {
        let signal = Arc::new(SharedSignal::new());
        let waiter = {
            let signal = Arc::clone(&signal);
            tokio::spawn(async move { signal.preempted().await })
        };
        signal.raise(SignalLevel::Preemption);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("waiter should be woken")
            .unwrap();
    }

    #[tokio::test]
    async fn test_congestion_does_not_wake_waiter() {
        let signal = SharedSignal::new();
        signal.raise(SignalLevel::Congestion);
        let woken = tokio::time::timeout(Duration::from_millis(50), signal.preempted()).await;
        assert!(woken.is_err());
    }
}
