// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Host CPU utilization sampling
//!
//! A [`CpuStatsReader`] returns raw cumulative tick counters for the whole host. Utilization is
//! derived by [`CpuUsageSampler`] from the delta between two successive reads, so readers stay
//! stateless and can be swapped per platform.
//!
//! Platforms without a tick source get [`UnsupportedCpuStatsReader`], and the sampler reports
//! `None` instead of a misleading zero.
//!
//! [`UnsupportedCpuStatsReader`]: crate::unsupported::UnsupportedCpuStatsReader

use tracing::debug;

/// Cumulative host-wide CPU time in clock ticks
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CpuStats {
    pub idle: u64,  // Ticks spent idle or waiting on I/O
    pub total: u64, // Ticks spent in every accounted state
}

pub trait CpuStatsReader: Send + Sync {
    fn read(&self) -> Option<CpuStats>;
}

/// Returns the tick reader for the current platform.
pub fn default_reader() -> Box<dyn CpuStatsReader> {
    #[cfg(target_os = "linux")]
    {
        Box::new(crate::procfs::ProcStatReader::default())
    }
    #[cfg(not(target_os = "linux"))]
    {
        Box::new(crate::unsupported::UnsupportedCpuStatsReader)
    }
}

pub struct CpuUsageSampler {
    reader: Box<dyn CpuStatsReader>,
    previous: Option<CpuStats>,
}

impl CpuUsageSampler {
    /// Creates a sampler and takes the baseline snapshot immediately, so the first call to
    /// [`CpuUsageSampler::sample`] already covers a full interval.
    pub fn new(reader: Box<dyn CpuStatsReader>) -> Self {
        let previous = reader.read();
        if previous.is_none() {
            debug!("CPU tick source unavailable, utilization will be reported as missing");
        }
        Self { reader, previous }
    }

    /// Busy percentage (0-100) of the host since the previous call.
    ///
    /// Returns `None` when either snapshot is missing or the counters went backwards.
    pub fn sample(&mut self) -> Option<f64> {
        let current = self.reader.read();
        let usage = match (self.previous, current) {
            (Some(previous), Some(current)) => busy_percent(previous, current),
            _ => None,
        };
        self.previous = current;
        usage
    }
}

fn busy_percent(previous: CpuStats, current: CpuStats) -> Option<f64> {
    let total = current.total.checked_sub(previous.total)?;
    let idle = current.idle.checked_sub(previous.idle)?;
    if total == 0 {
        return Some(0.0);
    }
    let idle = idle.min(total);
    Some((1.0 - idle as f64 / total as f64) * 100.0)
}
