// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Periodic performance reporting.
//!
//! Every interval the reporter samples host CPU, diffs the counter snapshot against the previous
//! one, appends a row to the performance log and emits a one-line status.

use crate::admission::QueueProbe;
use crate::metrics::{Counter, MetricsRegistry, MetricsSnapshot};
use crate::sink::{PerfRow, PerformanceLog};
use rsu_metrics_collector::CpuUsageSampler;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub struct PerformanceReporter {
    sampler: CpuUsageSampler,
    metrics: Arc<MetricsRegistry>,
    queue: QueueProbe,
    log: Arc<PerformanceLog>,
    interval: Duration,
    count_bytes: bool,
    previous: MetricsSnapshot,
    previous_at: Instant,
}

impl PerformanceReporter {
    pub fn new(
        sampler: CpuUsageSampler,
        metrics: Arc<MetricsRegistry>,
        queue: QueueProbe,
        log: Arc<PerformanceLog>,
        interval: Duration,
        count_bytes: bool,
    ) -> Self {
        let previous = metrics.snapshot();
        Self {
            sampler,
            metrics,
            queue,
            log,
            interval,
            count_bytes,
            previous,
            previous_at: Instant::now(),
        }
    }

    pub async fn run(mut self, cancel_token: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                _ = ticker.tick() => {
                    self.report_once();
                }
            }
        }
        debug!("Performance reporter stopped");
    }

    /// Takes one sample, appends it to the performance log and returns it.
    pub fn report_once(&mut self) -> PerfRow {
        let now = Instant::now();
        let elapsed = now.duration_since(self.previous_at);
        let snapshot = self.metrics.snapshot();
        let delta = snapshot.delta_since(&self.previous);
        self.previous = snapshot;
        self.previous_at = now;

        let row = build_row(
            &delta,
            elapsed,
            self.sampler.sample(),
            self.queue.len(),
            self.count_bytes,
        );
        if let Err(e) = self.log.append(&row) {
            warn!("Failed to append performance row: {}", e);
        }
        info!("{}", status_line(&row));
        row
    }
}

fn build_row(
    delta: &MetricsSnapshot,
    elapsed: Duration,
    cpu_usage: Option<f64>,
    queue_len: usize,
    count_bytes: bool,
) -> PerfRow {
    // Guard against a zero interval when two samples land on the same instant.
    let seconds = elapsed.as_secs_f64().max(0.001);
    let rate = |counter: Counter| (delta.get(counter) as f64 / seconds).round() as u64;

    PerfRow {
        cpu_usage,
        in_rate: rate(Counter::Received),
        bandwidth_mbps: count_bytes
            .then(|| delta.get(Counter::BytesReceived) as f64 * 8.0 / 1_000_000.0 / seconds),
        decode_rate: rate(Counter::Decoded),
        decode_error_rate: rate(Counter::DecodeErrors),
        process_rate: rate(Counter::Processed),
        drop_rate: rate(Counter::Dropped),
        queue_len,
        emergency_rate: rate(Counter::Emergency),
        control_rate: rate(Counter::ControlSent),
    }
}

fn status_line(row: &PerfRow) -> String {
    let cpu = row
        .cpu_usage
        .map_or_else(|| "NA".to_string(), |cpu| format!("{cpu:.1}%"));
    format!(
        "CPU: {} | In: {}/s | Drop: {}/s | Q: {} | Emerg: {}/s | Ctrl: {}/s",
        cpu, row.in_rate, row.drop_rate, row.queue_len, row.emergency_rate, row.control_rate
    )
}
