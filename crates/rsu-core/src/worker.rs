// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Worker pool that decodes, filters and classifies queued telemetry.

use crate::admission::WorkItem;
use crate::message::{decode, MessageKind, V2xMessage};
use crate::metrics::{Counter, MetricsRegistry};
use crate::signal::SignalLevel;
use crate::sink::{EventRecord, SharedEventSink};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

#[derive(Debug, Clone, PartialEq)]
pub struct ProcessingSettings {
    /// Square-root iterations per message, 0 disables the synthetic workload.
    pub compute_intensity: u32,
    pub poi_x: f64,
    pub poi_y: f64,
    pub roi_radius: f64,
    pub day_speed_threshold: f64,
    pub night_speed_threshold: f64,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            compute_intensity: 0,
            poi_x: 0.0,
            poi_y: 0.0,
            roi_radius: 1000.0,
            day_speed_threshold: 5.0,
            night_speed_threshold: 15.0,
        }
    }
}

impl ProcessingSettings {
    fn speed_threshold(&self, msg: &V2xMessage) -> f64 {
        if msg.is_night() {
            self.night_speed_threshold
        } else {
            self.day_speed_threshold
        }
    }
}

/// Terminal state of a single work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    DecodeError,
    Noise,
    OutOfRange,
    Processed,
}

pub struct MessageProcessor {
    settings: ProcessingSettings,
    metrics: Arc<MetricsRegistry>,
    events: SharedEventSink,
}

impl MessageProcessor {
    pub fn new(
        settings: ProcessingSettings,
        metrics: Arc<MetricsRegistry>,
        events: SharedEventSink,
    ) -> Self {
        Self {
            settings,
            metrics,
            events,
        }
    }

    pub fn process(&self, payload: &[u8]) -> Outcome {
        let msg = match decode(payload) {
            Ok(msg) => msg,
            Err(e) => {
                self.metrics.incr(Counter::DecodeErrors);
                trace!("Discarding payload: {}", e);
                return Outcome::DecodeError;
            }
        };
        self.metrics.incr(Counter::Decoded);

        if self.settings.compute_intensity > 0 {
            synthetic_workload(payload, msg.spd, self.settings.compute_intensity);
        }

        if msg.kind == MessageKind::Noise {
            self.metrics.incr(Counter::NoiseFiltered);
            return Outcome::Noise;
        }

        if msg.distance_to(self.settings.poi_x, self.settings.poi_y) > self.settings.roi_radius {
            self.metrics.incr(Counter::RoiFiltered);
            return Outcome::OutOfRange;
        }

        self.metrics.incr(Counter::Processed);
        let signal = self.metrics.signal();

        if let Some(incident) = msg.kind.incident() {
            self.metrics.incr(Counter::Emergency);
            let details = if msg.desc.trim().is_empty() {
                incident.default_details
            } else {
                msg.desc.as_str()
            };
            let event = EventRecord::new(incident.event_type, msg.id.as_str(), msg.spd, details);
            if let Err(e) = self.events.record(&event) {
                warn!("Failed to record {} event: {}", incident.event_type, e);
            }
            signal.raise(incident.level);
        }

        if msg.spd < self.settings.speed_threshold(&msg) {
            signal.raise(SignalLevel::Congestion);
        }

        Outcome::Processed
    }
}

/// CPU-bound stand-in for per-message analytics.
fn synthetic_workload(payload: &[u8], speed: f64, intensity: u32) -> f64 {
    let digest = Sha256::digest(payload);
    let mut val = f64::from(digest[0]);
    for i in 0..intensity {
        val = (val + f64::from(i) * speed.abs()).sqrt();
    }
    std::hint::black_box(val)
}

/// Fixed set of consumer tasks sharing one queue receiver.
pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(
        count: usize,
        rx: flume::Receiver<WorkItem>,
        processor: Arc<MessageProcessor>,
    ) -> WorkerPool {
        let handles = (0..count)
            .map(|id| {
                let rx = rx.clone();
                let processor = Arc::clone(&processor);
                tokio::spawn(async move {
                    while let Ok(item) = rx.recv_async().await {
                        processor.process(&item);
                        tokio::task::yield_now().await;
                    }
                    trace!("Worker {} exiting, queue closed", id);
                })
            })
            .collect();
        debug!("Started {} workers", count);
        WorkerPool { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    /// Waits for every worker to drain the closed queue. Workers still running after `timeout`
    /// are aborted and `false` is returned.
    pub async fn drain(mut self, timeout: Duration) -> bool {
        let joined = tokio::time::timeout(timeout, async {
            for handle in self.handles.iter_mut() {
                if let Err(e) = handle.await {
                    warn!("Worker task failed: {}", e);
                }
            }
        })
        .await;

        if joined.is_err() {
            for handle in &self.handles {
                handle.abort();
            }
            return false;
        }
        true
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::admission::bounded;
    use crate::sink::testing::MemorySink;

    fn processor() -> (MessageProcessor, Arc<MetricsRegistry>, Arc<MemorySink>) {
        let metrics = Arc::new(MetricsRegistry::new());
        let events = Arc::new(MemorySink::default());
        let processor =
            MessageProcessor::new(ProcessingSettings::default(), metrics.clone(), events.clone());
        (processor, metrics, events)
    }

    #[test]
    fn test_decode_error_is_counted_separately() {
        let (processor, metrics, _) = processor();
        assert_eq!(processor.process(b"not json"), Outcome::DecodeError);
        assert_eq!(metrics.get(Counter::DecodeErrors), 1);
        assert_eq!(metrics.get(Counter::Decoded), 0);
        assert_eq!(metrics.get(Counter::RoiFiltered), 0);
    }

    #[test]
    fn test_noise_is_filtered_before_spatial_checks() {
        let (processor, metrics, _) = processor();
        let outcome = processor.process(br#"{"type":"NOISE","x":5000,"y":5000}"#);
        assert_eq!(outcome, Outcome::Noise);
        assert_eq!(metrics.get(Counter::NoiseFiltered), 1);
        assert_eq!(metrics.get(Counter::RoiFiltered), 0);
        assert_eq!(metrics.get(Counter::Processed), 0);
    }

    #[test]
    fn test_out_of_range_message_is_never_classified() {
        let (processor, metrics, events) = processor();
        let outcome =
            processor.process(br#"{"id":"far","type":"EMERGENCY","x":800,"y":800,"spd":1}"#);
        assert_eq!(outcome, Outcome::OutOfRange);
        assert_eq!(metrics.get(Counter::RoiFiltered), 1);
        assert_eq!(metrics.get(Counter::Emergency), 0);
        assert!(events.records().is_empty());
        assert_eq!(metrics.signal().peek(), SignalLevel::None);
    }

    #[test]
    fn test_message_on_radius_boundary_is_processed() {
        let (processor, metrics, _) = processor();
        // 600-800-1000 triangle: exactly the default radius from the origin.
        let outcome = processor.process(br#"{"type":"BSM","x":600,"y":800,"spd":20}"#);
        assert_eq!(outcome, Outcome::Processed);
        assert_eq!(metrics.get(Counter::RoiFiltered), 0);
        assert_eq!(metrics.get(Counter::Processed), 1);

        let outcome = processor.process(br#"{"type":"BSM","x":600,"y":800.5,"spd":20}"#);
        assert_eq!(outcome, Outcome::OutOfRange);
        assert_eq!(metrics.get(Counter::RoiFiltered), 1);
    }

    #[test]
    fn test_emergency_records_event_and_requests_preemption() {
        let (processor, metrics, events) = processor();
        let outcome =
            processor.process(br#"{"id":"amb-1","type":"EMERGENCY","x":10,"y":10,"spd":10}"#);
        assert_eq!(outcome, Outcome::Processed);
        assert_eq!(metrics.get(Counter::Emergency), 1);
        assert_eq!(metrics.signal().peek(), SignalLevel::Preemption);

        let records = events.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].event_type, "AMBULANCE_DETECTED");
        assert_eq!(records[0].subject, "amb-1");
        assert_eq!(records[0].details, "Preempt_Traffic_Light");
    }

    #[test]
    fn test_accident_and_warning_raise_congestion() {
        let (processor, metrics, events) = processor();
        processor.process(br#"{"id":"c1","type":"accident","spd":30}"#);
        assert_eq!(metrics.signal().take(), SignalLevel::Congestion);

        processor.process(br#"{"id":"c2","type":"WARNING","spd":30,"desc":"Ice on bridge"}"#);
        assert_eq!(metrics.signal().take(), SignalLevel::Congestion);

        assert_eq!(metrics.get(Counter::Emergency), 2);
        let records = events.records();
        assert_eq!(records[0].event_type, "ACCIDENT_DETECTED");
        assert_eq!(records[0].details, "Alert_Center");
        assert_eq!(records[1].event_type, "WARNING_DETECTED");
        assert_eq!(records[1].details, "Ice on bridge");
    }

    #[test]
    fn test_congestion_threshold_depends_on_environment() {
        let (processor, metrics, events) = processor();

        processor.process(br#"{"id":"d","type":"BSM","spd":10,"env":"DAY"}"#);
        assert_eq!(metrics.signal().take(), SignalLevel::None);

        processor.process(br#"{"id":"n","type":"BSM","spd":10,"env":"NIGHT"}"#);
        assert_eq!(metrics.signal().take(), SignalLevel::Congestion);

        processor.process(br#"{"id":"s","type":"BSM","spd":2}"#);
        assert_eq!(metrics.signal().take(), SignalLevel::Congestion);

        assert!(events.records().is_empty());
        assert_eq!(metrics.get(Counter::Emergency), 0);
    }

    #[test]
    fn test_congestion_never_lowers_pending_preemption() {
        let (processor, metrics, _) = processor();
        processor.process(br#"{"id":"amb","type":"EMERGENCY","spd":20}"#);
        processor.process(br#"{"id":"slow","type":"BSM","spd":1}"#);
        assert_eq!(metrics.signal().take(), SignalLevel::Preemption);
    }

    #[test]
    fn test_synthetic_workload_is_deterministic() {
        let a = synthetic_workload(b"payload", 12.0, 1_000);
        let b = synthetic_workload(b"payload", 12.0, 1_000);
        assert_eq!(a, b);
        assert!(a.is_finite());
    }

    #[test]
    fn test_compute_intensity_does_not_change_outcome() {
        let metrics = Arc::new(MetricsRegistry::new());
        let settings = ProcessingSettings {
            compute_intensity: 10_000,
            ..ProcessingSettings::default()
        };
        let processor =
            MessageProcessor::new(settings, metrics.clone(), Arc::new(MemorySink::default()));
        assert_eq!(
            processor.process(br#"{"type":"BSM","spd":20}"#),
            Outcome::Processed
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_pool_drains_queue_after_close() {
        let (processor, metrics, _) = processor();
        let (tx, rx) = bounded(2_000);
        for i in 0..1_500 {
            let item = format!(r#"{{"id":"v{i}","type":"BSM","spd":20,"x":1,"y":1}}"#);
            tx.try_send(item.into_bytes()).unwrap();
        }
        tx.try_send(b"garbage".to_vec()).unwrap();

        let pool = WorkerPool::spawn(4, rx, Arc::new(processor));
        assert_eq!(pool.len(), 4);
        drop(tx);

        assert!(pool.drain(Duration::from_secs(10)).await);
        assert_eq!(metrics.get(Counter::Decoded), 1_500);
        assert_eq!(metrics.get(Counter::DecodeErrors), 1);
        assert_eq!(metrics.get(Counter::Processed), 1_500);
    }

    #[tokio::test]
    async fn test_pool_drain_times_out_while_queue_open() {
        let (processor, _, _) = processor();
        let (_tx, rx) = bounded(4);
        let pool = WorkerPool::spawn(2, rx, Arc::new(processor));
        assert!(!pool.drain(Duration::from_millis(50)).await);
    }
}
