// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Lifecycle of the RSU pipeline.
//!
//! [`RsuServices::start`] performs every fallible initialization (config validation, log sinks,
//! control socket, listener and status sockets) before spawning a single task, so a startup
//! failure never leaves half a pipeline running. [`ServicesHandle::stop`] shuts the pipeline down
//! front to back: intake first, then the workers drain what was already queued, then the
//! background loops, and finally the log sinks are flushed.

use crate::admission::{bounded, AdmissionController, QueueProbe};
use crate::config::RsuConfig;
use crate::errors::RsuError;
use crate::feedback::{ControlChannel, FeedbackLoop};
use crate::listener::Listener;
use crate::metrics::MetricsRegistry;
use crate::rate_limit::{RateLimitedSink, WindowGate};
use crate::reporter::PerformanceReporter;
use crate::sink::{EventLog, EventSink, PerformanceLog, SharedEventSink};
use crate::status::StatusEndpoint;
use crate::worker::{MessageProcessor, WorkerPool};
use rsu_metrics_collector::{default_reader, CpuStatsReader, CpuUsageSampler};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex as TokioMutex, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Status of the RSU services.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServiceStatus {
    Starting,
    Running,
    Stopping,
    Stopped,
}

struct RunningTasks {
    listener_token: CancellationToken,
    background_token: CancellationToken,
    listener: JoinHandle<()>,
    workers: WorkerPool,
    feedback: JoinHandle<()>,
    reporter: JoinHandle<()>,
    status: JoinHandle<()>,
}

/// Handle to the running pipeline.
pub struct ServicesHandle {
    status: Arc<RwLock<ServiceStatus>>,
    tasks: TokioMutex<Option<RunningTasks>>,
    metrics: Arc<MetricsRegistry>,
    queue: QueueProbe,
    event_log: Arc<EventLog>,
    perf_log: Arc<PerformanceLog>,
    listen_addr: SocketAddr,
    status_addr: SocketAddr,
    drain_timeout: Duration,
}

impl ServicesHandle {
    pub async fn is_running(&self) -> bool {
        matches!(*self.status.read().await, ServiceStatus::Running)
    }

    pub async fn status(&self) -> ServiceStatus {
        *self.status.read().await
    }

    pub fn metrics(&self) -> &Arc<MetricsRegistry> {
        &self.metrics
    }

    pub fn queue(&self) -> &QueueProbe {
        &self.queue
    }

    /// Address the telemetry socket is bound to.
    pub fn listen_addr(&self) -> SocketAddr {
        self.listen_addr
    }

    pub fn status_addr(&self) -> SocketAddr {
        self.status_addr
    }

    /// Stops the pipeline. Calling it again after a completed stop is a no-op, and a call made
    /// while another stop is in progress waits for that stop to finish.
    ///
    /// Returns [`RsuError::ShutdownTimeout`] when workers had to be aborted before the queue was
    /// drained; every other shutdown step still runs. Only the call that performed the shutdown
    /// reports it.
    pub async fn stop(&self) -> Result<(), RsuError> {
        let mut status = self.status.write().await;
        match *status {
            ServiceStatus::Stopped => return Ok(()),
            ServiceStatus::Stopping => {
                drop(status);
                // The stopping caller holds the task lock until shutdown completes.
                let _tasks = self.tasks.lock().await;
                return Ok(());
            }
            ServiceStatus::Starting | ServiceStatus::Running => {}
        }
        // Taken before releasing the status lock so a concurrent caller cannot get ahead of it.
        let mut guard = self.tasks.lock().await;
        *status = ServiceStatus::Stopping;
        drop(status);

        let mut drained = true;
        if let Some(tasks) = guard.take() {
            info!("Stopping RSU services");

            // Dropping the listener drops the admission controller and closes the queue.
            tasks.listener_token.cancel();
            if let Err(e) = tasks.listener.await {
                warn!("Listener task failed: {}", e);
            }

            drained = tasks.workers.drain(self.drain_timeout).await;
            if drained {
                debug!("Work queue drained");
            } else {
                warn!(
                    "Workers did not drain within {:?}, {} items abandoned",
                    self.drain_timeout,
                    self.queue.len()
                );
            }

            tasks.background_token.cancel();
            for (name, task) in [
                ("feedback", tasks.feedback),
                ("reporter", tasks.reporter),
                ("status", tasks.status),
            ] {
                if let Err(e) = task.await {
                    warn!("{} task failed: {}", name, e);
                }
            }

            if let Err(e) = self.event_log.flush() {
                warn!("Failed to flush event log: {}", e);
            }
            if let Err(e) = self.perf_log.flush() {
                warn!("Failed to flush performance log: {}", e);
            }
        }

        *self.status.write().await = ServiceStatus::Stopped;
        drop(guard);
        info!("RSU services stopped");
        if drained {
            Ok(())
        } else {
            Err(RsuError::ShutdownTimeout)
        }
    }
}

/// Entry point that wires the pipeline together.
pub struct RsuServices {
    config: RsuConfig,
    cpu_reader: Option<Box<dyn CpuStatsReader>>,
}

impl RsuServices {
    pub fn new(config: RsuConfig) -> Self {
        Self {
            config,
            cpu_reader: None,
        }
    }

    /// Overrides the platform CPU tick reader.
    #[must_use]
    pub fn with_cpu_reader(mut self, reader: Box<dyn CpuStatsReader>) -> Self {
        self.cpu_reader = Some(reader);
        self
    }

    pub async fn start(self) -> Result<ServicesHandle, RsuError> {
        let config = self.config;
        config.validate()?;
        let status = Arc::new(RwLock::new(ServiceStatus::Starting));

        let metrics = Arc::new(MetricsRegistry::new());
        let event_log = Arc::new(EventLog::open(&config.event_log_path)?);
        let perf_log = Arc::new(PerformanceLog::create(&config.perf_log_path)?);
        let control = ControlChannel::connect(config.control_socket_addr()?).await?;

        let (tx, rx) = bounded(config.queue_capacity);
        let queue = QueueProbe::new(rx.clone(), config.queue_capacity);
        let events: SharedEventSink = event_log.clone();
        let drop_events = Arc::new(RateLimitedSink::new(
            Arc::clone(&events),
            WindowGate::per_second(),
        ));
        let admission = AdmissionController::new(
            tx,
            config.admission_policy(),
            Arc::clone(&metrics),
            drop_events,
        );

        let listener_token = CancellationToken::new();
        let listener = Listener::bind(
            &config.listener_config(),
            admission,
            Arc::clone(&metrics),
            listener_token.clone(),
        )
        .await?;
        let status_endpoint = StatusEndpoint::bind(
            &config.status_host,
            config.status_port,
            Arc::clone(&metrics),
            queue.clone(),
        )
        .await?;
        let listen_addr = listener.local_addr().ok_or_else(|| RsuError::Bind {
            role: "ingest",
            addr: format!("{}:{}", config.listen_host, config.listen_port),
            source: std::io::Error::other("socket has no local address"),
        })?;
        let status_addr = status_endpoint.local_addr().ok_or_else(|| RsuError::Bind {
            role: "status",
            addr: format!("{}:{}", config.status_host, config.status_port),
            source: std::io::Error::other("socket has no local address"),
        })?;

        // Nothing below can fail.
        let background_token = CancellationToken::new();
        let processor = Arc::new(MessageProcessor::new(
            config.processing_settings(),
            Arc::clone(&metrics),
            Arc::clone(&events),
        ));
        let workers = WorkerPool::spawn(config.worker_count, rx, processor);

        let feedback = FeedbackLoop::new(
            control,
            config.feedback_settings(),
            Arc::clone(&metrics),
            Arc::clone(&events),
            background_token.clone(),
        );
        let reporter = PerformanceReporter::new(
            CpuUsageSampler::new(self.cpu_reader.unwrap_or_else(default_reader)),
            Arc::clone(&metrics),
            queue.clone(),
            Arc::clone(&perf_log),
            config.report_interval(),
            config.count_bytes,
        );

        let tasks = RunningTasks {
            listener_token,
            background_token: background_token.clone(),
            listener: tokio::spawn(listener.spin()),
            workers,
            feedback: tokio::spawn(feedback.run()),
            reporter: tokio::spawn(reporter.run(background_token.clone())),
            status: tokio::spawn(status_endpoint.serve(background_token)),
        };

        *status.write().await = ServiceStatus::Running;
        info!(
            "RSU core started | Listen: {} | Status: {} | Control: {} | Workers: {} | Queue: {} | Intensity: {}",
            listen_addr,
            status_addr,
            config.control_addr,
            config.worker_count,
            config.queue_capacity,
            config.compute_intensity
        );
        debug!(
            "Event log {}, performance log {}",
            event_log.path().display(),
            perf_log.path().display()
        );

        Ok(ServicesHandle {
            status,
            tasks: TokioMutex::new(Some(tasks)),
            metrics,
            queue,
            event_log,
            perf_log,
            listen_addr,
            status_addr,
            drain_timeout: config.drain_timeout(),
        })
    }
}
