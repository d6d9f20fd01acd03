// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Read-only HTTP status endpoint exposing cumulative counters and queue depth.

use crate::admission::QueueProbe;
use crate::errors::RsuError;
use crate::metrics::{MetricsRegistry, MetricsSnapshot};
use http_body_util::Full;
use hyper::body::Bytes;
use hyper::service::service_fn;
use hyper::{header, Method, Request, Response, StatusCode};
use std::convert::Infallible;
use std::fmt::Write as _;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error};

pub struct StatusEndpoint {
    listener: TcpListener,
    metrics: Arc<MetricsRegistry>,
    queue: QueueProbe,
}

impl StatusEndpoint {
    pub async fn bind(
        host: &str,
        port: u16,
        metrics: Arc<MetricsRegistry>,
        queue: QueueProbe,
    ) -> Result<StatusEndpoint, RsuError> {
        let addr = format!("{host}:{port}");
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| RsuError::Bind {
                role: "status",
                addr,
                source,
            })?;
        Ok(StatusEndpoint {
            listener,
            metrics,
            queue,
        })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.listener.local_addr().ok()
    }

    /// Accepts connections until the cancel token fires. In-flight connections are aborted on
    /// return.
    pub async fn serve(self, cancel_token: CancellationToken) {
        let server = hyper::server::conn::http1::Builder::new();
        let mut joinset = tokio::task::JoinSet::new();
        let metrics = self.metrics;
        let queue = self.queue;

        loop {
            let conn = tokio::select! {
                biased;
                () = cancel_token.cancelled() => break,
                con_res = self.listener.accept() => match con_res {
                    Err(e)
                        if matches!(
                            e.kind(),
                            io::ErrorKind::ConnectionAborted
                                | io::ErrorKind::ConnectionReset
                                | io::ErrorKind::ConnectionRefused
                        ) =>
                    {
                        continue;
                    }
                    Err(e) => {
                        error!("Status endpoint accept error: {e}");
                        continue;
                    }
                    Ok((conn, _)) => conn,
                },
                Some(finished) = joinset.join_next() => {
                    if let Err(e) = finished {
                        if e.is_panic() {
                            error!("Status connection handler panicked: {:?}", e);
                        }
                    }
                    continue;
                },
            };

            let conn = hyper_util::rt::TokioIo::new(conn);
            let server = server.clone();
            let metrics = Arc::clone(&metrics);
            let queue = queue.clone();
            let service = service_fn(move |req: Request<hyper::body::Incoming>| {
                let response = respond(&req, &metrics, &queue);
                async move { Ok::<_, Infallible>(response) }
            });
            joinset.spawn(async move {
                if let Err(e) = server.serve_connection(conn, service).await {
                    debug!("Status connection error: {e}");
                }
            });
        }
        joinset.abort_all();
        debug!("Status endpoint stopped");
    }
}

fn respond<B>(
    req: &Request<B>,
    metrics: &MetricsRegistry,
    queue: &QueueProbe,
) -> Response<Full<Bytes>> {
    let (status, body) = if req.method() == Method::GET {
        (
            StatusCode::OK,
            render_status(&metrics.snapshot(), queue.len(), queue.capacity()),
        )
    } else {
        (
            StatusCode::METHOD_NOT_ALLOWED,
            "Method not allowed\n".to_string(),
        )
    };

    let mut response = Response::new(Full::new(Bytes::from(body)));
    *response.status_mut() = status;
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        header::HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    if status == StatusCode::METHOD_NOT_ALLOWED {
        response
            .headers_mut()
            .insert(header::ALLOW, header::HeaderValue::from_static("GET"));
    }
    response
}

/// Plain-text rendering of every cumulative counter, one `name: value` pair per line.
pub fn render_status(
    snapshot: &MetricsSnapshot,
    queue_len: usize,
    queue_capacity: usize,
) -> String {
    let mut out = String::from("RSU Status\n");
    for (counter, value) in snapshot.iter() {
        let _ = writeln!(out, "{}: {}", counter.name(), value);
    }
    let _ = writeln!(out, "queue_len: {queue_len}");
    let _ = writeln!(out, "queue_capacity: {queue_capacity}");
    out
}
