//! Prometheus metrics and health endpoint
//!
//! Serves `/metrics` and `/health` over HTTP with axum.

use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use blind_relay_core::{FramedConnection, Relay};
use std::net::SocketAddr;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Content type of the Prometheus text exposition format
const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Metrics server errors
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Render relay state in the Prometheus text exposition format
pub fn render<C: FramedConnection>(relay: &Relay<C>) -> String {
    let stats = relay.stats();
    let mut out = String::new();

    let mut gauge = |name: &str, help: &str, value: usize| {
        out.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} gauge\n{name} {value}\n"
        ));
    };
    gauge(
        "blind_relay_active_sessions",
        "Sessions currently forwarding",
        relay.active_sessions(),
    );
    gauge(
        "blind_relay_pending_sessions",
        "Sessions waiting for a peer",
        relay.pending_sessions(),
    );

    let counters = [
        ("blind_relay_sessions_opened_total", "Sessions created by a first connection", stats.sessions_opened),
        ("blind_relay_sessions_paired_total", "Sessions that found their peer", stats.sessions_paired),
        ("blind_relay_sessions_closed_total", "Paired sessions torn down", stats.sessions_closed),
        ("blind_relay_duplicate_rejections_total", "Connections refused for an already paired identifier", stats.duplicate_rejections),
        ("blind_relay_pairing_timeouts_total", "Sessions that expired without a peer", stats.pairing_timeouts),
        ("blind_relay_abandoned_waits_total", "Initiators that disconnected before a peer arrived", stats.abandoned_waits),
        ("blind_relay_forwarding_errors_total", "Sessions torn down by an I/O failure", stats.forwarding_errors),
        ("blind_relay_capacity_rejections_total", "Connections refused because the relay was full", stats.capacity_rejections),
        ("blind_relay_frames_forwarded_total", "Frames relayed between peers", stats.frames_forwarded),
        ("blind_relay_bytes_forwarded_total", "Payload bytes relayed between peers", stats.bytes_forwarded),
    ];
    for (name, help, value) in counters {
        out.push_str(&format!(
            "# HELP {name} {help}\n# TYPE {name} counter\n{name} {value}\n"
        ));
    }

    out
}

/// Routes served by the metrics server
pub fn router<C: FramedConnection>(relay: Relay<C>) -> Router {
    Router::new()
        .route("/metrics", get(metrics::<C>))
        .route("/health", get(health))
        .with_state(relay)
}

async fn metrics<C: FramedConnection>(State(relay): State<Relay<C>>) -> impl IntoResponse {
    ([(header::CONTENT_TYPE, PROMETHEUS_CONTENT_TYPE)], render(&relay))
}

async fn health() -> &'static str {
    "Healthy\n"
}

/// Running metrics server
pub struct MetricsServer {
    local_addr: SocketAddr,
    stop: CancellationToken,
    task: JoinHandle<()>,
}

impl MetricsServer {
    /// Bind `addr` and serve metrics for `relay`
    ///
    /// Port 0 binds an ephemeral port; see `local_addr`.
    pub async fn start<C: FramedConnection>(
        addr: SocketAddr,
        relay: Relay<C>,
    ) -> Result<Self, MetricsError> {
        let listener = TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        let stop = CancellationToken::new();

        let app = router(relay);
        let shutdown = stop.clone().cancelled_owned();
        let task = tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app)
                .with_graceful_shutdown(shutdown)
                .await
            {
                warn!("Metrics server failed: {}", e);
            }
            debug!("Metrics server stopped");
        });

        info!(
            "Prometheus metrics server is listening at http://{}",
            local_addr
        );
        Ok(Self {
            local_addr,
            stop,
            task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Stop accepting and wait for in-flight requests
    pub async fn close(self) {
        self.stop.cancel();
        if let Err(e) = self.task.await {
            warn!("Metrics server ended abnormally: {}", e);
        }
    }
}
