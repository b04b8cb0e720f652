//! Prometheus metrics for the fan-in barrier.
//!
//! Recorders are plain functions over the `metrics` facade; without an
//! installed recorder they are no-ops, so the barrier can always call them.
//!
//! # Example
//!
//! ```rust,no_run
//! use fanin_runtime::metrics::MetricsServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut server = MetricsServer::new("0.0.0.0:9090".parse()?);
//! server.start()?;
//! // Scrape http://0.0.0.0:9090/metrics
//! # Ok(())
//! # }
//! ```

use metrics::{describe_counter, describe_histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;

pub use metrics::{counter, histogram};

/// Errors from metrics operations.
#[derive(Error, Debug)]
pub enum MetricsError {
    /// Failed to build metrics exporter or its listener
    #[error("Failed to build metrics exporter: {0}")]
    Build(String),
}

/// Prometheus metrics exporter serving scrapes over HTTP on `addr`.
pub struct MetricsServer {
    addr: SocketAddr,
    handle: Option<PrometheusHandle>,
}

impl MetricsServer {
    /// Create a new metrics server for `addr`.
    #[must_use]
    pub const fn new(addr: SocketAddr) -> Self {
        Self { addr, handle: None }
    }

    /// Register metric descriptions, install the Prometheus recorder and
    /// start serving it on `addr`.
    ///
    /// Must be called from within a Tokio runtime; the HTTP listener runs as
    /// a spawned task.
    ///
    /// # Errors
    ///
    /// Returns `MetricsError::Build` if the exporter configuration is invalid
    /// or the listener cannot be set up. A recorder that is already installed
    /// is tolerated: nothing is served and [`MetricsServer::render`] returns
    /// `None`.
    pub fn start(&mut self) -> Result<(), MetricsError> {
        register_metrics();

        let (recorder, exporter) = PrometheusBuilder::new()
            .with_http_listener(self.addr)
            .set_buckets_for_metric(
                Matcher::Suffix("duration_seconds".to_string()),
                &[0.0005, 0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5],
            )
            .map_err(|e| MetricsError::Build(e.to_string()))?
            .build()
            .map_err(|e| MetricsError::Build(e.to_string()))?;
        let handle = recorder.handle();

        if metrics::set_global_recorder(recorder).is_err() {
            tracing::warn!("Metrics recorder already initialized, skipping re-initialization");
            return Ok(());
        }

        let addr = self.addr;
        tokio::spawn(async move {
            if let Err(_e) = exporter.await {
                // ExporterError (metrics-exporter-prometheus 0.15) implements neither Debug nor Display.
                tracing::error!(addr = %addr, "Metrics listener stopped");
            }
        });
        self.handle = Some(handle);
        tracing::info!(
            addr = %self.addr,
            "Metrics server started - available at http://{}/metrics",
            self.addr
        );
        Ok(())
    }

    /// Address scrapes are served on.
    #[must_use]
    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Render current metrics in Prometheus text format.
    ///
    /// Returns `None` if this server did not install the recorder.
    #[must_use]
    pub fn render(&self) -> Option<String> {
        self.handle.as_ref().map(PrometheusHandle::render)
    }
}

fn register_metrics() {
    describe_counter!(
        "fanin_arrivals_total",
        "Branch arrivals processed, labelled by outcome"
    );
    describe_histogram!(
        "fanin_record_duration_seconds",
        "Time taken to record one branch arrival, including conflict retries"
    );
    describe_counter!(
        "fanin_cas_conflicts_total",
        "Compare-and-set conflicts observed while recording arrivals"
    );
    describe_counter!(
        "fanin_completions_total",
        "Instances that transitioned to completed"
    );
    describe_counter!(
        "fanin_emissions_total",
        "Merged event publish attempts, labelled by result"
    );
    describe_counter!(
        "fanin_errors_total",
        "Barrier errors, labelled by kind"
    );
    describe_histogram!(
        "fanin_store_write_duration_seconds",
        "Time taken by one instance store compare-and-set write"
    );
    describe_counter!("retry_attempts_total", "Total number of retry attempts");
    describe_counter!("retry_successes_total", "Operations that succeeded after retrying");
    describe_counter!("retry_exhausted_total", "Operations that exhausted their retries");
}

/// Barrier metrics recorder.
pub struct BarrierMetrics;

impl BarrierMetrics {
    /// Record a processed arrival and how long it took.
    pub fn record_arrival(outcome: &'static str, duration: Duration) {
        counter!("fanin_arrivals_total", "outcome" => outcome).increment(1);
        histogram!("fanin_record_duration_seconds").record(duration.as_secs_f64());
    }

    /// Record a compare-and-set conflict.
    pub fn record_conflict() {
        counter!("fanin_cas_conflicts_total").increment(1);
    }

    /// Record an `Open → Completed` transition.
    pub fn record_completion(workflow_type: &str) {
        counter!("fanin_completions_total", "workflow_type" => workflow_type.to_string())
            .increment(1);
    }

    /// Record a merged-event publish attempt.
    pub fn record_emission(succeeded: bool) {
        let result = if succeeded { "ok" } else { "failed" };
        counter!("fanin_emissions_total", "result" => result).increment(1);
    }

    /// Record a barrier error.
    pub fn record_error(kind: &'static str) {
        counter!("fanin_errors_total", "kind" => kind).increment(1);
    }
}

/// Retry metrics recorder.
pub struct RetryMetrics;

impl RetryMetrics {
    /// Record a retry attempt.
    pub fn record_attempt() {
        counter!("retry_attempts_total").increment(1);
    }

    /// Record a successful retry.
    pub fn record_success() {
        counter!("retry_successes_total").increment(1);
    }

    /// Record exhausted retries.
    pub fn record_exhausted() {
        counter!("retry_exhausted_total").increment(1);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::panic)] // Test code can use unwrap
mod tests {
    use super::*;

    #[test]
    fn server_starts_without_handle() {
        let server = MetricsServer::new("127.0.0.1:0".parse().unwrap());
        assert!(server.render().is_none());
    }

    async fn scrape(addr: SocketAddr) -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        for _ in 0..50 {
            if let Ok(mut conn) = tokio::net::TcpStream::connect(addr).await {
                conn.write_all(b"GET /metrics HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
                    .await
                    .unwrap();
                let mut body = String::new();
                conn.read_to_string(&mut body).await.unwrap();
                return body;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        panic!("metrics listener never came up on {addr}");
    }

    #[tokio::test]
    async fn started_server_serves_scrapes_on_its_address() {
        let addr = std::net::TcpListener::bind("127.0.0.1:0")
            .unwrap()
            .local_addr()
            .unwrap();
        let mut server = MetricsServer::new(addr);

        server.start().unwrap();
        BarrierMetrics::record_conflict();

        assert!(server.render().unwrap().contains("fanin_cas_conflicts_total"));
        assert!(scrape(addr).await.contains("fanin_cas_conflicts_total"));
    }

    #[test]
    fn recorders_are_noops_without_exporter() {
        BarrierMetrics::record_arrival("awaiting_more", Duration::from_millis(1));
        BarrierMetrics::record_conflict();
        BarrierMetrics::record_completion("order-processing");
        BarrierMetrics::record_emission(true);
        BarrierMetrics::record_error("unknown_branch_tag");
        RetryMetrics::record_attempt();
    }
}
