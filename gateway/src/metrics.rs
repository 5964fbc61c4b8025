//! # Prometheus Metrics
//!
//! Operational metrics for the gateway, scraped at `/metrics` on the
//! dedicated metrics port. All metrics live in a dedicated registry
//! under the `keel` namespace so they never collide with a default
//! global registry.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{Encoder, Histogram, HistogramOpts, IntCounter, IntGauge, Registry, TextEncoder};
use std::sync::Arc;

/// Holds all Prometheus metric handles for the gateway.
///
/// Clone-friendly via `Arc` in [`SharedMetrics`]; handlers record into
/// it directly.
pub struct GatewayMetrics {
    /// Registry owning every metric below.
    registry: Registry,
    /// Deposits initiated through the API.
    pub deposits_initiated_total: IntCounter,
    /// Deposits confirmed and credited.
    pub deposits_confirmed_total: IntCounter,
    /// Withdrawals reserved.
    pub withdrawals_initiated_total: IntCounter,
    /// Internal transfers reserved.
    pub transfers_initiated_total: IntCounter,
    /// Stake / unstake / claim operations executed.
    pub staking_operations_total: IntCounter,
    /// Requests rejected with a client error (validation, funds,
    /// rate limit, capacity).
    pub requests_rejected_total: IntCounter,
    /// Finalize jobs currently awaiting settlement. Refreshed on scrape.
    pub pending_finalize_jobs: IntGauge,
    /// Latency of settlement-engine operations, seconds.
    pub operation_latency_seconds: Histogram,
}

impl GatewayMetrics {
    /// Creates and registers all metrics. Call once at startup.
    pub fn new() -> Self {
        let registry = Registry::new_custom(Some("keel".into()), None)
            .expect("failed to create prometheus registry");

        fn counter(registry: &Registry, name: &str, help: &str) -> IntCounter {
            let c = IntCounter::new(name, help).expect("metric creation");
            registry.register(Box::new(c.clone())).expect("metric registration");
            c
        }

        let deposits_initiated_total = counter(
            &registry,
            "deposits_initiated_total",
            "Deposits initiated through the API",
        );
        let deposits_confirmed_total = counter(
            &registry,
            "deposits_confirmed_total",
            "Deposits confirmed and credited",
        );
        let withdrawals_initiated_total = counter(
            &registry,
            "withdrawals_initiated_total",
            "Withdrawals reserved for settlement",
        );
        let transfers_initiated_total = counter(
            &registry,
            "transfers_initiated_total",
            "Internal transfers reserved",
        );
        let staking_operations_total = counter(
            &registry,
            "staking_operations_total",
            "Stake, unstake, and claim operations executed",
        );
        let requests_rejected_total = counter(
            &registry,
            "requests_rejected_total",
            "Requests rejected with a client-side error",
        );

        let pending_finalize_jobs = IntGauge::new(
            "pending_finalize_jobs",
            "Finalize jobs currently awaiting settlement",
        )
        .expect("metric creation");
        registry
            .register(Box::new(pending_finalize_jobs.clone()))
            .expect("metric registration");

        let operation_latency_seconds = Histogram::with_opts(
            HistogramOpts::new(
                "operation_latency_seconds",
                "Settlement-engine operation latency in seconds",
            )
            .buckets(vec![0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0]),
        )
        .expect("metric creation");
        registry
            .register(Box::new(operation_latency_seconds.clone()))
            .expect("metric registration");

        Self {
            registry,
            deposits_initiated_total,
            deposits_confirmed_total,
            withdrawals_initiated_total,
            transfers_initiated_total,
            staking_operations_total,
            requests_rejected_total,
            pending_finalize_jobs,
            operation_latency_seconds,
        }
    }

    /// Encodes all registered metrics in the Prometheus text format.
    pub fn encode(&self) -> Result<String, prometheus::Error> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&families, &mut buffer)?;
        Ok(String::from_utf8(buffer).expect("prometheus output is valid utf-8"))
    }
}

impl Default for GatewayMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Shared metrics handle passed to handlers via state.
pub type SharedMetrics = Arc<GatewayMetrics>;

/// Axum handler rendering `/metrics`. Refreshes scrape-time gauges from
/// the engine before encoding.
pub async fn metrics_handler(
    axum::extract::State(state): axum::extract::State<crate::api::AppState>,
) -> impl IntoResponse {
    let snapshot = state.engine.status_snapshot();
    state
        .metrics
        .pending_finalize_jobs
        .set(snapshot.pending_finalize as i64);

    match state.metrics.encode() {
        Ok(body) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!("failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, "metrics encoding failed").into_response()
        }
    }
}
