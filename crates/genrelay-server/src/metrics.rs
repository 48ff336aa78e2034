//! Prometheus metrics for the generation pipeline.
//!
//! Every [`GatewayMetrics`] owns its own [`Registry`], so tests can build
//! isolated instances and assert on them.
//!
//! | Metric | Type | Labels |
//! |--------|------|--------|
//! | `genrelay_http_request_duration_seconds` | Histogram | `method`, `route`, `status` |
//! | `genrelay_pending_jobs` | Gauge | |
//! | `genrelay_pool_queue_depth` | Gauge | |
//! | `genrelay_pool_busy_workers` | Gauge | |
//! | `genrelay_broadcast_queue_depth` | Gauge | |
//! | `genrelay_broadcast_fps` | Gauge | |
//! | `genrelay_frames_dropped_total` | Counter | `reason` |
//! | `genrelay_ws_connections` | Gauge | |
//! | `genrelay_jobs_submitted_total` | Counter | `mode` |
//! | `genrelay_jobs_rejected_total` | Counter | `reason` |
//! | `genrelay_jobs_resolved_total` | Counter | `outcome` |
//! | `genrelay_dead_letters_total` | Counter | `reason` |
//! | `genrelay_duplicate_results_total` | Counter | |
//! | `genrelay_ready` | Gauge | |

use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{MatchedPath, Request, State},
    middleware::Next,
    response::Response,
};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use thiserror::Error;

/// Latency buckets in seconds; generation requests can wait up to the job timeout
pub const REQUEST_LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Errors that can occur during metrics operations.
#[derive(Debug, Error)]
pub enum MetricsError {
    #[error("failed to register metric: {0}")]
    RegistrationFailed(#[from] prometheus::Error),

    #[error("failed to encode metrics: {0}")]
    EncodingFailed(String),
}

/// Pipeline metrics
#[derive(Clone)]
pub struct GatewayMetrics {
    registry: Registry,
    request_duration: HistogramVec,
    pending_jobs: IntGauge,
    pool_queue_depth: IntGauge,
    pool_busy_workers: IntGauge,
    broadcast_queue_depth: IntGauge,
    broadcast_fps: IntGauge,
    frames_dropped_total: IntCounterVec,
    ws_connections: IntGauge,
    jobs_submitted_total: IntCounterVec,
    jobs_rejected_total: IntCounterVec,
    jobs_resolved_total: IntCounterVec,
    dead_letters_total: IntCounterVec,
    duplicate_results_total: IntCounter,
    ready: IntGauge,
}

impl GatewayMetrics {
    /// Creates the metrics and registers them with a fresh registry.
    ///
    /// # Errors
    ///
    /// Returns an error if any metric fails to register.
    pub fn new() -> Result<Self, MetricsError> {
        let registry = Registry::new();

        let request_duration = HistogramVec::new(
            HistogramOpts::new(
                "genrelay_http_request_duration_seconds",
                "HTTP request latency",
            )
            .buckets(REQUEST_LATENCY_BUCKETS.to_vec()),
            &["method", "route", "status"],
        )?;
        registry.register(Box::new(request_duration.clone()))?;

        let pending_jobs = IntGauge::new("genrelay_pending_jobs", "Jobs awaiting a result")?;
        registry.register(Box::new(pending_jobs.clone()))?;

        let pool_queue_depth = IntGauge::new(
            "genrelay_pool_queue_depth",
            "Tasks waiting in the worker pool overflow queue",
        )?;
        registry.register(Box::new(pool_queue_depth.clone()))?;

        let pool_busy_workers =
            IntGauge::new("genrelay_pool_busy_workers", "Worker slots currently busy")?;
        registry.register(Box::new(pool_busy_workers.clone()))?;

        let broadcast_queue_depth = IntGauge::new(
            "genrelay_broadcast_queue_depth",
            "Frames waiting in the broadcast queue",
        )?;
        registry.register(Box::new(broadcast_queue_depth.clone()))?;

        let broadcast_fps =
            IntGauge::new("genrelay_broadcast_fps", "Current broadcast frame rate")?;
        registry.register(Box::new(broadcast_fps.clone()))?;

        let frames_dropped_total = IntCounterVec::new(
            Opts::new("genrelay_frames_dropped_total", "Frames dropped by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(frames_dropped_total.clone()))?;

        let ws_connections =
            IntGauge::new("genrelay_ws_connections", "Active WebSocket connections")?;
        registry.register(Box::new(ws_connections.clone()))?;

        let jobs_submitted_total = IntCounterVec::new(
            Opts::new("genrelay_jobs_submitted_total", "Jobs accepted by the gateway"),
            &["mode"],
        )?;
        registry.register(Box::new(jobs_submitted_total.clone()))?;

        let jobs_rejected_total = IntCounterVec::new(
            Opts::new("genrelay_jobs_rejected_total", "Submissions rejected by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(jobs_rejected_total.clone()))?;

        let jobs_resolved_total = IntCounterVec::new(
            Opts::new("genrelay_jobs_resolved_total", "Jobs resolved by outcome"),
            &["outcome"],
        )?;
        registry.register(Box::new(jobs_resolved_total.clone()))?;

        let dead_letters_total = IntCounterVec::new(
            Opts::new("genrelay_dead_letters_total", "Dead-letter entries by reason"),
            &["reason"],
        )?;
        registry.register(Box::new(dead_letters_total.clone()))?;

        let duplicate_results_total = IntCounter::new(
            "genrelay_duplicate_results_total",
            "Result deliveries discarded as duplicates",
        )?;
        registry.register(Box::new(duplicate_results_total.clone()))?;

        let ready = IntGauge::new("genrelay_ready", "1 when the last readiness check passed")?;
        registry.register(Box::new(ready.clone()))?;

        Ok(Self {
            registry,
            request_duration,
            pending_jobs,
            pool_queue_depth,
            pool_busy_workers,
            broadcast_queue_depth,
            broadcast_fps,
            frames_dropped_total,
            ws_connections,
            jobs_submitted_total,
            jobs_rejected_total,
            jobs_resolved_total,
            dead_letters_total,
            duplicate_results_total,
            ready,
        })
    }

    /// Prometheus text exposition
    pub fn encode_text(&self) -> Result<String, MetricsError> {
        let mut buffer = Vec::new();
        TextEncoder::new()
            .encode(&self.registry.gather(), &mut buffer)
            .map_err(|e| MetricsError::EncodingFailed(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| MetricsError::EncodingFailed(e.to_string()))
    }

    pub fn observe_request(&self, method: &str, route: &str, status: u16, seconds: f64) {
        let status = status.to_string();
        self.request_duration
            .with_label_values(&[method, route, status.as_str()])
            .observe(seconds);
    }

    pub fn set_pending_jobs(&self, pending: usize) {
        self.pending_jobs.set(pending as i64);
    }

    pub fn set_pool_state(&self, queued: usize, busy: usize) {
        self.pool_queue_depth.set(queued as i64);
        self.pool_busy_workers.set(busy as i64);
    }

    pub fn set_broadcast_state(&self, queue_depth: usize, fps: u32) {
        self.broadcast_queue_depth.set(queue_depth as i64);
        self.broadcast_fps.set(i64::from(fps));
    }

    pub fn frames_dropped(&self, reason: &str, count: u64) {
        if count > 0 {
            self.frames_dropped_total
                .with_label_values(&[reason])
                .inc_by(count);
        }
    }

    pub fn ws_connected(&self) {
        self.ws_connections.inc();
    }

    pub fn ws_disconnected(&self) {
        self.ws_connections.dec();
    }

    pub fn job_submitted(&self, mode: &str) {
        self.jobs_submitted_total.with_label_values(&[mode]).inc();
    }

    pub fn job_rejected(&self, reason: &str) {
        self.jobs_rejected_total.with_label_values(&[reason]).inc();
    }

    pub fn job_resolved(&self, outcome: &str) {
        self.jobs_resolved_total.with_label_values(&[outcome]).inc();
    }

    pub fn dead_lettered(&self, reason: &str) {
        self.dead_letters_total.with_label_values(&[reason]).inc();
    }

    pub fn duplicate_result(&self) {
        self.duplicate_results_total.inc();
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.set(i64::from(ready));
    }

    // Accessors used by health reporting and tests

    pub fn submitted_count(&self, mode: &str) -> u64 {
        self.jobs_submitted_total.with_label_values(&[mode]).get()
    }

    pub fn rejected_count(&self, reason: &str) -> u64 {
        self.jobs_rejected_total.with_label_values(&[reason]).get()
    }

    pub fn resolved_count(&self, outcome: &str) -> u64 {
        self.jobs_resolved_total.with_label_values(&[outcome]).get()
    }

    pub fn dead_letter_count(&self, reason: &str) -> u64 {
        self.dead_letters_total.with_label_values(&[reason]).get()
    }

    pub fn duplicate_count(&self) -> u64 {
        self.duplicate_results_total.get()
    }

    pub fn dropped_count(&self, reason: &str) -> u64 {
        self.frames_dropped_total.with_label_values(&[reason]).get()
    }

    pub fn pending_jobs(&self) -> i64 {
        self.pending_jobs.get()
    }

    pub fn active_connections(&self) -> i64 {
        self.ws_connections.get()
    }

    pub fn is_ready(&self) -> bool {
        self.ready.get() == 1
    }
}

/// Middleware recording request latency by matched route
pub async fn track_requests(
    State(metrics): State<Arc<GatewayMetrics>>,
    request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();
    let method = request.method().to_string();
    let route = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| "unmatched".to_string());

    let response = next.run(request).await;

    metrics.observe_request(
        &method,
        &route,
        response.status().as_u16(),
        started.elapsed().as_secs_f64(),
    );
    response
}
