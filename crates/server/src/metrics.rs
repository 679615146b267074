//! Prometheus metrics for the upload server.
//!
//! The `/metrics` endpoint is unauthenticated so Prometheus can scrape it.
//! It carries no per-user data, only aggregate counters, but should still be
//! restricted to scraper addresses at the network level.

use axum::http::StatusCode;
use axum::response::IntoResponse;
use prometheus::{
    self, Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use std::sync::{LazyLock, Once};

/// Global Prometheus registry for all metrics.
pub static REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

// Session metrics
pub static SESSIONS_ADMITTED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "drivex_upload_sessions_admitted_total",
        "Total number of upload sessions admitted",
    )
    .expect("metric creation failed")
});

pub static SESSIONS_DENIED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "drivex_upload_sessions_denied_total",
            "Total number of upload sessions denied admission, by reason",
        ),
        &["reason"],
    )
    .expect("metric creation failed")
});

pub static SESSIONS_FINISHED: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "drivex_upload_sessions_finished_total",
            "Total number of admitted upload sessions by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

// Chunk metrics
pub static CHUNKS_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "drivex_chunks_uploaded_total",
        "Total number of chunks acknowledged by the destination",
    )
    .expect("metric creation failed")
});

pub static CHUNK_RETRIES: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "drivex_chunk_retries_total",
        "Total number of chunk upload retries",
    )
    .expect("metric creation failed")
});

pub static BYTES_UPLOADED: LazyLock<IntCounter> = LazyLock::new(|| {
    IntCounter::new(
        "drivex_bytes_uploaded_total",
        "Total bytes acknowledged by the destination",
    )
    .expect("metric creation failed")
});

// Timing metrics
pub static CHUNK_UPLOAD_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "drivex_chunk_upload_duration_seconds",
            "Time taken to upload a single chunk",
        )
        .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 120.0]),
    )
    .expect("metric creation failed")
});

pub static SESSION_DURATION: LazyLock<Histogram> = LazyLock::new(|| {
    Histogram::with_opts(
        HistogramOpts::new(
            "drivex_upload_session_duration_seconds",
            "Time from admission to the terminal message",
        )
        .buckets(vec![1.0, 5.0, 15.0, 30.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]),
    )
    .expect("metric creation failed")
});

// Current state gauges
pub static ACTIVE_UPLOADS: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "drivex_active_uploads",
        "Current number of admitted uploads",
    )
    .expect("metric creation failed")
});

pub static RESERVED_MEMORY_BYTES: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "drivex_reserved_memory_bytes",
        "Memory currently reserved by admitted uploads",
    )
    .expect("metric creation failed")
});

pub static BUFFER_POOL_IDLE: LazyLock<IntGauge> = LazyLock::new(|| {
    IntGauge::new(
        "drivex_buffer_pool_idle",
        "Idle buffers held by the chunk buffer pool",
    )
    .expect("metric creation failed")
});

// Backup metrics
pub static BACKUP_COPIES: LazyLock<IntCounterVec> = LazyLock::new(|| {
    IntCounterVec::new(
        Opts::new(
            "drivex_backup_copies_total",
            "Total backup copies by outcome",
        ),
        &["outcome"],
    )
    .expect("metric creation failed")
});

static REGISTER_ONCE: Once = Once::new();

/// Register all metrics with the global registry.
///
/// Safe to call more than once; registration happens on the first call.
pub fn register_metrics() {
    REGISTER_ONCE.call_once(|| {
        REGISTRY
            .register(Box::new(SESSIONS_ADMITTED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SESSIONS_DENIED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SESSIONS_FINISHED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNKS_UPLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNK_RETRIES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BYTES_UPLOADED.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(CHUNK_UPLOAD_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(SESSION_DURATION.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(ACTIVE_UPLOADS.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(RESERVED_MEMORY_BYTES.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BUFFER_POOL_IDLE.clone()))
            .expect("metric registration failed");
        REGISTRY
            .register(Box::new(BACKUP_COPIES.clone()))
            .expect("metric registration failed");
    });
}

/// Handler for `GET /metrics`.
pub async fn metrics_handler() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();

    let mut buffer = Vec::new();
    match encoder.encode(&metric_families, &mut buffer) {
        Ok(()) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4; charset=utf-8")],
            buffer,
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            format!("Failed to encode metrics: {e}").into_bytes(),
        ),
    }
}

/// Record the terminal outcome of an admitted session.
pub fn record_session_outcome(outcome: &str) {
    SESSIONS_FINISHED.with_label_values(&[outcome]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_registration() {
        // This would panic if any metric creation failed
        register_metrics();
        register_metrics();
    }

    #[test]
    fn test_outcome_counter() {
        register_metrics();
        let before = SESSIONS_FINISHED.with_label_values(&["completed"]).get();
        record_session_outcome("completed");
        assert_eq!(
            SESSIONS_FINISHED.with_label_values(&["completed"]).get(),
            before + 1
        );
    }
}
