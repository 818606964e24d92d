//! Prometheus metrics registry and `/metrics` handler.

use axum::http::header;
use axum::response::{IntoResponse, Response};
use prometheus::{Encoder, HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder};

pub struct Metrics {
    registry: Registry,
    pub requests_total: IntCounterVec,
    pub request_duration_seconds: HistogramVec,
    pub rate_limited_total: IntCounterVec,
    pub quota_exceeded_total: IntCounterVec,
    pub quota_channel_depth: IntGauge,
    pub quota_dropped_events_total: prometheus::IntCounter,
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let requests_total = IntCounterVec::new(
            prometheus::Opts::new("gateway_requests_total", "Total requests processed"),
            &["endpoint", "status"],
        )
        .unwrap();
        let request_duration_seconds = HistogramVec::new(
            prometheus::HistogramOpts::new("gateway_request_duration_seconds", "Request latency"),
            &["endpoint"],
        )
        .unwrap();
        let rate_limited_total = IntCounterVec::new(
            prometheus::Opts::new("gateway_rate_limited_total", "Requests rejected for rate limiting"),
            &["key_kind"],
        )
        .unwrap();
        let quota_exceeded_total = IntCounterVec::new(
            prometheus::Opts::new("gateway_quota_exceeded_total", "Requests rejected for quota exhaustion"),
            &["quota_type"],
        )
        .unwrap();
        let quota_channel_depth = IntGauge::new("gateway_quota_channel_depth", "Pending quota events in the channel").unwrap();
        let quota_dropped_events_total = prometheus::IntCounter::new(
            "gateway_quota_dropped_events_total",
            "Quota events that hit a full channel and fell back to synchronous accounting",
        )
        .unwrap();

        registry.register(Box::new(requests_total.clone())).unwrap();
        registry.register(Box::new(request_duration_seconds.clone())).unwrap();
        registry.register(Box::new(rate_limited_total.clone())).unwrap();
        registry.register(Box::new(quota_exceeded_total.clone())).unwrap();
        registry.register(Box::new(quota_channel_depth.clone())).unwrap();
        registry.register(Box::new(quota_dropped_events_total.clone())).unwrap();

        Metrics {
            registry,
            requests_total,
            request_duration_seconds,
            rate_limited_total,
            quota_exceeded_total,
            quota_channel_depth,
            quota_dropped_events_total,
        }
    }

    pub fn render(&self) -> Response {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&families, &mut buffer) {
            tracing::error!("failed to encode metrics: {e}");
        }
        ([(header::CONTENT_TYPE, encoder.format_type().to_string())], buffer).into_response()
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}
