use prometheus::{
    register_counter_with_registry, register_gauge_with_registry, register_histogram_with_registry,
    register_int_counter_vec_with_registry, Counter, Encoder, Gauge, Histogram, IntCounterVec,
    Registry,
};
use std::sync::Arc;

use crate::error::ErrorCode;

pub struct HubMetrics {
    pub connects: Counter,
    pub forwards: Counter,
    pub push_failures: Counter,
    pub rate_limit_hits: Counter,
    pub errors: IntCounterVec,
    pub open_channels: Gauge,
    pub request_latency: Histogram,
    pub registry: Arc<Registry>,
}

impl HubMetrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Arc::new(Registry::new());

        let connects = register_counter_with_registry!(
            "smoke_hub_connects_total",
            "Total number of successful connects",
            registry
        )?;

        let forwards = register_counter_with_registry!(
            "smoke_hub_forwards_total",
            "Total number of accepted forwards",
            registry
        )?;

        let push_failures = register_counter_with_registry!(
            "smoke_hub_push_failures_total",
            "Forwards whose channel push failed",
            registry
        )?;

        let rate_limit_hits = register_counter_with_registry!(
            "smoke_hub_rate_limit_hits_total",
            "Total number of rate limit hits",
            registry
        )?;

        let errors = register_int_counter_vec_with_registry!(
            "smoke_hub_errors_total",
            "Failed requests by error code",
            &["code"],
            registry
        )?;

        let open_channels = register_gauge_with_registry!(
            "smoke_hub_open_channels",
            "Number of channels held by the hub",
            registry
        )?;

        let request_latency = register_histogram_with_registry!(
            "smoke_hub_request_latency_seconds",
            "Request latency in seconds",
            registry
        )?;

        Ok(Self {
            connects,
            forwards,
            push_failures,
            rate_limit_hits,
            errors,
            open_channels,
            request_latency,
            registry,
        })
    }

    pub fn record_error(&self, code: ErrorCode) {
        self.errors.with_label_values(&[&code.code().to_string()]).inc();
    }

    pub fn export_prometheus(&self) -> anyhow::Result<String> {
        let encoder = prometheus::TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8(buffer)?)
    }
}
