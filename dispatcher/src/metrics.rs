//! Prometheus metrics (A4), grounded on the Handler's own `metrics::Metrics`
//! (an owned `prometheus::Registry`, constructed once at startup).

use prometheus::{IntCounterVec, IntGauge, Opts, Registry};

pub struct Metrics {
    pub callback_attempts_total: IntCounterVec,
    pub pending_callbacks: IntGauge,
    pub registry: Registry,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let callback_attempts_total = IntCounterVec::new(
            Opts::new("dispatcher_callback_attempts_total", "Customer callback delivery attempts"),
            &["outcome"],
        )
        .expect("constant metric name is valid");

        let pending_callbacks = IntGauge::new(
            "dispatcher_pending_callbacks",
            "Callbacks awaiting delivery at last worker tick",
        )
        .expect("constant metric name is valid");

        registry
            .register(Box::new(callback_attempts_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(pending_callbacks.clone()))
            .expect("metric registration must not be called twice");

        Self { callback_attempts_total, pending_callbacks, registry }
    }
}
