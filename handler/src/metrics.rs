//! Prometheus metrics (A4): blocks processed, deposits detected,
//! sweep/withdrawal outcomes, queue depths, provider health.
//!
//! Grounded on the teacher's `canceler::server::Metrics` (an owned
//! `prometheus::Registry`, not the global default registry, `IntCounter`/
//! `IntGauge` constructed then registered once at startup).

use prometheus::{IntCounter, IntCounterVec, IntGauge, IntGaugeVec, Opts, Registry};

pub struct Metrics {
    pub blocks_processed_total: IntCounter,
    pub deposits_detected_total: IntCounterVec,
    pub deposit_sweeps_total: IntCounterVec,
    pub withdrawals_total: IntCounterVec,
    pub callback_attempts_total: IntCounterVec,
    pub pending_deposits: IntGauge,
    pub pending_withdrawals: IntGauge,
    pub pending_callbacks: IntGauge,
    pub last_handled_block: IntGauge,
    pub trusted_block: IntGauge,
    pub scanner_catch_up_mode: IntGauge,
    pub provider_rps: IntGaugeVec,
    pub provider_enabled: IntGaugeVec,
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

        let blocks_processed_total = IntCounter::new(
            "handler_blocks_processed_total",
            "Total blocks the scanner has advanced past",
        )
        .expect("constant metric name is valid");

        let deposits_detected_total = IntCounterVec::new(
            Opts::new("handler_deposits_detected_total", "Deposits detected by the scanner"),
            &["kind"],
        )
        .expect("constant metric name is valid");

        let deposit_sweeps_total = IntCounterVec::new(
            Opts::new("handler_deposit_sweeps_total", "Deposit sweep outcomes"),
            &["kind", "outcome"],
        )
        .expect("constant metric name is valid");

        let withdrawals_total = IntCounterVec::new(
            Opts::new("handler_withdrawals_total", "Withdrawal send outcomes"),
            &["outcome"],
        )
        .expect("constant metric name is valid");

        let callback_attempts_total = IntCounterVec::new(
            Opts::new("handler_callback_attempts_total", "Dispatcher callback attempts"),
            &["kind", "outcome"],
        )
        .expect("constant metric name is valid");

        let pending_deposits = IntGauge::new(
            "handler_pending_deposits",
            "Deposits awaiting sweep at last scheduler tick",
        )
        .expect("constant metric name is valid");

        let pending_withdrawals = IntGauge::new(
            "handler_pending_withdrawals",
            "Withdrawals awaiting send at last scheduler tick",
        )
        .expect("constant metric name is valid");

        let pending_callbacks = IntGauge::new(
            "handler_pending_callbacks",
            "Deposits/withdrawals awaiting notification at last scheduler tick",
        )
        .expect("constant metric name is valid");

        let last_handled_block = IntGauge::new(
            "handler_last_handled_block",
            "Most recently scanned block number",
        )
        .expect("constant metric name is valid");

        let trusted_block = IntGauge::new(
            "handler_trusted_block",
            "Chain tip minus the confirmation cushion",
        )
        .expect("constant metric name is valid");

        let scanner_catch_up_mode = IntGauge::new(
            "handler_scanner_catch_up_mode",
            "1 if the scanner is running with zero inter-tick pause",
        )
        .expect("constant metric name is valid");

        let provider_rps = IntGaugeVec::new(
            Opts::new("handler_provider_requests_per_second", "Provider telemetry window RPS"),
            &["url"],
        )
        .expect("constant metric name is valid");

        let provider_enabled = IntGaugeVec::new(
            Opts::new("handler_provider_enabled", "1 if the provider endpoint is currently enabled"),
            &["url"],
        )
        .expect("constant metric name is valid");

        registry
            .register(Box::new(blocks_processed_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(deposits_detected_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(deposit_sweeps_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(withdrawals_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(callback_attempts_total.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(pending_deposits.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(pending_withdrawals.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(pending_callbacks.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(last_handled_block.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(trusted_block.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(scanner_catch_up_mode.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(provider_rps.clone()))
            .expect("metric registration must not be called twice");
        registry
            .register(Box::new(provider_enabled.clone()))
            .expect("metric registration must not be called twice");

        Self {
            blocks_processed_total,
            deposits_detected_total,
            deposit_sweeps_total,
            withdrawals_total,
            callback_attempts_total,
            pending_deposits,
            pending_withdrawals,
            pending_callbacks,
            last_handled_block,
            trusted_block,
            scanner_catch_up_mode,
            provider_rps,
            provider_enabled,
            registry,
        }
    }
}
