//! Prometheus metrics for the withdrawer
//!
//! Exposes metrics on /metrics endpoint for Prometheus scraping.

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_gauge_vec, register_histogram_vec, CounterVec, GaugeVec,
    HistogramVec,
};

lazy_static! {
    pub static ref WITHDRAWALS_RECEIVED: CounterVec = register_counter_vec!(
        "withdrawer_withdrawals_received_total",
        "Total number of withdrawal requests persisted by intake",
        &["asset"]
    ).unwrap();

    pub static ref BROADCASTS: CounterVec = register_counter_vec!(
        "withdrawer_broadcasts_total",
        "Total number of send attempts by outcome",
        &["asset", "outcome"]
    ).unwrap();

    pub static ref INCHAIN: CounterVec = register_counter_vec!(
        "withdrawer_inchain_total",
        "Total number of withdrawals observed in a block",
        &["asset"]
    ).unwrap();

    pub static ref CANCELLED: CounterVec = register_counter_vec!(
        "withdrawer_cancelled_total",
        "Total number of withdrawals removed by cancellation",
        &["asset"]
    ).unwrap();

    pub static ref ERRORS: CounterVec = register_counter_vec!(
        "withdrawer_errors_total",
        "Total number of errors",
        &["asset", "stage", "type"]
    ).unwrap();

    pub static ref QUEUE_SIZE: GaugeVec = register_gauge_vec!(
        "withdrawer_queue_size",
        "Entries currently held by an in-memory pipeline queue",
        &["asset", "queue"]
    ).unwrap();

    pub static ref RPC_LATENCY: HistogramVec = register_histogram_vec!(
        "withdrawer_rpc_latency_seconds",
        "Latency of chain RPC calls",
        &["asset", "method"],
        vec![0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
    ).unwrap();
}

/// Record a withdrawal accepted by intake
pub fn record_received(asset: &str) {
    WITHDRAWALS_RECEIVED.with_label_values(&[asset]).inc();
}

/// Record a send attempt; outcome is one of "sent", "empty_hash", "error"
pub fn record_broadcast(asset: &str, outcome: &str) {
    BROADCASTS.with_label_values(&[asset, outcome]).inc();
}

pub fn record_inchain(asset: &str) {
    INCHAIN.with_label_values(&[asset]).inc();
}

pub fn record_cancelled(asset: &str) {
    CANCELLED.with_label_values(&[asset]).inc();
}

/// Record an error
pub fn record_error(asset: &str, stage: &str, error_type: &str) {
    ERRORS.with_label_values(&[asset, stage, error_type]).inc();
}

/// Update the size of "pending_send" or "watch"
pub fn set_queue_size(asset: &str, queue: &str, size: usize) {
    QUEUE_SIZE
        .with_label_values(&[asset, queue])
        .set(size as f64);
}

pub fn record_rpc_latency(asset: &str, method: &str, seconds: f64) {
    RPC_LATENCY
        .with_label_values(&[asset, method])
        .observe(seconds);
}
