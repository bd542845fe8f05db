//! Prometheus metrics for the AMQP gateway

use lazy_static::lazy_static;
use prometheus::{
    register_counter_vec, register_histogram_vec, register_int_counter, CounterVec, HistogramVec,
    IntCounter,
};

lazy_static! {
    /// Total messages published
    pub static ref PUBLISH_TOTAL: CounterVec = register_counter_vec!(
        "amqp_gateway_publish_total",
        "Total messages published",
        &["class", "status"]
    )
    .unwrap();

    /// Message publish duration
    pub static ref PUBLISH_DURATION: HistogramVec = register_histogram_vec!(
        "amqp_gateway_publish_duration_seconds",
        "Message publish duration in seconds",
        &["class"]
    )
    .unwrap();

    /// Publish attempts that went into the retry loop
    pub static ref PUBLISH_RETRIES_TOTAL: IntCounter = register_int_counter!(
        "amqp_gateway_publish_retries_total",
        "Publish attempts retried after a failure"
    )
    .unwrap();

    /// Total messages consumed
    pub static ref CONSUME_TOTAL: CounterVec = register_counter_vec!(
        "amqp_gateway_consume_total",
        "Total messages consumed",
        &["status"]
    )
    .unwrap();

    /// Message handler duration
    pub static ref CONSUME_DURATION: HistogramVec = register_histogram_vec!(
        "amqp_gateway_consume_duration_seconds",
        "Message handling duration in seconds",
        &["status"]
    )
    .unwrap();

    /// Connection/channel recoveries
    pub static ref RECONNECTS_TOTAL: CounterVec = register_counter_vec!(
        "amqp_gateway_reconnects_total",
        "Connection and channel recoveries",
        &["scope"]
    )
    .unwrap();

    /// Rebound decisions
    pub static ref REBOUNDS_TOTAL: CounterVec = register_counter_vec!(
        "amqp_gateway_rebounds_total",
        "Rebound decisions",
        &["outcome"]
    )
    .unwrap();
}
