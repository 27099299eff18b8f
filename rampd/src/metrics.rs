//! Prometheus metrics for the rollout engine.
//!
//! Registered against the default registry and exported through the
//! `/metrics` HTTP endpoint.

use lazy_static::lazy_static;
use prometheus::{
    Encoder, IntCounter, IntCounterVec, IntGauge, TextEncoder, register_int_counter,
    register_int_counter_vec, register_int_gauge,
};
use ramp_common::types::{Stage, TransitionCause};

lazy_static! {
    /// Flag evaluations by outcome: "on", "off", or "fail_closed".
    pub static ref EVALUATIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rampd_evaluations_total",
        "Flag evaluations by outcome",
        &["outcome"]
    )
    .expect("evaluations counter registration");

    /// Stage transitions by cause.
    pub static ref TRANSITIONS_TOTAL: IntCounterVec = register_int_counter_vec!(
        "rampd_transitions_total",
        "Committed stage transitions by cause",
        &["cause"]
    )
    .expect("transitions counter registration");

    /// Rollbacks, automatic and manual.
    pub static ref ROLLBACKS_TOTAL: IntCounter = register_int_counter!(
        "rampd_rollbacks_total",
        "Transitions into the rolled_back stage"
    )
    .expect("rollbacks counter registration");

    /// Metrics feed pull failures.
    pub static ref FEED_UNAVAILABLE_TOTAL: IntCounter = register_int_counter!(
        "rampd_feed_unavailable_total",
        "Health monitor cycles degraded by an unavailable metrics feed"
    )
    .expect("feed counter registration");

    /// Flags currently in a monitored stage.
    pub static ref ACTIVE_FLAGS: IntGauge = register_int_gauge!(
        "rampd_active_flags",
        "Flags currently in canary or ramping"
    )
    .expect("active flags gauge registration");
}

/// Record one evaluation outcome.
pub fn record_evaluation(outcome: &str) {
    EVALUATIONS_TOTAL.with_label_values(&[outcome]).inc();
}

/// Record one committed transition.
pub fn record_transition(cause: TransitionCause, to: Stage) {
    TRANSITIONS_TOTAL.with_label_values(&[cause.as_str()]).inc();
    if to == Stage::RolledBack {
        ROLLBACKS_TOTAL.inc();
    }
}

/// Encode all registered metrics in the Prometheus text format.
pub fn encode_metrics() -> Result<String, prometheus::Error> {
    let encoder = TextEncoder::new();
    let families = prometheus::gather();
    let mut buffer = Vec::new();
    encoder.encode(&families, &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}
