//! Prometheus metrics for reduction stages.

use lazy_static::lazy_static;
use prometheus::{self, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};
use std::sync::Once;

use crate::error::ReductionError;

lazy_static! {
    // Registry for holding metric state
    pub static ref REGISTRY: Registry = Registry::new();
    // Leaf task counter by stage and outcome
    pub static ref LEAVES: IntCounterVec = IntCounterVec::new(
        Opts::new("reduction_leaves", "The number of leaf tasks run by reduction stages"),
        &["stage", "outcome"]
    ).expect("valid leaf counter options");
    // Stage histogram by wall-clock duration
    pub static ref STAGE_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts{
            common_opts: Opts::new("reduction_stage_duration", "The time taken to run each reduction stage"),
            buckets: prometheus::DEFAULT_BUCKETS.to_vec(), // Change buckets here if desired
        },
        &["stage"],
    ).expect("valid stage histogram options");
}

static REGISTER: Once = Once::new();

/// Register the reduction metrics with [REGISTRY].
///
/// Safe to call more than once; only the first call registers.
pub fn register_metrics() -> Result<(), ReductionError> {
    let mut result = Ok(());
    REGISTER.call_once(|| {
        result = REGISTRY
            .register(Box::new(LEAVES.clone()))
            .and_then(|_| REGISTRY.register(Box::new(STAGE_DURATION.clone())))
            .map_err(ReductionError::from);
    });
    result
}

/// Returns the registered metrics in the prometheus text exposition format.
pub fn gather_metrics() -> Result<String, ReductionError> {
    let encoder = prometheus::TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY.gather(), &mut buffer)?;
    Ok(String::from_utf8_lossy(&buffer).into_owned())
}

/// Increments the leaf counter for a stage, labelled by outcome.
pub fn record_leaf(stage: &str, outcome: &str) {
    LEAVES.with_label_values(&[stage, outcome]).inc();
}

/// Observe the duration of a stage run.
pub fn record_stage_duration(stage: &str, elapsed: std::time::Duration) {
    STAGE_DURATION
        .with_label_values(&[stage])
        .observe(elapsed.as_secs_f64());
}
