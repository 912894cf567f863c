//! Prometheus metrics for the object-store gateway
//!
//! Defines metrics for:
//! - Storage operation counts by operation and status
//! - Storage operation duration
//! - Access token refresh outcomes

use std::sync::Once;
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry};

lazy_static! {
    /// Registry for all metrics
    pub static ref REGISTRY: Registry = Registry::new();

    /// Storage operation counter by operation and status
    pub static ref STORAGE_OPERATIONS: IntCounterVec = IntCounterVec::new(
        Opts::new("objectstore_storage_operations_total", "Total storage operations"),
        &["operation", "status"]
    )
    .expect("Failed to create STORAGE_OPERATIONS metric");

    /// Storage operation duration histogram by operation
    pub static ref STORAGE_OPERATION_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "objectstore_storage_operation_duration_seconds",
            "Storage operation duration in seconds"
        )
        .buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]),
        &["operation"]
    )
    .expect("Failed to create STORAGE_OPERATION_DURATION metric");

    /// Access token refresh counter by status
    pub static ref TOKEN_REFRESHES: IntCounterVec = IntCounterVec::new(
        Opts::new("objectstore_token_refreshes_total", "Total access token refresh attempts"),
        &["status"]
    )
    .expect("Failed to create TOKEN_REFRESHES metric");
}

static INIT: Once = Once::new();

/// Register all metrics with the global registry; safe to call repeatedly
pub fn init_metrics() {
    INIT.call_once(|| {
        REGISTRY.register(Box::new(STORAGE_OPERATIONS.clone())).unwrap();
        REGISTRY.register(Box::new(STORAGE_OPERATION_DURATION.clone())).unwrap();
        REGISTRY.register(Box::new(TOKEN_REFRESHES.clone())).unwrap();
    });
}

/// Record the outcome and duration of one storage operation
pub fn observe<T, E>(operation: &str, started: Instant, result: &Result<T, E>) {
    let status = if result.is_ok() { "success" } else { "error" };
    STORAGE_OPERATIONS.with_label_values(&[operation, status]).inc();
    STORAGE_OPERATION_DURATION
        .with_label_values(&[operation])
        .observe(started.elapsed().as_secs_f64());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_is_idempotent_and_registers() {
        init_metrics();
        init_metrics();

        let ok: Result<(), ()> = Ok(());
        observe("test_op", Instant::now(), &ok);
        assert!(STORAGE_OPERATIONS.with_label_values(&["test_op", "success"]).get() >= 1);

        let families = REGISTRY.gather();
        assert!(families
            .iter()
            .any(|f| f.get_name() == "objectstore_storage_operations_total"));
    }
}
