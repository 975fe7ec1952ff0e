//! Metrics registry and helpers shared by the sync engines.
//!
//! Metrics are declared as `LazyLock` statics with the
//! `register_syncular_*!` macros and reported through the helpers here. The
//! reported metric name is the lower_snake_case version of the declared
//! static, prefixed with `syncular_`.

use std::sync::LazyLock;

use prometheus::{
    core::Collector,
    Histogram,
    HistogramVec,
    Registry,
};

mod macros;
mod timer;

pub use paste::paste;
pub use prometheus;

pub use crate::timer::{
    StatusTimer,
    Timer,
};

/// All syncular metrics register against this registry rather than the
/// prometheus default, so embedding applications control what gets exported.
pub static SYNCULAR_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::new);

pub const STATUS_LABEL: &str = "status";
pub const STATUS_SUCCESS: &str = "success";
pub const STATUS_ERROR: &str = "error";

#[macro_export]
macro_rules! metric_name {
    ($name:expr) => {
        format!("syncular_{}", $name)
    };
}

pub fn get_desc(collector: &impl Collector) -> String {
    collector
        .desc()
        .first()
        .map(|d| d.fq_name.clone())
        .unwrap_or_else(|| "unknown_metric".to_owned())
}

pub fn log_distribution(histogram: &'static Histogram, value: f64) {
    histogram.observe(value);
}

pub fn log_distribution_with_status(histogram: &'static HistogramVec, value: f64, status: &str) {
    histogram.with_label_values(&[status]).observe(value);
}

#[cfg(test)]
mod tests {
    use super::*;

    crate::register_syncular_counter!(TEST_EVENTS_TOTAL, "Test counter");
    crate::register_syncular_histogram!(TEST_LATENCY_SECONDS, "Test histogram");

    #[test]
    fn test_registered_names_are_prefixed() {
        TEST_EVENTS_TOTAL.inc();
        assert_eq!(get_desc(&*TEST_EVENTS_TOTAL), "syncular_test_events_total");
        assert_eq!(
            get_desc(&*TEST_LATENCY_SECONDS),
            "syncular_test_latency_seconds"
        );
    }

    #[test]
    fn test_timer_records_on_drop() {
        let before = TEST_LATENCY_SECONDS.get_sample_count();
        {
            let _timer = Timer::new(&TEST_LATENCY_SECONDS);
        }
        assert_eq!(TEST_LATENCY_SECONDS.get_sample_count(), before + 1);
    }
}
