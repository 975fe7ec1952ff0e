/// Register a histogram with the syncular metrics registry and store it in a
/// static variable. An optional third argument specifies labels. The reported
/// metric name is the lower_snake_case version of the declared variable name.
#[macro_export]
macro_rules! register_syncular_histogram {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Histogram> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let histogram = $crate::prometheus::Histogram::with_opts(
                    $crate::prometheus::HistogramOpts::new(name, $HELP),
                )
                .expect("Metric initialization failed");
                $crate::SYNCULAR_METRICS_REGISTRY
                    .register(Box::new(histogram.clone()))
                    .expect("Metric registration failed");
                histogram
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::HistogramVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let histogram = $crate::prometheus::HistogramVec::new(
                    $crate::prometheus::HistogramOpts::new(name, $HELP),
                    $LABELS,
                )
                .expect("Metric initialization failed");
                $crate::SYNCULAR_METRICS_REGISTRY
                    .register(Box::new(histogram.clone()))
                    .expect("Metric registration failed");
                histogram
            });
    };
}

/// Register an integer counter with the syncular metrics registry and store
/// it in a static variable. An optional third argument specifies labels.
#[macro_export]
macro_rules! register_syncular_counter {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounter> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let counter = $crate::prometheus::IntCounter::new(name, $HELP)
                    .expect("Metric initialization failed");
                $crate::SYNCULAR_METRICS_REGISTRY
                    .register(Box::new(counter.clone()))
                    .expect("Metric registration failed");
                counter
            });
    };
    ($VIS:vis $NAME:ident, $HELP:literal, $LABELS:expr $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::IntCounterVec> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let counter = $crate::prometheus::IntCounterVec::new(
                    $crate::prometheus::Opts::new(name, $HELP),
                    $LABELS,
                )
                .expect("Metric initialization failed");
                $crate::SYNCULAR_METRICS_REGISTRY
                    .register(Box::new(counter.clone()))
                    .expect("Metric registration failed");
                counter
            });
    };
}

/// Register a floating-point gauge with the syncular metrics registry and
/// store it in a static variable.
#[macro_export]
macro_rules! register_syncular_gauge {
    ($VIS:vis $NAME:ident, $HELP:literal $(,)?) => {
        $VIS static $NAME: std::sync::LazyLock<$crate::prometheus::Gauge> =
            std::sync::LazyLock::new(|| {
                $crate::paste! {
                    let name = $crate::metric_name!(stringify!([<$NAME:lower>]));
                }
                let gauge = $crate::prometheus::Gauge::new(name, $HELP)
                    .expect("Metric initialization failed");
                $crate::SYNCULAR_METRICS_REGISTRY
                    .register(Box::new(gauge.clone()))
                    .expect("Metric registration failed");
                gauge
            });
    };
}
