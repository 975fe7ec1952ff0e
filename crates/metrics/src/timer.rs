use std::time::{
    Duration,
    Instant,
};

use prometheus::{
    Histogram,
    HistogramVec,
};

use crate::{
    get_desc,
    log_distribution,
    log_distribution_with_status,
    STATUS_ERROR,
    STATUS_SUCCESS,
};

/// Records elapsed time into a histogram when dropped.
pub struct Timer {
    start: Instant,
    histogram: &'static Histogram,
}

impl Timer {
    pub fn new(histogram: &'static Histogram) -> Self {
        Self {
            start: Instant::now(),
            histogram,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed = self.start.elapsed();
        tracing::debug!("{elapsed:?} for timer {:?}", get_desc(self.histogram));
        log_distribution(self.histogram, elapsed.as_secs_f64());
    }
}

/// Status timer that records with status `error` unless `.finish()` is
/// explicitly called upon success. The histogram must carry a single
/// `status` label.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    status: &'static str,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        Self {
            start: Instant::now(),
            histogram,
            status: STATUS_ERROR,
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish the timer with status success.
    pub fn finish(mut self) -> Duration {
        self.status = STATUS_SUCCESS;
        self.elapsed()
    }

    /// Finish the timer with the given status.
    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.status = status;
        self.elapsed()
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed = self.start.elapsed();
        log_distribution_with_status(self.histogram, elapsed.as_secs_f64(), self.status);
    }
}
