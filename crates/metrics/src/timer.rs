use std::{
    collections::BTreeSet,
    mem,
    time::{
        Duration,
        Instant,
    },
};

use prometheus::{
    Histogram,
    HistogramVec,
};

use crate::{
    get_desc,
    labels::StaticMetricLabel,
    log_distribution,
    log_distribution_with_labels,
};

/// A timer over a single unlabeled histogram. Records its elapsed duration
/// when dropped.
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
        let elapsed_duration = self.start.elapsed();
        let desc = get_desc(self.histogram);
        tracing::debug!("{elapsed_duration:?} for timer {desc:?}");
        log_distribution(self.histogram, elapsed_duration.as_secs_f64());
    }
}

/// A timer over a labeled histogram that defaults to `status=error` unless
/// `.finish()`/`.finish_with()` is explicitly called upon success.
pub struct StatusTimer {
    start: Instant,
    histogram: &'static HistogramVec,
    labels: BTreeSet<StaticMetricLabel>,
}

impl StatusTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        let mut labels = BTreeSet::new();
        labels.insert(StaticMetricLabel::STATUS_ERROR);
        Self {
            start: Instant::now(),
            histogram,
            labels,
        }
    }

    pub fn add_label(&mut self, label: StaticMetricLabel) {
        self.labels.insert(label);
    }

    fn replace_label(&mut self, old_label: StaticMetricLabel, new_label: StaticMetricLabel) {
        self.labels.remove(&old_label);
        self.labels.insert(new_label);
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    /// Finish the timer with status success.
    pub fn finish(mut self) -> Duration {
        self.replace_label(StaticMetricLabel::STATUS_ERROR, StaticMetricLabel::STATUS_SUCCESS);
        self.elapsed()
    }

    /// Finish the timer with the given status label value.
    pub fn finish_with(mut self, status: &'static str) -> Duration {
        self.replace_label(StaticMetricLabel::STATUS_ERROR, StaticMetricLabel::new("status", status));
        self.elapsed()
    }
}

impl Drop for StatusTimer {
    fn drop(&mut self) {
        if std::thread::panicking() {
            return;
        }
        let elapsed_duration = self.start.elapsed();
        let desc = get_desc(self.histogram);
        tracing::debug!("{elapsed_duration:?} for timer {desc:?} {:?}", self.labels);
        let labels = mem::take(&mut self.labels);
        log_distribution_with_labels(
            self.histogram,
            elapsed_duration.as_secs_f64(),
            labels.into_iter().collect(),
        );
    }
}

/// Timer that defaults to `status=canceled`, switching to error/success once
/// `.finish()` is called. Used around a batch's lifetime in the consumer
/// loop, so a panic or early return is visible as "canceled" rather than
/// silently missing.
pub struct CancelableTimer(StatusTimer);

impl CancelableTimer {
    pub fn new(histogram: &'static HistogramVec) -> Self {
        let mut timer = StatusTimer::new(histogram);
        timer.replace_label(StaticMetricLabel::STATUS_ERROR, CANCELED_LABEL);
        Self(timer)
    }

    pub fn finish(mut self, is_ok: bool) -> Duration {
        self.0.replace_label(CANCELED_LABEL, StaticMetricLabel::status(is_ok));
        self.0.elapsed()
    }
}

const CANCELED_LABEL: StaticMetricLabel = StaticMetricLabel {
    key: "status",
    value: std::borrow::Cow::Borrowed("canceled"),
};
