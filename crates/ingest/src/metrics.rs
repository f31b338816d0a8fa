//! Prometheus metrics for the ingestion pipeline, one static per metric as
//! the `register_convex_*!` macros expect.
use metrics::{
    register_convex_counter,
    register_convex_histogram,
    CancelableTimer,
};

register_convex_counter!(pub BATCHES_PROCESSED_TOTAL, "Count of batches consumed from the broker");
register_convex_counter!(pub BATCHES_REQUEUED_TOTAL, "Count of batches rejected and requeued as transient");
register_convex_counter!(pub BATCHES_DROPPED_TOTAL, "Count of batches rejected without requeue");
register_convex_counter!(
    MESSAGES_DROPPED_TOTAL,
    "Count of individual batch items dropped during decoding",
    &["reason"]
);
register_convex_histogram!(
    pub BATCH_PROCESSING_SECONDS,
    "Time spent processing one batch end to end",
    &["status"]
);

pub fn batch_timer() -> CancelableTimer {
    CancelableTimer::new(&BATCH_PROCESSING_SECONDS)
}

pub fn log_dropped_message(reason: &'static str) {
    metrics::log_counter_with_labels(
        &MESSAGES_DROPPED_TOTAL,
        1,
        vec![metrics::StaticMetricLabel::new("reason", reason)],
    );
}
