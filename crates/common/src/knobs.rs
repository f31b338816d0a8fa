//! Tunable limits and timeouts for the ingestion worker. Every knob here can
//! be overridden with an environment variable of the same name when running
//! locally or in a one-off incident.
#![deny(missing_docs)]

use std::{
    sync::LazyLock,
    time::Duration,
};

use cmd_util::env::env_config;

/// Number of high-resolution data points stored in a single data document
/// (bucket). Matches the constant referenced throughout the data model.
pub static HIGH_RESOLUTION_DOCUMENT_SIZE: LazyLock<u32> =
    LazyLock::new(|| env_config("HIGH_RESOLUTION_DOCUMENT_SIZE", 360));

/// Fixed bucket width, in seconds, for event documents.
pub static EVENT_DOCUMENT_DURATION: LazyLock<u64> =
    LazyLock::new(|| env_config("EVENT_DOCUMENT_DURATION", 86_400));

/// TTL for a cached data or event bucket entry.
pub static DATA_CACHE_EXPIRATION: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("DATA_CACHE_EXPIRATION_SECS", 3_600)));

/// Minimum TTL for a cached measurement entry. The effective TTL is
/// `max(MEASUREMENT_CACHE_EXPIRATION, interval * 2)` so that a slowly
/// sampled measurement isn't evicted between updates.
pub static MEASUREMENT_CACHE_EXPIRATION: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("MEASUREMENT_CACHE_EXPIRATION_SECS", 3_600)));

/// How long to hold a distributed lock acquisition attempt before giving up.
pub static LOCK_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("LOCK_TIMEOUT_SECS", 10)));

/// Number of times to retry acquiring a distributed lock before treating the
/// batch as a transient failure.
pub static LOCK_RETRIES: LazyLock<u32> = LazyLock::new(|| env_config("LOCK_RETRIES", 10));

/// How long a single fetch from the broker blocks waiting for a delivery
/// before the consumer loop re-checks the shutdown signal.
pub static QUEUE_FETCH_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("QUEUE_FETCH_TIMEOUT_SECS", 10)));

/// `basic_qos` prefetch count for the broker consumer.
pub static QUEUE_PREFETCH_COUNT: LazyLock<u16> =
    LazyLock::new(|| env_config("QUEUE_PREFETCH_COUNT", 20));

/// Delay between broker reconnect attempts.
pub static RECONNECT_TIMEOUT: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("RECONNECT_TIMEOUT_SECS", 5)));

/// Initial delay for the consumer loop's exponential backoff on unexpected
/// (non-broker) failures.
pub static WORKER_INITIAL_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_millis(env_config("WORKER_INITIAL_BACKOFF_MILLIS", 100)));

/// Cap for the consumer loop's exponential backoff.
pub static WORKER_MAX_BACKOFF: LazyLock<Duration> =
    LazyLock::new(|| Duration::from_secs(env_config("WORKER_MAX_BACKOFF_SECS", 30)));
