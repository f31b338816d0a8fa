//! We follow [Prometheus's conventions](https://prometheus.io/docs/practices/naming/) for metric
//! names:
//!
//! 1. Metrics may only contain alphanumerics and underscores.
//! 2. Metrics are automatically prefixed with `SERVICE_NAME`.
//! 3. Suffix metrics with their units (e.g. `_seconds`, `_bytes`, `_total`).
//!    See `ALLOWED_SUFFIXES` for the full list.
use std::{
    borrow::Cow,
    collections::HashSet,
    env,
    ops::Deref,
    sync::LazyLock,
};

use parking_lot::RwLock;
use prometheus::Registry;

use crate::{
    log_counter_with_labels,
    register_convex_counter,
    StaticMetricLabel,
};

const ALLOWED_SUFFIXES: &[&str] = &[
    "_seconds",
    "_bytes",
    "_documents",
    "_connections",
    "_requests",
    "_timeouts",
    "_hits",
    "_misses",
    "_evictions",
    "_errors",
    "_reads",
    "_writes",
    "_operations",
    "_updates",
    "_locks",
    "_total",
    "_info",
];

pub static SERVICE_NAME: LazyLock<String> = LazyLock::new(|| {
    std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "ts_ingest_worker".to_string())
        .replace('-', "_")
});

pub static CONVEX_METRICS_REGISTRY: LazyLock<Registry> = LazyLock::new(|| {
    let labels = env::var("WORKER_INSTANCE_NAME")
        .ok()
        .map(|instance_name| [("instance_name".to_owned(), instance_name)].into_iter().collect());
    Registry::new_custom(Some(SERVICE_NAME.clone()), labels)
        .expect("Failed to initialize Prometheus metrics registry")
});

#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct MetricName(Cow<'static, str>);

impl MetricName {
    pub const fn new(name: &'static str) -> Self {
        validate_metric_name(name);
        Self(Cow::Borrowed(name))
    }
}

impl Deref for MetricName {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0[..]
    }
}

const fn ends_with(s: &[u8], suffix: &[u8]) -> bool {
    if s.len() < suffix.len() {
        return false;
    }
    let s_base = s.len() - suffix.len();
    let mut i = 0;
    while i < suffix.len() {
        if s[s_base + i] != suffix[i] {
            return false;
        }
        i += 1;
    }
    true
}

const fn validate_metric_name(name: &str) {
    let name_bytes = name.as_bytes();

    let mut i = 0;
    while i < name_bytes.len() {
        let c = name_bytes[i];
        let is_upper = c.is_ascii_uppercase();
        let is_lower = c.is_ascii_lowercase();
        let is_numeric = c.is_ascii_digit();
        let is_underscore = c == b'_';
        if !(is_upper || is_lower || is_numeric || is_underscore) {
            panic!("Metric names can only contain alphanumeric characters and underscores");
        }
        i += 1;
    }

    let mut i = 0;
    let mut found_suffix = false;
    while i < ALLOWED_SUFFIXES.len() {
        if ends_with(name_bytes, ALLOWED_SUFFIXES[i].as_bytes()) {
            found_suffix = true;
            break;
        }
        i += 1;
    }
    if !found_suffix {
        panic!("Metric names must end with their units as a suffix (e.g. `_seconds`, `_total`)");
    }
}

#[macro_export]
macro_rules! metric_name {
    ($name: expr) => {{
        use $crate::MetricName;
        const METRIC_NAME: MetricName = MetricName::new($name);
        METRIC_NAME
    }};
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct MetricHelp(&'static str);

impl Deref for MetricHelp {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        self.0
    }
}

impl MetricHelp {
    pub const fn new(help_str: &'static str) -> Self {
        if help_str.is_empty() {
            panic!("Metric help strings must be nonempty");
        }
        Self(help_str)
    }
}

#[macro_export]
macro_rules! metric_help {
    ($help: literal) => {{
        use $crate::MetricHelp;
        const METRIC_HELP: MetricHelp = MetricHelp::new($help);
        METRIC_HELP
    }};
}

register_convex_counter!(
    INVALID_METRIC_TOTAL,
    "Count of metrics that failed to be reported",
    &["metric_name"]
);

// Only report a given broken metric to Sentry once, so a hot path with a bad
// label cardinality can't spam it.
static METRICS_ERROR_ONCE: LazyLock<RwLock<HashSet<String>>> = LazyLock::new(Default::default);

pub fn log_invalid_metric(name: String, error: prometheus::Error) {
    log_counter_with_labels(
        &INVALID_METRIC_TOTAL,
        1,
        vec![StaticMetricLabel::new("metric_name", name.clone())],
    );
    if METRICS_ERROR_ONCE.read().contains(&name) {
        return;
    }
    if METRICS_ERROR_ONCE.write().insert(name.clone()) {
        tracing::error!("Failed to record metric {name:?}: {error}");
    }
}
