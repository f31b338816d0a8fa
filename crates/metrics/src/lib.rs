//! Code for interacting with this worker's metrics logging.
use std::{
    env,
    sync::LazyLock,
};

mod labels;
mod macros;
mod metrics;
mod reporting;
mod timer;

pub use crate::{
    labels::*,
    macros::*,
    metrics::*,
    reporting::{
        get_desc,
        log_counter,
        log_counter_with_labels,
        log_distribution,
        log_distribution_with_labels,
        log_gauge,
        log_gauge_with_labels,
    },
    timer::{
        CancelableTimer,
        StatusTimer,
        Timer,
    },
};

/// Use the executable name to identify the reporting service.
pub static SERVICE_NAME: LazyLock<String> = LazyLock::new(|| {
    let path = env::current_exe().expect("Couldn't find exe name");
    path.file_name()
        .expect("Path was empty")
        .to_str()
        .expect("Not valid unicode")
        .replace('-', "_")
});
