use std::{
    borrow::Cow,
    sync::LazyLock,
};

use errors::{
    ErrorMetadata,
    ErrorMetadataAnyhowExt,
};
pub use errors::{
    INTERNAL_SERVER_ERROR,
    INTERNAL_SERVER_ERROR_MSG,
};
use rand::Rng;
use regex::Regex;

/// Return `Result<(), MainError>` from `main` to report any returned error to
/// Sentry before the process exits.
pub struct MainError(anyhow::Error);

impl<T: Into<anyhow::Error>> From<T> for MainError {
    fn from(e: T) -> Self {
        let mut err: anyhow::Error = e.into();
        report_error_sync(&mut err);
        Self(err)
    }
}

impl std::fmt::Debug for MainError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

// Regex to match emails from https://emailregex.com/
static EMAIL_REGEX: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?:[a-z0-9!#$%&'*+/=?^_`{|}~-]+(?:\.[a-z0-9!#$%&'*+/=?^_`{|}~-]+)*|"(?:[\x01-\x08\x0b\x0c\x0e-\x1f\x21\x23-\x5b\x5d-\x7f]|\\[\x01-\x09\x0b\x0c\x0e-\x7f])*")@(?:(?:[a-z0-9](?:[a-z0-9-]*[a-z0-9])?\.)+[a-z0-9](?:[a-z0-9-]*[a-z0-9])?|\[(?:(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?)\.){3}(?:25[0-5]|2[0-4][0-9]|[01]?[0-9][0-9]?|[a-z0-9-]*[a-z0-9]:(?:[\x01-\x08\x0b\x0c\x0e-\x1f\x21-\x5a\x53-\x7f]|\\[\x01-\x09\x0b\x0c\x0e-\x7f])+)\])"#).unwrap()
});

/// Measurement `meta` blobs are attacker/customer supplied and sometimes
/// contain an email address; strip it before the error message leaves the
/// process.
fn strip_pii(err: &mut anyhow::Error) {
    if let Some(error_metadata) = err.downcast_mut::<ErrorMetadata>() {
        match EMAIL_REGEX.replace_all(&error_metadata.msg, "*****@*****.***") {
            Cow::Borrowed(b) if b == error_metadata.msg => (),
            cow => error_metadata.msg = Cow::Owned(cow.into_owned()),
        }
    }
}

/// Log an error to tracing and Sentry. This is the one point in the worker
/// that calls into Sentry -- every other collaborator should just propagate
/// `anyhow::Result`.
pub async fn report_error(err: &mut anyhow::Error) {
    trace_error(err);
    // Yield so a shutdown-triggered cancellation has a chance to run before we
    // (synchronously) talk to Sentry.
    tokio::task::yield_now().await;
    report_error_sync_no_tracing(err);
}

/// Synchronous version of `report_error`, for use outside an async context.
pub fn report_error_sync(err: &mut anyhow::Error) {
    trace_error(err);
    report_error_sync_no_tracing(err);
}

fn trace_error(err: &mut anyhow::Error) {
    strip_pii(err);
    let short_msg = err.short_msg().to_owned();
    let err_for_tracing = format!("{err:#}").replace('\n', "\\n");
    let full_msg = format!(
        "Caught {short_msg} error (RUST_LOG=info,{}=debug for full trace): {err_for_tracing}",
        module_path!()
    );
    if err.should_requeue() {
        tracing::warn!("{full_msg}");
    } else {
        tracing::error!("{full_msg}");
    }
    tracing::debug!("{err:?}");
}

fn report_error_sync_no_tracing(err: &mut anyhow::Error) {
    let Some(sentry_client) = sentry::Hub::current().client() else {
        tracing::debug!("Not reporting above error: Sentry is not configured");
        return;
    };
    if !sentry_client.is_enabled() {
        tracing::debug!("Not reporting above error: SENTRY_DSN not set.");
        return;
    }
    let Some(level) = err.should_report_to_sentry() else {
        tracing::debug!("Not reporting above error to sentry.");
        return;
    };
    let mut event = sentry::integrations::anyhow::event_from_error(err);
    event.level = level;
    event
        .tags
        .insert("short_msg".into(), err.short_msg().to_owned());
    let event_id = sentry::capture_event(event);
    tracing::error!("Reporting above error to sentry with event_id {}", event_id.simple());
}

/// Draw a sample with probability `prob` using the thread RNG; used for
/// low-priority error classes where every occurrence doesn't need reporting.
pub fn sample(prob: f64) -> bool {
    rand::rng().random::<f64>() <= prob
}
