//! The `Runtime` trait is the seam between "run for real, sleeping on the
//! wall clock and spawning real Tokio tasks" and "run deterministically under
//! test". Every collaborator that touches time or task spawning (the
//! consumer loop's backoff, the measurement cache TTL, reconnect delays)
//! takes a `Runtime` rather than reaching for `tokio::time`/`tokio::spawn`
//! directly.
use std::{
    future::Future,
    pin::Pin,
    time::{
        Duration,
        SystemTime,
    },
};

use async_trait::async_trait;
use futures::future::FusedFuture;
use rand::Rng;

#[async_trait]
pub trait Runtime: Clone + Send + Sync + 'static {
    type Handle: SpawnHandle;
    type Instant: RuntimeInstant;
    type Rng: Rng;

    /// Sleep for `duration`. Production implementations sleep on the wall
    /// clock; test implementations resolve as soon as the test advances its
    /// simulated clock past `duration`.
    fn wait(&self, duration: Duration) -> Pin<Box<dyn FusedFuture<Output = ()> + Send + 'static>>;

    /// Spawn a background task under `name` (used for task-level metrics and
    /// panic attribution).
    fn spawn(
        &self,
        name: &'static str,
        f: impl Future<Output = ()> + Send + 'static,
    ) -> Self::Handle;

    fn system_time(&self) -> SystemTime;

    fn monotonic_now(&self) -> Self::Instant;

    fn with_rng<R>(&self, f: impl FnOnce(&mut Self::Rng) -> R) -> R;
}

pub trait RuntimeInstant: Copy + Ord + Send + Sync + 'static {
    fn elapsed(&self) -> Duration;
}

#[derive(thiserror::Error, Debug)]
pub enum JoinError {
    #[error("task was canceled")]
    Canceled,
    #[error("task panicked: {0}")]
    Panicked(anyhow::Error),
}

/// A handle to a task spawned with `Runtime::spawn`. Dropping the handle does
/// NOT cancel the task -- call `shutdown()` explicitly, then await
/// `into_join_future()` to wait for it to actually stop.
pub trait SpawnHandle: Send + 'static {
    type Future: Future<Output = Result<(), JoinError>> + Send;

    fn shutdown(&mut self);
    fn into_join_future(self) -> Self::Future;
}

/// Request a spawned task shut down and wait for it to finish. A panic
/// inside the task surfaces here as `Err`; a clean stop or a cancellation
/// racing the shutdown request are both treated as success.
pub async fn shutdown_and_join(mut handle: impl SpawnHandle) -> anyhow::Result<()> {
    handle.shutdown();
    match handle.into_join_future().await {
        Ok(()) | Err(JoinError::Canceled) => Ok(()),
        Err(JoinError::Panicked(e)) => Err(e),
    }
}
